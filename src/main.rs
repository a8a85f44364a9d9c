use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

const DEFAULT_LOG_FILTER: &str = "stage_reset=info";

/// Reset a stage: install the SDK, sync the workdir, generate app config,
/// start the database proxy and reset pipelines.
///
/// Configuration comes from the environment; `project_id` selects the
/// stage descriptor.
#[derive(Parser)]
#[command(name = "stage-reset")]
#[command(about = "Reset the pipeline state of a deployment stage")]
struct Cli {}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() -> std::process::ExitCode {
    let _cli = Cli::parse();
    init_tracing();

    if let Err(err) = stage_reset::interrupt::install_handler() {
        let _ = output::print_json_result(Err(err));
        return std::process::ExitCode::from(1);
    }

    let (json_result, exit_code) = commands::run_json();
    let _ = output::print_json_result(json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
