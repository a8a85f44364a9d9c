use stage_reset::reset;
use stage_reset::settings::Settings;
use stage_reset::workflow::WorkflowReport;

use super::CmdResult;

/// Reset the stage selected by `project_id` in the environment.
pub fn run() -> CmdResult<WorkflowReport> {
    let settings = Settings::from_env()?;
    let report = reset::run(&settings)?;
    Ok((report, 0))
}
