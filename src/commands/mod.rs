pub mod reset;

pub type CmdResult<T> = stage_reset::Result<(T, i32)>;

pub(crate) fn run_json() -> (stage_reset::Result<serde_json::Value>, i32) {
    crate::output::map_cmd_result_to_json(reset::run())
}
