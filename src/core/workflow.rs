//! Sequential step executor.
//!
//! Steps run in order and the run stops at the first failure. Resources a
//! step acquires are registered as cleanups on the run context; cleanups run
//! in reverse registration order after the last step, whether the run
//! succeeded or not. If a step panics, the context is dropped during unwind
//! and each cleanup's own `Drop` releases its resource.

use chrono::Utc;
use serde::Serialize;
use std::time::Instant;

use crate::error::Error;
use crate::proxy::ProxyBridge;

pub trait WorkflowStep {
    fn id(&self) -> &'static str;
    fn run(&mut self, ctx: &mut RunContext) -> crate::Result<serde_json::Value>;
}

pub trait Cleanup {
    fn name(&self) -> &str;
    fn cleanup(&mut self) -> serde_json::Value;
}

impl Cleanup for ProxyBridge {
    fn name(&self) -> &str {
        "stop_proxy"
    }

    fn cleanup(&mut self) -> serde_json::Value {
        serde_json::to_value(self.stop()).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Default)]
pub struct RunContext {
    cleanups: Vec<Box<dyn Cleanup>>,
}

impl RunContext {
    pub fn register_cleanup(&mut self, cleanup: Box<dyn Cleanup>) {
        self.cleanups.push(cleanup);
    }

    fn run_cleanups(&mut self) -> Vec<CleanupResult> {
        let mut results = Vec::with_capacity(self.cleanups.len());
        while let Some(mut cleanup) = self.cleanups.pop() {
            let name = cleanup.name().to_string();
            let data = cleanup.cleanup();
            tracing::debug!(cleanup = %name, "Cleanup finished");
            results.push(CleanupResult { name, data });
        }
        results
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_steps: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup: Vec<CleanupResult>,
    pub summary: RunSummary,
}

pub struct WorkflowRun {
    pub report: WorkflowReport,
    /// The error of the failed step, if any.
    pub error: Option<Error>,
}

#[derive(Default)]
pub struct Workflow<'a> {
    steps: Vec<Box<dyn WorkflowStep + 'a>>,
}

impl<'a> Workflow<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn step(mut self, step: impl WorkflowStep + 'a) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn run(self) -> WorkflowRun {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        let mut ctx = RunContext::default();
        let mut results = Vec::with_capacity(self.steps.len());
        let mut failure: Option<Error> = None;

        for mut step in self.steps {
            let id = step.id().to_string();

            if failure.is_some() {
                results.push(StepResult {
                    id,
                    status: StepStatus::Skipped,
                    duration_ms: None,
                    data: None,
                    error_code: None,
                    error: None,
                });
                continue;
            }

            tracing::info!(step = %id, "Running step");
            let started = Instant::now();
            let outcome = step.run(&mut ctx);
            let duration_ms = Some(started.elapsed().as_millis() as u64);

            match outcome {
                Ok(data) => results.push(StepResult {
                    id,
                    status: StepStatus::Success,
                    duration_ms,
                    data: (!data.is_null()).then_some(data),
                    error_code: None,
                    error: None,
                }),
                Err(err) => {
                    tracing::error!(step = %id, code = err.code.as_str(), "{}", err.message);
                    results.push(StepResult {
                        id,
                        status: StepStatus::Failed,
                        duration_ms,
                        data: None,
                        error_code: Some(err.code.as_str().to_string()),
                        error: Some(err.message.clone()),
                    });
                    failure = Some(err);
                }
            }
        }

        let cleanup = ctx.run_cleanups();

        let count = |status: StepStatus| results.iter().filter(|r| r.status == status).count();
        let summary = RunSummary {
            total_steps: results.len(),
            succeeded: count(StepStatus::Success),
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
        };

        let report = WorkflowReport {
            run_id,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            status: if failure.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Success
            },
            steps: results,
            cleanup,
            summary,
        };

        WorkflowRun {
            report,
            error: failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Recorded {
        id: &'static str,
        fail: bool,
        log: Log,
        cleanup: bool,
    }

    struct RecordedCleanup {
        name: String,
        log: Log,
    }

    impl Cleanup for RecordedCleanup {
        fn name(&self) -> &str {
            &self.name
        }

        fn cleanup(&mut self) -> serde_json::Value {
            self.log.borrow_mut().push(format!("cleanup:{}", self.name));
            serde_json::Value::Null
        }
    }

    impl WorkflowStep for Recorded {
        fn id(&self) -> &'static str {
            self.id
        }

        fn run(&mut self, ctx: &mut RunContext) -> crate::Result<serde_json::Value> {
            self.log.borrow_mut().push(format!("run:{}", self.id));
            if self.cleanup {
                ctx.register_cleanup(Box::new(RecordedCleanup {
                    name: self.id.to_string(),
                    log: self.log.clone(),
                }));
            }
            if self.fail {
                return Err(Error::other(format!("{} broke", self.id)));
            }
            Ok(serde_json::json!({ "step": self.id }))
        }
    }

    fn step(id: &'static str, fail: bool, cleanup: bool, log: &Log) -> Recorded {
        Recorded {
            id,
            fail,
            log: log.clone(),
            cleanup,
        }
    }

    #[test]
    fn runs_all_steps_in_order() {
        let log: Log = Rc::default();
        let run = Workflow::new()
            .step(step("a", false, false, &log))
            .step(step("b", false, false, &log))
            .run();

        assert!(run.error.is_none());
        assert_eq!(run.report.status, RunStatus::Success);
        assert_eq!(*log.borrow(), vec!["run:a", "run:b"]);
        assert_eq!(run.report.steps[1].data, Some(serde_json::json!({ "step": "b" })));
        assert_eq!(run.report.summary.succeeded, 2);
    }

    #[test]
    fn stops_at_first_failure_and_skips_rest() {
        let log: Log = Rc::default();
        let run = Workflow::new()
            .step(step("a", false, false, &log))
            .step(step("b", true, false, &log))
            .step(step("c", false, false, &log))
            .run();

        assert_eq!(run.error.unwrap().message, "Unexpected error");
        assert_eq!(run.report.status, RunStatus::Failed);
        assert_eq!(*log.borrow(), vec!["run:a", "run:b"]);
        assert_eq!(run.report.steps[1].status, StepStatus::Failed);
        assert_eq!(run.report.steps[1].error_code.as_deref(), Some("internal.unexpected"));
        assert_eq!(run.report.steps[2].status, StepStatus::Skipped);
        assert_eq!(run.report.summary.failed, 1);
        assert_eq!(run.report.summary.skipped, 1);
    }

    #[test]
    fn cleanups_run_in_reverse_even_after_failure() {
        let log: Log = Rc::default();
        let run = Workflow::new()
            .step(step("a", false, true, &log))
            .step(step("b", false, true, &log))
            .step(step("c", true, false, &log))
            .run();

        assert!(run.error.is_some());
        assert_eq!(
            *log.borrow(),
            vec!["run:a", "run:b", "run:c", "cleanup:b", "cleanup:a"]
        );
        assert_eq!(run.report.cleanup.len(), 2);
        assert_eq!(run.report.cleanup[0].name, "b");
    }

    #[test]
    fn failing_step_cleanup_still_runs() {
        let log: Log = Rc::default();
        let run = Workflow::new()
            .step(step("bridge", true, true, &log))
            .run();

        assert!(run.error.is_some());
        assert_eq!(*log.borrow(), vec!["run:bridge", "cleanup:bridge"]);
    }
}
