/// Stage events delivered to a caller-supplied reporter during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Emitted once with `current == 0` before dispatch, then after every
    /// rule completion with the finished rule's id.
    RuleExecution {
        current: usize,
        total: usize,
        message: Option<String>,
    },
    /// Emitted when all rules completed normally.
    Complete {
        current: usize,
        total: usize,
        percent: u8,
    },
}

/// Caller-supplied sink for progress events.
///
/// Reporters are per-run, invoked from the collector, and must not block:
/// a reporter that drops events on overflow is acceptable, one that stalls
/// delays result collection.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Reporter that forwards progress to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RuleExecution {
                current,
                total,
                message: Some(rule_id),
            } => log::debug!("evaluated rule {rule_id} ({current}/{total})"),
            ProgressEvent::RuleExecution { total, .. } => {
                log::debug!("dispatching {total} rules");
            }
            ProgressEvent::Complete { total, .. } => {
                log::debug!("rule evaluation complete ({total} rules)");
            }
        }
    }
}
