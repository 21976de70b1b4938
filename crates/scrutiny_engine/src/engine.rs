use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use log::{debug, warn};

use crate::compile::{self, CompiledRule, CompiledRules};
use crate::context::ConditionContext;
use crate::error::EngineError;
use crate::incidents::build_violation;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::provider::ProviderRegistry;
use crate::results::{RuleSetResult, Violation};
use crate::rules::{Rule, RuleSelector, RuleSet};
use crate::scope::Scope;
use crate::settings::EngineSettings;
use crate::tagging::run_tagging_rules;

/// Recommended worker count when the caller has no better number.
pub const DEFAULT_WORKERS: usize = 10;

/// Capacity of the dispatch queue. Submission blocks once this many rules
/// are queued, which bounds memory on very large catalogs.
const DISPATCH_QUEUE_CAPACITY: usize = 10;

/// How often blocked dispatch and collection re-check for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cancellation handle for a run. Cancelling stops new dispatch and ends
/// collection; rules already on a worker finish and their responses are
/// discarded.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-run options.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub progress: Option<Arc<dyn ProgressReporter>>,
    pub cancellation: Option<CancellationToken>,
}

struct WorkItem {
    ruleset: usize,
    rule: Rule,
    ctx: ConditionContext,
    scope: Option<Arc<dyn Scope>>,
    response_tx: Sender<RuleResponse>,
}

struct RuleResponse {
    ruleset: usize,
    rule_id: String,
    outcome: Result<Option<Violation>, EngineError>,
}

/// The rule-evaluation engine: a fixed pool of workers fed through a
/// bounded dispatch queue.
///
/// Create one engine per provider fleet and reuse it across runs; `stop`
/// (or drop) shuts the pool down.
pub struct RuleEngine {
    dispatch: Option<Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
    providers: Arc<ProviderRegistry>,
    settings: EngineSettings,
}

impl RuleEngine {
    pub fn new(providers: ProviderRegistry, workers: usize, settings: EngineSettings) -> Self {
        let providers = Arc::new(providers);
        let (dispatch, work_rx) = bounded::<WorkItem>(DISPATCH_QUEUE_CAPACITY);
        let workers = (0..workers.max(1))
            .map(|index| {
                let work_rx = work_rx.clone();
                let providers = Arc::clone(&providers);
                let settings = settings.clone();
                std::thread::Builder::new()
                    .name(format!("rule-worker-{index}"))
                    .spawn(move || worker_loop(&work_rx, &providers, &settings))
                    .expect("failed to spawn rule worker")
            })
            .collect();
        Self {
            dispatch: Some(dispatch),
            workers,
            providers,
            settings,
        }
    }

    pub fn run(&self, rule_sets: &[RuleSet], selectors: &[&dyn RuleSelector]) -> Vec<RuleSetResult> {
        self.run_scoped_with_options(rule_sets, None, RunOptions::default(), selectors)
    }

    pub fn run_with_options(
        &self,
        rule_sets: &[RuleSet],
        options: RunOptions,
        selectors: &[&dyn RuleSelector],
    ) -> Vec<RuleSetResult> {
        self.run_scoped_with_options(rule_sets, None, options, selectors)
    }

    pub fn run_scoped(
        &self,
        rule_sets: &[RuleSet],
        scope: Arc<dyn Scope>,
        selectors: &[&dyn RuleSelector],
    ) -> Vec<RuleSetResult> {
        self.run_scoped_with_options(rule_sets, Some(scope), RunOptions::default(), selectors)
    }

    pub fn run_scoped_with_options(
        &self,
        rule_sets: &[RuleSet],
        scope: Option<Arc<dyn Scope>>,
        options: RunOptions,
        selectors: &[&dyn RuleSelector],
    ) -> Vec<RuleSetResult> {
        let CompiledRules {
            mut results,
            tagging,
            regular,
        } = compile::compile(rule_sets, selectors);
        let cancellation = options.cancellation.clone().unwrap_or_default();
        let progress = options.progress.clone();

        // Seed the base context; the tagging pass runs to completion before
        // any regular rule observes it.
        let mut ctx = ConditionContext::default();
        if let Some(scope) = &scope {
            scope.add_to_context(&mut ctx);
        }
        run_tagging_rules(
            &self.providers,
            &self.settings,
            scope.as_deref(),
            tagging,
            &mut ctx,
            &mut results,
        );

        let total = regular.len();
        if let Some(progress) = &progress {
            progress.report(ProgressEvent::RuleExecution {
                current: 0,
                total,
                message: None,
            });
        }

        let completed = if total > 0 {
            self.dispatch_rules(regular, &ctx, scope, &cancellation, &progress, &mut results)
        } else {
            0
        };

        if completed == total {
            if let Some(progress) = &progress {
                progress.report(ProgressEvent::Complete {
                    current: total,
                    total,
                    percent: 100,
                });
            }
        }

        // A rule id must land in exactly one bucket. Tag-with-message rules
        // are evaluated twice under one id (pre-pass and cloned regular
        // rule); when the two verdicts disagree the map buckets win.
        for result in &mut results {
            let RuleSetResult {
                violations,
                insights,
                errors,
                unmatched,
                ..
            } = result;
            unmatched.retain(|rule_id| {
                !violations.contains_key(rule_id)
                    && !insights.contains_key(rule_id)
                    && !errors.contains_key(rule_id)
            });
            unmatched.sort_unstable();
            unmatched.dedup();
        }
        results
    }

    /// Shut the worker pool down and wait for the workers to exit.
    /// Idempotent; also invoked on drop.
    pub fn stop(&mut self) {
        if self.dispatch.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("rule worker panicked during shutdown");
            }
        }
    }

    fn dispatch_rules(
        &self,
        regular: Vec<CompiledRule>,
        ctx: &ConditionContext,
        scope: Option<Arc<dyn Scope>>,
        cancellation: &CancellationToken,
        progress: &Option<Arc<dyn ProgressReporter>>,
        results: &mut Vec<RuleSetResult>,
    ) -> usize {
        let total = regular.len();
        let Some(dispatch) = &self.dispatch else {
            for CompiledRule { ruleset, rule } in regular {
                results[ruleset]
                    .errors
                    .insert(rule.rule_id, "engine is stopped".to_string());
            }
            return 0;
        };
        let (response_tx, response_rx) = bounded::<RuleResponse>(DISPATCH_QUEUE_CAPACITY);

        std::thread::scope(|run| {
            let collector = run.spawn(|| {
                collect_responses(&response_rx, total, cancellation, progress, results)
            });

            'submission: for CompiledRule { ruleset, rule } in regular {
                if cancellation.is_cancelled() {
                    break;
                }
                let mut item = WorkItem {
                    ruleset,
                    ctx: ctx.for_rule(&rule.rule_id),
                    rule,
                    scope: scope.clone(),
                    response_tx: response_tx.clone(),
                };
                loop {
                    match dispatch.send_timeout(item, CANCEL_POLL_INTERVAL) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(returned)) => {
                            if cancellation.is_cancelled() {
                                break 'submission;
                            }
                            item = returned;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => break 'submission,
                    }
                }
            }
            // Once every in-flight clone is gone the collector sees the
            // channel disconnect instead of waiting for a full count.
            drop(response_tx);

            collector.join().unwrap_or_else(|_| {
                warn!("response collector panicked");
                0
            })
        })
    }
}

impl Drop for RuleEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    work_rx: &Receiver<WorkItem>,
    providers: &ProviderRegistry,
    settings: &EngineSettings,
) {
    while let Ok(item) = work_rx.recv() {
        let WorkItem {
            ruleset,
            rule,
            mut ctx,
            scope,
            response_tx,
        } = item;
        let rule_id = rule.rule_id.clone();
        let outcome = evaluate_rule(&rule, providers, &mut ctx, scope.as_deref(), settings);
        if response_tx
            .send(RuleResponse {
                ruleset,
                rule_id,
                outcome,
            })
            .is_err()
        {
            debug!("discarding rule response after run cancellation");
        }
    }
}

fn evaluate_rule(
    rule: &Rule,
    providers: &ProviderRegistry,
    ctx: &mut ConditionContext,
    scope: Option<&dyn Scope>,
    settings: &EngineSettings,
) -> Result<Option<Violation>, EngineError> {
    let response = rule.when.evaluate(providers, ctx)?;
    if !response.matched || response.incidents.is_empty() {
        return Ok(None);
    }
    Ok(build_violation(rule, &response.incidents, scope, settings))
}

/// Drain worker responses into the result maps, reporting progress after
/// every completion. Returns the number of responses collected.
fn collect_responses(
    response_rx: &Receiver<RuleResponse>,
    total: usize,
    cancellation: &CancellationToken,
    progress: &Option<Arc<dyn ProgressReporter>>,
    results: &mut [RuleSetResult],
) -> usize {
    let mut completed = 0;
    let (mut matched, mut unmatched, mut failed) = (0usize, 0usize, 0usize);

    while completed < total {
        let response = match response_rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                if cancellation.is_cancelled() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        completed += 1;

        let result = &mut results[response.ruleset];
        match response.outcome {
            Err(err) => {
                failed += 1;
                result.errors.insert(response.rule_id.clone(), err.to_string());
            }
            Ok(None) => {
                unmatched += 1;
                result.unmatched.push(response.rule_id.clone());
            }
            Ok(Some(violation)) => {
                matched += 1;
                if violation.effort.unwrap_or(0) > 0 {
                    result.violations.insert(response.rule_id.clone(), violation);
                } else {
                    result.insights.insert(response.rule_id.clone(), violation);
                }
            }
        }

        if let Some(progress) = progress {
            progress.report(ProgressEvent::RuleExecution {
                current: completed,
                total,
                message: Some(response.rule_id),
            });
        }
    }

    debug!("rule evaluation drained: {matched} matched, {unmatched} unmatched, {failed} failed");
    completed
}
