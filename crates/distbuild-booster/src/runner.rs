//! The dispatch loop.
//!
//! Pulls ready actions from the graph, runs up to `max_jobs` of them
//! concurrently through an [`ActionExecutor`], and applies results in
//! arrival order. Control flow is one `tokio::select!` over the result
//! channel, a watchdog tick and cancellation.

use crate::error::BoosterError;
use crate::executor::ActionExecutor;
use crate::graph::ActionGraph;
use distbuild_core::{exit, ActionResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Most machines are fine driving this many in-flight actions.
pub const DEFAULT_MAX_JOBS: usize = 240;

/// Watchdog tick period.
pub const TICK_SECS: u64 = 30;

/// Hard ceiling on silence between two results.
pub const MAX_WAIT_SECS: u64 = 10_800;

/// Run-loop knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on concurrently running actions.
    pub max_jobs: usize,
    /// Treat failed actions as finished instead of halting.
    pub continue_on_error: bool,
    /// Watchdog tick period.
    pub tick: Duration,
    /// Give up when no result arrives for this long.
    pub max_wait: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            continue_on_error: false,
            tick: Duration::from_secs(TICK_SECS),
            max_wait: Duration::from_secs(MAX_WAIT_SECS),
        }
    }
}

/// Drives one action graph to completion.
pub struct Runner {
    opts: RunOptions,
}

impl Runner {
    pub fn new(opts: RunOptions) -> Self {
        Self { opts }
    }

    /// Execute every action in the graph, respecting dependencies and the
    /// failure policy. Returns the aggregate exit code for the build driver.
    pub async fn run(
        &self,
        graph: &mut ActionGraph,
        executor: Arc<dyn ActionExecutor>,
        cancel: CancellationToken,
    ) -> Result<i32, BoosterError> {
        let total = graph.total();
        if total == 0 {
            debug!("empty action chain, nothing to do");
            return Ok(exit::OK);
        }

        info!(total, max_jobs = self.opts.max_jobs, "running actions");

        let (tx, mut rx) = mpsc::channel::<ActionResult>(self.opts.max_jobs.max(1));
        let mut running = 0usize;
        let mut module_selected: HashMap<String, usize> = HashMap::new();

        running += self.dispatch(graph, &executor, &tx, running, &mut module_selected);
        if running == 0 {
            return Err(BoosterError::NoActionsToRun { unfinished: total });
        }

        let mut tick = interval(self.opts.tick);
        tick.reset();
        let mut last_result = Instant::now();

        loop {
            tokio::select! {
                Some(result) = rx.recv() => {
                    last_result = Instant::now();
                    running -= 1;

                    let failed = !result.ok();
                    if failed {
                        warn!(
                            action = %result.index,
                            exit_code = result.exit_code,
                            error = ?result.error,
                            attempts = result.attempts,
                            "action failed: {}", result.stderr.trim_end()
                        );
                    }

                    let is_compile = graph
                        .get(&result.index)
                        .map(|a| a.is_compile)
                        .unwrap_or(false);

                    let code = if failed && result.exit_code == 0 {
                        exit::GENERIC
                    } else {
                        result.exit_code
                    };
                    graph.mark_finished(&result.index, code)?;

                    if failed && !self.opts.continue_on_error {
                        let final_code = if is_compile {
                            exit::COMPILE_FAILED
                        } else if code != 0 {
                            code
                        } else {
                            exit::GENERIC
                        };
                        error!(
                            action = %result.index,
                            exit_code = final_code,
                            "halting after failed action"
                        );
                        return Ok(final_code);
                    }

                    if graph.done() {
                        info!(total, "all actions finished");
                        debug!(modules = ?module_selected, "module selection counts");
                        return Ok(exit::OK);
                    }

                    running += self.dispatch(graph, &executor, &tx, running, &mut module_selected);
                    if running == 0 {
                        return Err(BoosterError::NoActionsToRun {
                            unfinished: total - graph.finished_count(),
                        });
                    }
                }
                _ = tick.tick() => {
                    if last_result.elapsed() > self.opts.max_wait {
                        return Err(BoosterError::OverMaxWait(self.opts.max_wait.as_secs()));
                    }
                    debug!(
                        finished = graph.finished_count(),
                        running,
                        total,
                        "still waiting for action results"
                    );
                }
                _ = cancel.cancelled() => {
                    warn!("run cancelled with {running} actions in flight");
                    return Ok(exit::GENERIC);
                }
            }
        }
    }

    /// Hand out ready actions until the job bound is reached. Returns how
    /// many were started.
    fn dispatch(
        &self,
        graph: &mut ActionGraph,
        executor: &Arc<dyn ActionExecutor>,
        tx: &mpsc::Sender<ActionResult>,
        running: usize,
        module_selected: &mut HashMap<String, usize>,
    ) -> usize {
        let mut started = 0;
        while running + started < self.opts.max_jobs {
            let Some(action) = graph.next_ready() else {
                break;
            };
            let action = action.clone();
            graph.mark_running(&action.index);

            if action.is_compile {
                if let Some(module) = &action.module_path {
                    *module_selected.entry(module.clone()).or_insert(0) += 1;
                }
            }

            info!(
                "[{}/{}] {}",
                graph.finished_count() + running + started + 1,
                graph.total(),
                action.desc
            );

            let executor = executor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = executor.execute(&action).await;
                // the loop may have exited on halt; nothing to do then
                let _ = tx.send(result).await;
            });
            started += 1;
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphOptions;
    use async_trait::async_trait;
    use distbuild_core::{Action, ActionId, ErrorKind};
    use std::sync::Mutex;

    fn action(id: &str, deps: &[&str]) -> Action {
        let mut a = Action::new(id, "cc").with_arg(format!("-c {id}.c"));
        for d in deps {
            a = a.with_dep(*d);
        }
        a
    }

    fn diamond() -> Vec<Action> {
        vec![
            action("A", &[]),
            action("B", &["A"]),
            action("C", &["A"]),
            action("D", &["B", "C"]),
        ]
    }

    /// Executor stub that fails a configured set of actions and records
    /// completion order.
    struct StubExecutor {
        fail: Vec<ActionId>,
        seen: Mutex<Vec<ActionId>>,
    }

    impl StubExecutor {
        fn new(fail: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail: fail.iter().map(|s| ActionId::new(*s)).collect(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<ActionId> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionExecutor for StubExecutor {
        async fn execute(&self, action: &Action) -> ActionResult {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.seen.lock().unwrap().push(action.index.clone());
            if self.fail.contains(&action.index) {
                ActionResult {
                    index: action.index.clone(),
                    exit_code: 1,
                    error: ErrorKind::LocalExec,
                    stdout: String::new(),
                    stderr: "boom".to_string(),
                    attempts: 1,
                }
            } else {
                ActionResult::success(action.index.clone())
            }
        }
    }

    fn opts(continue_on_error: bool) -> RunOptions {
        RunOptions {
            max_jobs: 4,
            continue_on_error,
            tick: Duration::from_millis(50),
            max_wait: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_diamond_all_success() {
        let mut graph = ActionGraph::load(diamond(), GraphOptions::default()).unwrap();
        let executor = StubExecutor::new(&[]);
        let runner = Runner::new(opts(false));

        let code = runner
            .run(&mut graph, executor.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, exit::OK);

        let seen = executor.seen();
        assert_eq!(seen.len(), 4);
        let pos = |id: &str| seen.iter().position(|a| a.as_str() == id).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
    }

    #[tokio::test]
    async fn test_diamond_failure_halts() {
        let mut graph = ActionGraph::load(diamond(), GraphOptions::default()).unwrap();
        let executor = StubExecutor::new(&["B"]);
        // serialized so the failure lands before anything else starts
        let runner = Runner::new(RunOptions {
            max_jobs: 1,
            ..opts(false)
        });

        let code = runner
            .run(&mut graph, executor.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(code, exit::OK);

        // A then B ran; the failure keeps C and D from ever dispatching
        let seen = executor.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_str(), "A");
        assert_eq!(seen[1].as_str(), "B");
    }

    #[tokio::test]
    async fn test_diamond_continue_on_error_runs_all() {
        let opts = RunOptions {
            continue_on_error: true,
            ..opts(true)
        };
        let mut graph = ActionGraph::load(
            diamond(),
            GraphOptions {
                continue_on_error: true,
                ..Default::default()
            },
        )
        .unwrap();
        let executor = StubExecutor::new(&["B"]);
        let runner = Runner::new(opts);

        let code = runner
            .run(&mut graph, executor.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, exit::OK);

        let seen = executor.seen();
        assert_eq!(seen.len(), 4);
        let pos = |id: &str| seen.iter().position(|a| a.as_str() == id).unwrap();
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
    }

    #[tokio::test]
    async fn test_bounded_parallelism_reaches_done() {
        // 20 independent actions through 2 jobs
        let actions: Vec<Action> = (0..20).map(|i| action(&i.to_string(), &[])).collect();
        let mut graph = ActionGraph::load(actions, GraphOptions::default()).unwrap();
        let executor = StubExecutor::new(&[]);
        let runner = Runner::new(RunOptions {
            max_jobs: 2,
            ..opts(false)
        });

        let code = runner
            .run(&mut graph, executor.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, exit::OK);
        assert_eq!(executor.seen().len(), 20);
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let actions: Vec<Action> = (0..4).map(|i| action(&i.to_string(), &[])).collect();
        let mut graph = ActionGraph::load(actions, GraphOptions::default()).unwrap();

        /// Executor that never completes.
        struct StuckExecutor;
        #[async_trait]
        impl ActionExecutor for StuckExecutor {
            async fn execute(&self, action: &Action) -> ActionResult {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ActionResult::success(action.index.clone())
            }
        }

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let runner = Runner::new(opts(false));
                runner
                    .run(&mut graph, Arc::new(StuckExecutor), cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let code = handle.await.unwrap().unwrap();
        assert_eq!(code, exit::GENERIC);
    }
}
