//! The execute dispatcher.
//!
//! Takes one admitted execute request, chooses the remote pool or the local
//! sandbox, and walks failures through the retry/degrade policy. Net errors
//! feed the worker registry so dead endpoints drop out of rotation.

use crate::error::ControllerError;
use crate::local::{run_local, LocalOutput};
use crate::remote::Dialer;
use crate::slots::{SlotGuard, SlotPool};
use crate::workers::WorkerRegistry;
use distbuild_core::policy::{decide, RetryContext, Verdict};
use distbuild_core::protocol::{code, ExecuteRequest, ExecuteResponse};
use distbuild_core::{exit, ControllerConfig, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum RemoteOutcome {
    Done(ExecuteResponse),
    Degrade,
}

/// Chooses where an action runs and drives it to a final response.
pub struct Dispatcher {
    cfg: ControllerConfig,
    pool: Arc<SlotPool>,
    dialer: Arc<dyn Dialer>,
}

impl Dispatcher {
    pub fn new(cfg: ControllerConfig, pool: Arc<SlotPool>, dialer: Arc<dyn Dialer>) -> Self {
        Self { cfg, pool, dialer }
    }

    /// Run one execute request to completion.
    pub async fn execute(
        &self,
        registry: &Arc<WorkerRegistry>,
        cancel: &CancellationToken,
        req: &ExecuteRequest,
    ) -> ExecuteResponse {
        let remote_ok = self.remote_eligible(req) && registry.live_count() > 0;

        // prefer_local grabs a free slot when one is idle right now and
        // only falls back to the pool when the host is saturated
        let mut local_guard: Option<SlotGuard> = None;
        if remote_ok && self.cfg.prefer_local {
            local_guard = self.pool.try_acquire(req.class);
        }

        if remote_ok && local_guard.is_none() {
            match self.execute_remote(registry, req).await {
                RemoteOutcome::Done(resp) => return resp,
                RemoteOutcome::Degrade => {
                    if self.cfg.no_local {
                        return failure(
                            exit::FORBIDDEN_DEGRADE,
                            ErrorKind::RemoteExec,
                            "remote failed and local degrade is forbidden",
                        );
                    }
                    info!(action = %req.action_id, "degrading to local execution");
                }
            }
        }

        self.execute_local(local_guard, cancel, req).await
    }

    /// Link and lib stay local unless explicitly enabled; everything else
    /// follows the compile flag.
    fn remote_eligible(&self, req: &ExecuteRequest) -> bool {
        let program = req
            .command
            .first()
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or_default();
        if program.ends_with("link.exe") {
            return self.cfg.enable_link;
        }
        if program.ends_with("lib.exe") {
            return self.cfg.enable_lib;
        }
        req.is_compile
    }

    async fn execute_remote(
        &self,
        registry: &Arc<WorkerRegistry>,
        req: &ExecuteRequest,
    ) -> RemoteOutcome {
        // with use_default_worker the first live endpoint wins; otherwise an
        // explicit selection may ride in on the action attributes
        let preferred = if self.cfg.use_default_worker {
            None
        } else {
            req.attributes.get("worker").map(String::as_str)
        };

        let mut attempt: u32 = 0;
        loop {
            let Some(endpoint) = registry.pick(preferred) else {
                debug!(action = %req.action_id, "no live worker with spare capacity");
                return RemoteOutcome::Degrade;
            };
            let key = endpoint.key();

            let outcome = self.dialer.dispatch(&endpoint, req).await;
            registry.done(&key);

            let (exit_code, detail) = match outcome {
                Ok(out) if out.exit_code == 0 => {
                    registry.record_success(&key);
                    return RemoteOutcome::Done(ExecuteResponse {
                        code: code::OK,
                        exit_code: 0,
                        error: ErrorKind::None,
                        stdout: out.stdout,
                        stderr: out.stderr,
                        message: String::new(),
                    });
                }
                Ok(out) => {
                    // the worker answered; the tool itself failed
                    registry.record_success(&key);
                    warn!(
                        action = %req.action_id,
                        worker = %key,
                        exit_code = out.exit_code,
                        "remote execution failed"
                    );
                    (out.exit_code, out.stderr)
                }
                Err(e) => {
                    registry.record_net_error(&key);
                    warn!(action = %req.action_id, worker = %key, error = %e, "worker net error");
                    (exit::GENERIC, e.to_string())
                }
            };

            let verdict = decide(&RetryContext {
                exit_code,
                kind: ErrorKind::RemoteExec,
                attempt,
                refreshes: 0,
                remote_retry_times: self.cfg.remote_retry_times,
                no_local: self.cfg.no_local,
            });
            match verdict {
                Verdict::RetryRemote => {
                    attempt += 1;
                    debug!(action = %req.action_id, attempt, "retrying remotely");
                }
                Verdict::DegradeLocal => return RemoteOutcome::Degrade,
                Verdict::Fail(code_) => {
                    return RemoteOutcome::Done(failure(code_, ErrorKind::RemoteExec, &detail))
                }
                // work-missing never originates on the worker wire
                Verdict::RefreshAndRetry => return RemoteOutcome::Degrade,
            }
        }
    }

    async fn execute_local(
        &self,
        guard: Option<SlotGuard>,
        cancel: &CancellationToken,
        req: &ExecuteRequest,
    ) -> ExecuteResponse {
        let _guard = match guard {
            Some(g) => g,
            None => match self.pool.acquire(req.class, cancel).await {
                Ok(g) => g,
                Err(_) => {
                    return ExecuteResponse {
                        code: code::EXECUTE_FAILED,
                        exit_code: exit::GENERIC,
                        error: ErrorKind::LocalExec,
                        stdout: String::new(),
                        stderr: String::new(),
                        message: "cancelled while waiting for a local slot".to_string(),
                    }
                }
            },
        };

        let io_timeout = Duration::from_secs(self.cfg.io_timeout_secs);
        match run_local(&req.command, &req.workdir, req.command_type, io_timeout, cancel).await {
            Ok(LocalOutput {
                exit_code,
                stdout,
                stderr,
            }) => ExecuteResponse {
                code: code::OK,
                exit_code,
                error: if exit_code == 0 {
                    ErrorKind::None
                } else {
                    ErrorKind::LocalExec
                },
                stdout,
                stderr,
                message: String::new(),
            },
            Err(ControllerError::IoTimeout(secs)) => failure(
                exit::GENERIC,
                ErrorKind::Timeout,
                &format!("local execution ran past {secs}s"),
            ),
            Err(e) => failure(exit::LOCAL_EXEC, ErrorKind::LocalExec, &e.to_string()),
        }
    }
}

fn failure(exit_code: i32, error: ErrorKind, message: &str) -> ExecuteResponse {
    ExecuteResponse {
        code: code::OK,
        exit_code,
        error,
        stdout: String::new(),
        stderr: message.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteOutput;
    use crate::workers::WorkerEndpoint;
    use async_trait::async_trait;
    use distbuild_core::{ActionId, SlotBudget, SlotClass, WorkId};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn request(command: &[&str], is_compile: bool) -> ExecuteRequest {
        ExecuteRequest {
            work_id: WorkId::new("w-1"),
            action_id: ActionId::new("A"),
            command: command.iter().map(|s| s.to_string()).collect(),
            workdir: String::new(),
            attributes: HashMap::new(),
            command_type: Default::default(),
            class: SlotClass::Exe,
            is_compile,
        }
    }

    fn pool() -> Arc<SlotPool> {
        SlotPool::new(SlotBudget {
            total: 2,
            pre: 2,
            exe: 2,
            post: 2,
        })
    }

    fn registry(workers: &[&str]) -> Arc<WorkerRegistry> {
        Arc::new(WorkerRegistry::from_list(
            &workers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            3,
            4,
        ))
    }

    /// Dialer stub scripted per call: `Ok(exit)` or net error.
    struct ScriptedDialer {
        script: Mutex<Vec<Result<i32, ()>>>,
        calls: AtomicU32,
    }

    impl ScriptedDialer {
        fn new(script: Vec<Result<i32, ()>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dispatch(
            &self,
            _endpoint: &WorkerEndpoint,
            _req: &ExecuteRequest,
        ) -> Result<RemoteOutput, ControllerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            match script.remove(0) {
                Ok(exit_code) => Ok(RemoteOutput {
                    exit_code,
                    stdout: String::new(),
                    stderr: String::new(),
                }),
                Err(()) => Err(ControllerError::Remote("connection refused".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_remote_success() {
        let dialer = ScriptedDialer::new(vec![Ok(0)]);
        let d = Dispatcher::new(ControllerConfig::default(), pool(), dialer.clone());
        let resp = d
            .execute(
                &registry(&["10.0.0.1:31000"]),
                &CancellationToken::new(),
                &request(&["clang", "-c", "a.c"], true),
            )
            .await;
        assert_eq!(resp.code, code::OK);
        assert_eq!(resp.exit_code, 0);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_retries_then_degrades_to_local() {
        // two remote failures exhaust a budget of 1, then /bin/echo runs
        // locally
        let dialer = ScriptedDialer::new(vec![Ok(1), Ok(1)]);
        let d = Dispatcher::new(ControllerConfig::default(), pool(), dialer.clone());
        let resp = d
            .execute(
                &registry(&["10.0.0.1:31000"]),
                &CancellationToken::new(),
                &request(&["/bin/echo", "ok"], true),
            )
            .await;
        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.error, ErrorKind::None);
        // 1 + remote_retry_times attempts on the wire
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_local_forbids_degrade() {
        let dialer = ScriptedDialer::new(vec![Ok(1), Ok(1)]);
        let cfg = ControllerConfig {
            no_local: true,
            ..Default::default()
        };
        let d = Dispatcher::new(cfg, pool(), dialer);
        let resp = d
            .execute(
                &registry(&["10.0.0.1:31000"]),
                &CancellationToken::new(),
                &request(&["clang", "-c", "a.c"], true),
            )
            .await;
        assert_eq!(resp.exit_code, exit::FORBIDDEN_DEGRADE);
    }

    #[tokio::test]
    async fn test_net_errors_disable_worker() {
        // limit is 3; every call is a net error on the same endpoint
        let dialer = ScriptedDialer::new(vec![Err(()), Err(()), Err(()), Err(())]);
        let cfg = ControllerConfig {
            remote_retry_times: 3,
            ..Default::default()
        };
        let d = Dispatcher::new(cfg, pool(), dialer);
        let reg = registry(&["10.0.0.1:31000"]);
        let resp = d
            .execute(
                &reg,
                &CancellationToken::new(),
                &request(&["/bin/echo", "ok"], true),
            )
            .await;
        // degraded to local once the endpoint died
        assert_eq!(resp.exit_code, 0);
        assert_eq!(reg.live_count(), 0);
    }

    #[tokio::test]
    async fn test_non_compile_runs_local() {
        let dialer = ScriptedDialer::new(vec![]);
        let d = Dispatcher::new(ControllerConfig::default(), pool(), dialer.clone());
        let resp = d
            .execute(
                &registry(&["10.0.0.1:31000"]),
                &CancellationToken::new(),
                &request(&["/bin/echo", "hi"], false),
            )
            .await;
        assert_eq!(resp.exit_code, 0);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_failure_keeps_exit_code() {
        let dialer = ScriptedDialer::new(vec![]);
        let d = Dispatcher::new(ControllerConfig::default(), pool(), dialer);
        let resp = d
            .execute(
                &registry(&[]),
                &CancellationToken::new(),
                &request(&["/bin/sh", "-c", "exit 5"], true),
            )
            .await;
        assert_eq!(resp.exit_code, 5);
        assert_eq!(resp.error, ErrorKind::LocalExec);
    }
}
