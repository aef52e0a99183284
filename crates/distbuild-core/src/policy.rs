//! Retry/degrade policy.
//!
//! A pure function over the outcome of one execution attempt. The dispatcher
//! feeds every failed attempt through [`decide`] and acts on the verdict;
//! successful attempts never reach the policy.

use crate::error::ErrorKind;
use crate::exit;

/// Work-missing refreshes are self-healing and do not count toward the
/// remote retry budget, but an endless refresh loop would hang the build if
/// the replacement work id keeps failing too.
pub const WORK_MISSING_REFRESH_LIMIT: u32 = 3;

/// Everything the policy needs to know about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    /// Exit code reported by the attempt (tool or transport bucket).
    pub exit_code: i32,
    /// Error classification of the attempt.
    pub kind: ErrorKind,
    /// Zero-based index of the failed remote attempt: the first attempt is
    /// 0, so a budget of N allows N retries after it (1 + N attempts total).
    pub attempt: u32,
    /// How many work-missing refreshes have been consumed so far.
    pub refreshes: u32,
    /// Remote retry budget from controller config.
    pub remote_retry_times: u32,
    /// Local degrade is forbidden for this work.
    pub no_local: bool,
}

/// What the dispatcher must do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Run the action remotely again.
    RetryRemote,
    /// Refresh the cached work id and toolchain registration, then retry
    /// remotely. Does not consume the remote retry budget.
    RefreshAndRetry,
    /// Run the action locally instead.
    DegradeLocal,
    /// Stop and surface the given exit code.
    Fail(i32),
}

/// Decide the fate of a failed attempt.
pub fn decide(ctx: &RetryContext) -> Verdict {
    match ctx.kind {
        ErrorKind::WorkMissing => {
            if ctx.refreshes < WORK_MISSING_REFRESH_LIMIT {
                Verdict::RefreshAndRetry
            } else {
                Verdict::Fail(exit::GENERIC)
            }
        }
        ErrorKind::RemoteExec | ErrorKind::Timeout => {
            if ctx.attempt < ctx.remote_retry_times {
                Verdict::RetryRemote
            } else if ctx.no_local {
                Verdict::Fail(exit::FORBIDDEN_DEGRADE)
            } else {
                Verdict::DegradeLocal
            }
        }
        ErrorKind::LocalExec => {
            if ctx.exit_code != 0 {
                Verdict::Fail(ctx.exit_code)
            } else {
                Verdict::Fail(exit::LOCAL_EXEC)
            }
        }
        // A clean attempt never consults the policy; treat as final.
        ErrorKind::None => Verdict::Fail(ctx.exit_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(kind: ErrorKind, attempt: u32) -> RetryContext {
        RetryContext {
            exit_code: 1,
            kind,
            attempt,
            refreshes: 0,
            remote_retry_times: 1,
            no_local: false,
        }
    }

    #[test]
    fn test_remote_within_budget_retries() {
        assert_eq!(decide(&ctx(ErrorKind::RemoteExec, 0)), Verdict::RetryRemote);
    }

    #[test]
    fn test_remote_over_budget_degrades() {
        assert_eq!(decide(&ctx(ErrorKind::RemoteExec, 1)), Verdict::DegradeLocal);
        assert_eq!(decide(&ctx(ErrorKind::RemoteExec, 7)), Verdict::DegradeLocal);
    }

    #[test]
    fn test_no_local_forbids_degrade() {
        let mut c = ctx(ErrorKind::RemoteExec, 1);
        c.no_local = true;
        assert_eq!(decide(&c), Verdict::Fail(exit::FORBIDDEN_DEGRADE));
    }

    #[test]
    fn test_work_missing_refreshes_without_consuming_budget() {
        let mut c = ctx(ErrorKind::WorkMissing, 5);
        assert_eq!(decide(&c), Verdict::RefreshAndRetry);
        c.refreshes = WORK_MISSING_REFRESH_LIMIT;
        assert_eq!(decide(&c), Verdict::Fail(exit::GENERIC));
    }

    #[test]
    fn test_local_exec_fails_with_underlying_code() {
        let mut c = ctx(ErrorKind::LocalExec, 0);
        c.exit_code = 2;
        assert_eq!(decide(&c), Verdict::Fail(2));
        c.exit_code = 0;
        assert_eq!(decide(&c), Verdict::Fail(exit::LOCAL_EXEC));
    }

    #[test]
    fn test_retry_bound_property() {
        // No sequence of verdicts allows more than 1 + remote_retry_times
        // remote attempts plus one local degrade.
        let budget = 2u32;
        let mut attempts_made = 1u32; // the initial attempt, which failed
        loop {
            let c = RetryContext {
                exit_code: 1,
                kind: ErrorKind::RemoteExec,
                attempt: attempts_made - 1,
                refreshes: 0,
                remote_retry_times: budget,
                no_local: false,
            };
            match decide(&c) {
                Verdict::RetryRemote => attempts_made += 1,
                Verdict::DegradeLocal => break,
                v => panic!("unexpected verdict {v:?}"),
            }
            assert!(attempts_made <= budget + 1);
        }
        assert_eq!(attempts_made, budget + 1);
    }
}
