//! The local slot pool.
//!
//! Three labeled classes (pre, exe, post) draw from one parent budget.
//! Admission blocks until both the class cap and the global total allow
//! another slot; waiters wake FIFO within their class, and a cancelled
//! waiter never leaks a slot.

use crate::error::ControllerError;
use distbuild_core::{SlotBudget, SlotClass};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Waiter {
    id: u64,
    class: SlotClass,
    tx: oneshot::Sender<()>,
}

struct Inner {
    budget: SlotBudget,
    in_use: [usize; 3],
    total_in_use: usize,
    waiters: [VecDeque<Waiter>; 3],
    next_waiter: u64,
}

fn class_idx(class: SlotClass) -> usize {
    match class {
        SlotClass::Pre => 0,
        SlotClass::Exe => 1,
        SlotClass::Post => 2,
    }
}

impl Inner {
    fn can_grant(&self, class: SlotClass) -> bool {
        self.in_use[class_idx(class)] < self.budget.cap(class)
            && self.total_in_use < self.budget.total
    }

    fn grant(&mut self, class: SlotClass) {
        self.in_use[class_idx(class)] += 1;
        self.total_in_use += 1;
    }

    fn ungrant(&mut self, class: SlotClass) {
        self.in_use[class_idx(class)] -= 1;
        self.total_in_use -= 1;
    }
}

/// Counting pool over the local slot budget.
pub struct SlotPool {
    inner: Mutex<Inner>,
}

/// An admitted slot; releasing happens on drop.
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    class: SlotClass,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(self.class);
    }
}

impl SlotPool {
    pub fn new(budget: SlotBudget) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                budget,
                in_use: [0; 3],
                total_in_use: 0,
                waiters: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                next_waiter: 0,
            }),
        })
    }

    /// Admit one slot of `class`, waiting until one is free. Waiting is
    /// FIFO within the class and aborts cleanly when `cancel` fires.
    pub async fn acquire(
        self: &Arc<Self>,
        class: SlotClass,
        cancel: &CancellationToken,
    ) -> Result<SlotGuard, ControllerError> {
        let (waiter_id, rx) = {
            let mut inner = self.inner.lock().expect("slot pool poisoned");
            if inner.can_grant(class) {
                inner.grant(class);
                return Ok(SlotGuard {
                    pool: self.clone(),
                    class,
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter;
            inner.next_waiter += 1;
            inner.waiters[class_idx(class)].push_back(Waiter { id, class, tx });
            (id, rx)
        };

        tokio::select! {
            granted = rx => match granted {
                Ok(()) => Ok(SlotGuard {
                    pool: self.clone(),
                    class,
                }),
                // sender dropped without granting; cannot happen while the
                // pool lives, treat as cancellation
                Err(_) => Err(ControllerError::AdmissionCancelled),
            },
            _ = cancel.cancelled() => {
                self.forget_waiter(class, waiter_id);
                Err(ControllerError::AdmissionCancelled)
            }
        }
    }

    /// Admit without waiting; `None` when the class is saturated.
    pub fn try_acquire(self: &Arc<Self>, class: SlotClass) -> Option<SlotGuard> {
        let mut inner = self.inner.lock().expect("slot pool poisoned");
        if inner.can_grant(class) {
            inner.grant(class);
            Some(SlotGuard {
                pool: self.clone(),
                class,
            })
        } else {
            None
        }
    }

    fn release(&self, class: SlotClass) {
        let mut inner = self.inner.lock().expect("slot pool poisoned");
        inner.ungrant(class);

        // hand the freed capacity to the first waiter whose class still has
        // room; the grant transfers before the waiter task resumes, so the
        // budget invariant holds across the wakeup
        for class in SlotClass::ALL {
            while inner.can_grant(class) {
                let Some(waiter) = inner.waiters[class_idx(class)].pop_front() else {
                    break;
                };
                inner.grant(waiter.class);
                if waiter.tx.send(()).is_err() {
                    // waiter cancelled between queueing and wakeup
                    inner.ungrant(waiter.class);
                    continue;
                }
                return;
            }
        }
    }

    /// Drop a cancelled waiter. If the waiter already got a grant in the
    /// meantime the grant is returned to the pool.
    fn forget_waiter(&self, class: SlotClass, waiter_id: u64) {
        let mut inner = self.inner.lock().expect("slot pool poisoned");
        let queue = &mut inner.waiters[class_idx(class)];
        let before = queue.len();
        queue.retain(|w| w.id != waiter_id);
        if queue.len() == before {
            // not queued anymore: a release granted to us concurrently and
            // the select raced; give the slot back
            inner.ungrant(class);
            debug!(?class, "returned slot granted to a cancelled waiter");
        }
    }

    /// Current usage snapshot `(pre, exe, post, total)`.
    pub fn usage(&self) -> (usize, usize, usize, usize) {
        let inner = self.inner.lock().expect("slot pool poisoned");
        (
            inner.in_use[0],
            inner.in_use[1],
            inner.in_use[2],
            inner.total_in_use,
        )
    }

    pub fn budget(&self) -> SlotBudget {
        self.inner.lock().expect("slot pool poisoned").budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn budget(total: usize, pre: usize, exe: usize, post: usize) -> SlotBudget {
        SlotBudget {
            total,
            pre,
            exe,
            post,
        }
    }

    #[tokio::test]
    async fn test_acquire_within_cap() {
        let pool = SlotPool::new(budget(2, 2, 2, 2));
        let cancel = CancellationToken::new();
        let _a = pool.acquire(SlotClass::Exe, &cancel).await.unwrap();
        let _b = pool.acquire(SlotClass::Pre, &cancel).await.unwrap();
        assert_eq!(pool.usage().3, 2);
    }

    #[tokio::test]
    async fn test_global_budget_binds_all_classes() {
        // class caps alone would allow 3, the parent budget does not
        let pool = SlotPool::new(budget(2, 1, 1, 1));
        let cancel = CancellationToken::new();
        let _a = pool.acquire(SlotClass::Pre, &cancel).await.unwrap();
        let _b = pool.acquire(SlotClass::Exe, &cancel).await.unwrap();
        assert!(pool.try_acquire(SlotClass::Post).is_none());
    }

    #[tokio::test]
    async fn test_release_wakes_waiter_fifo() {
        let pool = SlotPool::new(budget(1, 1, 1, 1));
        let cancel = CancellationToken::new();
        let guard = pool.acquire(SlotClass::Exe, &cancel).await.unwrap();

        let mut order = Vec::new();
        let mut handles = Vec::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let g = pool.acquire(SlotClass::Exe, &cancel).await.unwrap();
                tx.send(i).unwrap();
                drop(g);
            }));
            // serialize arrival so the queue order is deterministic
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(guard);
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaks_nothing() {
        let pool = SlotPool::new(budget(1, 1, 1, 1));
        let cancel = CancellationToken::new();
        let guard = pool.acquire(SlotClass::Exe, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let pool = pool.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { pool.acquire(SlotClass::Exe, &waiter_cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        waiter_cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ControllerError::AdmissionCancelled)
        ));

        drop(guard);
        // the slot the cancelled waiter never took is still available
        assert!(pool.try_acquire(SlotClass::Exe).is_some());
        assert_eq!(pool.usage().3, 1);
    }

    #[tokio::test]
    async fn test_conservation_under_load() {
        let pool = SlotPool::new(budget(4, 2, 3, 2));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for i in 0..40 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let class = match i % 3 {
                0 => SlotClass::Pre,
                1 => SlotClass::Exe,
                _ => SlotClass::Post,
            };
            handles.push(tokio::spawn(async move {
                let _g = pool.acquire(class, &cancel).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(pool.usage(), (0, 0, 0, 0));
    }
}
