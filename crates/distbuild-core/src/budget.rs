//! Local slot budget.

use serde::{Deserialize, Serialize};

/// The three local work phases, each with its own bounded parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotClass {
    /// Preprocess phase.
    Pre,
    /// Compile/execute phase.
    Exe,
    /// Post-process phase.
    Post,
}

impl SlotClass {
    /// All classes, in admission-priority order.
    pub const ALL: [SlotClass; 3] = [SlotClass::Pre, SlotClass::Exe, SlotClass::Post];
}

/// Per-controller slot budget: one parent `total` that the three class caps
/// draw from. Invariant: `pre, exe, post <= total` and every field `>= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBudget {
    pub total: usize,
    pub pre: usize,
    pub exe: usize,
    pub post: usize,
}

impl SlotBudget {
    /// Derive a budget from configured values, falling back to the host CPU
    /// count. A zero `total` means "derive from `ncpu - 2`"; a class value
    /// of zero or one above `total` clamps to `total`.
    pub fn derive(total: usize, pre: usize, exe: usize, post: usize, ncpu: usize) -> Self {
        let total = if total == 0 {
            ncpu.saturating_sub(2).max(1)
        } else {
            total.max(1)
        };
        let clamp = |v: usize| {
            if v == 0 || v > total {
                total
            } else {
                v
            }
        };
        Self {
            total,
            pre: clamp(pre),
            exe: clamp(exe),
            post: clamp(post),
        }
    }

    /// Cap for one class.
    pub fn cap(&self, class: SlotClass) -> usize {
        match class {
            SlotClass::Pre => self.pre,
            SlotClass::Exe => self.exe,
            SlotClass::Post => self.post,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_from_cpu_count() {
        let b = SlotBudget::derive(0, 0, 0, 0, 16);
        assert_eq!(b.total, 14);
        assert_eq!(b.pre, 14);
        assert_eq!(b.exe, 14);
        assert_eq!(b.post, 14);
    }

    #[test]
    fn test_derive_small_host_still_positive() {
        let b = SlotBudget::derive(0, 0, 0, 0, 1);
        assert_eq!(b.total, 1);
        assert_eq!(b.exe, 1);
    }

    #[test]
    fn test_class_clamped_to_total() {
        let b = SlotBudget::derive(8, 4, 100, 0, 32);
        assert_eq!(b.total, 8);
        assert_eq!(b.pre, 4);
        assert_eq!(b.exe, 8);
        assert_eq!(b.post, 8);
    }
}
