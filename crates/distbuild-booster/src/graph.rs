//! The action DAG engine.
//!
//! An array-backed action table with an id index and a ready list. The
//! engine is single-writer: the run loop owns it and applies results in
//! arrival order, so there is no internal locking.

use distbuild_core::{Action, ActionId, CoreError};
use std::collections::HashMap;

/// Engine knobs fixed at load time.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphOptions {
    /// Among ready candidates, prefer the one with the most dependents.
    pub most_dependents_first: bool,
    /// Treat failed actions as finished for DAG progress instead of
    /// halting the run.
    pub continue_on_error: bool,
}

/// Dependency-resolving store for one action chain.
#[derive(Debug)]
pub struct ActionGraph {
    actions: Vec<Action>,
    by_id: HashMap<ActionId, usize>,
    /// Indices of actions whose dependency set has drained, in the order
    /// they became ready.
    ready: Vec<usize>,
    finished: usize,
    halted: bool,
    opts: GraphOptions,
}

impl ActionGraph {
    /// Validate and index a chain. Rejects duplicate identities, references
    /// to unknown identities and dependency cycles.
    pub fn load(actions: Vec<Action>, opts: GraphOptions) -> Result<Self, CoreError> {
        let mut by_id = HashMap::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            if by_id.insert(action.index.clone(), i).is_some() {
                return Err(CoreError::DuplicateAction(action.index.to_string()));
            }
        }

        let mut graph = Self {
            actions,
            by_id,
            ready: Vec::new(),
            finished: 0,
            halted: false,
            opts,
        };

        // derive follow edges from the forward dependency sets
        for i in 0..graph.actions.len() {
            for dep in graph.actions[i].dep.clone() {
                let Some(&di) = graph.by_id.get(&dep) else {
                    return Err(CoreError::UnknownDependency {
                        action: graph.actions[i].index.to_string(),
                        dep: dep.to_string(),
                    });
                };
                graph.actions[di].follow.push(i);
            }
        }

        graph.check_acyclic()?;

        for (i, action) in graph.actions.iter().enumerate() {
            if action.dep.is_empty() {
                graph.ready.push(i);
            }
        }

        Ok(graph)
    }

    /// Kahn's algorithm over the derived edges; any node left with a
    /// nonzero in-degree sits on a cycle.
    fn check_acyclic(&self) -> Result<(), CoreError> {
        let mut indegree: Vec<usize> = self.actions.iter().map(|a| a.dep.len()).collect();
        let mut queue: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut seen = 0;
        while let Some(i) = queue.pop() {
            seen += 1;
            for &f in &self.actions[i].follow {
                indegree[f] -= 1;
                if indegree[f] == 0 {
                    queue.push(f);
                }
            }
        }
        if seen != self.actions.len() {
            let stuck = indegree
                .iter()
                .position(|&d| d > 0)
                .map(|i| self.actions[i].index.to_string())
                .unwrap_or_default();
            return Err(CoreError::DependencyCycle(stuck));
        }
        Ok(())
    }

    /// Pick the next dispatchable action: not running, not finished, no
    /// remaining dependencies. Ties break by follower count when
    /// `most_dependents_first` is set, else by readiness order.
    pub fn next_ready(&self) -> Option<&Action> {
        if self.halted {
            return None;
        }

        if self.opts.most_dependents_first {
            let mut best: Option<usize> = None;
            let mut followers = 0usize;
            for &i in &self.ready {
                let action = &self.actions[i];
                if action.running || action.finished {
                    continue;
                }
                if best.is_none() || action.follow.len() > followers {
                    best = Some(i);
                    followers = action.follow.len();
                }
            }
            return best.map(|i| &self.actions[i]);
        }

        self.ready
            .iter()
            .map(|&i| &self.actions[i])
            .find(|a| !a.running && !a.finished)
    }

    /// Flag an action as handed to the dispatcher.
    pub fn mark_running(&mut self, id: &ActionId) {
        if let Some(&i) = self.by_id.get(id) {
            self.actions[i].running = true;
        }
    }

    /// Apply one finished result: the action becomes terminal, and on
    /// success (or always, when failures are tolerated) every dependent
    /// loses this edge; dependents whose sets drain become ready. A failure
    /// under the halt policy freezes the ready set for good.
    pub fn mark_finished(&mut self, id: &ActionId, exit_code: i32) -> Result<(), CoreError> {
        let Some(&i) = self.by_id.get(id).filter(|&&i| !self.actions[i].finished) else {
            return Err(CoreError::InvalidInput(format!(
                "finish for unknown or already finished action {id}"
            )));
        };

        self.actions[i].finished = true;
        self.actions[i].running = false;
        self.finished += 1;
        self.ready.retain(|&r| r != i);

        if exit_code != 0 && !self.opts.continue_on_error {
            self.halted = true;
            return Ok(());
        }

        let index = self.actions[i].index.clone();
        for f in self.actions[i].follow.clone() {
            let dependent = &mut self.actions[f];
            dependent.dep.retain(|d| *d != index);
            if dependent.is_ready() {
                self.ready.push(f);
            }
        }
        Ok(())
    }

    /// True once every action reached a terminal state.
    pub fn done(&self) -> bool {
        self.finished == self.actions.len()
    }

    /// The run can no longer make progress because a failure halted it.
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn total(&self) -> usize {
        self.actions.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished
    }

    /// Look an action up by id.
    pub fn get(&self, id: &ActionId) -> Option<&Action> {
        self.by_id.get(id).map(|&i| &self.actions[i])
    }

    /// Count of compile actions, for progress accounting.
    pub fn compile_total(&self) -> usize {
        self.actions.iter().filter(|a| a.is_compile).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str, deps: &[&str]) -> Action {
        let mut a = Action::new(id, "cc").with_arg(format!("-c {id}.c"));
        for d in deps {
            a = a.with_dep(*d);
        }
        a
    }

    fn diamond() -> Vec<Action> {
        // A -> B, A -> C, B -> D, C -> D
        vec![
            action("A", &[]),
            action("B", &["A"]),
            action("C", &["A"]),
            action("D", &["B", "C"]),
        ]
    }

    #[test]
    fn test_load_rejects_duplicate_ids() {
        let err = ActionGraph::load(
            vec![action("A", &[]), action("A", &[])],
            GraphOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateAction(_)));
    }

    #[test]
    fn test_load_rejects_unknown_dep() {
        let err = ActionGraph::load(vec![action("A", &["ghost"])], GraphOptions::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownDependency { .. }));
    }

    #[test]
    fn test_load_rejects_cycle() {
        let err = ActionGraph::load(
            vec![action("A", &["B"]), action("B", &["A"])],
            GraphOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::DependencyCycle(_)));
    }

    #[test]
    fn test_diamond_all_success_order() {
        let mut g = ActionGraph::load(diamond(), GraphOptions::default()).unwrap();
        let mut order = Vec::new();
        while !g.done() {
            let id = g.next_ready().map(|a| a.index.clone()).expect("not stuck");
            g.mark_running(&id);
            order.push(id.clone());
            g.mark_finished(&id, 0).unwrap();
        }
        assert_eq!(order.len(), 4);
        let pos = |id: &str| order.iter().position(|a| a.as_str() == id).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
    }

    #[test]
    fn test_diamond_failure_halts_descendants() {
        let mut g = ActionGraph::load(diamond(), GraphOptions::default()).unwrap();
        let a = g.next_ready().unwrap().index.clone();
        assert_eq!(a.as_str(), "A");
        g.mark_running(&a);
        g.mark_finished(&a, 0).unwrap();

        let b = g.next_ready().unwrap().index.clone();
        g.mark_running(&b);
        g.mark_finished(&b, 1).unwrap();

        assert!(g.halted());
        assert!(g.next_ready().is_none());
        assert!(!g.done());
    }

    #[test]
    fn test_diamond_continue_on_error_runs_all() {
        let opts = GraphOptions {
            continue_on_error: true,
            ..Default::default()
        };
        let mut g = ActionGraph::load(diamond(), opts).unwrap();
        let mut dispatched = 0;
        let mut last = None;
        while !g.done() {
            let id = g.next_ready().map(|a| a.index.clone()).expect("not stuck");
            g.mark_running(&id);
            dispatched += 1;
            // B fails, the rest succeed
            let code = if id.as_str() == "B" { 1 } else { 0 };
            last = Some(id.clone());
            g.mark_finished(&id, code).unwrap();
        }
        assert_eq!(dispatched, 4);
        assert_eq!(last.unwrap().as_str(), "D");
    }

    #[test]
    fn test_most_dependents_first() {
        let opts = GraphOptions {
            most_dependents_first: true,
            ..Default::default()
        };
        // "hub" unblocks two dependents, "leaf" none
        let g = ActionGraph::load(
            vec![
                action("leaf", &[]),
                action("hub", &[]),
                action("x", &["hub"]),
                action("y", &["hub"]),
            ],
            opts,
        )
        .unwrap();
        assert_eq!(g.next_ready().unwrap().index.as_str(), "hub");
    }

    #[test]
    fn test_ready_never_reverts() {
        let mut g = ActionGraph::load(diamond(), GraphOptions::default()).unwrap();
        let a = g.next_ready().unwrap().index.clone();
        g.mark_running(&a);
        // while A runs nothing else is ready
        assert!(g.next_ready().is_none());
        g.mark_finished(&a, 0).unwrap();
        // duplicate finish is rejected
        assert!(g.mark_finished(&a, 0).is_err());
    }

    #[test]
    fn test_no_deadlock_on_wide_graph() {
        let mut actions: Vec<Action> = (0..100).map(|i| action(&i.to_string(), &[])).collect();
        for i in 10..100 {
            let dep = (i % 10).to_string();
            actions[i] = action(&i.to_string(), &[&dep]);
        }
        let mut g = ActionGraph::load(actions, GraphOptions::default()).unwrap();
        let mut steps = 0;
        while !g.done() {
            let id = g.next_ready().map(|a| a.index.clone()).expect("not stuck");
            g.mark_running(&id);
            g.mark_finished(&id, 0).unwrap();
            steps += 1;
            assert!(steps <= 100);
        }
        assert_eq!(steps, 100);
    }
}
