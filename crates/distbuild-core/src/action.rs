//! Build actions and their results.

use crate::{ActionId, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One build action: a single compiler/linker invocation with identity and
/// dependencies, as delivered by the build driver in the action-chain file.
///
/// The serialized form matches the chain file layout; the runtime flags and
/// derived fields are never read from the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Stable identity inside the chain.
    #[serde(rename = "Index")]
    pub index: ActionId,

    /// Executable path.
    #[serde(rename = "Cmd")]
    pub cmd: String,

    /// Raw argument string, tokenized at dispatch time.
    #[serde(rename = "Arg", default)]
    pub arg: String,

    /// Working directory for the invocation.
    #[serde(rename = "Workdir", default)]
    pub workdir: String,

    /// Identities of actions that must finish before this one.
    #[serde(rename = "Dep", default)]
    pub dep: Vec<ActionId>,

    /// Opaque attributes forwarded to the executor.
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,

    /// Indices (into the action table) of actions that depend on this one.
    /// Derived from `dep` at load time.
    #[serde(skip)]
    pub follow: Vec<usize>,

    /// The action has been handed to the dispatcher.
    #[serde(skip)]
    pub running: bool,

    /// The action reached a terminal state. Never reverts.
    #[serde(skip)]
    pub finished: bool,

    /// The command was recognized as a compiler invocation.
    #[serde(skip)]
    pub is_compile: bool,

    /// Short display descriptor for progress lines.
    #[serde(skip)]
    pub desc: String,

    /// Module grouping key derived from the compile target path.
    #[serde(skip)]
    pub module_path: Option<String>,
}

impl Action {
    /// Create a bare action, mostly useful in tests.
    pub fn new(index: impl Into<ActionId>, cmd: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            cmd: cmd.into(),
            arg: String::new(),
            workdir: String::new(),
            dep: Vec::new(),
            attributes: HashMap::new(),
            follow: Vec::new(),
            running: false,
            finished: false,
            is_compile: false,
            desc: String::new(),
            module_path: None,
        }
    }

    /// Builder method to set the argument string.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = arg.into();
        self
    }

    /// Builder method to add a dependency.
    pub fn with_dep(mut self, dep: impl Into<ActionId>) -> Self {
        self.dep.push(dep.into());
        self
    }

    /// Builder method to set the working directory.
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// True when the action may be handed to the dispatcher.
    pub fn is_ready(&self) -> bool {
        !self.running && !self.finished && self.dep.is_empty()
    }
}

/// Result of one action execution attempt chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Identity of the finished action.
    pub index: ActionId,

    /// Final exit code.
    pub exit_code: i32,

    /// Error classification for the retry policy.
    pub error: ErrorKind,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// How many times the action was attempted in total.
    pub attempts: u32,
}

impl ActionResult {
    /// A clean success for `index`.
    pub fn success(index: ActionId) -> Self {
        Self {
            index,
            exit_code: 0,
            error: ErrorKind::None,
            stdout: String::new(),
            stderr: String::new(),
            attempts: 1,
        }
    }

    /// True when the action finished with exit code zero and no error.
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && self.error == ErrorKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_file_field_names() {
        let json = r#"{
            "Index": "3",
            "Cmd": "/usr/bin/clang++",
            "Arg": "-c main.cpp",
            "Workdir": "/src",
            "Dep": ["1", "2"],
            "Attributes": {"pch": "shared"}
        }"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert_eq!(action.index.as_str(), "3");
        assert_eq!(action.dep.len(), 2);
        assert_eq!(action.attributes["pch"], "shared");
        assert!(!action.running);
    }

    #[test]
    fn test_is_ready() {
        let mut action = Action::new("1", "cc").with_dep("0");
        assert!(!action.is_ready());
        action.dep.clear();
        assert!(action.is_ready());
        action.running = true;
        assert!(!action.is_ready());
    }
}
