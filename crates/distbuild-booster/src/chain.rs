//! Action-chain file loading and pre-execution fixup.
//!
//! The build driver drops a JSON chain file next to the booster; before the
//! DAG is built, template placeholders are substituted and each action gets
//! its display descriptor and compile classification.

use crate::error::BoosterError;
use distbuild_core::protocol::Toolchain;
use distbuild_core::Action;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// `${tool_key}` in `Cmd` becomes the first toolchain key.
pub const TEMPLATE_TOOL_KEY: &str = "${tool_key}";
/// `${tool_key_dir}` in `Workdir` becomes the toolchain key's parent dir.
pub const TEMPLATE_TOOL_KEY_DIR: &str = "${tool_key_dir}";
/// `${host_ip}` in `Arg` becomes a routable local IPv4.
pub const TEMPLATE_HOST_IP: &str = "${host_ip}";

/// Display descriptors cut the argument string off at this many characters.
const DESC_MAX_LEN: usize = 50;

const COMPILER_EXES: &[&str] = &[
    "cl.exe",
    "cl-filter.exe",
    "clang.exe",
    "clang++.exe",
    "clang",
    "clang++",
    "prospero-clang.exe",
    "clang-cl.exe",
];

const LINKER_EXES: &[&str] = &["lib.exe", "link.exe", "link-filter.exe"];

const COMPILE_SUFFIXES: &[&str] = &[".cpp", ".c", ".response\"", ".response"];
const LINK_SUFFIXES: &[&str] = &[".dll", ".lib", ".response\"", ".response"];

/// The parsed action-chain document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionChain {
    #[serde(rename = "Actions", default)]
    pub actions: Vec<Action>,
}

impl ActionChain {
    /// Load a chain file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BoosterError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| BoosterError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        let chain: ActionChain = serde_json::from_str(&data)?;
        Ok(chain)
    }

    /// Substitute template placeholders against the given toolchain and the
    /// host address, then derive descriptors and compile flags.
    pub fn prepare(&mut self, toolchain: Option<&Toolchain>, host_ip: Option<&str>) {
        let tool_key = toolchain
            .and_then(|t| t.toolchains.first())
            .map(|e| e.tool_key.clone());

        for action in &mut self.actions {
            if let Some(key) = &tool_key {
                if action.cmd == TEMPLATE_TOOL_KEY {
                    action.cmd = key.clone();
                }
                if action.workdir == TEMPLATE_TOOL_KEY_DIR {
                    action.workdir = parent_dir(key);
                }
            }
            if let Some(ip) = host_ip {
                if action.arg.contains(TEMPLATE_HOST_IP) {
                    action.arg = action.arg.replace(TEMPLATE_HOST_IP, ip);
                }
            }
            analyze(action);
        }
    }
}

/// Pick the address to substitute for `${host_ip}`: the first IPv4 outside
/// the private RFC1918/loopback prefixes, or the first address at all.
pub fn pick_host_ip(addrs: &[IpAddr]) -> Option<String> {
    let v4: Vec<&IpAddr> = addrs.iter().filter(|a| a.is_ipv4()).collect();
    for addr in &v4 {
        if let IpAddr::V4(ip) = addr {
            let octets = ip.octets();
            let private = octets[0] == 192 || octets[0] == 172 || octets[0] == 127;
            if !private {
                return Some(addr.to_string());
            }
        }
    }
    v4.first()
        .map(|a| a.to_string())
        .or_else(|| addrs.first().map(|a| a.to_string()))
}

/// Derive the display descriptor, compile flag and module path for one
/// action from its command and argument string.
pub fn analyze(action: &mut Action) {
    let exe = file_name(&action.cmd);

    let suffixes: &[&str] = if COMPILER_EXES.contains(&exe.as_str()) {
        action.is_compile = true;
        COMPILE_SUFFIXES
    } else if LINKER_EXES.contains(&exe.as_str()) {
        LINK_SUFFIXES
    } else {
        action.desc = format!("{} {}...", exe, truncate(&action.arg, DESC_MAX_LEN));
        return;
    };

    let args = shlex::split(&escape_backslashes(&action.arg)).unwrap_or_default();
    if args.len() == 1 {
        let base = file_name(action.arg.trim_end_matches('"'));
        action.desc = format!("{exe} {base}");
        action.module_path = Some(parent_dir(&action.arg));
        return;
    }

    for arg in &args {
        for suffix in suffixes {
            if arg.ends_with(suffix) {
                let trimmed = arg.trim_end_matches('"');
                action.desc = format!("{exe} {trimmed}");
                action.module_path = Some(parent_dir(trimmed));
                return;
            }
        }
    }

    action.desc = format!("{} {}...", exe, truncate(&action.arg, DESC_MAX_LEN));
}

/// Double lone backslashes so Windows paths survive shell-style splitting,
/// leaving quote characters alone.
pub fn escape_backslashes(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('"') => out.push(c),
                _ => out.push_str("\\\\"),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn parent_dir(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distbuild_core::protocol::ToolchainEntry;

    #[test]
    fn test_analyze_compile_action() {
        let mut action =
            Action::new("1", "C:\\tools\\cl.exe").with_arg(r#"/c "D:\src\game\main.cpp" /O2"#);
        analyze(&mut action);
        assert!(action.is_compile);
        assert!(action.desc.starts_with("cl.exe"));
        assert!(action.desc.contains("main.cpp"));
        assert!(action.module_path.is_some());
    }

    #[test]
    fn test_analyze_linker_action_not_compile() {
        let mut action = Action::new("2", "/usr/bin/link.exe").with_arg("/OUT:engine.dll a.obj");
        analyze(&mut action);
        assert!(!action.is_compile);
        assert!(action.desc.contains("engine.dll"));
    }

    #[test]
    fn test_analyze_other_action_truncates() {
        let long_arg = "x".repeat(200);
        let mut action = Action::new("3", "python").with_arg(long_arg);
        analyze(&mut action);
        assert!(action.desc.starts_with("python "));
        assert!(action.desc.ends_with("..."));
        assert!(action.desc.len() < 80);
    }

    #[test]
    fn test_prepare_substitutes_tool_key() {
        let toolchain = Toolchain {
            toolchains: vec![ToolchainEntry {
                tool_key: "/opt/llvm/bin/clang++".to_string(),
            }],
        };
        let mut chain = ActionChain {
            actions: vec![{
                let mut a = Action::new("1", TEMPLATE_TOOL_KEY).with_arg("-flag ${host_ip}");
                a.workdir = TEMPLATE_TOOL_KEY_DIR.to_string();
                a
            }],
        };
        chain.prepare(Some(&toolchain), Some("9.8.7.6"));
        assert_eq!(chain.actions[0].cmd, "/opt/llvm/bin/clang++");
        assert_eq!(chain.actions[0].workdir, "/opt/llvm/bin");
        assert_eq!(chain.actions[0].arg, "-flag 9.8.7.6");
    }

    #[test]
    fn test_pick_host_ip_skips_private_prefixes() {
        let addrs = vec![
            "127.0.0.1".parse().unwrap(),
            "192.168.1.4".parse().unwrap(),
            "10.20.30.40".parse().unwrap(),
        ];
        // 10.x is not in the filtered prefix list, mirroring the client-side
        // best-effort check
        assert_eq!(pick_host_ip(&addrs).unwrap(), "10.20.30.40");

        let only_private = vec!["192.168.1.4".parse().unwrap()];
        assert_eq!(pick_host_ip(&only_private).unwrap(), "192.168.1.4");
    }

    #[test]
    fn test_chain_json_layout() {
        let json = r#"{"Actions": [
            {"Index": "0", "Cmd": "cc", "Arg": "-c a.c", "Dep": []},
            {"Index": "1", "Cmd": "cc", "Arg": "-c b.c", "Dep": ["0"]}
        ]}"#;
        let chain: ActionChain = serde_json::from_str(json).unwrap();
        assert_eq!(chain.actions.len(), 2);
        assert_eq!(chain.actions[1].dep[0].as_str(), "0");
    }
}
