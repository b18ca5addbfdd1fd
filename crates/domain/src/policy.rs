//! Tool policy merge and the precedence helpers the Router needs.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Approval requirement for a named tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    Always,
    Dangerous,
    Never,
}

/// `{approvals, blocked_tools, allowed_commands, blocked_commands,
/// max_file_size, sandbox}`. All fields are deep-merged, later sources
/// overwriting earlier ones at leaf level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub approvals: HashMap<String, Approval>,
    #[serde(default)]
    pub blocked_tools: HashSet<String>,
    #[serde(default)]
    pub allowed_commands: HashSet<String>,
    #[serde(default)]
    pub blocked_commands: HashSet<String>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub sandbox: Option<bool>,
}

impl ToolPolicy {
    /// Deep merge `other` on top of `self`; `other`'s leaves win.
    pub fn merge(mut self, other: &ToolPolicy) -> Self {
        for (k, v) in &other.approvals {
            self.approvals.insert(k.clone(), *v);
        }
        self.blocked_tools.extend(other.blocked_tools.iter().cloned());
        self.allowed_commands.extend(other.allowed_commands.iter().cloned());
        self.blocked_commands.extend(other.blocked_commands.iter().cloned());
        if other.max_file_size.is_some() {
            self.max_file_size = other.max_file_size;
        }
        if other.sandbox.is_some() {
            self.sandbox = other.sandbox;
        }
        self
    }

    /// Force a set of tools to `require_approval`-equivalent (`Dangerous`)
    /// status. Used for group/supergroup/channel peers.
    pub fn force_dangerous(mut self, tools: &[&str]) -> Self {
        for t in tools {
            self.approvals.insert((*t).to_string(), Approval::Dangerous);
        }
        self
    }
}

/// Merge a precedence-ordered chain of policies, earliest first (agent →
/// channel → session → runtime).
pub fn merge_chain(chain: &[&ToolPolicy]) -> ToolPolicy {
    chain.iter().fold(ToolPolicy::default(), |acc, p| acc.merge(p))
}

pub fn approval_required(policy: &ToolPolicy, tool: &str) -> bool {
    matches!(policy.approvals.get(tool), Some(Approval::Always) | Some(Approval::Dangerous))
}

pub fn tool_blocked(policy: &ToolPolicy, tool: &str) -> bool {
    policy.blocked_tools.contains(tool) || matches!(policy.approvals.get(tool), Some(Approval::Never))
}

pub fn command_allowed(policy: &ToolPolicy, cmd: &str) -> bool {
    if policy.blocked_commands.contains(cmd) {
        return false;
    }
    if policy.allowed_commands.is_empty() {
        return true;
    }
    policy.allowed_commands.contains(cmd)
}
