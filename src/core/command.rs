//! Command values produced by the synthesizer and consumed by the executor
//!
//! Idempotency is carried in the types instead of in string concatenation: a
//! [`GuardedCommand`] pairs a non-mutating `-C` check with the mutation it
//! guards and the [`Combinator`] that joins them. A [`CommandScript`] is an
//! ordered list of such pairs that must all be attempted.
//!
//! The executor either interprets a script step by step or renders it to the
//! shell form below and hands it to `sh -c`:
//!
//! ```text
//! add:     (check || add) ; (check || add)
//! delete:  (check && delete) ; (check && delete) ; true
//! ```

use crate::core::rule::{Intent, RuleCategory};
use serde::Serialize;
use std::fmt;

/// How a check gates its mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    /// `check || mutate`: mutate only when the check reports the rule absent
    IfAbsent,
    /// `check && mutate`: mutate only when the check reports the rule present
    IfPresent,
}

impl Combinator {
    pub const fn shell_op(self) -> &'static str {
        match self {
            Combinator::IfAbsent => "||",
            Combinator::IfPresent => "&&",
        }
    }

    /// Whether the mutation runs, given the check's success
    pub const fn should_mutate(self, check_succeeded: bool) -> bool {
        match self {
            Combinator::IfAbsent => !check_succeeded,
            Combinator::IfPresent => check_succeeded,
        }
    }
}

/// A check/act pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardedCommand {
    pub check: Vec<String>,
    pub mutate: Vec<String>,
    pub combinator: Combinator,
}

impl GuardedCommand {
    pub fn add_if_absent(check: Vec<String>, mutate: Vec<String>) -> Self {
        Self {
            check,
            mutate,
            combinator: Combinator::IfAbsent,
        }
    }

    pub fn delete_if_present(check: Vec<String>, mutate: Vec<String>) -> Self {
        Self {
            check,
            mutate,
            combinator: Combinator::IfPresent,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{} {} {}",
            render_argv(&self.check),
            self.combinator.shell_op(),
            render_argv(&self.mutate)
        )
    }
}

/// Ordered check/act pairs, every one of which is attempted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandScript {
    pub steps: Vec<GuardedCommand>,
    /// Append `; true` so the script reports success whatever happened
    pub always_succeed: bool,
    /// Wrap each step in parentheses when rendering
    pub grouped: bool,
}

impl CommandScript {
    /// `(check || add) ; ...`
    pub fn ensure_present(steps: Vec<GuardedCommand>) -> Self {
        Self {
            steps,
            always_succeed: false,
            grouped: true,
        }
    }

    /// `(check && delete) ; ... ; true`
    pub fn ensure_absent(steps: Vec<GuardedCommand>) -> Self {
        Self {
            steps,
            always_succeed: true,
            grouped: true,
        }
    }

    pub fn ungrouped(mut self) -> Self {
        self.grouped = false;
        self
    }

    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self
            .steps
            .iter()
            .map(|step| {
                if self.grouped {
                    format!("({})", step.render())
                } else {
                    step.render()
                }
            })
            .collect();
        if self.always_succeed {
            parts.push("true".to_string());
        }
        parts.join(" ; ")
    }
}

/// One unit of work for the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "style", content = "command", rename_all = "snake_case")]
pub enum Invocation {
    /// Direct spawn, no shell interpretation
    Argv(Vec<String>),
    /// Raw command line run through `sh -c`
    Shell(String),
    /// Check/act script
    Guarded(CommandScript),
}

impl Invocation {
    pub fn render(&self) -> String {
        match self {
            Invocation::Argv(argv) => render_argv(argv),
            Invocation::Shell(line) => line.clone(),
            Invocation::Guarded(script) => script.render(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Synthesized commands for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandPlan {
    pub category: RuleCategory,
    pub intent: Intent,
    pub invocation: Invocation,
}

/// Joins an argument vector for logging and shell rendering.
///
/// Arguments are validated at admission to a shell-safe alphabet, so no
/// quoting is applied.
pub fn render_argv(argv: &[String]) -> String {
    argv.join(" ")
}

/// Wraps a raw iptables command line so it can be re-run safely.
///
/// - `-A`/`-I` rules become `bash -c '<check> &>/dev/null || <rule>'`
/// - `-D` rules become `bash -c '<check> &>/dev/null && <rule>'`
/// - anything else is returned unchanged
///
/// The check is the same line with the action flag swapped for `-C`.
pub fn wrap_idempotent(rule: &str) -> String {
    if rule.contains(" -D ") {
        let check = rule.replacen(" -D ", " -C ", 1);
        return format!("bash -c '{check} &>/dev/null && {rule}'");
    }

    match [" -A ", " -I "].into_iter().find(|flag| rule.contains(flag)) {
        Some(flag) => {
            let check = rule.replacen(flag, " -C ", 1);
            format!("bash -c '{check} &>/dev/null || {rule}'")
        }
        None => rule.to_string(),
    }
}
