//! Command Executor
//!
//! Runs the plans produced by the synthesizer against a [`CommandRunner`].
//! The runner is the only thing that spawns processes; [`ProcessRunner`] is
//! the real one, tests substitute an in-memory rule table.
//!
//! Guarded scripts are executed in one of two [`ScriptMode`]s:
//!
//! - `Stepwise`: every check and mutation is spawned directly (no shell) and
//!   the combinator is applied here, which yields one [`StepOutcome`] per
//!   check/act pair.
//! - `Shell`: the script is rendered to its `(check || add) ; ...` form and
//!   handed to `sh -c` in a single spawn.
//!
//! Either way, remove-type plans always resolve `Ok`. A failed add resolves
//! `Err` after being logged.

use crate::core::command::{CommandPlan, CommandScript, Combinator, GuardedCommand, Invocation};
use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::core::rule::{Intent, RuleCategory};
use crate::utils::truncate_string;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Max command length kept in log lines
const LOG_COMMAND_LEN: usize = 240;

/// How guarded check/act scripts are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptMode {
    /// Spawn each check and mutation directly
    #[default]
    Stepwise,
    /// Render the script and run it through `sh -c`
    Shell,
}

/// Captured result of one spawned command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawns external commands.
///
/// `run` executes an argument vector with no shell interpretation, `run_shell`
/// passes a command line to `sh -c`. A `timeout` of `None` waits for the
/// process however long it takes.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;

    fn run_shell(
        &self,
        script: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs commands as child processes via `tokio::process`
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shell used for `run_shell` (default `sh`)
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn spawn(
        mut command: tokio::process::Command,
        display: String,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{display}: {e}")))?;

        let wait = child.wait_with_output();
        let output = match timeout {
            // Dropping the timed-out future drops the child, which kills it
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::Timeout {
                    command: display,
                    secs: limit.as_secs(),
                })??,
            None => wait.await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty argument vector".to_string()))?;
        let mut command = tokio::process::Command::new(program);
        command.args(args);
        Self::spawn(command, argv.join(" "), timeout).await
    }

    async fn run_shell(&self, script: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        let mut command = tokio::process::Command::new(&self.shell);
        command.arg("-c").arg(script);
        Self::spawn(command, script.to_string(), timeout).await
    }
}

/// What happened to one check/act pair or plain command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Check found the rule, add skipped
    Present,
    /// Check did not find the rule, delete skipped
    Absent,
    /// Add ran and succeeded
    Applied,
    /// Delete ran and succeeded
    Removed,
    /// Unguarded command or whole shell script succeeded
    Completed,
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }

    fn mutated(&self) -> bool {
        matches!(self, StepOutcome::Applied | StepOutcome::Removed)
    }

    fn from_error(e: &Error) -> Self {
        StepOutcome::Failed {
            exit_code: None,
            stderr: e.to_string(),
        }
    }
}

/// Net effect of an applied plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApplyStatus {
    /// At least one mutation ran
    Changed,
    /// Every check made its mutation unnecessary
    Unchanged,
    /// Ran as one unit (plain argv or shell script), no per-step detail
    #[default]
    Completed,
}

/// Success value delivered for a finished request
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub request_id: Uuid,
    pub category: RuleCategory,
    pub intent: Intent,
    pub status: ApplyStatus,
    pub steps: Vec<StepOutcome>,
    /// Stdout of the last command that ran (rule listings)
    pub output: String,
    /// Non-empty stderr of commands that succeeded (iptables warnings)
    pub warnings: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ApplyReport {
    /// Steps that failed. Only non-empty for remove plans, whose failures
    /// never reach the caller as an `Err`.
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.is_failure())
    }
}

/// Executes synthesized plans
#[derive(Debug, Clone)]
pub struct Executor<R> {
    runner: R,
    mode: ScriptMode,
    timeout: Option<Duration>,
}

impl<R: CommandRunner> Executor<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            mode: ScriptMode::default(),
            timeout: None,
        }
    }

    pub fn with_mode(mut self, mode: ScriptMode) -> Self {
        self.mode = mode;
        self
    }

    /// Per-process timeout. The serializer path runs without one.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn mode(&self) -> ScriptMode {
        self.mode
    }

    /// Runs a plan to completion.
    ///
    /// # Errors
    ///
    /// For add and read plans: `Error::Execution` when a command exits
    /// non-zero, or the spawn/timeout error. Remove plans never fail here;
    /// their failures are only visible in [`ApplyReport::steps`].
    pub async fn execute(
        &self,
        request_id: Uuid,
        plan: &CommandPlan,
        submitted_at: DateTime<Utc>,
    ) -> Result<ApplyReport> {
        let tag = plan.category.log_tag();
        let rendered = plan.invocation.render();
        debug!("[{tag}] {} {}", plan.intent, truncate_string(&rendered, LOG_COMMAND_LEN));

        let run = match &plan.invocation {
            Invocation::Argv(argv) => finish_single(plan, self.runner.run(argv, self.timeout).await)?,
            Invocation::Shell(line) => {
                finish_single(plan, self.runner.run_shell(line, self.timeout).await)?
            }
            Invocation::Guarded(script) => match self.mode {
                ScriptMode::Stepwise => self.run_stepwise(plan, script).await?,
                ScriptMode::Shell => {
                    let result = self.runner.run_shell(&script.render(), self.timeout).await;
                    finish_single(plan, result)?
                }
            },
        };

        for warning in &run.warnings {
            debug!("[{tag}] stderr: {warning}");
        }
        debug!("[{tag}] finished: {}", run.status);
        Ok(ApplyReport {
            request_id,
            category: plan.category,
            intent: plan.intent,
            status: run.status,
            steps: run.steps,
            output: run.output,
            warnings: run.warnings,
            submitted_at,
            completed_at: Utc::now(),
        })
    }

    async fn run_stepwise(&self, plan: &CommandPlan, script: &CommandScript) -> Result<PlanRun> {
        let tag = plan.category.log_tag();
        let mut run = PlanRun::default();
        let mut first_error = None;

        // Every pair is attempted, even after an earlier one failed
        for step in &script.steps {
            let result = self.run_step(step).await;
            if let StepOutcome::Failed { exit_code, stderr } = &result.outcome {
                if plan.intent == Intent::Remove {
                    debug!("[{tag}] delete step failed ({exit_code:?}), ignored: {}", stderr.trim());
                } else {
                    log_failure(plan, stderr);
                }
                if first_error.is_none() {
                    first_error =
                        Some(result.error.unwrap_or_else(|| execution_error(*exit_code, stderr)));
                }
            }
            run.warnings.extend(result.warnings);
            run.output = result.stdout;
            run.steps.push(result.outcome);
        }

        if plan.intent != Intent::Remove
            && let Some(e) = first_error
        {
            return Err(e);
        }

        run.status = if run.steps.iter().any(StepOutcome::mutated) {
            ApplyStatus::Changed
        } else {
            ApplyStatus::Unchanged
        };
        Ok(run)
    }

    /// Runs one check/act pair, applying its combinator.
    ///
    /// Only exit 0 (found) and exit 1 (no such rule) are answers from the
    /// check. Any other exit, or a spawn/timeout error, fails the step
    /// without running the mutation.
    async fn run_step(&self, step: &GuardedCommand) -> StepResult {
        let mut result = StepResult::default();

        let check = match self.runner.run(&step.check, self.timeout).await {
            Ok(out) => out,
            Err(e) => return result.errored(e),
        };
        let found = match check.exit_code {
            Some(0) => true,
            Some(CHECK_NOT_FOUND) => false,
            exit_code => {
                result.outcome = StepOutcome::Failed {
                    exit_code,
                    stderr: check.stderr,
                };
                result.stdout = check.stdout;
                return result;
            }
        };
        if found {
            result.note(&check.stderr);
        }

        if !step.combinator.should_mutate(found) {
            result.outcome = match step.combinator {
                Combinator::IfAbsent => StepOutcome::Present,
                Combinator::IfPresent => StepOutcome::Absent,
            };
            result.stdout = check.stdout;
            return result;
        }

        let out = match self.runner.run(&step.mutate, self.timeout).await {
            Ok(out) => out,
            Err(e) => return result.errored(e),
        };
        result.outcome = if out.success() {
            result.note(&out.stderr);
            match step.combinator {
                Combinator::IfAbsent => StepOutcome::Applied,
                Combinator::IfPresent => StepOutcome::Removed,
            }
        } else {
            StepOutcome::Failed {
                exit_code: out.exit_code,
                stderr: out.stderr,
            }
        };
        result.stdout = out.stdout;
        result
    }
}

/// iptables `-C` exit status when the rule does not exist
const CHECK_NOT_FOUND: i32 = 1;

/// What a plan produced, before it becomes an [`ApplyReport`]
#[derive(Default)]
struct PlanRun {
    status: ApplyStatus,
    steps: Vec<StepOutcome>,
    output: String,
    warnings: Vec<String>,
}

struct StepResult {
    outcome: StepOutcome,
    stdout: String,
    warnings: Vec<String>,
    /// Spawn or timeout error behind a `Failed` outcome
    error: Option<Error>,
}

impl Default for StepResult {
    fn default() -> Self {
        Self {
            outcome: StepOutcome::Completed,
            stdout: String::new(),
            warnings: Vec::new(),
            error: None,
        }
    }
}

impl StepResult {
    fn errored(mut self, e: Error) -> Self {
        self.outcome = StepOutcome::from_error(&e);
        self.error = Some(e);
        self
    }

    fn note(&mut self, stderr: &str) {
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            self.warnings.push(stderr.to_string());
        }
    }
}

/// Classifies the result of a plan that ran as a single process
fn finish_single(plan: &CommandPlan, result: Result<CommandOutput>) -> Result<PlanRun> {
    match result {
        Ok(out) if out.success() => {
            let stderr = out.stderr.trim();
            Ok(PlanRun {
                status: ApplyStatus::Completed,
                steps: vec![StepOutcome::Completed],
                output: out.stdout,
                warnings: if stderr.is_empty() {
                    Vec::new()
                } else {
                    vec![stderr.to_string()]
                },
            })
        }
        Ok(out) => {
            if plan.intent == Intent::Remove {
                debug!(
                    "[{}] remove exited {:?}, ignored: {}",
                    plan.category.log_tag(),
                    out.exit_code,
                    out.stderr.trim()
                );
                return Ok(PlanRun {
                    status: ApplyStatus::Completed,
                    steps: vec![StepOutcome::Failed {
                        exit_code: out.exit_code,
                        stderr: out.stderr,
                    }],
                    output: out.stdout,
                    warnings: Vec::new(),
                });
            }
            log_failure(plan, &out.stderr);
            Err(execution_error(out.exit_code, &out.stderr))
        }
        Err(e) => {
            if plan.intent == Intent::Remove {
                debug!("[{}] remove failed, ignored: {e}", plan.category.log_tag());
                return Ok(PlanRun {
                    status: ApplyStatus::Completed,
                    steps: vec![StepOutcome::from_error(&e)],
                    ..PlanRun::default()
                });
            }
            log_failure(plan, &e.to_string());
            Err(e)
        }
    }
}

fn execution_error(exit_code: Option<i32>, stderr: &str) -> Error {
    let translation = IptablesErrorPattern::match_error(stderr);
    Error::Execution {
        message: translation.user_message,
        stderr: Some(stderr.to_string()),
        exit_code,
    }
}

fn log_failure(plan: &CommandPlan, stderr: &str) {
    let tag = plan.category.log_tag();
    let translation = IptablesErrorPattern::match_error(stderr);
    if plan.intent == Intent::Add {
        error!("[{tag}] add failed: {}", translation.user_message);
    } else {
        warn!("[{tag}] {} failed: {}", plan.intent, translation.user_message);
    }
    for suggestion in &translation.suggestions {
        debug!("[{tag}] hint: {suggestion}");
    }
}
