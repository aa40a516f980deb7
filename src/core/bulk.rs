//! Bulk Runner
//!
//! Runs an ordered list of raw command lines one at a time, each through the
//! shell with its own timeout. It does not go through [`RuleQueue`]: callers
//! use it for multi-step flushes and migrations where the command text is
//! already final.
//!
//! Every command is attempted. A failure is reported to the per-command
//! callback and the run continues; the last error seen is returned once the
//! whole list has been attempted.
//!
//! [`RuleQueue`]: crate::core::queue::RuleQueue

use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::core::executor::{CommandOutput, CommandRunner};
use crate::core::synthesizer::Synthesizer;
use crate::utils::truncate_string;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default per-command timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const LOG_COMMAND_LEN: usize = 160;

/// Tables cleared by [`flush`], in order
const FLUSH_TABLES: [Option<&str>; 4] = [None, Some("nat"), Some("raw"), Some("mangle")];

/// Runs `commands` sequentially.
///
/// `on_command` is called after each command with its index, text and
/// outcome. A non-zero exit is reported as `Error::Execution`.
///
/// # Errors
///
/// Returns the last error encountered, after every command has been tried.
pub async fn run_all<R, F>(
    runner: &R,
    commands: &[String],
    timeout: Duration,
    mut on_command: F,
) -> Result<()>
where
    R: CommandRunner,
    F: FnMut(usize, &str, &Result<CommandOutput>),
{
    let mut last_error = None;

    for (index, command) in commands.iter().enumerate() {
        info!("Running {}", truncate_string(command, LOG_COMMAND_LEN));

        let result = runner
            .run_shell(command, Some(timeout))
            .await
            .and_then(|output| {
                if !output.stdout.trim().is_empty() {
                    debug!("stdout: {}", output.stdout.trim_end());
                }
                if !output.stderr.trim().is_empty() {
                    warn!("stderr: {}", output.stderr.trim_end());
                }
                if output.success() {
                    Ok(output)
                } else {
                    Err(Error::Execution {
                        message: IptablesErrorPattern::match_error(&output.stderr).user_message,
                        stderr: Some(output.stderr),
                        exit_code: output.exit_code,
                    })
                }
            });

        match &result {
            Err(e @ Error::Timeout { .. }) => warn!("{e}"),
            Err(e) => error!("Command failed: {e}"),
            Ok(_) => {}
        }

        on_command(index, command, &result);
        if let Err(e) = result {
            last_error = Some(e);
        }
    }

    last_error.map_or(Ok(()), Err)
}

/// The `-F` chain for the filter, nat, raw and mangle tables, joined with
/// `&&` so it stops at the first failure
pub fn flush_command(synthesizer: &Synthesizer) -> String {
    let tool = synthesizer.elevated_tool().join(" ");
    FLUSH_TABLES
        .iter()
        .map(|table| match table {
            Some(table) => format!("{tool} -F -t {table}"),
            None => format!("{tool} -F"),
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Flushes every table.
///
/// # Errors
///
/// Returns the error of the flush chain, which `run_all` has already logged.
pub async fn flush<R: CommandRunner>(
    runner: &R,
    synthesizer: &Synthesizer,
    timeout: Duration,
) -> Result<()> {
    let command = flush_command(synthesizer);
    info!("Flushing filter, nat, raw and mangle tables");
    run_all(runner, std::slice::from_ref(&command), timeout, |_, _, _| {}).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::FakeIptables;

    fn lines(commands: &[&str]) -> Vec<String> {
        commands.iter().map(|c| (*c).to_string()).collect()
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let fake = FakeIptables::new();
        let commands = lines(&[
            "iptables -A INPUT -j A",
            "iptables -A INPUT -j B",
            "iptables -I INPUT -j C",
        ]);
        let mut seen = Vec::new();
        run_all(&fake, &commands, DEFAULT_TIMEOUT, |i, _, r| {
            seen.push((i, r.is_ok()));
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![(0, true), (1, true), (2, true)]);
        assert_eq!(fake.rules("filter", "INPUT"), vec!["-j C", "-j A", "-j B"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_run() {
        let fake = FakeIptables::new();
        let commands = lines(&[
            "iptables -D INPUT -j MISSING",
            "iptables -A INPUT -j OK",
            "iptables -D INPUT -j ALSO_MISSING",
            "iptables -A INPUT -j LAST",
        ]);
        let mut failures = Vec::new();
        let err = run_all(&fake, &commands, DEFAULT_TIMEOUT, |i, _, r| {
            if r.is_err() {
                failures.push(i);
            }
        })
        .await
        .unwrap_err();

        assert_eq!(failures, vec![0, 2]);
        assert_eq!(fake.rules("filter", "INPUT"), vec!["-j OK", "-j LAST"]);
        assert!(matches!(err, Error::Execution { exit_code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_timeout_reported_and_run_continues() {
        let fake = FakeIptables::new();
        fake.slow_when("SLOW", Duration::from_secs(30));
        let commands = lines(&["iptables -A INPUT -j SLOW", "iptables -A INPUT -j FAST"]);
        let err = run_all(&fake, &commands, Duration::from_millis(20), |_, _, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(fake.rules("filter", "INPUT"), vec!["-j FAST"]);
    }

    #[tokio::test]
    async fn test_one_at_a_time() {
        let fake = FakeIptables::new().with_delay(Duration::from_millis(2));
        let commands: Vec<String> = (0..5).map(|i| format!("iptables -A INPUT -j R{i}")).collect();
        run_all(&fake, &commands, DEFAULT_TIMEOUT, |_, _, _| {})
            .await
            .unwrap();
        assert_eq!(fake.peak_concurrency(), 1);
    }

    #[test]
    fn test_flush_command() {
        let synth = Synthesizer::default().with_elevation(vec!["sudo".to_string()]);
        assert_eq!(
            flush_command(&synth),
            "sudo iptables -w -F && sudo iptables -w -F -t nat && \
             sudo iptables -w -F -t raw && sudo iptables -w -F -t mangle"
        );
    }

    #[tokio::test]
    async fn test_flush_clears_all_tables() {
        let fake = FakeIptables::new();
        fake.seed("filter", "FORWARD", "-j DROP");
        fake.seed("nat", "PREROUTING", "-j DNAT");
        fake.seed("mangle", "PREROUTING", "-j MARK");
        flush(&fake, &Synthesizer::default(), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(fake.total_rules(), 0);
    }
}
