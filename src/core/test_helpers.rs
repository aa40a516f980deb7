//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::error::{Error, Result};
use crate::core::executor::{CommandOutput, CommandRunner};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FWQ_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWQ_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// What iptables prints when `-C` or `-D` finds nothing
pub const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).\n";

const LAUNCHERS: [&str; 3] = ["sudo", "run0", "pkexec"];

#[derive(Default)]
struct FakeState {
    /// (table, chain) -> rule specs in chain order
    chains: BTreeMap<(String, String), Vec<String>>,
    invocations: Vec<String>,
    /// Mutations whose command line contains one of these fail with exit 1
    fail_patterns: Vec<String>,
    delay: Duration,
    /// Commands that sleep this long instead of `delay`
    slow_patterns: Vec<(String, Duration)>,
    /// Every iptables call exits with this code and stderr
    denied: Option<(i32, String)>,
    /// Commands containing one of these panic inside the runner
    panic_patterns: Vec<String>,
    /// Successful commands containing the pattern print the text on stderr
    stderr_notes: Vec<(String, String)>,
}

/// In-memory stand-in for iptables.
///
/// Implements [`CommandRunner`] over a simulated rule table. Understands
/// `-t`, `-w`, `-C`, `-A`, `-I`, `-D`, `-F` and `-L`, plus the shell scripts
/// the synthesizer renders (`;`, `&&`, `||`, parentheses, `true`).
///
/// Clones share state, so a test keeps one handle for assertions and gives
/// another to the executor.
///
/// # Example
///
/// ```ignore
/// let fake = FakeIptables::new().with_delay(Duration::from_millis(5));
/// let queue = RuleQueue::new(Synthesizer::default(), Executor::new(fake.clone()));
/// queue.dhcp_subnet_change("10.0.0.0/24".parse().unwrap(), true).await.unwrap();
/// assert_eq!(fake.rules("nat", "POSTROUTING").len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct FakeIptables {
    state: Arc<Mutex<FakeState>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeIptables {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Every command takes at least this long
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = delay;
        self
    }

    /// Commands containing `pattern` sleep for `delay`
    pub fn slow_when(&self, pattern: &str, delay: Duration) {
        self.lock().slow_patterns.push((pattern.to_string(), delay));
    }

    /// `-A`/`-I`/`-D` commands containing `pattern` exit 1
    pub fn fail_mutations_matching(&self, pattern: &str) {
        self.lock().fail_patterns.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_patterns.clear();
        state.denied = None;
        state.panic_patterns.clear();
    }

    /// Every iptables call, checks included, exits with `code`
    pub fn deny_all(&self, code: i32, stderr: &str) {
        self.lock().denied = Some((code, stderr.to_string()));
    }

    /// Commands containing `pattern` panic instead of returning
    pub fn panic_when(&self, pattern: &str) {
        self.lock().panic_patterns.push(pattern.to_string());
    }

    /// Successful commands containing `pattern` also print `stderr`
    pub fn stderr_when(&self, pattern: &str, stderr: &str) {
        self.lock()
            .stderr_notes
            .push((pattern.to_string(), stderr.to_string()));
    }

    /// Every simple command run so far, launcher prefix included
    pub fn invocations(&self) -> Vec<String> {
        self.lock().invocations.clone()
    }

    /// Invocations that change the rule table
    pub fn mutations(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|line| {
                let args: Vec<&str> = line.split_whitespace().collect();
                args.iter().any(|a| matches!(*a, "-A" | "-I" | "-D" | "-F"))
            })
            .collect()
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_rules(&self) -> usize {
        self.lock().chains.values().map(Vec::len).sum()
    }

    /// Highest number of commands that were running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Inserts a rule directly, bypassing the invocation log
    pub fn seed(&self, table: &str, chain: &str, spec: &str) {
        self.lock()
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(spec.to_string());
    }

    fn delay_for(&self, line: &str) -> Duration {
        let state = self.lock();
        state
            .slow_patterns
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map_or(state.delay, |(_, delay)| *delay)
    }

    async fn timed<F>(&self, line: &str, timeout: Option<Duration>, body: F) -> Result<CommandOutput>
    where
        F: FnOnce() -> CommandOutput,
    {
        let panics = self
            .lock()
            .panic_patterns
            .iter()
            .any(|p| line.contains(p.as_str()));
        assert!(!panics, "injected runner panic: {line}");

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay_for(line);
        let timed_out = timeout.is_some_and(|limit| delay > limit);
        if !delay.is_zero() {
            tokio::time::sleep(timeout.map_or(delay, |limit| delay.min(limit))).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match timeout {
            Some(limit) if timed_out => Err(Error::Timeout {
                command: line.to_string(),
                secs: limit.as_secs(),
            }),
            _ => Ok(body()),
        }
    }

    /// Applies one simple command to the table
    fn exec(&self, argv: &[&str]) -> CommandOutput {
        let line = argv.join(" ");
        let mut out = self.exec_table(argv, &line);
        let state = self.lock();
        let note = state
            .stderr_notes
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()));
        if out.success()
            && let Some((_, note)) = note
        {
            out.stderr.clone_from(note);
        }
        out
    }

    fn exec_table(&self, argv: &[&str], line: &str) -> CommandOutput {
        let mut state = self.lock();
        state.invocations.push(line.to_string());

        let mut args = argv
            .iter()
            .copied()
            .skip_while(|a| LAUNCHERS.contains(a))
            .peekable();
        let Some(program) = args.next() else {
            return CommandOutput::default();
        };
        match program {
            "true" => return ok(String::new()),
            "false" => return fail(1, ""),
            _ => {}
        }
        if let Some((code, stderr)) = &state.denied {
            return fail(*code, stderr);
        }

        let mut table = "filter".to_string();
        let mut action: Option<&str> = None;
        let mut chain: Option<String> = None;
        let mut spec: Vec<&str> = Vec::new();
        while let Some(arg) = args.next() {
            match arg {
                "-w" => {}
                "-t" => table = args.next().unwrap_or("filter").to_string(),
                "-n" | "-v" if action == Some("-L") => {}
                "-C" | "-A" | "-I" | "-D" | "-F" | "-L" => {
                    action = Some(arg);
                    if let Some(next) = args.peek()
                        && !next.starts_with('-')
                    {
                        chain = args.next().map(String::from);
                    }
                }
                other => spec.push(other),
            }
        }
        let spec = spec.join(" ");

        let mutating = matches!(action, Some("-A" | "-I" | "-D"));
        if mutating && state.fail_patterns.iter().any(|p| line.contains(p)) {
            return fail(1, "iptables: Resource temporarily unavailable.\n");
        }

        let key = |chain: String| (table.clone(), chain);
        match (action, chain) {
            (Some("-C"), Some(chain)) => {
                let present = state
                    .chains
                    .get(&key(chain))
                    .is_some_and(|rules| rules.contains(&spec));
                if present { ok(String::new()) } else { fail(1, BAD_RULE) }
            }
            (Some("-A"), Some(chain)) => {
                state.chains.entry(key(chain)).or_default().push(spec);
                ok(String::new())
            }
            (Some("-I"), Some(chain)) => {
                state.chains.entry(key(chain)).or_default().insert(0, spec);
                ok(String::new())
            }
            (Some("-D"), Some(chain)) => {
                let rules = state.chains.entry(key(chain)).or_default();
                match rules.iter().position(|r| *r == spec) {
                    Some(index) => {
                        rules.remove(index);
                        ok(String::new())
                    }
                    None => fail(1, BAD_RULE),
                }
            }
            (Some("-F"), Some(chain)) => {
                state.chains.remove(&key(chain));
                ok(String::new())
            }
            (Some("-F"), None) => {
                state.chains.retain(|(t, _), _| *t != table);
                ok(String::new())
            }
            (Some("-L"), Some(chain)) => {
                let listing = state
                    .chains
                    .get(&key(chain.clone()))
                    .map(|rules| rules.join("\n"))
                    .unwrap_or_default();
                ok(format!("Chain {chain}\n{listing}\n"))
            }
            _ => fail(2, "iptables: unsupported invocation\n"),
        }
    }

    /// Evaluates `a || b`, `a && b` chains left to right, like sh
    fn exec_chain(&self, chain: &str) -> CommandOutput {
        let mut tokens = chain.split_whitespace().peekable();
        let mut last: Option<CommandOutput> = None;
        let mut skip = false;

        loop {
            let mut command: Vec<&str> = Vec::new();
            let mut op = None;
            for token in tokens.by_ref() {
                match token {
                    "&&" | "||" => {
                        op = Some(token);
                        break;
                    }
                    _ => command.push(token.trim_matches(|c| c == '(' || c == ')')),
                }
            }
            command.retain(|t| !t.is_empty());

            if !skip && !command.is_empty() {
                last = Some(self.exec(&command));
            }

            let succeeded = last.as_ref().is_some_and(CommandOutput::success);
            skip = match op {
                Some("&&") => !succeeded,
                Some("||") => succeeded,
                _ => break,
            };
        }

        last.unwrap_or_default()
    }

    fn exec_script(&self, script: &str) -> CommandOutput {
        let mut stdout = String::new();
        let mut last = CommandOutput::default();
        for part in script.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            last = self.exec_chain(part);
            stdout.push_str(&last.stdout);
        }
        CommandOutput { stdout, ..last }
    }
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl CommandRunner for FakeIptables {
    async fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<CommandOutput> {
        let line = argv.join(" ");
        self.timed(&line, timeout, || {
            let args: Vec<&str> = argv.iter().map(String::as_str).collect();
            self.exec(&args)
        })
        .await
    }

    async fn run_shell(&self, script: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        self.timed(script, timeout, || self.exec_script(script)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[tokio::test]
    async fn test_check_append_delete_cycle() {
        let fake = FakeIptables::new();
        let check = argv("sudo iptables -w -t nat -C POSTROUTING -s 10.0.0.0/24 -j MASQUERADE");
        let add = argv("sudo iptables -w -t nat -A POSTROUTING -s 10.0.0.0/24 -j MASQUERADE");
        let del = argv("sudo iptables -w -t nat -D POSTROUTING -s 10.0.0.0/24 -j MASQUERADE");

        assert!(!fake.run(&check, None).await.unwrap().success());
        assert!(fake.run(&add, None).await.unwrap().success());
        assert!(fake.run(&check, None).await.unwrap().success());
        assert_eq!(fake.rules("nat", "POSTROUTING"), vec!["-s 10.0.0.0/24 -j MASQUERADE"]);
        assert!(fake.run(&del, None).await.unwrap().success());
        assert_eq!(fake.run(&del, None).await.unwrap().stderr, BAD_RULE);
    }

    #[tokio::test]
    async fn test_shell_script_semantics() {
        let fake = FakeIptables::new();
        let script = "(iptables -C INPUT -j DROP || iptables -A INPUT -j DROP) ; \
                      (iptables -C INPUT -j DROP || iptables -A INPUT -j DROP)";
        assert!(fake.run_shell(script, None).await.unwrap().success());
        assert_eq!(fake.rules("filter", "INPUT").len(), 1);
        assert_eq!(fake.mutations().len(), 1);

        let delete = "(iptables -C INPUT -j ACCEPT && iptables -D INPUT -j ACCEPT) ; true";
        assert!(fake.run_shell(delete, None).await.unwrap().success());
        assert_eq!(fake.rules("filter", "INPUT").len(), 1);
    }

    #[tokio::test]
    async fn test_flush_table() {
        let fake = FakeIptables::new();
        fake.seed("nat", "PREROUTING", "-j X");
        fake.seed("filter", "INPUT", "-j Y");
        let out = fake.run_shell("iptables -w -F -t nat", None).await.unwrap();
        assert!(out.success());
        assert!(fake.rules("nat", "PREROUTING").is_empty());
        assert_eq!(fake.total_rules(), 1);
    }

    #[tokio::test]
    async fn test_denied_calls_exit_with_code() {
        let fake = FakeIptables::new();
        fake.deny_all(4, "Permission denied (you must be root)\n");
        let out = fake
            .run(&argv("iptables -t nat -C POSTROUTING -j MASQUERADE"), None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(4));
        assert!(fake.run_shell("true", None).await.unwrap().success());
    }

    #[tokio::test]
    async fn test_stderr_note_on_success_only() {
        let fake = FakeIptables::new();
        fake.stderr_when("INPUT", "# Warning: iptables-legacy tables present\n");
        let add = fake.run(&argv("iptables -A INPUT -j DROP"), None).await.unwrap();
        assert!(add.stderr.contains("iptables-legacy"));
        let missing = fake.run(&argv("iptables -C INPUT -j ACCEPT"), None).await.unwrap();
        assert_eq!(missing.stderr, BAD_RULE);
    }

    #[tokio::test]
    async fn test_timeout_injection() {
        let fake = FakeIptables::new();
        fake.slow_when("-L", Duration::from_secs(5));
        let err = fake
            .run(&argv("iptables -L INPUT"), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
