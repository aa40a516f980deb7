use thiserror::Error;

/// Core error types for fwqueue
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request named a rule category this crate does not know
    #[error("invalid rule type: {0}")]
    InvalidCategory(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// iptables (or the guarded script around it) exited non-zero
    #[error("iptables error: {message}")]
    Execution {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Command did not finish within its time budget
    #[error("Command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    /// Process could not be started
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// The queue dropped a request before reporting its result
    #[error("Rule queue closed before the request completed")]
    QueueClosed,

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Captured stderr of a failed command, if there is one
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::Execution { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

impl From<crate::elevation::ElevationError> for Error {
    fn from(e: crate::elevation::ElevationError) -> Self {
        Error::Elevation(e.to_string())
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches iptables stderr against known patterns and returns a readable translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Set the request's elevation flag or run as root")
                .with_suggestion("Check that sudo is configured with NOPASSWD for iptables")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Elevated commands pass -w to wait for the lock")
                .with_suggestion("Check for other firewall managers: systemctl status firewalld ufw");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or set iptables_command in config.json / FWQ_IPTABLES_COMMAND");
        }

        // What `-C` prints when the rule is absent
        if lower.contains("bad rule") && lower.contains("matching rule exist") {
            return ErrorTranslation::new("No matching rule exists in that chain")
                .with_suggestion("Deletes are tolerant and treat this as already absent");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match module not found")
                .with_suggestion("Ensure the chain exists in the table being modified")
                .with_suggestion("Check kernel modules: lsmod | grep -E 'xt_|nf_nat'");
        }

        if lower.contains("invalid port") || (lower.contains("port") && lower.contains("invalid")) {
            return ErrorTranslation::new("Invalid port")
                .with_suggestion("Port numbers must be between 1 and 65535");
        }

        if (lower.contains("host/network") && lower.contains("not found"))
            || lower.contains("invalid mask")
        {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use proper IP format: 192.168.1.1 or 192.168.1.0/24");
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("Check system load: uptime");
        }

        ErrorTranslation::new(format!("Firewall error: {}", msg.trim()))
            .with_suggestion("Verify iptables is working: sudo iptables -w -L -n")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
