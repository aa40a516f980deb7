//! Privilege elevation for iptables invocations
//!
//! fwqueue may run as an unprivileged control-plane user and only elevates
//! the iptables calls that need it. NAT-category commands are always
//! elevated; host ACLs only when the request asks for it.
//!
//! Elevation is expressed as a launcher prefix (`["sudo"]`, `["run0"]`,
//! `["pkexec"]` or nothing) that the synthesizer prepends to each iptables
//! argument vector, so the same prefix works for direct spawns and for
//! rendered check/act scripts.
//!
//! # Environment Variables
//!
//! - `FWQ_ELEVATION_METHOD`: Force a specific method (`sudo`, `run0`, `pkexec`
//!   or `none`), overriding the config file.
//! - `FWQ_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only the configured iptables binary is ever elevated
//! - All request fields are validated before a command line is built
//! - Launchers are checked for availability in PATH

use serde::{Deserialize, Serialize};

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// No launcher could be found for automatic elevation
    #[error("No elevation method available - install sudo or run as root")]
    NoLauncher,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FWQ_ELEVATION_METHOD`
    #[error("Invalid FWQ_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec, none")]
    InvalidMethod(String),
}

/// How elevated commands are launched
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    /// Root runs directly, otherwise sudo, then run0, then pkexec
    #[default]
    Auto,
    /// Never prepend a launcher
    None,
    Sudo,
    Run0,
    Pkexec,
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn launcher(name: &str) -> Result<Vec<String>, ElevationError> {
    if binary_exists(name) {
        Ok(vec![name.to_string()])
    } else {
        Err(ElevationError::MethodNotAvailable(name.to_string()))
    }
}

/// Resolves the launcher prefix for elevated commands.
///
/// Order of precedence:
/// 1. `FWQ_TEST_NO_ELEVATION` set: no prefix
/// 2. `FWQ_ELEVATION_METHOD` set: that method, overriding `method`
/// 3. explicit `method` from config
/// 4. `Auto`: no prefix as root, else the first of sudo, run0, pkexec found
///
/// # Errors
///
/// - `InvalidMethod` for an unknown `FWQ_ELEVATION_METHOD`
/// - `MethodNotAvailable` if an explicitly requested launcher is missing
/// - `NoLauncher` if automatic detection finds nothing usable
pub fn resolve_prefix(method: ElevationMethod) -> Result<Vec<String>, ElevationError> {
    if std::env::var("FWQ_TEST_NO_ELEVATION").is_ok() {
        return Ok(Vec::new());
    }

    let method = match std::env::var("FWQ_ELEVATION_METHOD") {
        Ok(value) if !value.is_empty() => value
            .parse::<ElevationMethod>()
            .map_err(|_| ElevationError::InvalidMethod(value.to_lowercase()))?,
        _ => method,
    };

    match method {
        ElevationMethod::None => Ok(Vec::new()),
        ElevationMethod::Sudo => launcher("sudo"),
        ElevationMethod::Run0 => launcher("run0"),
        ElevationMethod::Pkexec => launcher("pkexec"),
        ElevationMethod::Auto => {
            if nix::unistd::getuid().is_root() {
                return Ok(Vec::new());
            }
            ["sudo", "run0", "pkexec"]
                .into_iter()
                .find(|name| binary_exists(name))
                .map(|name| vec![name.to_string()])
                .ok_or(ElevationError::NoLauncher)
        }
    }
}
