//! fwqueue - serialized, idempotent iptables rule application
//!
//! Applies host ACL and NAT changes through iptables one request at a time,
//! with every NAT mutation guarded by an existence check so that it is safe
//! to repeat.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, command synthesis, execution, the rule queue
//! - [`elevation`] - Privilege launcher selection (sudo/run0/pkexec)
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Guarantees
//!
//! - Requests run in submission order, never two at once
//! - Repeating an add or a delete leaves the rule table unchanged
//! - Deletes always report success ("ensure absent")
//! - A failed request never stops the queue
//!
//! # Example
//!
//! ```no_run
//! use fwqueue::{AppConfig, RuleQueue};
//!
//! # async fn run() -> fwqueue::Result<()> {
//! let queue = RuleQueue::from_config(&AppConfig::default())?;
//! queue.dhcp_subnet_change("192.168.218.1/24".parse().unwrap(), true).await?;
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use config::AppConfig;
pub use core::command::{CommandPlan, Invocation, wrap_idempotent};
pub use core::error::{Error, Result};
pub use core::executor::{ApplyReport, ApplyStatus, ProcessRunner, ScriptMode, StepOutcome};
pub use core::queue::{RuleQueue, Ticket};
pub use core::rule::{RuleCategory, RuleChange, RuleChangeRequest};
pub use core::synthesizer::Synthesizer;
