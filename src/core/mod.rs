//! Core rule-application functionality
//!
//! This module contains the types and logic for applying iptables changes
//! one at a time, idempotently. It provides:
//!
//! - [`rule`]: Typed rule change requests for the five rule categories
//! - [`command`]: Check/act command values and their shell rendering
//! - [`synthesizer`]: Request to command translation
//! - [`executor`]: Process spawning and plan interpretation
//! - [`queue`]: The single-flight FIFO rule queue
//! - [`bulk`]: Sequential runner for raw command lists
//! - [`error`]: Error types for firewall operations

pub mod bulk;
pub mod command;
pub mod error;
pub mod executor;
pub mod queue;
pub mod rule;
pub mod synthesizer;

#[cfg(test)]
pub mod test_helpers;
