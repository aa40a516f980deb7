//! Utility functions for directory management
//!
//! Follows the XDG Base Directory specification:
//!
//! - Data: `~/.local/share/fwqueue/` - `config.json`
//!
//! # Example
//!
//! ```no_run
//! use fwqueue::utils::{config_path, ensure_dirs};
//!
//! # fn main() -> std::io::Result<()> {
//! ensure_dirs()?;
//! if let Some(path) = config_path() {
//!     println!("config: {}", path.display());
//! }
//! # Ok(())
//! # }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "fwqueue", "fwqueue").map(|pd| pd.data_dir().to_path_buf())
}

/// Default location of `config.json`
pub fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Creates the data directory, owner-only (0o700)
pub fn ensure_dirs() -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    match get_data_dir() {
        Some(dir) => std::fs::DirBuilder::new()
            .mode(0o700)
            .recursive(true)
            .create(dir),
        None => Ok(()),
    }
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Find the nearest character boundary to avoid splitting multi-byte characters
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}
