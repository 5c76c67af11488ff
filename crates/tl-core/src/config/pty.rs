//! PTY configuration
//!
//! Host-derived defaults (login shell, home directory) are resolved here and
//! nowhere else.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Defaults for the shell process attached to the PTY
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Shell to spawn when a start request names none
    pub default_shell: Option<String>,

    /// Working directory when a start request names none
    pub working_directory: Option<PathBuf>,

    /// Extra environment variables for every shell
    pub env: Vec<(String, String)>,

    /// Initial terminal width
    pub cols: u16,

    /// Initial terminal height
    pub rows: u16,

    /// Value forced into `TERM`
    pub term: String,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            working_directory: None,
            env: vec![],
            cols: 80,
            rows: 24,
            term: "xterm-256color".to_string(),
        }
    }
}

impl PtyConfig {
    /// Pick the shell: requested > configured > `$SHELL` > platform fallback
    pub fn resolved_shell(&self, requested: Option<&str>) -> String {
        requested
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_shell.clone())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            })
    }

    /// Pick the working directory: requested > configured > home > current
    pub fn resolved_working_directory(&self, requested: Option<&str>) -> PathBuf {
        requested
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.working_directory.clone())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_shell_wins() {
        let config = PtyConfig {
            default_shell: Some("/bin/bash".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolved_shell(Some("/bin/zsh")), "/bin/zsh");
        assert_eq!(config.resolved_shell(Some("")), "/bin/bash");
        assert_eq!(config.resolved_shell(None), "/bin/bash");
    }

    #[test]
    fn test_working_directory_precedence() {
        let config = PtyConfig {
            working_directory: Some(PathBuf::from("/srv")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_working_directory(Some("/tmp")),
            PathBuf::from("/tmp")
        );
        assert_eq!(config.resolved_working_directory(None), PathBuf::from("/srv"));
    }
}
