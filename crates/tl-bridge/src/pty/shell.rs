//! Shell discovery and validation

use std::path::Path;

use super::PtyError;

/// Fail early when an absolute shell path does not exist.
///
/// Bare names (`bash`, `cmd.exe`) are left to the OS search path.
pub fn validate_shell(shell: &str) -> Result<(), PtyError> {
    let path = Path::new(shell);
    if path.is_absolute() && !path.exists() {
        return Err(PtyError::ShellNotFound(shell.to_string()));
    }
    Ok(())
}

/// Shells this machine can spawn, for the registration handshake.
///
/// Reads `/etc/shells` on Unix (existing entries only) and always includes
/// the configured default first.
pub fn supported_shells(default_shell: &str) -> Vec<String> {
    let mut shells = vec![default_shell.to_string()];

    #[cfg(unix)]
    if let Ok(contents) = std::fs::read_to_string("/etc/shells") {
        shells.extend(parse_shells_file(&contents));
    }

    let mut seen = std::collections::HashSet::new();
    shells.retain(|s| seen.insert(s.clone()));
    shells
}

/// Parse `/etc/shells`, skipping comments and entries missing on disk
fn parse_shells_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| Path::new(line).exists())
        .map(str::to_string)
        .collect()
}
