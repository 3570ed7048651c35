//! Working-directory resolution for new terminal sessions.
//!
//! Candidates are tried in order: the requested directory (with `~`
//! expanded), this process's cwd, the home directory, then `/`. The first
//! one that is an existing directory wins.

use std::path::PathBuf;

/// Outcome of resolving a session's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCwd {
    /// Directory the session runs in.
    pub path: PathBuf,
    /// True when a requested directory was unusable.
    pub fallback: bool,
    /// Human-readable note for the startup log when `fallback` is set.
    pub note: Option<String>,
}

/// Resolve against the live process environment.
pub fn resolve_cwd(requested: Option<&str>) -> ResolvedCwd {
    let mut fallbacks = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        fallbacks.push(cwd);
    }
    if let Some(home) = dirs::home_dir() {
        fallbacks.push(home);
    }
    resolve_cwd_from(requested, &fallbacks)
}

/// Resolve `requested`, then `fallbacks` in order, then `/`.
pub fn resolve_cwd_from(requested: Option<&str>, fallbacks: &[PathBuf]) -> ResolvedCwd {
    let requested = requested.map(str::trim).filter(|p| !p.is_empty());

    if let Some(raw) = requested {
        let expanded = PathBuf::from(shellexpand::tilde(raw).into_owned());
        if expanded.is_dir() {
            return ResolvedCwd {
                path: expanded,
                fallback: false,
                note: None,
            };
        }
    }

    let path = fallbacks
        .iter()
        .find(|p| p.is_dir())
        .cloned()
        .unwrap_or_else(|| PathBuf::from("/"));

    match requested {
        Some(raw) => {
            log::warn!("[Terminal] cwd {raw} unavailable, using {}", path.display());
            ResolvedCwd {
                note: Some(format!(
                    "Directory {raw} is not available; started in {} instead.",
                    path.display()
                )),
                path,
                fallback: true,
            }
        }
        None => ResolvedCwd {
            path,
            fallback: false,
            note: None,
        },
    }
}
