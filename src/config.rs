//! Configuration loading.
//!
//! Reads `<config dir>/config.json`, then applies `SWITCHBOARD_*`
//! environment overrides. A missing file means defaults. Paths may use `~`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bus::BusConfig;
use crate::constants::{GIT_WORKER_ID, TERMINAL_SCROLLBACK_BYTES};
use crate::rpc::RpcConfig;
use crate::router::RouterOptions;
use crate::terminal::TerminalConfig;
use crate::worker::WorkerConfig;

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Configuration for switchboard.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Assistant executable. Unset disables assistant and fetch messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_bin: Option<String>,
    /// Extra assistant arguments.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assistant_args: Vec<String>,
    /// Bus socket path. Unset disables bus messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_socket: Option<String>,
    /// UI socket path. Defaults to `<config dir>/ui.sock`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_socket: Option<String>,
    /// Working directory for terminals that do not ask for one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cwd: Option<String>,
    /// Terminal shell. Defaults to `$SHELL`, then `/bin/sh`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Worker executable. Defaults to this binary's `git-worker`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Initial workspace roots.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub workspace_roots: Vec<String>,
    /// Persisted atom file. Defaults to `<config dir>/atoms.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atoms_file: Option<String>,
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `SWITCHBOARD_CONFIG_DIR` wins; otherwise the platform config dir
    /// (macOS: ~/Library/Application Support/switchboard).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("SWITCHBOARD_CONFIG_DIR") {
            Ok(dir) => expand_path(&dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("switchboard"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Load from the config directory with environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `config.json` from `dir`. Missing or unreadable files give defaults.
    pub fn load_from(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Self::default();
        }
        match Self::read(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring unreadable config: {e:#}");
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("SWITCHBOARD_"))
            .collect();
        self.apply_overrides(|key| vars.get(key).cloned());
    }

    /// Apply overrides from `lookup` (environment variable name to value).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bin) = lookup("SWITCHBOARD_ASSISTANT_BIN") {
            self.assistant_bin = Some(bin);
        }
        if let Some(socket) = lookup("SWITCHBOARD_BUS_SOCKET") {
            self.bus_socket = Some(socket);
        }
        if let Some(socket) = lookup("SWITCHBOARD_UI_SOCKET") {
            self.ui_socket = Some(socket);
        }
        if let Some(cwd) = lookup("SWITCHBOARD_DEFAULT_CWD") {
            self.default_cwd = Some(cwd);
        }
        if let Some(worker) = lookup("SWITCHBOARD_WORKER") {
            self.worker = Some(worker);
        }
        if let Some(shell) = lookup("SWITCHBOARD_SHELL") {
            self.shell = Some(shell);
        }
    }

    /// UI socket path, defaulting into `config_dir`.
    pub fn ui_socket_path(&self, config_dir: &Path) -> PathBuf {
        self.ui_socket
            .as_deref()
            .map_or_else(|| config_dir.join("ui.sock"), expand_path)
    }

    /// Persisted atom file, defaulting into `config_dir`.
    pub fn atoms_path(&self, config_dir: &Path) -> PathBuf {
        self.atoms_file
            .as_deref()
            .map_or_else(|| config_dir.join("atoms.json"), expand_path)
    }

    /// Router options. `exe` is this binary, used for the default worker.
    pub fn router_options(&self, exe: &Path) -> RouterOptions {
        let terminal = TerminalConfig {
            default_shell: self
                .shell
                .clone()
                .or_else(|| std::env::var("SHELL").ok())
                .unwrap_or_else(|| "/bin/sh".to_string()),
            default_cwd: self
                .default_cwd
                .as_deref()
                .map(|cwd| expand_path(cwd).to_string_lossy().into_owned()),
            scrollback_bytes: TERMINAL_SCROLLBACK_BYTES,
        };
        let worker = match &self.worker {
            Some(program) => WorkerConfig {
                worker_id: GIT_WORKER_ID.to_string(),
                program: Some(expand_path(program)),
                args: Vec::new(),
            },
            None => WorkerConfig {
                worker_id: GIT_WORKER_ID.to_string(),
                program: Some(exe.to_path_buf()),
                args: vec!["git-worker".to_string()],
            },
        };

        let mut options = RouterOptions::new(terminal, worker);
        options.assistant = self.assistant_bin.as_deref().map(|bin| {
            let mut rpc = RpcConfig::new(expand_path(bin));
            rpc.args.clone_from(&self.assistant_args);
            rpc
        });
        options.bus = self.bus_socket.as_deref().map(|path| BusConfig::new(expand_path(path)));
        options.workspace_roots = self
            .workspace_roots
            .iter()
            .map(|root| expand_path(root).to_string_lossy().into_owned())
            .collect();
        options
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(Config::load_from(tmp.path()), Config::default());
    }

    #[test]
    fn test_partial_file_and_corrupt_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{"assistantBin": "/opt/assistant", "workspaceRoots": ["/repo"]}"#,
        )
        .unwrap();
        let config = Config::load_from(tmp.path());
        assert_eq!(config.assistant_bin.as_deref(), Some("/opt/assistant"));
        assert_eq!(config.workspace_roots, vec!["/repo".to_string()]);
        assert!(config.bus_socket.is_none());

        fs::write(tmp.path().join(CONFIG_FILE), "{broken").unwrap();
        assert_eq!(Config::load_from(tmp.path()), Config::default());
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = Config {
            shell: Some("/bin/zsh".to_string()),
            ..Config::default()
        };
        config.apply_overrides(|key| match key {
            "SWITCHBOARD_SHELL" => Some("/bin/bash".to_string()),
            "SWITCHBOARD_BUS_SOCKET" => Some("/tmp/bus.sock".to_string()),
            _ => None,
        });
        assert_eq!(config.shell.as_deref(), Some("/bin/bash"));
        assert_eq!(config.bus_socket.as_deref(), Some("/tmp/bus.sock"));
        assert!(config.ui_socket.is_none());
    }

    #[test]
    fn test_default_paths_live_in_config_dir() {
        let dir = Path::new("/cfg");
        let config = Config::default();
        assert_eq!(config.ui_socket_path(dir), PathBuf::from("/cfg/ui.sock"));
        assert_eq!(config.atoms_path(dir), PathBuf::from("/cfg/atoms.json"));

        let home = dirs::home_dir().unwrap();
        let config = Config {
            ui_socket: Some("~/sb.sock".to_string()),
            ..Config::default()
        };
        assert_eq!(config.ui_socket_path(dir), home.join("sb.sock"));
    }

    #[test]
    fn test_router_options_default_worker_is_this_binary() {
        let config = Config {
            assistant_bin: Some("/opt/assistant".to_string()),
            assistant_args: vec!["--stdio".to_string()],
            shell: Some("/bin/sh".to_string()),
            ..Config::default()
        };
        let options = config.router_options(Path::new("/usr/bin/switchboard"));

        assert_eq!(options.worker.program, Some(PathBuf::from("/usr/bin/switchboard")));
        assert_eq!(options.worker.args, vec!["git-worker".to_string()]);
        assert_eq!(options.worker.worker_id, "git");
        let assistant = options.assistant.unwrap();
        assert_eq!(assistant.program, PathBuf::from("/opt/assistant"));
        assert_eq!(assistant.args, vec!["--stdio".to_string()]);
        assert!(options.bus.is_none());
        assert_eq!(options.terminal.default_shell, "/bin/sh");
    }
}
