//! `git-worker` subcommand: the default version-control worker.
//!
//! Reads worker protocol lines on stdin, runs `git` in the request's `cwd`
//! and writes one `worker-response` per request. Requests are served in
//! order; a cancel for a request that already ran is ignored.
//!
//! | method           | params                          | result                      |
//! |------------------|---------------------------------|-----------------------------|
//! | `status`         | `cwd`                           | `{branch, upstream, ahead, behind, files}` |
//! | `current-branch` | `cwd`                           | branch name or `null`       |
//! | `branches`       | `cwd`                           | `{current, branches}`       |
//! | `log`            | `cwd`, `limit?` (20)            | `[{hash, author, timestamp, subject}]` |
//! | `diff`           | `cwd`, `staged?`, `path?`       | unified diff text           |

use std::io::{BufRead, Write};
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};

use super::protocol::{self, WorkerRequest, WorkerResponse};

const DEFAULT_LOG_LIMIT: u64 = 20;
const MAX_LOG_LIMIT: u64 = 500;

/// One changed path in `git status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    /// Path relative to the repository root.
    pub path: String,
    /// Index (staged) status letter, `' '` when unchanged.
    pub index: char,
    /// Work tree status letter, `' '` when unchanged.
    pub worktree: char,
}

/// Parsed `git status --porcelain=v1 --branch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepoStatus {
    /// Checked-out branch, `None` when detached.
    pub branch: Option<String>,
    /// Tracking branch.
    pub upstream: Option<String>,
    /// Commits ahead of upstream.
    pub ahead: u32,
    /// Commits behind upstream.
    pub behind: u32,
    /// Changed paths.
    pub files: Vec<FileStatus>,
}

/// One `git log` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    /// Full hash.
    pub hash: String,
    /// Author name.
    pub author: String,
    /// Author time, seconds since the epoch.
    pub timestamp: i64,
    /// First line of the message.
    pub subject: String,
}

/// Serve requests from stdin until it closes.
pub fn run() -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    log::info!("[Worker] git-worker ready");

    for line in stdin.lock().lines() {
        let line = line.context("Failed to read worker input")?;
        if line.trim().is_empty() {
            continue;
        }
        let Some(reply) = handle_line(&line) else {
            continue;
        };
        stdout
            .write_all(&protocol::to_line(&reply))
            .and_then(|()| stdout.flush())
            .context("Failed to write worker output")?;
    }
    Ok(())
}

/// Answer one input line. `None` for lines that need no reply.
pub fn handle_line(line: &str) -> Option<Value> {
    let message: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("[Worker] Ignoring invalid line: {e}");
            return None;
        }
    };
    if protocol::message_type(&message) != Some(protocol::REQUEST) {
        return None;
    }

    let id = protocol::request_id(&message).cloned().unwrap_or(Value::Null);
    let request = match message
        .get("request")
        .cloned()
        .map(serde_json::from_value::<WorkerRequest>)
    {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            return Some(WorkerResponse::err(id, "invalid-request", e.to_string()).into_message())
        }
        None => {
            return Some(
                WorkerResponse::err(id, "invalid-request", "missing request").into_message(),
            )
        }
    };

    let response = match dispatch(&request.method, &request.params) {
        Ok(result) => WorkerResponse::ok(request.id, result),
        Err(e) => {
            log::debug!("[Worker] {} failed: {e:#}", request.method);
            WorkerResponse::err(request.id, "git", format!("{e:#}"))
        }
    };
    Some(response.into_message())
}

fn dispatch(method: &str, params: &Value) -> Result<Value> {
    let cwd = params
        .get("cwd")
        .and_then(Value::as_str)
        .map(|c| shellexpand::tilde(c).into_owned())
        .unwrap_or_else(|| ".".to_string());
    let cwd = Path::new(&cwd);

    match method {
        "status" => {
            let out = git(cwd, &["status", "--porcelain=v1", "--branch"])?;
            Ok(serde_json::to_value(parse_status(&out))?)
        }
        "current-branch" => {
            let out = git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])?;
            let branch = out.trim();
            Ok(if branch.is_empty() || branch == "HEAD" {
                Value::Null
            } else {
                json!(branch)
            })
        }
        "branches" => {
            let out = git(cwd, &["branch", "--format=%(HEAD)%(refname:short)"])?;
            let (current, branches) = parse_branches(&out);
            Ok(json!({ "current": current, "branches": branches }))
        }
        "log" => {
            let limit = params
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_LOG_LIMIT)
                .clamp(1, MAX_LOG_LIMIT);
            let count = format!("-n{limit}");
            let out = git(cwd, &["log", &count, "--format=%H%x1f%an%x1f%at%x1f%s"])?;
            Ok(serde_json::to_value(parse_log(&out))?)
        }
        "diff" => {
            let mut args = vec!["diff", "--no-color"];
            if params.get("staged").and_then(Value::as_bool) == Some(true) {
                args.push("--cached");
            }
            if let Some(path) = params.get("path").and_then(Value::as_str) {
                args.push("--");
                args.push(path);
            }
            Ok(json!(git(cwd, &args)?))
        }
        other => bail!("unknown method: {other}"),
    }
}

fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .with_context(|| format!("Failed to run git in {}", cwd.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args[0], stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `git status --porcelain=v1 --branch` output.
pub fn parse_status(output: &str) -> RepoStatus {
    let mut status = RepoStatus::default();
    for line in output.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            parse_branch_header(header, &mut status);
            continue;
        }
        let mut chars = line.chars();
        let (Some(index), Some(worktree)) = (chars.next(), chars.next()) else {
            continue;
        };
        let path = line.get(3..).unwrap_or_default();
        // Renames read "old -> new"; report the new path.
        let path = path.rsplit(" -> ").next().unwrap_or(path);
        if path.is_empty() {
            continue;
        }
        status.files.push(FileStatus {
            path: path.to_string(),
            index,
            worktree,
        });
    }
    status
}

fn parse_branch_header(header: &str, status: &mut RepoStatus) {
    let (refs, tracking) = match header.split_once(" [") {
        Some((refs, rest)) => (refs, rest.trim_end_matches(']')),
        None => (header, ""),
    };

    if let Some(name) = refs.strip_prefix("No commits yet on ") {
        status.branch = Some(name.to_string());
    } else if !refs.starts_with("HEAD (no branch)") {
        match refs.split_once("...") {
            Some((local, upstream)) => {
                status.branch = Some(local.to_string());
                status.upstream = Some(upstream.to_string());
            }
            None => status.branch = Some(refs.to_string()),
        }
    }

    for part in tracking.split(", ") {
        if let Some(n) = part.strip_prefix("ahead ") {
            status.ahead = n.parse().unwrap_or(0);
        } else if let Some(n) = part.strip_prefix("behind ") {
            status.behind = n.parse().unwrap_or(0);
        }
    }
}

/// Parse `git branch --format=%(HEAD)%(refname:short)` output.
pub fn parse_branches(output: &str) -> (Option<String>, Vec<String>) {
    let mut current = None;
    let mut branches = Vec::new();
    for line in output.lines() {
        let (is_head, name) = match line.strip_prefix('*') {
            Some(name) => (true, name),
            None => (false, line.strip_prefix(' ').unwrap_or(line)),
        };
        let name = name.trim();
        if name.is_empty() || name.starts_with('(') {
            continue;
        }
        if is_head {
            current = Some(name.to_string());
        }
        branches.push(name.to_string());
    }
    (current, branches)
}

/// Parse `git log --format=%H%x1f%an%x1f%at%x1f%s` output.
pub fn parse_log(output: &str) -> Vec<Commit> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\u{1f}');
            let hash = fields.next()?.to_string();
            let author = fields.next()?.to_string();
            let timestamp = fields.next()?.parse().ok()?;
            let subject = fields.next().unwrap_or_default().to_string();
            Some(Commit {
                hash,
                author,
                timestamp,
                subject,
            })
        })
        .collect()
}
