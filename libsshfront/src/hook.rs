// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Spawning and running the external auth/exec hook programs.

use std::{env, os::unix::process::ExitStatusExt, path::PathBuf, process::Stdio, sync::Arc};

use anyhow::Context;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    InvalidHandler(String),
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for HookError {}

/// The result of running a hook to completion and collecting its output.
pub struct HookResult {
    pub exit_code: u32,
    pub merged_output: Vec<u8>,
}

/// Split `template` with POSIX shell-word rules, resolve the first token
/// to an executable (via `PATH` if it isn't already absolute), and append
/// `extra_args` verbatim.
pub fn resolve(template: &str, extra_args: &[String]) -> Result<Vec<String>, HookError> {
    let mut argv =
        shell_words::split(template).map_err(|_| HookError::InvalidHandler(template.to_string()))?;
    if argv.is_empty() {
        return Err(HookError::InvalidHandler(template.to_string()));
    }
    let resolved = resolve_path(&argv[0]).ok_or_else(|| HookError::InvalidHandler(argv[0].clone()))?;
    argv[0] = resolved.to_string_lossy().into_owned();
    argv.extend(extra_args.iter().cloned());
    Ok(argv)
}

fn resolve_path(cmd: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(cmd);
    if candidate.is_absolute() {
        return candidate.is_file().then_some(candidate);
    }
    if candidate.components().count() > 1 {
        if !candidate.is_file() {
            return None;
        }
        return std::path::absolute(&candidate).ok().or(Some(candidate));
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var).map(|dir| dir.join(cmd)).find(|p| p.is_file())
}

fn build_command(argv: &[String], env: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env_clear();
    for assignment in env {
        if let Some((name, value)) = assignment.split_once('=') {
            cmd.env(name, value);
        }
    }
    cmd
}

/// Run `argv` to completion, merging stdout and stderr into a single
/// buffer in roughly the order the child produced them. Used for the
/// auth hook, which has no interactive stdin.
#[instrument(skip(env))]
pub async fn run_collect(argv: &[String], env: &[String]) -> anyhow::Result<HookResult> {
    let mut cmd = build_command(argv, env);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawning hook")?;
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let merged = Arc::new(Mutex::new(Vec::new()));
    let merged_out = Arc::clone(&merged);
    let merged_err = Arc::clone(&merged);

    let out_task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = stdout.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            merged_out.lock().await.extend_from_slice(&buf[..n]);
        }
    });
    let err_task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = stderr.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            merged_err.lock().await.extend_from_slice(&buf[..n]);
        }
    });

    let status = child.wait().await.context("waiting on hook")?;
    let _ = tokio::join!(out_task, err_task);

    let exit_code = exit_code_of(&status);
    let merged_output = Arc::try_unwrap(merged).map(Mutex::into_inner).unwrap_or_default();
    Ok(HookResult { exit_code, merged_output })
}

/// Spawn `argv` with the given environment and stdio wiring, without
/// waiting on it. Shared by the pipe-mode and pty-mode exec paths in the
/// session engine.
pub fn spawn(argv: &[String], env: &[String], stdio: (Stdio, Stdio, Stdio)) -> anyhow::Result<Child> {
    let mut cmd = build_command(argv, env);
    cmd.stdin(stdio.0).stdout(stdio.1).stderr(stdio.2);
    cmd.spawn().context("spawning hook")
}

/// Extract the numeric exit status the way the historical implementation
/// does: normal exit reports its code, signal death reports 0 and is only
/// logged, never surfaced to the peer as a nonzero `exit-status`.
pub fn exit_code_of(status: &std::process::ExitStatus) -> u32 {
    match status.code() {
        Some(code) => code as u32,
        None => {
            if let Some(sig) = status.signal() {
                warn!(signal = sig, "child terminated abnormally by signal");
            } else {
                info!("child terminated without an exit code");
            }
            0
        }
    }
}
