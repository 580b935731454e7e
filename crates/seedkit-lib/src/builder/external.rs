//! `mkbrr` subprocess strategy.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::progress::{parse_external_line, ProgressSink};
use crate::error::{Error, Result};

const BINARY: &str = "mkbrr";
const MIN_EXPONENT: u32 = 16;
const MAX_EXPONENT: u32 = 27;

/// Finds `mkbrr` on `PATH`, then in the bundled tools directory.
pub fn resolve_binary(tools_dir: &Path) -> Result<PathBuf> {
    if let Some(found) = find_on_path(BINARY) {
        return Ok(found);
    }
    let bundled = bundled_binary(tools_dir, std::env::consts::OS, std::env::consts::ARCH)?;
    if !bundled.is_file() {
        return Err(Error::Configuration(format!(
            "{BINARY} binary not found at {}",
            bundled.display()
        )));
    }
    Ok(bundled)
}

fn find_on_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary).with_extension(std::env::consts::EXE_EXTENSION))
        .find(|candidate| candidate.is_file())
}

pub fn bundled_binary(tools_dir: &Path, os: &str, arch: &str) -> Result<PathBuf> {
    let base = tools_dir.join(BINARY);
    let relative = match (os, arch) {
        ("windows", "x86_64") => "windows/x86_64/mkbrr.exe",
        ("macos", "aarch64") => "macos/arm64/mkbrr",
        ("macos", "x86_64") => "macos/x86_64/mkbrr",
        ("linux", "x86_64") => "linux/amd64/mkbrr",
        ("linux", "aarch64") => "linux/arm64/mkbrr",
        ("linux", "arm") => "linux/arm/mkbrr",
        _ => {
            return Err(Error::Configuration(format!(
                "no bundled {BINARY} build for {os}/{arch}"
            )))
        }
    };
    Ok(base.join(relative))
}

/// Arguments for one `mkbrr create` run.
#[derive(Debug, Clone)]
pub struct ExternalInvocation {
    pub content: PathBuf,
    pub output: PathBuf,
    pub tracker_url: Option<String>,
    pub entropy: bool,
    pub piece_size: u64,
    pub workers: u32,
    /// Comma-separated exclude list, `None` for discs
    pub exclude: Option<String>,
}

impl ExternalInvocation {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["create".into(), self.content.clone().into()];
        if let Some(tracker) = &self.tracker_url {
            args.extend(["-t".into(), tracker.into()]);
        }
        if self.entropy {
            args.push("-e".into());
        }
        if self.tracker_url.is_none() {
            let exponent = crate::piece_size::piece_length_exponent(self.piece_size).clamp(MIN_EXPONENT, MAX_EXPONENT);
            args.extend(["-l".into(), exponent.to_string().into()]);
        }
        if self.workers != 0 {
            args.extend(["--workers".into(), self.workers.to_string().into()]);
        }
        if let Some(exclude) = &self.exclude {
            args.extend(["--exclude".into(), exclude.into()]);
        }
        args.extend(["-o".into(), self.output.clone().into()]);
        args
    }
}

#[tracing::instrument(err, skip(invocation, progress), fields(content = %invocation.content.display()))]
pub async fn run(binary: &Path, invocation: &ExternalInvocation, progress: &ProgressSink) -> Result<()> {
    let args = invocation.args();
    tracing::debug!(?binary, ?args, "running external hasher");

    let mut child = Command::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Configuration(format!("failed to spawn {}: {e}", binary.display())))?;

    let started = Instant::now();
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
        }
        collected
    });

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("failed to read {BINARY} output: {e}")))?
        {
            if let Some(update) = parse_external_line(line.trim(), started.elapsed()) {
                progress(&update);
            } else if line.contains("Wrote") && line.contains(".torrent") {
                tracing::debug!("{}", line.trim());
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("failed to wait for {BINARY}: {e}")))?;
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(Error::Internal(anyhow::anyhow!(
            "{BINARY} exited with {status}: {}",
            stderr.trim()
        )));
    }

    let written = tokio::fs::metadata(&invocation.output).await.map(|m| m.len()).unwrap_or(0);
    if written == 0 {
        return Err(Error::Internal(anyhow::anyhow!(
            "{BINARY} reported success but {} is missing or empty",
            invocation.output.display()
        )));
    }
    Ok(())
}
