//! Process table backed by the platform's own tools.
//!
//! Windows: `netstat`, `tasklist`, `taskkill`.
//! Unix: `lsof`, `pgrep`, `kill`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::ProcessTable;
#[cfg(windows)]
use super::parse::{parse_netstat, parse_tasklist};
#[cfg(unix)]
use super::parse::parse_pid_lines;

/// Output of a finished helper command.
struct ToolOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

async fn run_tool(program: &str, args: &[&str]) -> Result<ToolOutput> {
    debug!(program = program, args = ?args, "Running process tool");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    Ok(ToolOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Process table of the machine the launcher runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn listeners(&self, port: u16) -> Result<Vec<u32>> {
        let out = run_tool("netstat", &["-ano"]).await?;
        if !out.success {
            bail!("netstat failed ({:?}): {}", out.code, out.stderr.trim());
        }
        Ok(parse_netstat(&out.stdout, port))
    }

    async fn is_running(&self, image: &str) -> Result<bool> {
        let filter = format!("IMAGENAME eq {}", image);
        let out = run_tool("tasklist", &["/FI", &filter, "/FO", "CSV", "/NH"]).await?;
        if !out.success {
            bail!("tasklist failed ({:?}): {}", out.code, out.stderr.trim());
        }
        Ok(parse_tasklist(&out.stdout, image))
    }

    async fn force_kill(&self, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        let out = run_tool("taskkill", &["/F", "/T", "/PID", &pid]).await?;
        if !out.success {
            bail!("taskkill /F {} failed: {}", pid, out.stderr.trim());
        }
        Ok(())
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        let out = run_tool("taskkill", &["/T", "/PID", &pid]).await?;
        if !out.success {
            bail!("taskkill {} failed: {}", pid, out.stderr.trim());
        }
        Ok(())
    }
}

#[cfg(unix)]
#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn listeners(&self, port: u16) -> Result<Vec<u32>> {
        let spec = format!("-iTCP:{}", port);
        let out = run_tool("lsof", &["-nP", "-t", &spec, "-sTCP:LISTEN"]).await?;
        // lsof exits 1 when nothing matched
        if !out.success && !out.stderr.trim().is_empty() {
            bail!("lsof failed ({:?}): {}", out.code, out.stderr.trim());
        }
        Ok(parse_pid_lines(&out.stdout))
    }

    async fn is_running(&self, image: &str) -> Result<bool> {
        let out = run_tool("pgrep", &["-x", image]).await?;
        match out.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!("pgrep failed ({:?}): {}", out.code, out.stderr.trim()),
        }
    }

    async fn force_kill(&self, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        let out = run_tool("kill", &["-9", &pid]).await?;
        if !out.success {
            bail!("kill -9 {} failed: {}", pid, out.stderr.trim());
        }
        Ok(())
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        let out = run_tool("kill", &["-TERM", &pid]).await?;
        if !out.success {
            bail!("kill -TERM {} failed: {}", pid, out.stderr.trim());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_is_running_unknown_image() {
        let table = SystemProcessTable::new();
        // pgrep may be missing in minimal containers; only assert when it ran
        if let Ok(running) = table.is_running("fxlaunch-no-such-process").await {
            assert!(!running);
        }
    }

    #[tokio::test]
    async fn test_force_kill_missing_pid_is_error() {
        let table = SystemProcessTable::new();
        // Above the kernel's pid_max ceiling
        assert!(table.force_kill(99_999_999).await.is_err());
    }
}
