//! OS process table: who owns a port, is a process alive, stop it.

mod parse;
mod system;

use anyhow::Result;
use async_trait::async_trait;

pub use system::SystemProcessTable;

/// Queries and mutations of the operating system's process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Sorted, de-duplicated PIDs bound to `port`.
    async fn listeners(&self, port: u16) -> Result<Vec<u32>>;

    /// Whether a process with this image name is running.
    async fn is_running(&self, image: &str) -> Result<bool>;

    /// Kill a process (and its children where the OS supports it) without asking.
    async fn force_kill(&self, pid: u32) -> Result<()>;

    /// Ask a process to exit.
    async fn terminate(&self, pid: u32) -> Result<()>;
}
