//! The human at the console: warnings, acknowledgments, the final pause.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Interaction with whoever started the launcher.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Informational message.
    fn notice(&self, message: &str);

    /// Something is wrong but the launch can continue.
    fn warn(&self, message: &str);

    /// Block until the operator confirms.
    async fn acknowledge(&self, prompt: &str);
}

/// Operator on an interactive console.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOperator;

#[async_trait]
impl Operator for ConsoleOperator {
    fn notice(&self, message: &str) {
        println!("{}", message);
    }

    fn warn(&self, message: &str) {
        eprintln!("WARNING: {}", message);
    }

    async fn acknowledge(&self, prompt: &str) {
        println!("{}", prompt);

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        // EOF or a read error means nobody is there to answer
        if let Err(e) = stdin.read_line(&mut line).await {
            warn!(error = %e, "Could not read from stdin, continuing");
        }
    }
}

/// Operator for unattended runs (`--yes`): logs and never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoOperator;

#[async_trait]
impl Operator for AutoOperator {
    fn notice(&self, message: &str) {
        info!("{}", message);
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
    }

    async fn acknowledge(&self, prompt: &str) {
        info!(prompt = prompt, "Auto-acknowledged");
    }
}
