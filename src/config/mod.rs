//! Configuration: launcher settings and bot environment.

mod bot_env;
mod launcher;

pub use bot_env::{mask, BotSettings};
pub use launcher::LauncherConfig;
