//! Singleton port launcher and the commands it starts.

mod command;
mod singleton;

pub use command::{CommandSpec, OsRunner};
pub use singleton::{LaunchOutcome, LaunchReport, LaunchRequest, SingletonLauncher, StartMode};
