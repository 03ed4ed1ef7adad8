//! Application layer - wiring and CLI

pub mod commands;
pub mod services;

pub use commands::{Cli, Commands, CommandExecutor};
pub use services::OrchestratorService;
