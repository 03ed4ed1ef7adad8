//! Domain layer - core orchestration logic and entities

pub mod coordinator;
pub mod fusion;
pub mod health;
pub mod pipeline;
pub mod registry;
