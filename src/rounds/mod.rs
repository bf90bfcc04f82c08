// Round orchestration exports
pub mod orchestrator;

pub use orchestrator::{OrchestratorOptions, RoundOrchestrator};
