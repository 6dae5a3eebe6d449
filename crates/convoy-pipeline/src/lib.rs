//! The three-stage request pipeline: preprocessing → main streaming →
//! postprocessing, with cleanup, debug recording, model selection, and the
//! external gateway contracts it depends on.

pub mod cleanup;
pub mod context;
pub mod credit;
pub mod debug;
pub mod error;
pub mod instructions;
pub mod leaderboard;
pub mod mainproc;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod secrets;
pub mod selector;
pub mod storage;
pub mod token;

pub use cleanup::CleanupCoordinator;
pub use context::PipelineContext;
pub use debug::{DebugRecord, DebugRecorder, Stage};
pub use error::{PipelineError, Result};
pub use instructions::InstructionSet;
pub use leaderboard::{Leaderboard, LeaderboardEntry};
pub use mainproc::MainOutcome;
pub use pipeline::{AskTaskHandler, PipelineRunSummary, RequestPipeline, RunStatus};
pub use secrets::{CipherService, SecretsGateway, StaticSecrets};
pub use selector::{ModelSelection, ModelSelector};
pub use storage::{MemoryStorage, PersistedMessage, StorageGateway, UserRecord};
pub use token::RunToken;
