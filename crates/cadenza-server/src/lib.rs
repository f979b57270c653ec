pub mod app;
pub mod artifacts;
pub mod coordinator;
pub mod fetcher;
pub mod genres;
pub mod handlers;
pub mod inference;
pub mod lyrics;
pub mod metrics;
pub mod prompts;
pub mod registry;
pub mod retry;
pub mod sequencer;
pub mod state;

pub use coordinator::{CoordinatorConfig, CoordinatorError, ModelCoordinator};
pub use sequencer::{AdmissionError, GenerationBackend, JobError, JobSequencer};
