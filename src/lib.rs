// Allow dead code for public API functions that may not be used internally
// but are part of the library's exposed interface
#![allow(dead_code)]

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod input;
pub mod orchestrator;
pub mod output;
pub mod parser;
pub mod progress;
pub mod retry;
pub mod session;
pub mod template;

pub use checkpoint::{CheckpointStore, TaskCounts, TaskState};
pub use control::{Controller, StartRequest};
pub use error::ExtractError;
pub use parser::{Confidence, ParsedField};
pub use progress::{BatchStatus, ProgressReporter, ProgressSnapshot};
pub use session::AssistantClient;
