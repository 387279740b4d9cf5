pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod scheduler;
pub mod text;

pub use config::{DEFAULT_MAX_POLL_FAILURES, EngineConfig, EngineTexts};
pub use engine::ChatEngine;
pub use error::{EngineError, EngineResult};
pub use events::{EngineStatus, SendAvailability, StopReason, TranscriptEvent};
pub use reconciler::{MergeMode, Reconciliation, finish_streaming, needs_full_refresh, reconcile};
pub use scheduler::PollScheduler;
pub use text::{decode_html_entities, merge_range, normalize_role, parse_timestamp, shows_tool_placeholder};
