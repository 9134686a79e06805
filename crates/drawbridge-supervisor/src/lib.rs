//! Agent-side companion supervisor for the canvas engine.
//!
//! Launches the engine process, polls its health endpoint, restarts it with
//! exponential backoff when it stops answering, and gates agent requests on
//! the engine being healthy.

pub mod alerts;
pub mod client;
pub mod probe;
pub mod process;
pub mod record;
pub mod supervisor;

pub use alerts::{Alert, AlertManager, Severity};
pub use client::EngineClient;
pub use probe::{HealthProbe, HttpHealthProbe};
pub use process::{ChildEngineProcess, EngineProcess};
pub use record::{SupervisorAction, SupervisorRecord, SupervisorState, SupervisorStatus};
pub use supervisor::{Supervisor, SupervisorReport};
