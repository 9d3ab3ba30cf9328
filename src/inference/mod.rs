//! LLM inference
//!
//! Engine backends, the session lifecycle, the generation loop, and the
//! controller that serializes access to them from other threads.

pub mod backend;
pub mod cancel;
pub mod controller;
pub mod generation;
pub mod sampling;
pub mod session;
pub mod streaming;

// Re-export main types for convenience
pub use backend::{BackendKind, Engine, EngineError, SamplerParams, Token};
pub use cancel::CancellationToken;
pub use controller::SessionController;
pub use generation::{GenerationReport, GenerationRequest, StepFailurePolicy, StopReason};
pub use session::{LoadedModelInfo, Phase, Session, SessionOptions};
pub use streaming::{StreamToken, TokenSink};
