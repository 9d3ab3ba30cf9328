//! PocketLLM Library
//!
//! Local LLM session control: load a GGUF model, stream generated text,
//! and cancel or unload from any thread.

pub mod error;
pub mod inference;
pub mod storage;
pub mod system;

pub use error::{Result, SessionError};
