//! Engine capability
//!
//! The inference engine (weights, tokenizer, forward pass, sampling kernels)
//! is an external collaborator. This module defines the primitives the
//! session consumes from it and the backends that provide them.
//!
//! Handles are associated types so each backend keeps its own native
//! representation. They never leave the thread that owns the [`Session`].
//!
//! [`Session`]: crate::inference::Session

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gguf;
pub mod llama;
pub mod simulated;
pub mod unavailable;

pub use gguf::{read_gguf_header, GgufError, GgufHeader, GGUF_MAGIC};
pub use llama::LlamaCppEngine;
pub use simulated::{SimulatedEngine, SimulatedFaults};
pub use unavailable::UnavailableEngine;

/// Errors reported by an engine primitive
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Inference engine unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Detokenization failed: {0}")]
    Detokenize(String),

    #[error("Insufficient memory: {available_mb}MB free, need {required_mb}MB+")]
    InsufficientMemory { available_mb: u64, required_mb: u64 },
}

impl From<GgufError> for EngineError {
    fn from(e: GgufError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Opaque token identifier, meaningful only to the engine that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub i32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for loading model weights.
///
/// Backends memory-map weights, so loading never needs RAM proportional to
/// the model size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelParams {
    /// Layers offloaded to a GPU. Sessions always use 0 (CPU only).
    pub gpu_layers: u32,
}

/// Parameters for creating an inference context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window capacity in tokens
    pub context_size: u32,
    /// CPU threads used for both single-token and batch decode
    pub threads: u32,
}

/// Sampler chain configuration: temperature, then nucleus filtering, then a
/// seeded stochastic draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            seed: 42,
        }
    }
}

/// Primitives provided by a native inference engine.
///
/// The session owns every handle returned here and releases them in
/// reverse order of creation: sampler, context, model.
pub trait Engine {
    type Model;
    type Context;
    type Sampler;

    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Reports whether the engine can serve requests at all.
    ///
    /// A backend that is not provisioned returns `EngineError::Unavailable`.
    fn check_available(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError>;

    fn create_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError>;

    /// Configured capacity of the context window, in tokens
    fn context_capacity(&self, ctx: &Self::Context) -> usize;

    /// Clears any token state held by the context
    fn clear_context(&self, ctx: &mut Self::Context);

    fn tokenize(&self, model: &Self::Model, text: &str) -> Result<Vec<Token>, EngineError>;

    /// Evaluates `tokens` as one batch starting at `position`
    fn decode(
        &self,
        ctx: &mut Self::Context,
        tokens: &[Token],
        position: usize,
    ) -> Result<(), EngineError>;

    fn new_sampler(&self, params: &SamplerParams) -> Self::Sampler;

    /// Draws the next token from the logits of the last decoded position
    fn sample(&self, sampler: &mut Self::Sampler, ctx: &mut Self::Context) -> Token;

    fn is_end_of_generation(&self, model: &Self::Model, token: Token) -> bool;

    /// Raw bytes of a token's text piece. May be a partial UTF-8 sequence.
    fn detokenize(&self, model: &Self::Model, token: Token) -> Result<Vec<u8>, EngineError>;

    fn release_sampler(&self, sampler: Self::Sampler) {
        drop(sampler);
    }

    fn release_context(&self, ctx: Self::Context) {
        drop(ctx);
    }

    fn release_model(&self, model: Self::Model) {
        drop(model);
    }
}

/// Which engine a controller should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// llama.cpp through `llama-cpp-2`
    #[default]
    LlamaCpp,
    /// Deterministic in-process engine, no model file needed
    Simulated,
    /// Degraded mode: every load fails, every generate reports an error
    Unavailable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::LlamaCpp => "llama-cpp",
            BackendKind::Simulated => "simulated",
            BackendKind::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_params_default_is_cpu_only() {
        let params = ModelParams::default();
        assert_eq!(params.gpu_layers, 0);
    }

    #[test]
    fn test_backend_kind_serde_names() {
        let json = serde_json::to_string(&BackendKind::LlamaCpp).unwrap();
        assert_eq!(json, "\"llama-cpp\"");
        let kind: BackendKind = serde_json::from_str("\"simulated\"").unwrap();
        assert_eq!(kind, BackendKind::Simulated);
        assert_eq!(BackendKind::Unavailable.to_string(), "unavailable");
    }

    #[test]
    fn test_gguf_error_maps_to_validation() {
        let err: EngineError = GgufError::FileTooSmall.into();
        assert!(matches!(err, EngineError::ModelValidation(_)));
    }
}
