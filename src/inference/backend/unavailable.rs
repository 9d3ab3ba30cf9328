//! Degraded-mode backend
//!
//! Stands in when no inference engine is provisioned on this install. It can
//! never produce a model, so every handle type is uninhabited.

use std::convert::Infallible;
use std::path::Path;

use super::{ContextParams, Engine, EngineError, ModelParams, SamplerParams, Token};

const DEFAULT_REASON: &str =
    "Model not available. Install a llama.cpp-enabled build and configure a model.";

/// Engine that refuses every request
#[derive(Debug, Clone)]
pub struct UnavailableEngine {
    reason: String,
}

impl UnavailableEngine {
    pub fn new() -> Self {
        Self {
            reason: DEFAULT_REASON.to_string(),
        }
    }

    /// Degraded engine carrying the reason the real one could not start
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for UnavailableEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for UnavailableEngine {
    type Model = Infallible;
    type Context = Infallible;
    type Sampler = ();

    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn check_available(&self) -> Result<(), EngineError> {
        Err(EngineError::Unavailable(self.reason.clone()))
    }

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<Self::Model, EngineError> {
        tracing::error!("Cannot load {}: {}", path.display(), self.reason);
        Err(EngineError::Unavailable(self.reason.clone()))
    }

    fn create_context(
        &self,
        model: &Self::Model,
        _params: &ContextParams,
    ) -> Result<Self::Context, EngineError> {
        match *model {}
    }

    fn context_capacity(&self, ctx: &Self::Context) -> usize {
        match *ctx {}
    }

    fn clear_context(&self, ctx: &mut Self::Context) {
        match *ctx {}
    }

    fn tokenize(&self, model: &Self::Model, _text: &str) -> Result<Vec<Token>, EngineError> {
        match *model {}
    }

    fn decode(
        &self,
        ctx: &mut Self::Context,
        _tokens: &[Token],
        _position: usize,
    ) -> Result<(), EngineError> {
        match *ctx {}
    }

    fn new_sampler(&self, _params: &SamplerParams) -> Self::Sampler {}

    fn sample(&self, _sampler: &mut Self::Sampler, ctx: &mut Self::Context) -> Token {
        match *ctx {}
    }

    fn is_end_of_generation(&self, model: &Self::Model, _token: Token) -> bool {
        match *model {}
    }

    fn detokenize(&self, model: &Self::Model, _token: Token) -> Result<Vec<u8>, EngineError> {
        match *model {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_always_fails() {
        let engine = UnavailableEngine::new();
        let result = engine.load_model(Path::new("model.gguf"), &ModelParams::default());
        assert!(matches!(result, Err(EngineError::Unavailable(_))));
    }

    #[test]
    fn test_reports_reason() {
        let engine = UnavailableEngine::with_reason("backend init failed");
        assert_eq!(
            engine.check_available(),
            Err(EngineError::Unavailable("backend init failed".to_string()))
        );
    }
}
