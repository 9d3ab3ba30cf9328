//! llama.cpp backend
//!
//! Binds the engine primitives to `llama-cpp-2`. Weights are memory-mapped
//! (llama.cpp's default) and every layer stays on the CPU.
//!
//! `LlamaBackend`, `LlamaModel` and `LlamaContext` wrap raw pointers; the
//! session keeps all of them on the single worker thread that created them.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use super::gguf::read_gguf_header;
use super::{ContextParams, Engine, EngineError, ModelParams, SamplerParams, Token};

/// Context paired with the model it borrows from.
///
/// Field order matters: `ctx` is dropped before `model`.
pub struct LlamaSessionContext {
    ctx: LlamaContext<'static>,
    model: Arc<LlamaModel>,
}

/// Engine backed by llama.cpp
pub struct LlamaCppEngine {
    backend: LlamaBackend,
}

impl LlamaCppEngine {
    /// Initializes the llama.cpp backend.
    ///
    /// llama.cpp allows one backend per process, so a second call fails with
    /// `EngineError::Unavailable`.
    pub fn new(engine_logs: bool) -> Result<Self, EngineError> {
        send_logs_to_tracing(LogOptions::default().with_logs_enabled(engine_logs));

        let backend =
            LlamaBackend::init().map_err(|e| EngineError::Unavailable(e.to_string()))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(Self { backend })
    }
}

impl Engine for LlamaCppEngine {
    type Model = Arc<LlamaModel>;
    type Context = LlamaSessionContext;
    type Sampler = LlamaSampler;

    fn name(&self) -> &'static str {
        "llama-cpp"
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError> {
        let header = read_gguf_header(path)?;
        tracing::debug!(
            "GGUF v{} header ok: {} tensors, {} metadata keys",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Model weights mapped: {} params, {} vocab, {} training ctx",
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );
        Ok(Arc::new(model))
    }

    fn create_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError> {
        let n_ctx = NonZeroU32::new(params.context_size)
            .ok_or_else(|| EngineError::ContextCreate("context size must be non-zero".into()))?;
        let threads = i32::try_from(params.threads)
            .map_err(|_| EngineError::ContextCreate(format!("bad thread count {}", params.threads)))?;

        // One batch must hold a whole prompt, so n_batch tracks n_ctx.
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.context_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        // SAFETY: the context borrows the model behind the Arc, whose heap
        // address is stable. LlamaSessionContext holds a clone of that Arc and
        // drops `ctx` first, so the borrow never outlives the model.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };

        Ok(LlamaSessionContext {
            ctx,
            model: Arc::clone(model),
        })
    }

    fn context_capacity(&self, ctx: &Self::Context) -> usize {
        ctx.ctx.n_ctx() as usize
    }

    fn clear_context(&self, ctx: &mut Self::Context) {
        ctx.ctx.clear_kv_cache();
    }

    fn tokenize(&self, model: &Self::Model, text: &str) -> Result<Vec<Token>, EngineError> {
        let tokens = model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn decode(
        &self,
        ctx: &mut Self::Context,
        tokens: &[Token],
        position: usize,
    ) -> Result<(), EngineError> {
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        let last = tokens.len().saturating_sub(1);

        for (i, token) in tokens.iter().enumerate() {
            let pos = i32::try_from(position + i)
                .map_err(|_| EngineError::Decode(format!("position {} out of range", position + i)))?;
            batch
                .add(LlamaToken::new(token.0), pos, &[0], i == last)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
        }

        ctx.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn new_sampler(&self, params: &SamplerParams) -> Self::Sampler {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(params.temperature),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::dist(params.seed),
        ])
    }

    fn sample(&self, sampler: &mut Self::Sampler, ctx: &mut Self::Context) -> Token {
        Token(sampler.sample(&ctx.ctx, -1).0)
    }

    fn is_end_of_generation(&self, model: &Self::Model, token: Token) -> bool {
        model.is_eog_token(LlamaToken::new(token.0))
    }

    fn detokenize(&self, model: &Self::Model, token: Token) -> Result<Vec<u8>, EngineError> {
        model
            .token_to_bytes(LlamaToken::new(token.0), Special::Tokenize)
            .map_err(|e| EngineError::Detokenize(e.to_string()))
    }

    fn release_context(&self, ctx: Self::Context) {
        tracing::debug!(
            "Releasing llama context ({} refs to model)",
            Arc::strong_count(&ctx.model)
        );
        drop(ctx);
    }
}
