//! Simulated backend
//!
//! A deterministic in-process engine for dry runs without model weights.
//! Text is tokenized byte by byte, logits are a pure function of the last
//! token and its position, and sampling goes through [`SamplerChain`], so
//! equal seeds give equal output. Faults can be injected at each primitive.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::inference::sampling::SamplerChain;

use super::{ContextParams, Engine, EngineError, ModelParams, SamplerParams, Token};

/// Beginning-of-sequence marker, prepended by `tokenize`
pub const BOS: Token = Token(256);
/// End-of-generation marker
pub const EOS: Token = Token(257);

/// Bytes the simulated model may emit
const ALPHABET: &[u8] = b"etaoinshrdlu cmwfgypbvk.,";

/// Failure points and pacing for the simulated engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatedFaults {
    pub fail_load: bool,
    pub fail_context: bool,
    pub fail_tokenize: bool,
    /// Fail the batch decoded at position 0
    pub fail_prefill: bool,
    /// Fail every prefill once this many have succeeded
    pub fail_prefill_after: Option<usize>,
    /// Fail the n-th single-token decode (0-based) after a prefill
    pub fail_step_at: Option<usize>,
    /// Sample the end-of-generation marker once this many tokens were drawn
    pub end_after: Option<usize>,
    /// Sleep applied to every single-token decode
    pub step_delay: Duration,
}

/// Record of engine calls, shared between the engine and observers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallLog {
    pub models_loaded: usize,
    pub models_released: usize,
    pub contexts_created: usize,
    pub contexts_released: usize,
    pub tokenize_calls: usize,
    /// `(position, batch length)` of every decode attempt
    pub decodes: Vec<(usize, usize)>,
    pub samplers_released: usize,
}

pub struct SimulatedModel {
    path: PathBuf,
}

impl SimulatedModel {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct SimulatedContext {
    capacity: usize,
    tokens: Vec<Token>,
    steps: usize,
}

pub struct SimulatedSampler {
    chain: SamplerChain,
    drawn: usize,
}

/// Deterministic engine. Cloning shares the call log.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngine {
    faults: SimulatedFaults,
    log: Arc<Mutex<CallLog>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: SimulatedFaults) -> Self {
        Self {
            faults,
            log: Arc::default(),
        }
    }

    /// Snapshot of the calls made so far
    pub fn calls(&self) -> CallLog {
        self.log().clone()
    }

    fn log(&self) -> MutexGuard<'_, CallLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn logits(ctx: &SimulatedContext) -> Vec<f32> {
        let last = ctx.tokens.last().map_or(0, |t| t.0 as u64);
        let position = ctx.tokens.len() as u64;
        (0..ALPHABET.len() as u64)
            .map(|i| {
                let h = mix(last.wrapping_mul(0x9E37_79B9) ^ position.rotate_left(17) ^ i);
                (h % 4096) as f32 / 1024.0
            })
            .collect()
    }
}

/// splitmix64 finalizer
fn mix(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

impl Engine for SimulatedEngine {
    type Model = SimulatedModel;
    type Context = SimulatedContext;
    type Sampler = SimulatedSampler;

    fn name(&self) -> &'static str {
        "simulated"
    }

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<Self::Model, EngineError> {
        if self.faults.fail_load {
            return Err(EngineError::ModelLoad(format!(
                "simulated load failure for {}",
                path.display()
            )));
        }
        self.log().models_loaded += 1;
        Ok(SimulatedModel {
            path: path.to_path_buf(),
        })
    }

    fn create_context(
        &self,
        _model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError> {
        if self.faults.fail_context {
            return Err(EngineError::ContextCreate("simulated allocation failure".into()));
        }
        self.log().contexts_created += 1;
        Ok(SimulatedContext {
            capacity: params.context_size as usize,
            tokens: Vec::new(),
            steps: 0,
        })
    }

    fn context_capacity(&self, ctx: &Self::Context) -> usize {
        ctx.capacity
    }

    fn clear_context(&self, ctx: &mut Self::Context) {
        ctx.tokens.clear();
        ctx.steps = 0;
    }

    fn tokenize(&self, _model: &Self::Model, text: &str) -> Result<Vec<Token>, EngineError> {
        self.log().tokenize_calls += 1;
        if self.faults.fail_tokenize {
            return Err(EngineError::Tokenization("simulated tokenizer failure".into()));
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        tokens.push(BOS);
        tokens.extend(text.bytes().map(|b| Token(i32::from(b))));
        Ok(tokens)
    }

    fn decode(
        &self,
        ctx: &mut Self::Context,
        tokens: &[Token],
        position: usize,
    ) -> Result<(), EngineError> {
        let prefills = {
            let mut log = self.log();
            log.decodes.push((position, tokens.len()));
            log.decodes.iter().filter(|(p, _)| *p == 0).count()
        };

        let prefill_fails = self.faults.fail_prefill
            || self.faults.fail_prefill_after.is_some_and(|n| prefills > n);
        if position == 0 && prefill_fails {
            return Err(EngineError::Decode("simulated prefill failure".into()));
        }
        if tokens.is_empty() {
            return Err(EngineError::Decode("empty batch".into()));
        }
        if position != ctx.tokens.len() {
            return Err(EngineError::Decode(format!(
                "position {} does not follow {} resident tokens",
                position,
                ctx.tokens.len()
            )));
        }
        if position + tokens.len() > ctx.capacity {
            return Err(EngineError::Decode(format!(
                "context full: {} + {} > {}",
                position,
                tokens.len(),
                ctx.capacity
            )));
        }

        if position > 0 {
            let step = ctx.steps;
            ctx.steps += 1;
            if self.faults.fail_step_at == Some(step) {
                return Err(EngineError::Decode(format!("simulated failure at step {step}")));
            }
            if !self.faults.step_delay.is_zero() {
                thread::sleep(self.faults.step_delay);
            }
        }

        ctx.tokens.extend_from_slice(tokens);
        Ok(())
    }

    fn new_sampler(&self, params: &SamplerParams) -> Self::Sampler {
        SimulatedSampler {
            chain: SamplerChain::new(*params),
            drawn: 0,
        }
    }

    fn sample(&self, sampler: &mut Self::Sampler, ctx: &mut Self::Context) -> Token {
        let drawn = sampler.drawn;
        sampler.drawn += 1;
        if self.faults.end_after.is_some_and(|n| drawn >= n) {
            return EOS;
        }

        let logits = Self::logits(ctx);
        match sampler.chain.sample(&logits) {
            Some(idx) => Token(i32::from(ALPHABET[idx])),
            None => EOS,
        }
    }

    fn is_end_of_generation(&self, _model: &Self::Model, token: Token) -> bool {
        token == EOS
    }

    fn detokenize(&self, _model: &Self::Model, token: Token) -> Result<Vec<u8>, EngineError> {
        match token {
            BOS | EOS => Ok(Vec::new()),
            Token(id) => u8::try_from(id)
                .map(|b| vec![b])
                .map_err(|_| EngineError::Detokenize(format!("unknown token {id}"))),
        }
    }

    fn release_sampler(&self, sampler: Self::Sampler) {
        self.log().samplers_released += 1;
        drop(sampler);
    }

    fn release_context(&self, ctx: Self::Context) {
        self.log().contexts_released += 1;
        drop(ctx);
    }

    fn release_model(&self, model: Self::Model) {
        self.log().models_released += 1;
        drop(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(engine: &SimulatedEngine, size: u32) -> (SimulatedModel, SimulatedContext) {
        let model = engine
            .load_model(Path::new("sim.gguf"), &ModelParams::default())
            .unwrap();
        let ctx = engine
            .create_context(
                &model,
                &ContextParams {
                    context_size: size,
                    threads: 1,
                },
            )
            .unwrap();
        (model, ctx)
    }

    #[test]
    fn test_tokenize_is_bos_plus_bytes() {
        let engine = SimulatedEngine::new();
        let (model, _ctx) = context(&engine, 64);
        let tokens = engine.tokenize(&model, "hi").unwrap();
        assert_eq!(tokens, vec![BOS, Token(104), Token(105)]);
        assert_eq!(model.path(), Path::new("sim.gguf"));
    }

    #[test]
    fn test_decode_requires_contiguous_positions() {
        let engine = SimulatedEngine::new();
        let (_model, mut ctx) = context(&engine, 64);
        engine.decode(&mut ctx, &[BOS, Token(1)], 0).unwrap();
        assert!(engine.decode(&mut ctx, &[Token(2)], 5).is_err());
        engine.decode(&mut ctx, &[Token(2)], 2).unwrap();
        assert_eq!(engine.calls().decodes, vec![(0, 2), (5, 1), (2, 1)]);
    }

    #[test]
    fn test_decode_rejects_overflow() {
        let engine = SimulatedEngine::new();
        let (_model, mut ctx) = context(&engine, 2);
        let result = engine.decode(&mut ctx, &[BOS, Token(1), Token(2)], 0);
        assert!(matches!(result, Err(EngineError::Decode(_))));
    }

    #[test]
    fn test_step_failure_injection() {
        let engine = SimulatedEngine::with_faults(SimulatedFaults {
            fail_step_at: Some(1),
            ..Default::default()
        });
        let (_model, mut ctx) = context(&engine, 64);
        engine.decode(&mut ctx, &[BOS], 0).unwrap();
        engine.decode(&mut ctx, &[Token(1)], 1).unwrap();
        assert!(engine.decode(&mut ctx, &[Token(2)], 2).is_err());
    }

    #[test]
    fn test_sampling_is_deterministic_per_seed() {
        let engine = SimulatedEngine::new();
        let (_model, mut ctx) = context(&engine, 64);
        engine.decode(&mut ctx, &[BOS], 0).unwrap();

        let mut a = engine.new_sampler(&SamplerParams::default());
        let mut b = engine.new_sampler(&SamplerParams::default());
        assert_eq!(engine.sample(&mut a, &mut ctx), engine.sample(&mut b, &mut ctx));
    }

    #[test]
    fn test_end_after() {
        let engine = SimulatedEngine::with_faults(SimulatedFaults {
            end_after: Some(1),
            ..Default::default()
        });
        let (model, mut ctx) = context(&engine, 64);
        engine.decode(&mut ctx, &[BOS], 0).unwrap();

        let mut sampler = engine.new_sampler(&SamplerParams::default());
        let first = engine.sample(&mut sampler, &mut ctx);
        assert!(!engine.is_end_of_generation(&model, first));
        let second = engine.sample(&mut sampler, &mut ctx);
        assert!(engine.is_end_of_generation(&model, second));
    }

    #[test]
    fn test_detokenize_markers_are_empty() {
        let engine = SimulatedEngine::new();
        let (model, _ctx) = context(&engine, 8);
        assert!(engine.detokenize(&model, BOS).unwrap().is_empty());
        assert_eq!(engine.detokenize(&model, Token(97)).unwrap(), b"a".to_vec());
        assert!(engine.detokenize(&model, Token(9000)).is_err());
    }
}
