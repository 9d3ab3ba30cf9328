//! Generation loop
//!
//! Prefill the prompt, then sample, stream and feed back one token at a time
//! until the budget runs out, the model emits an end-of-generation marker, an
//! abort is requested, or a decode step fails.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::inference::backend::{Engine, EngineError, Token};
use crate::inference::cancel::Ticket;
use crate::inference::session::{Phase, Session};
use crate::inference::streaming::TokenSink;

/// Tokens kept free at the end of the window for generation
pub const CONTEXT_HEADROOM: usize = 4;

/// What to do when a single-token decode fails mid-stream.
///
/// Either way the loop stops, `on_done` fires, and fragments already
/// delivered stand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepFailurePolicy {
    /// Treat the failure as an early end of generation
    #[default]
    EndGeneration,
    /// Also report it through `on_error` before `on_done`
    ReportError,
}

/// One generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Upper bound on sampled tokens. Zero streams nothing.
    pub max_tokens: usize,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    MaxTokens,
    EndOfGeneration,
    Cancelled,
    SinkClosed,
    DecodeFailed(String),
}

/// Summary of a finished generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    /// Tokens evaluated in the prefill, after budgeting
    pub prompt_tokens: usize,
    /// True if the prompt was cut to fit the window
    pub truncated: bool,
    pub generated: usize,
    pub stop: StopReason,
}

/// Applies the context budget to a tokenized prompt.
///
/// A prompt reaching `limit - CONTEXT_HEADROOM` tokens keeps only its first
/// `limit / 2` tokens. Returns true if it was cut.
pub fn budget_prompt(tokens: &mut Vec<Token>, limit: usize) -> bool {
    if tokens.len() >= limit.saturating_sub(CONTEXT_HEADROOM) {
        tokens.truncate(limit / 2);
        true
    } else {
        false
    }
}

/// Joins detokenized byte pieces into complete UTF-8 text
#[derive(Debug, Default)]
struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    /// Appends a piece and returns whatever text is now complete
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let ready = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Bytes that can never become valid go out as replacement chars.
            Err(e) if e.error_len().is_some() => self.pending.len(),
            // Hold back an incomplete trailing sequence.
            Err(e) => e.valid_up_to(),
        };
        if ready == 0 {
            return None;
        }

        let text: Vec<u8> = self.pending.drain(..ready).collect();
        let text = String::from_utf8_lossy(&text).into_owned();
        (!text.is_empty()).then_some(text)
    }

    /// Flushes a dangling partial sequence
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

impl<E: Engine> Session<E> {
    /// Runs one generation request, streaming fragments into `sink`.
    ///
    /// Blocks until the loop ends. Once the prompt is evaluated, `on_done`
    /// fires exactly once. Failures before that point are passed to
    /// `on_error` and returned without `on_done`, except for an unavailable
    /// backend, which always gets `on_error` followed by `on_done`.
    ///
    /// The request takes a fresh cancellation ticket on entry, so an abort
    /// raised before this call has no effect on it.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationReport> {
        let ticket = self.cancel.issue();
        self.generate_ticketed(ticket, request, sink)
    }

    /// Runs a request under a ticket issued earlier.
    ///
    /// The controller issues the ticket when it queues the request, so an
    /// abort or unload any time after that stops this request at its first
    /// iteration boundary.
    pub(crate) fn generate_ticketed(
        &mut self,
        ticket: Ticket,
        request: &GenerationRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationReport> {
        if let Err(e) = self.engine.check_available() {
            let message = e.to_string();
            tracing::error!("generate() on unavailable backend: {}", message);
            sink.on_error(&message);
            sink.on_done();
            return Err(SessionError::BackendUnavailable(message));
        }

        if self.model.is_none() || self.context.is_none() {
            tracing::error!("generate() called but model not loaded");
            sink.on_error(&SessionError::NoModelLoaded.to_string());
            return Err(SessionError::NoModelLoaded);
        }

        self.status.set_phase(Phase::Generating);
        let result = self.run_request(ticket, request, sink);
        self.status.set_phase(Phase::Loaded);

        if let Err(e) = &result {
            sink.on_error(&e.to_string());
        }
        result
    }

    fn run_request(
        &mut self,
        ticket: Ticket,
        request: &GenerationRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationReport> {
        let (Some(model), Some(ctx)) = (self.model.as_ref(), self.context.as_mut()) else {
            return Err(SessionError::NoModelLoaded);
        };
        let engine = &self.engine;

        let mut tokens = engine
            .tokenize(model, &request.prompt)
            .map_err(SessionError::Tokenize)?;
        if tokens.is_empty() {
            return Err(SessionError::Tokenize(EngineError::Tokenization(
                "prompt produced no tokens".into(),
            )));
        }
        tracing::debug!("Prompt tokenized: {} tokens", tokens.len());

        let limit = engine.context_capacity(ctx);
        let original = tokens.len();
        let truncated = budget_prompt(&mut tokens, limit);
        if truncated {
            tracing::warn!(
                "Prompt too long ({} >= {} - {}). Truncated to {} tokens.",
                original,
                limit,
                CONTEXT_HEADROOM,
                tokens.len()
            );
        }
        if tokens.is_empty() {
            return Err(SessionError::Prefill(EngineError::Decode(format!(
                "context window of {limit} tokens cannot hold any prompt"
            ))));
        }

        engine.clear_context(ctx);
        engine.decode(ctx, &tokens, 0).map_err(|e| {
            tracing::error!("Decode failed during prompt eval: {}", e);
            SessionError::Prefill(e)
        })?;

        let mut cursor = tokens.len();
        self.status.set_cursor(cursor);

        let mut sampler = engine.new_sampler(&self.options.sampler);
        let mut assembler = Utf8Assembler::default();
        let mut generated = 0;
        let started = Instant::now();

        let stop = loop {
            if generated >= request.max_tokens {
                break StopReason::MaxTokens;
            }
            if self.cancel.is_cancelled(ticket) {
                tracing::debug!("Generation stopped by abort request");
                break StopReason::Cancelled;
            }
            if sink.is_closed() {
                tracing::debug!("Sink closed, stopping generation");
                break StopReason::SinkClosed;
            }

            let token = engine.sample(&mut sampler, ctx);
            if engine.is_end_of_generation(model, token) {
                tracing::debug!("EOG token reached after {} tokens", generated);
                break StopReason::EndOfGeneration;
            }

            match engine.detokenize(model, token) {
                Ok(bytes) => {
                    if let Some(fragment) = assembler.push(&bytes) {
                        sink.on_token(&fragment);
                    }
                }
                Err(e) => tracing::warn!("Skipping token {}: {}", token, e),
            }

            if let Err(e) = engine.decode(ctx, &[token], cursor) {
                tracing::warn!("Decode failed at token {}: {}", generated, e);
                break StopReason::DecodeFailed(e.to_string());
            }

            cursor += 1;
            generated += 1;
            self.status.set_cursor(cursor);
        };

        engine.release_sampler(sampler);

        if let Some(tail) = assembler.finish() {
            sink.on_token(&tail);
        }
        if let StopReason::DecodeFailed(message) = &stop {
            if self.options.step_failure_policy == StepFailurePolicy::ReportError {
                sink.on_error(message);
            }
        }

        let elapsed = started.elapsed().as_secs_f32();
        tracing::info!(
            "Generation complete. {} tokens in {:.2}s ({:?})",
            generated,
            elapsed,
            stop
        );
        sink.on_done();

        Ok(GenerationReport {
            prompt_tokens: tokens.len(),
            truncated,
            generated,
            stop,
        })
    }
}
