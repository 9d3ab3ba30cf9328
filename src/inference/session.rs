//! Session state and lifecycle
//!
//! A [`Session`] owns the single model/context pair of an engine together
//! with the cursor into its context window. It is an ordinary value owned by
//! whoever composes the application; [`SessionController`] is the usual owner.
//!
//! [`SessionController`]: crate::inference::SessionController

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, SessionError};
use crate::inference::backend::{ContextParams, Engine, ModelParams, SamplerParams};
use crate::inference::cancel::CancellationToken;
use crate::inference::generation::StepFailurePolicy;
use crate::system::resources::{available_memory_mb, ensure_free_memory};

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unloaded,
    Loaded,
    Generating,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Phase::Loaded,
            2 => Phase::Generating,
            _ => Phase::Unloaded,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Unloaded => 0,
            Phase::Loaded => 1,
            Phase::Generating => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unloaded => "unloaded",
            Phase::Loaded => "loaded",
            Phase::Generating => "generating",
        };
        f.write_str(name)
    }
}

/// Read-only view of a session's cursor and phase, shareable across threads.
///
/// Only the session writes to it.
#[derive(Debug, Default)]
pub struct SessionStatus {
    cursor: AtomicUsize,
    phase: AtomicU8,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens currently resident in the context window
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_cursor(&self, cursor: usize) {
        self.cursor.store(cursor, Ordering::Release);
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }
}

/// Information about the loaded model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModelInfo {
    pub path: PathBuf,
    pub backend: &'static str,
    /// Context window capacity reported by the engine
    pub context_size: usize,
    pub threads: u32,
}

/// Per-session load and generation settings
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionOptions {
    pub sampler: SamplerParams,
    pub step_failure_policy: StepFailurePolicy,
    /// Refuse to load with less free memory than this, in MiB. 0 disables.
    pub min_free_memory_mb: u64,
}

/// The model/context pair of one engine plus its cursor.
///
/// Invariants: a context exists only alongside its model, and both are
/// created and released together.
pub struct Session<E: Engine> {
    pub(crate) context: Option<E::Context>,
    pub(crate) model: Option<E::Model>,
    info: Option<LoadedModelInfo>,
    pub(crate) status: Arc<SessionStatus>,
    pub(crate) cancel: CancellationToken,
    pub(crate) options: SessionOptions,
    pub(crate) engine: E,
}

impl<E: Engine> Session<E> {
    /// Creates an unloaded session
    pub fn new(engine: E, options: SessionOptions) -> Self {
        Self::with_shared(
            engine,
            options,
            CancellationToken::new(),
            Arc::new(SessionStatus::new()),
        )
    }

    /// Creates an unloaded session around handles already shared with other threads
    pub fn with_shared(
        engine: E,
        options: SessionOptions,
        cancel: CancellationToken,
        status: Arc<SessionStatus>,
    ) -> Self {
        status.set_cursor(0);
        status.set_phase(Phase::Unloaded);
        Self {
            context: None,
            model: None,
            info: None,
            status,
            cancel,
            options,
            engine,
        }
    }

    pub fn set_options(&mut self, options: SessionOptions) {
        self.options = options;
    }

    /// Handle for aborting generation from another thread
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> Arc<SessionStatus> {
        Arc::clone(&self.status)
    }

    pub fn phase(&self) -> Phase {
        self.status.phase()
    }

    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.info.as_ref()
    }

    /// Tokens currently resident in the context window. 0 when unloaded.
    ///
    /// A failed prompt evaluation leaves this at its previous value even
    /// though the context state was already cleared for the new prompt. The
    /// next generation starts from position 0 either way.
    pub fn context_used(&self) -> usize {
        self.status.cursor()
    }

    /// Loads a model and creates its context, replacing any current pair.
    ///
    /// On failure the session is left unloaded with nothing allocated.
    pub fn load(
        &mut self,
        path: &Path,
        threads: u32,
        context_size: u32,
    ) -> Result<LoadedModelInfo> {
        if threads == 0 {
            return Err(SessionError::InvalidParameter(
                "thread count must be at least 1".into(),
            ));
        }
        if context_size == 0 {
            return Err(SessionError::InvalidParameter(
                "context size must be at least 1".into(),
            ));
        }

        self.unload();

        if let Err(e) = ensure_free_memory(self.options.min_free_memory_mb, available_memory_mb()) {
            tracing::error!("Refusing to load {}: {}", path.display(), e);
            return Err(SessionError::Load(e));
        }

        tracing::info!(
            "Loading model: {}  threads={}  ctx={}  backend={}",
            path.display(),
            threads,
            context_size,
            self.engine.name()
        );

        let model = self
            .engine
            .load_model(path, &ModelParams::default())
            .map_err(|e| {
                tracing::error!("Failed to load model from {}: {}", path.display(), e);
                SessionError::Load(e)
            })?;

        let params = ContextParams {
            context_size,
            threads,
        };
        let context = match self.engine.create_context(&model, &params) {
            Ok(context) => context,
            Err(e) => {
                tracing::error!("Failed to create context: {}", e);
                self.engine.release_model(model);
                return Err(SessionError::Load(e));
            }
        };

        let info = LoadedModelInfo {
            path: path.to_path_buf(),
            backend: self.engine.name(),
            context_size: self.engine.context_capacity(&context),
            threads,
        };

        self.model = Some(model);
        self.context = Some(context);
        self.info = Some(info.clone());
        self.status.set_cursor(0);
        self.status.set_phase(Phase::Loaded);

        tracing::info!("Model loaded: {} ({} ctx)", info.path.display(), info.context_size);
        Ok(info)
    }

    /// Releases the context and then the model. Safe to call when unloaded.
    ///
    /// The abort flag is raised first so a loop polling it stops before the
    /// handles go away.
    pub fn unload(&mut self) {
        self.cancel.request_abort();

        let had_model = self.model.is_some();
        self.release_handles();
        self.info = None;
        self.status.set_cursor(0);
        self.status.set_phase(Phase::Unloaded);

        if had_model {
            tracing::info!("Model and context released");
        }
    }

    fn release_handles(&mut self) {
        if let Some(context) = self.context.take() {
            self.engine.release_context(context);
        }
        if let Some(model) = self.model.take() {
            self.engine.release_model(model);
        }
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        self.release_handles();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::{
        EngineError, SimulatedEngine, SimulatedFaults, UnavailableEngine,
    };

    fn session(faults: SimulatedFaults) -> (Session<SimulatedEngine>, SimulatedEngine) {
        let engine = SimulatedEngine::with_faults(faults);
        (Session::new(engine.clone(), SessionOptions::default()), engine)
    }

    #[test]
    fn test_new_session_is_unloaded() {
        let (session, _) = session(SimulatedFaults::default());
        assert_eq!(session.phase(), Phase::Unloaded);
        assert_eq!(session.context_used(), 0);
        assert!(session.model_info().is_none());
    }

    #[test]
    fn test_load_sets_loaded_with_zero_cursor() {
        let (mut session, _) = session(SimulatedFaults::default());
        let info = session.load(Path::new("tiny.gguf"), 2, 2048).unwrap();

        assert_eq!(info.context_size, 2048);
        assert_eq!(info.threads, 2);
        assert_eq!(info.backend, "simulated");
        assert_eq!(session.phase(), Phase::Loaded);
        assert_eq!(session.context_used(), 0);
    }

    #[test]
    fn test_load_rejects_zero_threads_and_context() {
        let (mut session, engine) = session(SimulatedFaults::default());
        assert!(matches!(
            session.load(Path::new("m.gguf"), 0, 512),
            Err(SessionError::InvalidParameter(_))
        ));
        assert!(matches!(
            session.load(Path::new("m.gguf"), 1, 0),
            Err(SessionError::InvalidParameter(_))
        ));
        assert_eq!(engine.calls().models_loaded, 0);
    }

    #[test]
    fn test_model_failure_leaves_unloaded() {
        let (mut session, engine) = session(SimulatedFaults {
            fail_load: true,
            ..Default::default()
        });
        let result = session.load(Path::new("broken.gguf"), 1, 512);

        assert!(matches!(result, Err(SessionError::Load(_))));
        assert_eq!(session.phase(), Phase::Unloaded);
        assert!(session.model.is_none());
        assert!(session.context.is_none());
        assert_eq!(engine.calls().models_loaded, 0);
    }

    #[test]
    fn test_context_failure_releases_model() {
        let (mut session, engine) = session(SimulatedFaults {
            fail_context: true,
            ..Default::default()
        });
        let result = session.load(Path::new("big.gguf"), 1, 512);

        assert!(matches!(result, Err(SessionError::Load(_))));
        assert!(session.model.is_none());
        assert!(session.context.is_none());
        let calls = engine.calls();
        assert_eq!(calls.models_loaded, 1);
        assert_eq!(calls.models_released, 1);
    }

    #[test]
    fn test_reload_tears_down_previous_pair() {
        let (mut session, engine) = session(SimulatedFaults::default());
        session.load(Path::new("a.gguf"), 1, 256).unwrap();
        session.load(Path::new("b.gguf"), 1, 256).unwrap();

        let calls = engine.calls();
        assert_eq!(calls.models_loaded, 2);
        assert_eq!(calls.contexts_released, 1);
        assert_eq!(calls.models_released, 1);
        assert_eq!(
            session.model_info().map(|i| i.path.clone()),
            Some(PathBuf::from("b.gguf"))
        );
    }

    #[test]
    fn test_unload_is_idempotent() {
        let (mut session, engine) = session(SimulatedFaults::default());
        session.unload();
        session.load(Path::new("m.gguf"), 1, 256).unwrap();
        session.unload();
        session.unload();

        assert_eq!(session.phase(), Phase::Unloaded);
        assert_eq!(session.context_used(), 0);
        let calls = engine.calls();
        assert_eq!(calls.contexts_released, 1);
        assert_eq!(calls.models_released, 1);
    }

    #[test]
    fn test_unload_raises_abort_flag() {
        let (mut session, _) = session(SimulatedFaults::default());
        let cancel = session.cancellation();
        let in_flight = cancel.issue();
        session.unload();
        assert!(cancel.is_cancelled(in_flight));
    }

    #[test]
    fn test_drop_releases_handles() {
        let (mut session, engine) = session(SimulatedFaults::default());
        session.load(Path::new("m.gguf"), 1, 256).unwrap();
        drop(session);

        let calls = engine.calls();
        assert_eq!(calls.contexts_released, 1);
        assert_eq!(calls.models_released, 1);
    }

    #[test]
    fn test_unavailable_backend_never_loads() {
        let mut session = Session::new(UnavailableEngine::new(), SessionOptions::default());
        let result = session.load(Path::new("m.gguf"), 4, 2048);

        assert!(matches!(result, Err(SessionError::Load(_))));
        assert_eq!(session.phase(), Phase::Unloaded);
        session.unload();
        assert_eq!(session.context_used(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_low_memory_refuses_load_before_touching_engine() {
        let (mut session, engine) = session(SimulatedFaults::default());
        session.load(Path::new("m.gguf"), 1, 128).unwrap();

        session.set_options(SessionOptions {
            min_free_memory_mb: u64::MAX,
            ..Default::default()
        });
        let result = session.load(Path::new("big.gguf"), 1, 128);

        assert!(matches!(
            result,
            Err(SessionError::Load(EngineError::InsufficientMemory { .. }))
        ));
        assert_eq!(session.phase(), Phase::Unloaded);
        let calls = engine.calls();
        assert_eq!(calls.models_loaded, 1);
        assert_eq!(calls.models_released, 1);
    }

    #[test]
    fn test_shared_status_tracks_phase() {
        let (mut session, _) = session(SimulatedFaults::default());
        let status = session.status();
        session.load(Path::new("m.gguf"), 1, 64).unwrap();
        assert_eq!(status.phase(), Phase::Loaded);
        session.unload();
        assert_eq!(status.phase(), Phase::Unloaded);
    }
}
