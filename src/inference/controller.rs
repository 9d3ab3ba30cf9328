//! Session controller
//!
//! Application-facing handle over a [`Session`].
//!
//! # Architecture
//!
//! Engine handles wrap raw pointers that are not `Send`, so the session and
//! everything it owns live on a dedicated worker thread. Lifecycle and
//! generation calls travel over a command channel and run one at a time,
//! which serializes all access to the handles. Two things bypass the queue:
//! the cancellation signal and the cursor/phase status, both atomics.
//!
//! A generation takes its cancellation ticket when it is queued, not when the
//! worker reaches it. From the caller's side a queued request is already in
//! flight, so `request_abort`, `unload` and `load` stop it too.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Result, SessionError};
use crate::inference::backend::{
    BackendKind, Engine, LlamaCppEngine, SimulatedEngine, UnavailableEngine,
};
use crate::inference::cancel::{CancellationToken, Ticket};
use crate::inference::generation::{GenerationReport, GenerationRequest};
use crate::inference::session::{LoadedModelInfo, Phase, Session, SessionOptions, SessionStatus};
use crate::inference::streaming::{AsyncChannelSink, ChannelSink, StreamToken, TokenSink};
use crate::storage::settings::SessionSettings;

/// Commands sent to the worker thread
enum WorkerCommand {
    Load {
        path: PathBuf,
        threads: u32,
        context_size: u32,
        response_tx: Sender<Result<LoadedModelInfo>>,
    },
    Unload {
        response_tx: Sender<()>,
    },
    Generate {
        ticket: Ticket,
        request: GenerationRequest,
        sink: Box<dyn TokenSink + Send>,
        response_tx: Option<Sender<Result<GenerationReport>>>,
    },
    Configure {
        options: SessionOptions,
    },
    Shutdown,
}

/// Thread-safe front end to one inference session
pub struct SessionController {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    status: Arc<SessionStatus>,
    backend: &'static str,
}

impl SessionController {
    /// Starts a worker thread that owns a fresh session over `engine`
    pub fn spawn<E>(engine: E, options: SessionOptions) -> Result<Self>
    where
        E: Engine + Send + 'static,
    {
        let backend = engine.name();
        let cancel = CancellationToken::new();
        let status = Arc::new(SessionStatus::new());
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let worker_cancel = cancel.clone();
        let worker_status = Arc::clone(&status);
        let handle = thread::Builder::new()
            .name(format!("pocketllm-{backend}"))
            .spawn(move || {
                let session = Session::with_shared(engine, options, worker_cancel, worker_status);
                worker_thread_main(session, command_rx);
            })
            .map_err(|e| SessionError::Worker(e.to_string()))?;

        tracing::info!("Session worker started ({} backend)", backend);
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            cancel,
            status,
            backend,
        })
    }

    /// Picks the backend named in `settings`.
    ///
    /// If llama.cpp cannot start, the controller runs the unavailable
    /// backend instead, so every call still behaves per the degraded contract.
    pub fn from_settings(settings: &SessionSettings) -> Result<Self> {
        let options = settings.session_options();
        match settings.backend {
            BackendKind::LlamaCpp => match LlamaCppEngine::new(settings.engine_logs) {
                Ok(engine) => Self::spawn(engine, options),
                Err(e) => {
                    tracing::warn!("llama.cpp unavailable, running degraded: {}", e);
                    Self::spawn(UnavailableEngine::with_reason(e.to_string()), options)
                }
            },
            BackendKind::Simulated => Self::spawn(SimulatedEngine::new(), options),
            BackendKind::Unavailable => Self::spawn(UnavailableEngine::new(), options),
        }
    }

    fn send(&self, command: WorkerCommand) -> Result<()> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| SessionError::Worker("session worker stopped".into()))?
            .send(command)
            .map_err(|e| SessionError::Worker(e.to_string()))
    }

    /// Name of the backend serving this controller
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Loads a model, replacing any loaded one. Blocks until done.
    ///
    /// Like [`unload`](Self::unload), aborts every generation issued before
    /// the call so the teardown does not wait for them.
    pub fn load<P: AsRef<Path>>(
        &self,
        path: P,
        threads: u32,
        context_size: u32,
    ) -> Result<LoadedModelInfo> {
        self.cancel.request_abort();

        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Load {
            path: path.as_ref().to_path_buf(),
            threads,
            context_size,
            response_tx,
        })?;
        response_rx
            .recv()
            .map_err(|e| SessionError::Worker(e.to_string()))?
    }

    /// Replaces sampler and step-failure settings for later requests
    pub fn configure(&self, options: SessionOptions) -> Result<()> {
        self.send(WorkerCommand::Configure { options })
    }

    /// Queues a generation. Results arrive only through `sink`.
    pub fn generate<S>(&self, prompt: impl Into<String>, max_tokens: usize, sink: S) -> Result<()>
    where
        S: TokenSink + Send + 'static,
    {
        self.send(WorkerCommand::Generate {
            ticket: self.cancel.issue(),
            request: GenerationRequest::new(prompt, max_tokens),
            sink: Box::new(sink),
            response_tx: None,
        })
    }

    /// Runs a generation and waits for its report
    pub fn generate_blocking<S>(
        &self,
        prompt: impl Into<String>,
        max_tokens: usize,
        sink: S,
    ) -> Result<GenerationReport>
    where
        S: TokenSink + Send + 'static,
    {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Generate {
            ticket: self.cancel.issue(),
            request: GenerationRequest::new(prompt, max_tokens),
            sink: Box::new(sink),
            response_tx: Some(response_tx),
        })?;
        response_rx
            .recv()
            .map_err(|e| SessionError::Worker(e.to_string()))?
    }

    /// Queues a generation and returns its event stream.
    ///
    /// Dropping the receiver stops generation at the next token.
    pub fn generate_stream(
        &self,
        prompt: impl Into<String>,
        max_tokens: usize,
    ) -> Result<Receiver<StreamToken>> {
        let (token_tx, token_rx) = mpsc::channel();
        self.generate(prompt, max_tokens, ChannelSink::new(token_tx))?;
        Ok(token_rx)
    }

    /// Async flavour of [`generate_stream`](Self::generate_stream)
    pub fn generate_async(
        &self,
        prompt: impl Into<String>,
        max_tokens: usize,
    ) -> Result<UnboundedReceiver<StreamToken>> {
        let (token_tx, token_rx) = tokio::sync::mpsc::unbounded_channel();
        self.generate(prompt, max_tokens, AsyncChannelSink::new(token_tx))?;
        Ok(token_rx)
    }

    /// Stops every generation issued so far, running or queued, at its next
    /// iteration boundary
    pub fn request_abort(&self) {
        self.cancel.request_abort();
        tracing::info!("Abort signal sent");
    }

    /// Releases the model and context. Idempotent.
    ///
    /// Aborts every generation issued so far before queueing the release, so
    /// neither a running nor a queued request holds it up. Blocks until the
    /// worker has released.
    pub fn unload(&self) {
        self.cancel.request_abort();

        let (response_tx, response_rx) = mpsc::channel();
        if self.send(WorkerCommand::Unload { response_tx }).is_ok() {
            let _ = response_rx.recv();
        }
    }

    /// Tokens currently resident in the context window
    pub fn context_used(&self) -> usize {
        self.status.cursor()
    }

    pub fn phase(&self) -> Phase {
        self.status.phase()
    }

    pub fn is_loaded(&self) -> bool {
        self.phase() != Phase::Unloaded
    }

    /// Handle for aborting from code that does not hold the controller
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.cancel.request_abort();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the session and processes commands in arrival order.
fn worker_thread_main<E: Engine>(mut session: Session<E>, command_rx: Receiver<WorkerCommand>) {
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load {
                path,
                threads,
                context_size,
                response_tx,
            }) => {
                let result = session.load(&path, threads, context_size);
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Unload { response_tx }) => {
                session.unload();
                let _ = response_tx.send(());
            }
            Ok(WorkerCommand::Generate {
                ticket,
                request,
                mut sink,
                response_tx,
            }) => {
                let result = session.generate_ticketed(ticket, &request, sink.as_mut());
                if let Some(tx) = response_tx {
                    let _ = tx.send(result);
                }
            }
            Ok(WorkerCommand::Configure { options }) => {
                session.set_options(options);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Session worker shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
    session.unload();
}
