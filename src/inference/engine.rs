//! Inference engine implementation
//!
//! Core logic for managing the llama-cpp context and running inference.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, all inference operations run on a dedicated
//! worker thread. Callers communicate with it via channels.
//!
//! The worker keeps a single context alive for as long as a model is loaded.
//! Each generation either starts from an empty KV cache or restores a
//! [`ContextSnapshot`] taken at the end of an earlier turn, so a branch only
//! evaluates its own new prompt tokens. Commands are processed one at a time,
//! which makes restore, generate and capture atomic per request.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::inference::model::{validate_gguf, ModelError};
use crate::inference::streaming::{ContextSnapshot, StreamToken, Utf8Assembler};

/// Capacity of the per-request token channel. The worker blocks when the
/// consumer falls this far behind.
const TOKEN_CHANNEL_CAPACITY: usize = 64;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Failed to restore context state: {0}")]
    StateRestore(String),

    #[error("Failed to capture context state: {0}")]
    StateCapture(String),

    #[error("Prompt does not fit in context: {needed} tokens needed, {available} available")]
    ContextOverflow { needed: usize, available: usize },

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Generation parameters for a single turn
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 768,
            temperature: 0.4,
            top_k: 40,
            top_p: 0.95,
            seed: 0,
        }
    }
}

/// Options applied when a model is loaded
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Context window size for the long-lived context
    pub context_size: u32,
    /// Maximum tokens evaluated per decode call
    pub batch_size: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            gpu_layers: 32,
            context_size: 4096,
            batch_size: 512,
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Context size actually allocated
    pub context_size: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

impl LoadedModelInfo {
    /// File name of the model, or the full path when it has none
    pub fn file_name(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.clone())
    }
}

/// One generation job
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt text evaluated before sampling starts
    pub prompt: String,
    /// Context state to restore first; `None` starts from an empty context
    pub resume_from: Option<Arc<ContextSnapshot>>,
    pub params: GenerationParams,
}

/// Anything that can stream a turn of generated text.
///
/// The HTTP layer only talks to this trait, so handlers can run against a
/// scripted generator in tests.
pub trait TextGenerator: Send + Sync {
    /// Starts a generation and returns the receiving end of its token stream.
    ///
    /// The stream ends with exactly one [`StreamToken::Done`] or
    /// [`StreamToken::Error`]. Dropping the receiver cancels generation.
    fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamToken>, EngineError>;

    /// Information about the loaded model, if any
    fn model_info(&self) -> Option<LoadedModelInfo>;
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Init,
    LoadModel {
        path: PathBuf,
        options: LoadOptions,
        response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    Generate {
        request: GenerationRequest,
        token_tx: mpsc::Sender<StreamToken>,
    },
    Shutdown,
}

/// The main LLM inference engine using llama-cpp-2
///
/// Uses a dedicated worker thread for all llama-cpp operations since
/// the underlying types are not Send.
pub struct LlamaEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Cached model info, set once a load succeeds
    model_info: Option<LoadedModelInfo>,
    /// Whether backend is initialized
    initialized: bool,
}

impl LlamaEngine {
    /// Creates a new uninitialized engine
    pub fn new() -> Self {
        Self {
            command_tx: None,
            worker_handle: None,
            model_info: None,
            initialized: false,
        }
    }

    /// Initializes the llama.cpp backend
    ///
    /// Must be called before loading models or running inference.
    /// Spawns a dedicated worker thread for all llama-cpp operations.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Ok(());
        }

        let (command_tx, command_rx) = std_mpsc::channel::<WorkerCommand>();

        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(command_rx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        command_tx
            .send(WorkerCommand::Init)
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        self.command_tx = Some(command_tx);
        self.worker_handle = Some(handle);
        self.initialized = true;
        tracing::info!("LlamaEngine worker thread started");
        Ok(())
    }

    /// Loads a GGUF model and allocates the long-lived context
    ///
    /// An engine serves one model for its lifetime; a second load is rejected.
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        path: P,
        options: LoadOptions,
    ) -> Result<LoadedModelInfo, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        if let Some(info) = &self.model_info {
            return Err(EngineError::ModelLoad(format!(
                "{} is already loaded",
                info.file_name()
            )));
        }

        let path = path.as_ref();

        // Cheap header check before handing the file to llama.cpp
        let metadata = validate_gguf(path)?;
        tracing::debug!(
            version = metadata.version,
            tensors = metadata.tensor_count,
            "GGUF validation passed for {:?}",
            path
        );

        let (response_tx, response_rx) = std_mpsc::channel();

        command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                options,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let info = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        self.model_info = Some(info.clone());
        Ok(info)
    }
}

impl TextGenerator for LlamaEngine {
    fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamToken>, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        if self.model_info.is_none() {
            return Err(EngineError::NoModelLoaded);
        }

        let (token_tx, token_rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);

        command_tx
            .send(WorkerCommand::Generate { request, token_tx })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        Ok(token_rx)
    }

    fn model_info(&self) -> Option<LoadedModelInfo> {
        self.model_info.clone()
    }
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// How the per-model command loop ended
enum ModelExit {
    /// The context could not be created; the model has been released
    ContextFailed,
    Shutdown,
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and, while one is loaded, the LlamaModel and its
/// context.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<LlamaBackend> = None;

    loop {
        let Ok(command) = command_rx.recv() else {
            tracing::debug!("Command channel closed, worker exiting");
            break;
        };

        match command {
            WorkerCommand::Init => match LlamaBackend::init() {
                Ok(b) => {
                    backend = Some(b);
                    tracing::info!("LlamaBackend initialized in worker thread");
                }
                Err(e) => {
                    tracing::error!("Failed to init backend: {}", e);
                }
            },
            WorkerCommand::LoadModel {
                path,
                options,
                response_tx,
            } => {
                let Some(ref b) = backend else {
                    let _ = response_tx.send(Err(EngineError::BackendNotInitialized));
                    continue;
                };
                let model = match load_model_internal(b, &path, &options) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::error!("Model load failed: {}", e);
                        let _ = response_tx.send(Err(e));
                        continue;
                    }
                };
                match serve_model(b, &model, &path, &options, response_tx, &command_rx) {
                    ModelExit::ContextFailed => tracing::info!("Model released in worker thread"),
                    ModelExit::Shutdown => {
                        tracing::info!("Worker thread shutting down");
                        break;
                    }
                }
            }
            WorkerCommand::Generate { token_tx, .. } => {
                let _ = token_tx.blocking_send(StreamToken::Error(
                    EngineError::NoModelLoaded.to_string(),
                ));
            }
            WorkerCommand::Shutdown => {
                tracing::info!("Worker thread shutting down");
                break;
            }
        }
    }
}

/// Load a model from disk (helper for worker thread)
fn load_model_internal(
    backend: &LlamaBackend,
    path: &Path,
    options: &LoadOptions,
) -> Result<LlamaModel, EngineError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);

    LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))
}

/// Creates the context for a loaded model and processes commands until
/// shutdown.
fn serve_model(
    backend: &LlamaBackend,
    model: &LlamaModel,
    path: &Path,
    options: &LoadOptions,
    response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    command_rx: &Receiver<WorkerCommand>,
) -> ModelExit {
    let n_ctx = options.context_size.min(model.n_ctx_train()).max(512);
    let n_batch = options.batch_size.clamp(1, n_ctx);

    let Some(n_ctx_nonzero) = NonZeroU32::new(n_ctx) else {
        let _ = response_tx.send(Err(EngineError::ContextCreate(
            "context size must be non-zero".to_string(),
        )));
        return ModelExit::ContextFailed;
    };

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx_nonzero))
        .with_n_batch(n_batch);

    let mut ctx = match model.new_context(backend, ctx_params) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = response_tx.send(Err(EngineError::ContextCreate(e.to_string())));
            return ModelExit::ContextFailed;
        }
    };

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        context_length: model.n_ctx_train(),
        context_size: n_ctx,
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_size
    );
    let _ = response_tx.send(Ok(info));

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate { request, token_tx }) => {
                if let Err(e) = run_generation(&mut ctx, model, request, n_batch, &token_tx) {
                    tracing::warn!("Generation failed: {}", e);
                    let _ = token_tx.blocking_send(StreamToken::Error(e.to_string()));
                }
            }
            Ok(WorkerCommand::LoadModel { response_tx, .. }) => {
                let _ = response_tx.send(Err(EngineError::ModelLoad(
                    "a model is already loaded".to_string(),
                )));
            }
            Ok(WorkerCommand::Init) => {}
            Ok(WorkerCommand::Shutdown) | Err(_) => return ModelExit::Shutdown,
        }
    }
}

/// Run one turn of text generation (called from worker thread)
fn run_generation(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    request: GenerationRequest,
    n_batch: u32,
    tx: &mpsc::Sender<StreamToken>,
) -> Result<(), EngineError> {
    let (n_past, add_bos) = match &request.resume_from {
        Some(snapshot) => (restore_snapshot(ctx, snapshot)?, AddBos::Never),
        None => {
            ctx.clear_kv_cache();
            (0, AddBos::Always)
        }
    };

    let prompt_tokens = model
        .str_to_token(&request.prompt, add_bos)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;

    if prompt_tokens.is_empty() {
        return Err(EngineError::Tokenization("prompt produced no tokens".to_string()));
    }

    let n_ctx = ctx.n_ctx() as usize;
    let needed = n_past as usize + prompt_tokens.len();
    if needed >= n_ctx {
        return Err(EngineError::ContextOverflow {
            needed,
            available: n_ctx,
        });
    }

    tracing::debug!(
        resumed = request.resume_from.is_some(),
        n_past,
        prompt_tokens = prompt_tokens.len(),
        "Evaluating prompt"
    );

    let mut batch = LlamaBatch::new(n_batch as usize, 1);
    evaluate_prompt(ctx, &mut batch, &prompt_tokens, n_past, n_batch as usize)?;
    let n_past = n_past + prompt_tokens.len() as i32;

    let Some(n_past) = run_inference(ctx, model, &mut batch, n_past, &request.params, tx)? else {
        return Ok(());
    };

    let snapshot = capture_snapshot(ctx, n_past)?;
    tracing::debug!(
        context_tokens = snapshot.token_count,
        state_bytes = snapshot.size_bytes(),
        "Captured context state"
    );
    let _ = tx.blocking_send(StreamToken::Done(snapshot));

    Ok(())
}

/// Decodes the prompt in chunks that fit the batch.
///
/// On return the batch holds the last chunk, whose final entry carries the
/// logits sampled next.
fn evaluate_prompt(
    ctx: &mut LlamaContext,
    batch: &mut LlamaBatch,
    tokens: &[LlamaToken],
    start_pos: i32,
    n_batch: usize,
) -> Result<(), EngineError> {
    let last_index = tokens.len() - 1;

    for (chunk_index, chunk) in tokens.chunks(n_batch).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let i = chunk_index * n_batch + offset;
            batch
                .add(*token, start_pos + i as i32, &[0], i == last_index)
                .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        }
        ctx.decode(batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode prompt: {e}")))?;
    }

    Ok(())
}

/// Runs the sampling loop
///
/// Returns the KV position after the last decoded token, or `None` when the
/// receiver went away and the turn was abandoned.
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    batch: &mut LlamaBatch,
    mut n_past: i32,
    params: &GenerationParams,
    tx: &mpsc::Sender<StreamToken>,
) -> Result<Option<i32>, EngineError> {
    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    let mut sampler = if params.temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(params.top_k as i32),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let n_ctx = ctx.n_ctx() as i32;
    let mut assembler = Utf8Assembler::new();
    let mut pending_ids: Vec<i32> = Vec::new();

    for _ in 0..params.max_tokens {
        if n_past >= n_ctx {
            tracing::warn!(n_ctx, "Context window full, ending turn early");
            break;
        }

        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("Failed to convert token to bytes: {e}")))?;

        pending_ids.push(new_token.0);
        if let Some(text) = assembler.push(&token_bytes) {
            let piece = StreamToken::Piece {
                text,
                token_ids: std::mem::take(&mut pending_ids),
            };
            if tx.blocking_send(piece).is_err() {
                tracing::debug!("Receiver dropped, stopping generation");
                return Ok(None);
            }
        }

        batch.clear();
        batch
            .add(new_token, n_past, &[0], true)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;

        ctx.decode(batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;

        n_past += 1;
    }

    if let Some(text) = assembler.flush() {
        let piece = StreamToken::Piece {
            text,
            token_ids: std::mem::take(&mut pending_ids),
        };
        if tx.blocking_send(piece).is_err() {
            return Ok(None);
        }
    }

    Ok(Some(n_past))
}

/// Serializes the full context state (KV cache, logits, RNG).
fn capture_snapshot(ctx: &mut LlamaContext, token_count: i32) -> Result<ContextSnapshot, EngineError> {
    let size = ctx.get_state_size();
    if size == 0 {
        return Err(EngineError::StateCapture("context reported empty state".to_string()));
    }

    let mut data = vec![0u8; size];
    // SAFETY: `data` is exactly `get_state_size()` bytes long, which is the
    // upper bound llama.cpp writes.
    let written = unsafe { ctx.copy_state_data(data.as_mut_ptr()) };
    if written > size {
        return Err(EngineError::StateCapture(format!(
            "state wrote {written} bytes into a {size} byte buffer"
        )));
    }
    data.truncate(written);

    Ok(ContextSnapshot { token_count, data })
}

/// Loads a snapshot into the context and returns the position to continue at.
fn restore_snapshot(ctx: &mut LlamaContext, snapshot: &ContextSnapshot) -> Result<i32, EngineError> {
    // SAFETY: the blob was produced by `capture_snapshot` for a context of the
    // same model and size; llama.cpp validates the header while reading.
    let read = unsafe { ctx.set_state_data(&snapshot.data) };
    if read != snapshot.data.len() {
        return Err(EngineError::StateRestore(format!(
            "consumed {read} of {} bytes",
            snapshot.data.len()
        )));
    }
    Ok(snapshot.token_count)
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
