//! llama.cpp backend.
//!
//! The `llama-cpp-2` types (`LlamaBackend`, `LlamaModel`, `LlamaContext`)
//! hold raw pointers and are not `Send`, so each loaded model lives on a
//! dedicated worker thread that owns them outright. The handle returned to
//! the rest of the crate is just a request channel into that thread.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;

use super::{EngineError, InferenceEngine, LoadOptions, ModelHandle, SamplingParams};

/// Batch size for prompt processing.
const BATCH_SIZE: usize = 512;

/// CPU-only: no layers are offloaded to the GPU.
const GPU_LAYERS: u32 = 0;

/// One completion request for the worker thread.
struct CompletionRequest {
    prompt: String,
    params: SamplingParams,
    reply_tx: Sender<Result<String, EngineError>>,
}

/// Engine backed by llama.cpp.
pub struct LlamaCppEngine;

impl LlamaCppEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LlamaCppEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for LlamaCppEngine {
    fn load(
        &self,
        path: &Path,
        options: &LoadOptions,
    ) -> Result<Arc<dyn ModelHandle>, EngineError> {
        let (request_tx, request_rx) = mpsc::channel::<CompletionRequest>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), EngineError>>();

        let path = path.to_path_buf();
        let options = options.clone();

        thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_main(path, options, ready_tx, request_rx))
            .map_err(|e| EngineError::Load(format!("failed to spawn worker thread: {e}")))?;

        // Block until the worker has the weights in memory (or failed).
        ready_rx
            .recv()
            .map_err(|_| EngineError::Load("worker thread exited during load".to_string()))??;

        tracing::info!("llama.cpp worker ready");
        Ok(Arc::new(LlamaCppHandle {
            request_tx: Mutex::new(request_tx),
        }))
    }
}

/// Channel-based handle to a worker thread owning one loaded model.
struct LlamaCppHandle {
    request_tx: Mutex<Sender<CompletionRequest>>,
}

impl ModelHandle for LlamaCppHandle {
    fn complete(&self, prompt: &str, params: &SamplingParams) -> Result<String, EngineError> {
        let (reply_tx, reply_rx) = mpsc::channel();

        self.request_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(CompletionRequest {
                prompt: prompt.to_string(),
                params: params.clone(),
                reply_tx,
            })
            .map_err(|_| EngineError::Inference("worker thread is gone".to_string()))?;

        reply_rx
            .recv()
            .map_err(|_| EngineError::Inference("worker thread exited mid-request".to_string()))?
    }
}

/// Worker thread body: initialize the backend, load the model once, then
/// serve completion requests until the handle is dropped.
fn worker_main(
    path: PathBuf,
    options: LoadOptions,
    ready_tx: Sender<Result<(), EngineError>>,
    request_rx: Receiver<CompletionRequest>,
) {
    let backend = match LlamaBackend::init() {
        Ok(b) => b,
        Err(e) => {
            let _ = ready_tx.send(Err(EngineError::Load(format!(
                "failed to initialize llama backend: {e}"
            ))));
            return;
        }
    };

    let model_params = LlamaModelParams::default().with_n_gpu_layers(GPU_LAYERS);
    let model = match LlamaModel::load_from_file(&backend, &path, &model_params) {
        Ok(m) => m,
        Err(e) => {
            let _ = ready_tx.send(Err(EngineError::Load(e.to_string())));
            return;
        }
    };

    tracing::info!(path = %path.display(), "model weights loaded");
    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    while let Ok(request) = request_rx.recv() {
        let result = run_completion(&backend, &model, &options, &request.prompt, &request.params);
        let _ = request.reply_tx.send(result);
    }

    tracing::debug!("request channel closed, llama worker exiting");
}

/// Run one non-streaming completion on the worker thread.
fn run_completion(
    backend: &LlamaBackend,
    model: &LlamaModel,
    options: &LoadOptions,
    prompt: &str,
    params: &SamplingParams,
) -> Result<String, EngineError> {
    let n_ctx = NonZeroU32::new(options.context_size.max(1))
        .ok_or_else(|| EngineError::Inference("invalid context size".to_string()))?;

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(BATCH_SIZE as u32)
        .with_n_threads(options.thread_count as i32)
        .with_n_threads_batch(options.thread_count as i32);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::Inference(format!("failed to create context: {e}")))?;

    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| EngineError::Inference(format!("failed to tokenize prompt: {e}")))?;

    let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
    for (i, token) in tokens.iter().enumerate() {
        let is_last = i == tokens.len() - 1;
        batch
            .add(*token, i as i32, &[0], is_last)
            .map_err(|e| EngineError::Inference(format!("failed to batch prompt: {e}")))?;
    }

    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(format!("failed to decode prompt: {e}")))?;

    let mut sampler = if params.temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(time_seed()),
        ])
    };

    let mut out_bytes: Vec<u8> = Vec::new();
    let mut n_decoded = tokens.len() as i32;

    for _ in 0..params.max_tokens {
        let new_token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("failed to detokenize: {e}")))?;
        out_bytes.extend_from_slice(&token_bytes);

        // Stop sequences are matched on the accumulated text, and anything
        // from the match onward is discarded.
        let text = String::from_utf8_lossy(&out_bytes);
        if let Some(cut) = params
            .stop
            .iter()
            .filter_map(|stop| text.find(stop.as_str()))
            .min()
        {
            out_bytes.truncate(cut);
            break;
        }

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| EngineError::Inference(format!("failed to batch token: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("failed to decode token: {e}")))?;
        n_decoded += 1;
    }

    Ok(String::from_utf8_lossy(&out_bytes).into_owned())
}

fn time_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}
