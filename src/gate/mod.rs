//! The model gate.
//!
//! One `ModelGate` is constructed at startup and shared by every request
//! handler. It owns the only mutable shared state in the process: whether
//! the model is loaded, and the engine handle once it is. The load
//! transition happens at most once per process lifetime; there is no unload
//! path, so `Loaded` is terminal.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::engine::{EngineError, InferenceEngine, LoadOptions, ModelHandle, SamplingParams};
use crate::paths::ModelLocation;

/// Stop sequences matching the prompt template's role tags.
pub const STOP_SEQUENCES: [&str; 3] = ["<|user|>", "<|system|>", "</s>"];

/// Returned instead of an empty or near-empty completion.
pub const FALLBACK_RESPONSE: &str =
    "No clear response from model, try rephrasing your prompt.";

/// Completions shorter than this (after trimming) get the fallback.
const MIN_RESPONSE_CHARS: usize = 2;

/// Why a load attempt failed. `loaded` stays false in every case, so the
/// caller may retry.
#[derive(Debug)]
pub enum LoadError {
    /// No file at the resolved model path; acquire it first.
    NotFound(PathBuf),
    /// The engine rejected the model file.
    Engine(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => {
                write!(f, "model not found at {}, download it first", path.display())
            }
            Self::Engine(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Why a completion failed. Never retried automatically.
#[derive(Debug)]
pub enum InferError {
    /// Inference requested before a successful load.
    NotLoaded,
    /// The engine failed during generation.
    Engine(String),
}

impl fmt::Display for InferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "model not loaded, call /load-model first"),
            Self::Engine(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for InferError {}

/// Single-shot, idempotent gate over the loaded/unloaded state of the
/// inference handle.
pub struct ModelGate {
    engine: Arc<dyn InferenceEngine>,
    /// True iff `handle` is set. Kept separate so `status` never waits on
    /// an in-progress load.
    loaded: AtomicBool,
    /// The one handle, behind the mutex that serializes the load transition.
    handle: Mutex<Option<Arc<dyn ModelHandle>>>,
}

impl ModelGate {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            loaded: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Whether the model has been loaded. Never fails, never blocks.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Load the model if it is not loaded yet.
    ///
    /// Idempotent: once a load has succeeded every later call returns
    /// immediately without touching the engine. Concurrent callers serialize
    /// on the handle mutex, so the engine sees at most one load attempt at a
    /// time and followers of a successful attempt just observe the handle.
    pub async fn ensure_loaded(
        &self,
        location: &ModelLocation,
        options: &LoadOptions,
    ) -> Result<(), LoadError> {
        if self.is_loaded() {
            return Ok(());
        }

        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            // Another caller finished the load while we waited.
            return Ok(());
        }

        if !location.exists() {
            return Err(LoadError::NotFound(location.full_path.clone()));
        }

        tracing::info!(path = %location.full_path.display(), "loading model");
        let engine = self.engine.clone();
        let path = location.full_path.clone();
        let options = options.clone();

        // Engine load is a long blocking call; keep it off the async
        // request path so status and health checks stay responsive.
        let handle = tokio::task::spawn_blocking(move || engine.load(&path, &options))
            .await
            .map_err(|e| LoadError::Engine(format!("load task panicked: {e}")))?
            .map_err(|e| LoadError::Engine(e.to_string()))?;

        *slot = Some(handle);
        self.loaded.store(true, Ordering::Release);
        tracing::info!("model loaded");
        Ok(())
    }

    /// Run one completion through the loaded model.
    ///
    /// The prompt is wrapped in the fixed role-tagged template before it
    /// reaches the engine, and the raw output is trimmed; empty or
    /// near-empty completions are replaced with [`FALLBACK_RESPONSE`].
    pub async fn infer(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[String],
    ) -> Result<String, InferError> {
        if !self.is_loaded() {
            // Also covers an in-flight load: inference is rejected until
            // the transition has completed.
            return Err(InferError::NotLoaded);
        }
        let handle = {
            let slot = self.handle.lock().await;
            slot.clone().ok_or(InferError::NotLoaded)?
        };

        let formatted = render_prompt(prompt);
        let params = SamplingParams {
            max_tokens,
            temperature,
            stop: stop.to_vec(),
        };

        let raw = tokio::task::spawn_blocking(move || handle.complete(&formatted, &params))
            .await
            .map_err(|e| InferError::Engine(format!("inference task panicked: {e}")))?
            .map_err(|e: EngineError| InferError::Engine(e.to_string()))?;

        let trimmed = raw.trim();
        if trimmed.chars().count() < MIN_RESPONSE_CHARS {
            Ok(FALLBACK_RESPONSE.to_string())
        } else {
            Ok(trimmed.to_string())
        }
    }
}

/// Wrap a user prompt in the system/user/assistant template the model was
/// tuned for.
fn render_prompt(prompt: &str) -> String {
    format!("<|system|>\nrespond as per questions.\n<|user|>\n{prompt}\n<|assistant|>")
}

/// The fixed stop sequences as owned strings, for callers passing them to
/// [`ModelGate::infer`].
pub fn default_stop_sequences() -> Vec<String> {
    STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ModelLocation;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Engine double: counts loads, records the last prompt, and replies
    /// with a canned string.
    struct MockEngine {
        loads: AtomicUsize,
        reply: String,
        last_prompt: Arc<StdMutex<Option<String>>>,
    }

    impl MockEngine {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                reply: reply.to_string(),
                last_prompt: Arc::new(StdMutex::new(None)),
            })
        }

        fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl InferenceEngine for MockEngine {
        fn load(
            &self,
            _path: &Path,
            _options: &LoadOptions,
        ) -> Result<Arc<dyn ModelHandle>, EngineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockHandle {
                reply: self.reply.clone(),
                last_prompt: self.last_prompt.clone(),
            }))
        }
    }

    struct MockHandle {
        reply: String,
        last_prompt: Arc<StdMutex<Option<String>>>,
    }

    impl ModelHandle for MockHandle {
        fn complete(
            &self,
            prompt: &str,
            _params: &SamplingParams,
        ) -> Result<String, EngineError> {
            *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    fn location_with_model() -> (tempfile::TempDir, ModelLocation) {
        let tmp = tempfile::tempdir().unwrap();
        let location = ModelLocation::resolve_in(tmp.path()).unwrap();
        std::fs::write(&location.full_path, b"weights").unwrap();
        (tmp, location)
    }

    fn location_without_model() -> (tempfile::TempDir, ModelLocation) {
        let tmp = tempfile::tempdir().unwrap();
        let location = ModelLocation::resolve_in(tmp.path()).unwrap();
        (tmp, location)
    }

    #[tokio::test]
    async fn test_second_load_is_a_no_op() {
        let engine = MockEngine::new("fine answer");
        let gate = ModelGate::new(engine.clone());
        let (_tmp, location) = location_with_model();
        let options = LoadOptions::default();

        gate.ensure_loaded(&location, &options).await.unwrap();
        gate.ensure_loaded(&location, &options).await.unwrap();

        assert!(gate.is_loaded());
        assert_eq!(engine.load_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_trigger_one_engine_load() {
        let engine = MockEngine::new("fine answer");
        let gate = Arc::new(ModelGate::new(engine.clone()));
        let (_tmp, location) = location_with_model();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let location = location.clone();
            tasks.push(tokio::spawn(async move {
                gate.ensure_loaded(&location, &LoadOptions::default()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(gate.is_loaded());
        assert_eq!(engine.load_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_engine_call() {
        let engine = MockEngine::new("fine answer");
        let gate = Arc::new(ModelGate::new(engine.clone()));
        let (_tmp, location) = location_without_model();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let location = location.clone();
            tasks.push(tokio::spawn(async move {
                gate.ensure_loaded(&location, &LoadOptions::default()).await
            }));
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(LoadError::NotFound(_))));
        }

        assert!(!gate.is_loaded());
        assert_eq!(engine.load_count(), 0);
    }

    #[tokio::test]
    async fn test_infer_before_load_is_rejected() {
        let gate = ModelGate::new(MockEngine::new("never reached"));
        let stop = default_stop_sequences();

        for prompt in ["hello", ""] {
            let result = gate.infer(prompt, 256, 0.7, &stop).await;
            assert!(matches!(result, Err(InferError::NotLoaded)));
        }
    }

    #[tokio::test]
    async fn test_infer_applies_template_and_trims() {
        let engine = MockEngine::new("  a thoughtful reply  ");
        let gate = ModelGate::new(engine.clone());
        let (_tmp, location) = location_with_model();

        gate.ensure_loaded(&location, &LoadOptions::default())
            .await
            .unwrap();
        let answer = gate
            .infer("what is rust?", 256, 0.7, &default_stop_sequences())
            .await
            .unwrap();

        assert_eq!(answer, "a thoughtful reply");
        let seen = engine.last_prompt.lock().unwrap().clone().unwrap();
        assert_eq!(
            seen,
            "<|system|>\nrespond as per questions.\n<|user|>\nwhat is rust?\n<|assistant|>"
        );
    }

    #[tokio::test]
    async fn test_short_output_gets_fallback() {
        for reply in ["", " ", "x", " x "] {
            let gate = ModelGate::new(MockEngine::new(reply));
            let (_tmp, location) = location_with_model();

            gate.ensure_loaded(&location, &LoadOptions::default())
                .await
                .unwrap();
            let answer = gate
                .infer("hi", 256, 0.7, &default_stop_sequences())
                .await
                .unwrap();

            assert_eq!(answer, FALLBACK_RESPONSE, "for engine reply {reply:?}");
        }
    }

    #[tokio::test]
    async fn test_engine_failure_leaves_gate_unloaded() {
        struct FailingEngine;
        impl InferenceEngine for FailingEngine {
            fn load(
                &self,
                _path: &Path,
                _options: &LoadOptions,
            ) -> Result<Arc<dyn ModelHandle>, EngineError> {
                Err(EngineError::Load("bad magic bytes".to_string()))
            }
        }

        let gate = ModelGate::new(Arc::new(FailingEngine));
        let (_tmp, location) = location_with_model();

        let result = gate.ensure_loaded(&location, &LoadOptions::default()).await;
        assert!(matches!(result, Err(LoadError::Engine(_))));
        assert!(!gate.is_loaded());

        // A retry is allowed after a failed load.
        let result = gate.ensure_loaded(&location, &LoadOptions::default()).await;
        assert!(matches!(result, Err(LoadError::Engine(_))));
    }
}
