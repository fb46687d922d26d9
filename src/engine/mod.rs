//! The wrapped inference engine.
//!
//! Everything hard about language models (tokenization, context management,
//! sampling, the numeric kernels) lives behind these two traits. The rest of
//! the crate only ever asks for two things: load a weight file into a handle,
//! and complete a prompt with that handle.
//!
//! The real backend is llama.cpp via the `llama-cpp-2` bindings, compiled in
//! with the `llama` cargo feature. Builds without it still serve every
//! endpoint; loading just reports that no backend is present.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "llama")]
pub mod llama;

/// Options for loading a model into the engine.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Context window size in tokens.
    pub context_size: u32,
    /// Worker threads for inference.
    pub thread_count: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            context_size: 4096,
            thread_count: 4,
        }
    }
}

/// Sampling parameters for one completion.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 = greedy).
    pub temperature: f32,
    /// Sequences that end generation when they appear in the output.
    pub stop: Vec<String>,
}

/// Errors surfaced by an engine implementation.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// This build has no inference backend.
    Unavailable(String),
    /// The engine rejected the model file.
    Load(String),
    /// Generation failed after the model was loaded.
    Inference(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "engine unavailable: {msg}"),
            Self::Load(msg) => write!(f, "model load failed: {msg}"),
            Self::Inference(msg) => write!(f, "inference failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// An inference engine capable of loading model files.
///
/// `load` is a long, blocking, CPU and I/O bound call; callers are expected
/// to run it off the async request path.
pub trait InferenceEngine: Send + Sync {
    fn load(
        &self,
        path: &Path,
        options: &LoadOptions,
    ) -> Result<Arc<dyn ModelHandle>, EngineError>;
}

/// A loaded model, ready to serve completions.
///
/// Handles live for the remainder of the process; there is no unload path.
pub trait ModelHandle: Send + Sync {
    /// Run one blocking completion and return the raw generated text.
    fn complete(&self, prompt: &str, params: &SamplingParams) -> Result<String, EngineError>;
}

/// The engine this build ships with.
pub fn default_engine() -> Arc<dyn InferenceEngine> {
    #[cfg(feature = "llama")]
    {
        Arc::new(llama::LlamaCppEngine::new())
    }
    #[cfg(not(feature = "llama"))]
    {
        Arc::new(DisabledEngine)
    }
}

/// Placeholder engine for builds without a backend.
#[cfg(not(feature = "llama"))]
struct DisabledEngine;

#[cfg(not(feature = "llama"))]
impl InferenceEngine for DisabledEngine {
    fn load(
        &self,
        _path: &Path,
        _options: &LoadOptions,
    ) -> Result<Arc<dyn ModelHandle>, EngineError> {
        Err(EngineError::Unavailable(
            "this build has no inference backend; rebuild with `--features llama`".to_string(),
        ))
    }
}
