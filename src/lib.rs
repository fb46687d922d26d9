// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! microchat - Local LLM chat backend
//!
//! Single-model, single-user HTTP backend for the microchat desktop client.
//! Everything runs on this machine: the model file lives in the per-user
//! application data directory, inference runs in-process through llama.cpp,
//! and the only network traffic is the one-time model download.
//!
//! # Core Modules
//!
//! - [`paths`] - Per-OS model storage path resolution
//! - [`download`] - Streaming model download with progress events
//! - [`engine`] - The inference engine seam (llama.cpp behind a trait)
//! - [`gate`] - Lazy single-shot model loading and prompt handling
//! - [`server`] - HTTP API the desktop client talks to

pub mod download;
pub mod engine;
pub mod gate;
pub mod paths;
pub mod server;

// Re-export the types main and tests touch most.
pub use download::{Downloader, ProgressEvent, DEFAULT_MODEL_URL};
pub use engine::{default_engine, EngineError, InferenceEngine, LoadOptions, ModelHandle};
pub use gate::{InferError, LoadError, ModelGate};
pub use paths::{ModelLocation, OsIdentity, MODEL_FILENAME};
pub use server::{Server, DEFAULT_PORT};
