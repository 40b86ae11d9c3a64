//! LLM inference engine
//!
//! This module handles all interaction with llama-cpp for model loading,
//! context snapshots and streaming generation.

pub mod engine;
pub mod model;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{
    EngineError, GenerationParams, GenerationRequest, LlamaEngine, LoadOptions, LoadedModelInfo,
    TextGenerator,
};
pub use model::{is_gguf_file, validate_gguf, GgufMetadata, ModelError, GGUF_MAGIC};
pub use streaming::{CompletedTurn, ContextSnapshot, StreamToken, TurnAccumulator, Utf8Assembler};
