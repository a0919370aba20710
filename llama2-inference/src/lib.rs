//! Local inference runtime core for llama2-style checkpoints.
//!
//! Loads model weights from a binary checkpoint through a zero-copy memory
//! mapping and drives a forward pass over tokenized input to produce
//! embeddings. Memory lives behind a device abstraction (host and
//! accelerator address spaces), activation buffers are allocated once at
//! init and reused on every call, and all fallible operations return typed
//! results.

pub mod buffer;
pub mod device;
pub mod error;
pub mod layer;
pub mod loader;
pub mod model;
pub mod tensor;
pub mod tokenizer;

pub use buffer::Buffer;
pub use device::{
    AcceleratorAllocator, CopyDirection, DeviceAllocator, DeviceType, HostAllocator,
    default_allocator,
};
pub use error::{InferenceError, Result};
pub use layer::{EmbeddingLayer, Layer};
pub use loader::{ModelHeader, RawModelData, WeightCatalog, WeightEntry};
pub use model::{LlamaModel, ModelBufferIdx};
pub use tensor::{DataType, Tensor, TensorElement};
pub use tokenizer::Tokenizer;

use log::debug;

/// Caller-supplied parameters for one embedding run.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub model_path: String,
    pub tokenizer_path: String,
    pub device: DeviceType,
    pub prompt: Option<String>,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    model_path: Option<String>,
    tokenizer_path: Option<String>,
    device: Option<DeviceType>,
    prompt: Option<String>,
}

impl RuntimeConfigBuilder {
    pub fn model_path(mut self, path: Option<&String>) -> Self {
        self.model_path = path.cloned();
        self
    }
    pub fn tokenizer_path(mut self, path: Option<&String>) -> Self {
        self.tokenizer_path = path.cloned();
        self
    }
    pub fn device(mut self, device: Option<DeviceType>) -> Self {
        self.device = device;
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn build(self) -> std::result::Result<RuntimeConfig, String> {
        Ok(RuntimeConfig {
            model_path: self.model_path.ok_or("model_path is required")?,
            tokenizer_path: self.tokenizer_path.ok_or("tokenizer_path is required")?,
            device: self.device.unwrap_or(DeviceType::Host),
            prompt: self.prompt,
        })
    }
}

/// The embeddings produced by one forward pass.
#[derive(Debug)]
pub struct EmbeddingOutput {
    pub tokens: Vec<i32>,
    pub dim: usize,
    /// Row-major `[tokens.len(), dim]`, copied back to the host.
    pub embeddings: Vec<f32>,
}

/// Initializes a model, encodes the prompt, and runs the embedding
/// forward pass.
pub fn run_forward(config: RuntimeConfig) -> Result<EmbeddingOutput> {
    debug!("{config:#?}");

    let mut model = LlamaModel::new(&config.tokenizer_path, &config.model_path);
    model.init(config.device)?;

    let prompt = config.prompt.as_deref().unwrap_or("");
    let tokens = model.encode(prompt)?;
    if tokens.is_empty() {
        return Err(InferenceError::InvalidState(
            "the prompt produced no tokens".to_string(),
        ));
    }

    model.forward(&tokens, 0)?;

    let dim = model
        .header()
        .map(|header| header.dim)
        .ok_or_else(|| InferenceError::Internal("model header missing after init".to_string()))?;

    let output = model.get_buffer(ModelBufferIdx::InputEmbeddings)?;
    let embeddings = match output.device_type() {
        DeviceType::Host => output.as_slice::<f32>()?[..tokens.len() * dim].to_vec(),
        _ => {
            // Stage the device-resident rows back through host memory.
            let host_allocator = default_allocator(DeviceType::Host)?;
            let staging =
                Tensor::allocated(DataType::Fp32, output.dims().to_vec(), &host_allocator)?;
            let src = output.buffer().ok_or_else(|| {
                InferenceError::Internal("embedding buffer is unallocated".to_string())
            })?;
            let dst = staging.buffer().ok_or_else(|| {
                InferenceError::Internal("staging buffer is unallocated".to_string())
            })?;
            dst.copy_from(src)?;
            staging.as_slice::<f32>()?[..tokens.len() * dim].to_vec()
        }
    };

    Ok(EmbeddingOutput {
        tokens,
        dim,
        embeddings,
    })
}
