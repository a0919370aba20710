//! Model orchestration: config parsing, weight mapping, the activation
//! buffer registry, the tokenizer façade, and forward sequencing.

use crate::device::{DeviceType, default_allocator};
use crate::error::{InferenceError, Result};
use crate::layer::{EmbeddingLayer, Layer};
use crate::loader::{self, ModelHeader, RawModelData, WeightCatalog};
use crate::tensor::{DataType, Tensor};
use crate::tokenizer::Tokenizer;
use log::{debug, info};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

/// Logical identifier of a pre-allocated activation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelBufferIdx {
    InputTokens,
    InputEmbeddings,
}

/// The llama2 model runtime.
///
/// Lifecycle: Uninitialized → Initialized → (forward)*. Initialization is
/// strictly one-shot: the activation buffers are created exactly once and
/// mutated in place on every forward call, and a second `init` is rejected
/// through the registry's duplicate-key guard. At most one forward call may
/// be in flight per model.
pub struct LlamaModel {
    tokenizer_path: PathBuf,
    model_path: PathBuf,
    device_type: DeviceType,
    header: Option<ModelHeader>,
    catalog: Option<WeightCatalog>,
    raw_model_data: Option<RawModelData>,
    tokenizer: Option<Tokenizer>,
    embedding_layer: Option<EmbeddingLayer>,
    buffers: HashMap<ModelBufferIdx, Tensor>,
}

impl LlamaModel {
    pub fn new(tokenizer_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            tokenizer_path: tokenizer_path.into(),
            model_path: model_path.into(),
            device_type: DeviceType::Unset,
            header: None,
            catalog: None,
            raw_model_data: None,
            tokenizer: None,
            embedding_layer: None,
            buffers: HashMap::new(),
        }
    }

    /// Loads the tokenizer and the weight file, then pre-allocates the
    /// activation buffers on `device_type`.
    ///
    /// A failed init commits no registry state, so the call can be retried
    /// after the underlying files are fixed.
    pub fn init(&mut self, device_type: DeviceType) -> Result<()> {
        if device_type == DeviceType::Unset {
            return Err(InferenceError::InvalidState(
                "cannot initialize a model on the unset device".to_string(),
            ));
        }

        let tokenizer = Tokenizer::load(&self.tokenizer_path)?;
        if tokenizer.piece_count() <= 0 {
            return Err(InferenceError::ModelParse(
                "the tokenizer reports a non-positive vocabulary size".to_string(),
            ));
        }

        let (header, catalog, raw_model_data, embedding_layer) =
            self.read_model_file(&tokenizer)?;

        let host_allocator = default_allocator(DeviceType::Host)?;
        let device_allocator = default_allocator(device_type)?;
        // Token ids are staged by host code on every call; the embedding
        // output lives on the selected device.
        let input_tokens =
            Tensor::allocated(DataType::Int32, vec![header.seq_len], &host_allocator)?;
        let input_embeddings = Tensor::allocated(
            DataType::Fp32,
            vec![header.seq_len, header.dim],
            &device_allocator,
        )?;

        self.insert_buffer(ModelBufferIdx::InputTokens, input_tokens)?;
        self.insert_buffer(ModelBufferIdx::InputEmbeddings, input_embeddings)?;

        info!(
            "initialized llama2 model on {device_type:?}: dim={} vocab={} seq_len={}",
            header.dim, header.vocab_size, header.seq_len
        );

        self.device_type = device_type;
        self.header = Some(header);
        self.catalog = Some(catalog);
        self.raw_model_data = Some(raw_model_data);
        self.tokenizer = Some(tokenizer);
        self.embedding_layer = Some(embedding_layer);
        Ok(())
    }

    /// Runs the weight-file loading protocol and builds the embedding
    /// layer from the catalog.
    fn read_model_file(
        &self,
        tokenizer: &Tokenizer,
    ) -> Result<(ModelHeader, WeightCatalog, RawModelData, EmbeddingLayer)> {
        let file = File::open(&self.model_path).map_err(|_| {
            InferenceError::PathNotValid(format!(
                "failed to open the model file {}",
                self.model_path.display()
            ))
        })?;
        let header = loader::read_header(&mut BufReader::new(file))?;

        if header.vocab_size != tokenizer.piece_count() as usize {
            return Err(InferenceError::ModelParse(
                "vocabulary size mismatch between the model file and the tokenizer".to_string(),
            ));
        }

        let raw_model_data = RawModelData::map(&self.model_path)?;
        let catalog = WeightCatalog::for_header(&header);

        let mut embedding_layer =
            EmbeddingLayer::new(header.dim, header.seq_len, header.vocab_size);
        let entry = catalog.find(loader::TOKEN_EMBEDDING)?;
        let weight = raw_model_data.tensor_view(entry)?;
        embedding_layer.set_weight(0, weight)?;

        Ok((header, catalog, raw_model_data, embedding_layer))
    }

    /// Embeds `tokens`, writing rows `0..tokens.len()` of the registered
    /// embedding buffer.
    ///
    /// `start_pos` is the position of the first token in the sequence; the
    /// embedding lookup itself is position-independent, later layers
    /// consume it.
    pub fn forward(&mut self, tokens: &[i32], start_pos: usize) -> Result<()> {
        let header = self.header.as_ref().ok_or_else(|| {
            InferenceError::InvalidState("forward called before init".to_string())
        })?;
        if tokens.len() > header.seq_len {
            return Err(InferenceError::CapacityExceeded(format!(
                "{} tokens exceed the sequence capacity {}",
                tokens.len(),
                header.seq_len
            )));
        }
        debug!("forward over {} tokens at position {start_pos}", tokens.len());

        let input_tokens = self.get_buffer(ModelBufferIdx::InputTokens)?.clone();
        let input_embeddings = self.get_buffer(ModelBufferIdx::InputEmbeddings)?.clone();

        // SAFETY: one forward call in flight per model; no other borrow of
        // the token buffer is live.
        let ids = unsafe { input_tokens.as_mut_slice::<i32>() }?;
        ids[..tokens.len()].copy_from_slice(tokens);

        let host_allocator = default_allocator(DeviceType::Host)?;
        let token_count = Tensor::allocated(DataType::Int32, vec![1], &host_allocator)?;
        // SAFETY: freshly allocated, unshared.
        unsafe { token_count.as_mut_slice::<i32>() }?[0] = tokens.len() as i32;

        let embedding_layer = self.embedding_layer.as_mut().ok_or_else(|| {
            InferenceError::Internal("the embedding layer was not created at init".to_string())
        })?;
        embedding_layer.set_input(0, input_tokens)?;
        embedding_layer.set_input(1, token_count)?;
        embedding_layer.set_output(0, input_embeddings)?;
        embedding_layer
            .forward()
            .map_err(|err| err.context("the embedding layer forward failed"))
    }

    /// Encodes a sentence into token ids. Pure with respect to model state.
    pub fn encode(&self, sentence: &str) -> Result<Vec<i32>> {
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            InferenceError::InvalidState("encode called before init".to_string())
        })?;
        Ok(tokenizer.encode(sentence))
    }

    /// Renders a token id back into its vocabulary piece.
    pub fn piece(&self, token_id: i32) -> Result<String> {
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            InferenceError::InvalidState("piece called before init".to_string())
        })?;
        Ok(tokenizer.piece(token_id).into_owned())
    }

    /// Registers a pre-allocated activation buffer.
    pub fn insert_buffer(&mut self, idx: ModelBufferIdx, tensor: Tensor) -> Result<()> {
        if self.buffers.contains_key(&idx) {
            return Err(InferenceError::KeyAlreadyExists(format!(
                "{idx:?} is already registered"
            )));
        }
        self.buffers.insert(idx, tensor);
        Ok(())
    }

    /// Looks up a registered activation buffer.
    pub fn get_buffer(&self, idx: ModelBufferIdx) -> Result<&Tensor> {
        self.buffers
            .get(&idx)
            .ok_or_else(|| InferenceError::NotFound(format!("{idx:?} is not registered")))
    }

    pub fn header(&self) -> Option<&ModelHeader> {
        self.header.as_ref()
    }

    /// The weight catalog built at init; further layer kinds pull their
    /// weights from it by name.
    pub fn weight_catalog(&self) -> Option<&WeightCatalog> {
        self.catalog.as_ref()
    }

    /// The mapped weight file. Weight tensors are views into it, so it
    /// lives exactly as long as the model.
    pub fn raw_model_data(&self) -> Option<&RawModelData> {
        self.raw_model_data.as_ref()
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }
}

impl std::fmt::Debug for LlamaModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaModel")
            .field("model_path", &self.model_path)
            .field("tokenizer_path", &self.tokenizer_path)
            .field("device_type", &self.device_type)
            .field("header", &self.header)
            .field("registered_buffers", &self.buffers.len())
            .finish()
    }
}
