//! End-to-end model tests over synthetic checkpoint and tokenizer files.

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use llama2_inference::{
    DataType, DeviceType, InferenceError, LlamaModel, ModelBufferIdx, RuntimeConfig, Tensor,
    default_allocator, run_forward,
};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes a tokenizer vocabulary file with one entry per piece.
fn write_tokenizer(dir: &Path, pieces: &[&str]) -> Result<PathBuf> {
    let path = dir.join("tokenizer.bin");
    let mut file = File::create(&path)?;
    let max_len = pieces.iter().map(|p| p.len()).max().unwrap_or(0) as u32;
    file.write_u32::<LittleEndian>(pieces.len() as u32)?;
    file.write_u32::<LittleEndian>(max_len.max(1))?;
    for (idx, piece) in pieces.iter().enumerate() {
        file.write_f32::<LittleEndian>(idx as f32)?;
        file.write_u32::<LittleEndian>(piece.len() as u32)?;
        file.write_all(piece.as_bytes())?;
    }
    file.flush()?;
    Ok(path)
}

/// Writes a checkpoint: the 7-field header followed by the given weights.
fn write_checkpoint(
    dir: &Path,
    dim: i32,
    vocab_size: i32,
    seq_len: i32,
    weights: &[f32],
) -> Result<PathBuf> {
    let path = dir.join("model.bin");
    let mut file = File::create(&path)?;
    let hidden_dim = 2 * dim;
    for value in [dim, hidden_dim, 1, 1, 1, vocab_size, seq_len] {
        file.write_i32::<LittleEndian>(value)?;
    }
    for weight in weights {
        file.write_f32::<LittleEndian>(*weight)?;
    }
    file.flush()?;
    Ok(path)
}

/// Shared fixture: 4 pieces, dim 2, seq_len 8, an 8-float table.
fn fixture(dir: &TempDir) -> Result<(PathBuf, PathBuf)> {
    let tokenizer = write_tokenizer(dir.path(), &["a", "b", "c", "d"])?;
    let table = [0.1, 0.2, 1.1, 1.2, 2.1, 2.2, 3.1, 3.2];
    let model = write_checkpoint(dir.path(), 2, 4, 8, &table)?;
    Ok((tokenizer, model))
}

fn embedding_rows(model: &LlamaModel, n: usize, dim: usize) -> Result<Vec<f32>> {
    let output = model.get_buffer(ModelBufferIdx::InputEmbeddings)?;
    let rows = match output.device_type() {
        DeviceType::Host => output.as_slice::<f32>()?[..n * dim].to_vec(),
        _ => {
            let host = default_allocator(DeviceType::Host)?;
            let staging = Tensor::allocated(DataType::Fp32, output.dims().to_vec(), &host)?;
            let src = output.buffer().expect("allocated");
            let dst = staging.buffer().expect("allocated");
            dst.copy_from(src)?;
            staging.as_slice::<f32>()?[..n * dim].to_vec()
        }
    };
    Ok(rows)
}

#[test]
fn init_and_forward_populate_the_embedding_buffer() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let mut model = LlamaModel::new(&tokenizer, &model_path);
    model.init(DeviceType::Host)?;

    model.forward(&[2, 1], 0)?;

    // Rows 0 and 1 hold the table's rows 2 and 1.
    let rows = embedding_rows(&model, 2, 2)?;
    assert_eq!(rows, vec![2.1, 2.2, 1.1, 1.2]);
    Ok(())
}

#[test]
fn forward_runs_on_the_accelerator_device() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let mut model = LlamaModel::new(&tokenizer, &model_path);
    model.init(DeviceType::Accelerator)?;
    assert_eq!(
        model
            .get_buffer(ModelBufferIdx::InputEmbeddings)?
            .device_type(),
        DeviceType::Accelerator
    );

    model.forward(&[3, 0, 2], 0)?;

    let rows = embedding_rows(&model, 3, 2)?;
    assert_eq!(rows, vec![3.1, 3.2, 0.1, 0.2, 2.1, 2.2]);
    Ok(())
}

#[test]
fn vocab_mismatch_fails_init_and_retry_succeeds() -> Result<()> {
    let dir = TempDir::new()?;
    // Tokenizer reports 3 pieces, header declares 4.
    write_tokenizer(dir.path(), &["a", "b", "c"])?;
    let table = [0.0; 8];
    let model_path = write_checkpoint(dir.path(), 2, 4, 8, &table)?;
    let tokenizer_path = dir.path().join("tokenizer.bin");

    let mut model = LlamaModel::new(&tokenizer_path, &model_path);
    let result = model.init(DeviceType::Host);
    assert!(matches!(result, Err(InferenceError::ModelParse(_))));

    // A failed init leaves no partial registry state.
    assert!(matches!(
        model.get_buffer(ModelBufferIdx::InputTokens),
        Err(InferenceError::NotFound(_))
    ));

    // Fix the tokenizer and retry on the same model.
    write_tokenizer(dir.path(), &["a", "b", "c", "d"])?;
    model.init(DeviceType::Host)?;
    model.forward(&[1], 0)?;
    Ok(())
}

#[test]
fn missing_files_fail_with_path_not_valid() {
    let mut model = LlamaModel::new("/nonexistent/tokenizer.bin", "/nonexistent/model.bin");
    let result = model.init(DeviceType::Host);
    assert!(matches!(result, Err(InferenceError::PathNotValid(_))));
}

#[test]
fn double_init_is_rejected_by_the_registry_guard() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let mut model = LlamaModel::new(&tokenizer, &model_path);
    model.init(DeviceType::Host)?;
    let result = model.init(DeviceType::Host);
    assert!(matches!(result, Err(InferenceError::KeyAlreadyExists(_))));

    // The first initialization stays intact.
    model.forward(&[0], 0)?;
    Ok(())
}

#[test]
fn duplicate_buffer_insertion_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let mut model = LlamaModel::new(&tokenizer, &model_path);
    model.init(DeviceType::Host)?;

    let host = default_allocator(DeviceType::Host)?;
    let spare = Tensor::allocated(DataType::Int32, vec![8], &host)?;
    let result = model.insert_buffer(ModelBufferIdx::InputTokens, spare);
    assert!(matches!(result, Err(InferenceError::KeyAlreadyExists(_))));
    Ok(())
}

#[test]
fn get_buffer_misses_return_not_found() {
    let model = LlamaModel::new("tokenizer.bin", "model.bin");
    let result = model.get_buffer(ModelBufferIdx::InputEmbeddings);
    assert!(matches!(result, Err(InferenceError::NotFound(_))));
}

#[test]
fn forward_rejects_more_tokens_than_the_sequence_capacity() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let mut model = LlamaModel::new(&tokenizer, &model_path);
    model.init(DeviceType::Host)?;

    let too_many = [0i32; 9];
    let result = model.forward(&too_many, 0);
    assert!(matches!(result, Err(InferenceError::CapacityExceeded(_))));
    Ok(())
}

#[test]
fn forward_rejects_out_of_range_token_ids() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let mut model = LlamaModel::new(&tokenizer, &model_path);
    model.init(DeviceType::Host)?;

    let result = model.forward(&[7], 0);
    assert!(matches!(
        result,
        Err(InferenceError::IndexOutOfRange { index: 7, bound: 4 })
    ));
    Ok(())
}

#[test]
fn encode_maps_pieces_to_ordered_ids() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let mut model = LlamaModel::new(&tokenizer, &model_path);
    model.init(DeviceType::Host)?;

    assert_eq!(model.encode("cb")?, vec![2, 1]);
    assert_eq!(model.piece(2)?, "c");
    Ok(())
}

#[test]
fn run_forward_returns_host_embeddings() -> Result<()> {
    let dir = TempDir::new()?;
    let (tokenizer, model_path) = fixture(&dir)?;

    let config = RuntimeConfig::builder()
        .model_path(Some(&model_path.display().to_string()))
        .tokenizer_path(Some(&tokenizer.display().to_string()))
        .device(Some(DeviceType::Accelerator))
        .prompt(Some(&"da".to_string()))
        .build()
        .map_err(|msg| anyhow::anyhow!(msg))?;

    let output = run_forward(config)?;
    assert_eq!(output.tokens, vec![3, 0]);
    assert_eq!(output.dim, 2);
    assert_eq!(output.embeddings, vec![3.1, 3.2, 0.1, 0.2]);
    Ok(())
}
