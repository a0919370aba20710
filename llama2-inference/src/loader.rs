//! Checkpoint loading: header parsing, the memory-mapped weight file, and
//! the weight catalog.
//!
//! The checkpoint is a flat binary file: a fixed little-endian header of
//! seven `i32` fields, immediately followed by concatenated f32 weight
//! tensors in a fixed architecture-defined order, the first being the token
//! embedding matrix. The file is mapped read-only once and never copied;
//! every weight tensor is a view into the mapping.

use crate::buffer::Buffer;
use crate::device::DeviceType;
use crate::error::{InferenceError, Result};
use crate::tensor::{DataType, Tensor};
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Size of the checkpoint header in bytes (7 i32 fields).
pub const HEADER_SIZE: usize = 28;

/// Catalog name of the token embedding matrix.
pub const TOKEN_EMBEDDING: &str = "token_embedding";
/// Catalog name of the final normalization weight.
pub const RMS_FINAL: &str = "rms_final";
/// Catalog name of the classifier matrix (may alias the token embedding).
pub const CLASSIFIER: &str = "classifier";

/// Parsed and validated checkpoint header.
///
/// The on-disk `vocab_size` field packs an auxiliary flag into its sign;
/// it is decoded here, once, into `shared_classifier`, and `vocab_size`
/// holds the absolute value.
#[derive(Debug, Clone)]
pub struct ModelHeader {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    pub shared_classifier: bool,
}

impl ModelHeader {
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }
}

/// Reads and validates the header from the start of a checkpoint.
///
/// The header is stored as 7 consecutive i32 values in little-endian
/// format; a short read fails with `ModelParse`.
pub fn read_header<R: Read>(reader: &mut R) -> Result<ModelHeader> {
    macro_rules! read_i32 {
        ($field:literal) => {
            reader.read_i32::<LittleEndian>().map_err(|_| {
                InferenceError::ModelParse(format!(
                    "failed to read {} from the model header",
                    $field
                ))
            })?
        };
    }

    let dim = read_i32!("dimension");
    let hidden_dim = read_i32!("hidden dimension");
    let n_layers = read_i32!("number of layers");
    let n_heads = read_i32!("number of heads");
    let n_kv_heads = read_i32!("number of KV heads");
    let vocab_size = read_i32!("vocabulary size");
    let seq_len = read_i32!("sequence length");

    let dimensions = [
        ("dim", dim),
        ("hidden_dim", hidden_dim),
        ("n_layers", n_layers),
        ("n_heads", n_heads),
        ("n_kv_heads", n_kv_heads),
        ("seq_len", seq_len),
    ];
    for (name, value) in dimensions {
        if value <= 0 {
            return Err(InferenceError::ModelParse(format!(
                "invalid {name}: must be positive, got {value}"
            )));
        }
    }
    if vocab_size == 0 {
        return Err(InferenceError::ModelParse(
            "invalid vocab_size: must be non-zero".to_string(),
        ));
    }
    if dim % n_heads != 0 {
        return Err(InferenceError::ModelParse(format!(
            "dim {dim} is not divisible by n_heads {n_heads}"
        )));
    }

    Ok(ModelHeader {
        dim: dim as usize,
        hidden_dim: hidden_dim as usize,
        n_layers: n_layers as usize,
        n_heads: n_heads as usize,
        n_kv_heads: n_kv_heads as usize,
        vocab_size: vocab_size.unsigned_abs() as usize,
        seq_len: seq_len as usize,
        shared_classifier: vocab_size > 0,
    })
}

/// The memory-mapped weight file.
///
/// Owns the read-only mapping for the model's lifetime; dropping unmaps
/// and closes exactly once. Weight data starts `HEADER_SIZE` bytes in.
#[derive(Debug)]
pub struct RawModelData {
    mmap: Mmap,
    weight_offset: usize,
}

impl RawModelData {
    /// Maps the whole checkpoint file read-only.
    pub fn map(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|_| {
            InferenceError::PathNotValid(format!(
                "failed to open the weight file {}",
                path.display()
            ))
        })?;
        // SAFETY: the mapping is read-only and the runtime never truncates
        // the checkpoint while a model holds it.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|_| {
            InferenceError::ModelParse(format!(
                "failed to map the weight file {} into memory",
                path.display()
            ))
        })?;
        if mmap.len() < HEADER_SIZE {
            return Err(InferenceError::ModelParse(format!(
                "weight file {} is shorter than the header",
                path.display()
            )));
        }
        debug!("mapped {} bytes from {}", mmap.len(), path.display());
        Ok(Self {
            mmap,
            weight_offset: HEADER_SIZE,
        })
    }

    /// Total size of the mapped file in bytes.
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    /// Borrows `count` f32 weights starting `offset` elements past the
    /// header, bounds-checked against the file size.
    pub fn weights(&self, offset: usize, count: usize) -> Result<&[f32]> {
        let start = self.weight_offset + offset * size_of::<f32>();
        let end = start + count * size_of::<f32>();
        if end > self.mmap.len() {
            return Err(InferenceError::ModelParse(format!(
                "weight range at element offset {offset} (+{count}) lies outside the mapped file"
            )));
        }
        let bytes = &self.mmap[start..end];
        // SAFETY: the length was verified against the mapping, the start is
        // 4-byte aligned (page-aligned base plus a multiple of 4), and f32
        // accepts any bit pattern.
        Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, count) })
    }

    /// Builds a non-owning tensor view for a catalog entry.
    ///
    /// The entry's offset and shape are validated against the file size
    /// before the view is created; weight bytes are never duplicated. The
    /// view points into the mapping and must not outlive the
    /// `RawModelData` that produced it.
    pub fn tensor_view(&self, entry: &WeightEntry) -> Result<Tensor> {
        let count = entry.element_count();
        let data = self
            .weights(entry.offset, count)?;
        let mut buffer =
            Buffer::from_external(data.as_ptr() as *mut u8, count * size_of::<f32>())?;
        buffer.set_device_type(DeviceType::Host);
        Tensor::from_buffer(DataType::Fp32, entry.shape.clone(), Arc::new(buffer))
    }

    #[cfg(test)]
    pub(crate) fn contains_ptr(&self, ptr: *const u8) -> bool {
        let base = self.mmap.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.mmap.len()
    }
}

/// One named weight tensor inside the checkpoint.
#[derive(Debug, Clone)]
pub struct WeightEntry {
    pub name: String,
    pub shape: Vec<usize>,
    /// Element offset past the weight base.
    pub offset: usize,
}

impl WeightEntry {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Ordered list of every weight tensor the architecture stores, with its
/// shape and element offset, derived once from the header.
///
/// Layers request weights by name instead of computing offsets by hand.
/// Offsets are validated against the file size when a view is built, so a
/// checkpoint that stops after the tensors actually used stays loadable.
#[derive(Debug)]
pub struct WeightCatalog {
    entries: Vec<WeightEntry>,
}

impl WeightCatalog {
    pub fn for_header(header: &ModelHeader) -> Self {
        let ModelHeader {
            dim,
            hidden_dim,
            n_layers,
            vocab_size,
            seq_len,
            shared_classifier,
            ..
        } = *header;
        let kv_dim = header.kv_dim();
        let head_size = header.head_size();

        fn push_block(
            entries: &mut Vec<WeightEntry>,
            offset: &mut usize,
            name: &str,
            shape: Vec<usize>,
        ) {
            let count: usize = shape.iter().product();
            entries.push(WeightEntry {
                name: name.to_string(),
                shape,
                offset: *offset,
            });
            *offset += count;
        }

        // Per-layer tensors are stored as contiguous blocks, one block per
        // tensor kind, each block holding n_layers tensors back to back.
        fn push_layer_block(
            entries: &mut Vec<WeightEntry>,
            offset: &mut usize,
            n_layers: usize,
            kind: &str,
            shape: Vec<usize>,
        ) {
            let count: usize = shape.iter().product();
            for layer_idx in 0..n_layers {
                entries.push(WeightEntry {
                    name: format!("layers.{layer_idx}.{kind}"),
                    shape: shape.clone(),
                    offset: *offset + layer_idx * count,
                });
            }
            *offset += n_layers * count;
        }

        let mut entries = Vec::new();
        let mut offset = 0usize;

        push_block(&mut entries, &mut offset, TOKEN_EMBEDDING, vec![vocab_size, dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "rms_att", vec![dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "wq", vec![dim, dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "wk", vec![kv_dim, dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "wv", vec![kv_dim, dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "wo", vec![dim, dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "rms_ffn", vec![dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "w1", vec![hidden_dim, dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "w2", vec![dim, hidden_dim]);
        push_layer_block(&mut entries, &mut offset, n_layers, "w3", vec![hidden_dim, dim]);
        push_block(&mut entries, &mut offset, RMS_FINAL, vec![dim]);
        push_block(&mut entries, &mut offset, "rope_freq_real", vec![seq_len, head_size / 2]);
        push_block(&mut entries, &mut offset, "rope_freq_imag", vec![seq_len, head_size / 2]);

        if shared_classifier {
            entries.push(WeightEntry {
                name: CLASSIFIER.to_string(),
                shape: vec![vocab_size, dim],
                offset: 0,
            });
        } else {
            push_block(&mut entries, &mut offset, CLASSIFIER, vec![vocab_size, dim]);
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[WeightEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Result<&WeightEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| {
                InferenceError::NotFound(format!("weight {name} is not in the catalog"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn test_header() -> ModelHeader {
        ModelHeader {
            dim: 4,
            hidden_dim: 8,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 6,
            seq_len: 16,
            shared_classifier: true,
        }
    }

    fn write_checkpoint(header: &ModelHeader, weights: &[f32]) -> anyhow::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        let vocab = if header.shared_classifier {
            header.vocab_size as i32
        } else {
            -(header.vocab_size as i32)
        };
        for value in [
            header.dim as i32,
            header.hidden_dim as i32,
            header.n_layers as i32,
            header.n_heads as i32,
            header.n_kv_heads as i32,
            vocab,
            header.seq_len as i32,
        ] {
            file.write_i32::<LittleEndian>(value)?;
        }
        for weight in weights {
            file.write_f32::<LittleEndian>(*weight)?;
        }
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn header_round_trips_and_decodes_the_sign_flag() -> anyhow::Result<()> {
        let mut header = test_header();
        header.shared_classifier = false;
        let file = write_checkpoint(&header, &[])?;
        let parsed = read_header(&mut File::open(file.path())?)?;
        assert_eq!(parsed.vocab_size, 6);
        assert!(!parsed.shared_classifier);
        assert_eq!(parsed.head_size(), 2);
        assert_eq!(parsed.kv_dim(), 2);
        Ok(())
    }

    #[test]
    fn short_header_fails_to_parse() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&[0u8; 12])?;
        file.flush()?;
        let result = read_header(&mut File::open(file.path())?);
        assert!(matches!(result, Err(InferenceError::ModelParse(_))));
        Ok(())
    }

    #[test]
    fn catalog_orders_blocks_by_file_layout() {
        let header = test_header();
        let catalog = WeightCatalog::for_header(&header);

        let embedding = catalog.find(TOKEN_EMBEDDING).unwrap();
        assert_eq!(embedding.offset, 0);
        assert_eq!(embedding.shape, vec![6, 4]);

        // rms_att block starts right after the embedding table.
        let rms_att_0 = catalog.find("layers.0.rms_att").unwrap();
        assert_eq!(rms_att_0.offset, 6 * 4);
        let rms_att_1 = catalog.find("layers.1.rms_att").unwrap();
        assert_eq!(rms_att_1.offset, 6 * 4 + 4);

        let wq_1 = catalog.find("layers.1.wq").unwrap();
        assert_eq!(wq_1.offset, 6 * 4 + 2 * 4 + 4 * 4);

        // Shared classifier aliases the embedding table.
        let classifier = catalog.find(CLASSIFIER).unwrap();
        assert_eq!(classifier.offset, 0);

        assert!(catalog.find("layers.2.wq").is_err());
    }

    #[test]
    fn weight_views_are_zero_copy_and_bounds_checked() -> anyhow::Result<()> {
        let mut header = test_header();
        header.vocab_size = 2;
        header.dim = 2;
        header.n_heads = 1;
        header.n_kv_heads = 1;
        let table = [5.0f32, 6.0, 7.0, 8.0];
        let file = write_checkpoint(&header, &table)?;

        let raw = RawModelData::map(file.path())?;
        let catalog = WeightCatalog::for_header(&header);
        let entry = catalog.find(TOKEN_EMBEDDING)?;
        let view = raw.tensor_view(entry)?;

        // The view points inside the mapping, not at a fresh copy.
        let buffer = view.buffer().expect("view has a buffer");
        assert!(buffer.is_external());
        assert!(raw.contains_ptr(buffer.ptr()));
        assert_eq!(view.as_slice::<f32>()?, &table);

        // The file stops after the embedding table, so the next block is
        // out of range.
        let rms_att = catalog.find("layers.0.rms_att")?;
        assert!(raw.tensor_view(rms_att).is_err());
        Ok(())
    }
}
