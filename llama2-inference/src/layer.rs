//! Forward-computation layers.
//!
//! A layer binds named weight/input/output tensors into numbered slots and
//! exposes a single `forward` operation. The embedding lookup is the one
//! concrete layer of this core; further layer kinds plug into the same
//! trait and pull their weights from the catalog by name.

use crate::error::{InferenceError, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Polymorphic forward-computation unit.
pub trait Layer {
    fn weight_count(&self) -> usize;
    fn input_count(&self) -> usize;
    fn output_count(&self) -> usize;

    /// Binds a weight tensor at a slot.
    fn set_weight(&mut self, idx: usize, weight: Tensor) -> Result<()>;

    /// Binds an input tensor at a slot.
    fn set_input(&mut self, idx: usize, input: Tensor) -> Result<()>;

    /// Binds an output tensor at a slot.
    fn set_output(&mut self, idx: usize, output: Tensor) -> Result<()>;

    /// Runs the layer over its bound tensors.
    ///
    /// Fails with `Internal` if a required binding is absent.
    fn forward(&mut self) -> Result<()>;
}

fn slot_bound(idx: usize, bound: usize) -> Result<()> {
    if idx >= bound {
        return Err(InferenceError::IndexOutOfRange {
            index: idx as i64,
            bound,
        });
    }
    Ok(())
}

/// Token embedding lookup.
///
/// Weight: `[vocab_size, dim]`, a non-owning view into the mapped
/// checkpoint. Input 0: token ids, `[seq_len]` Int32 on the host. Input 1:
/// a scalar Int32 tensor holding the live token count N. Output 0:
/// `[seq_len, dim]` Fp32 on any device; rows `0..N` receive the embedding
/// rows of the corresponding token ids.
pub struct EmbeddingLayer {
    dim: usize,
    seq_len: usize,
    vocab_size: usize,
    weight: Option<Tensor>,
    inputs: [Option<Tensor>; 2],
    output: Option<Tensor>,
}

impl EmbeddingLayer {
    pub fn new(dim: usize, seq_len: usize, vocab_size: usize) -> Self {
        Self {
            dim,
            seq_len,
            vocab_size,
            weight: None,
            inputs: [None, None],
            output: None,
        }
    }

    fn bound_tensors(&self) -> Result<(&Tensor, &Tensor, &Tensor, &Tensor)> {
        let weight = self.weight.as_ref().ok_or_else(|| {
            InferenceError::Internal("embedding weight is not bound".to_string())
        })?;
        let tokens = self.inputs[0].as_ref().ok_or_else(|| {
            InferenceError::Internal("embedding token input is not bound".to_string())
        })?;
        let count = self.inputs[1].as_ref().ok_or_else(|| {
            InferenceError::Internal("embedding token count input is not bound".to_string())
        })?;
        let output = self.output.as_ref().ok_or_else(|| {
            InferenceError::Internal("embedding output is not bound".to_string())
        })?;
        Ok((weight, tokens, count, output))
    }
}

impl Layer for EmbeddingLayer {
    fn weight_count(&self) -> usize {
        1
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        1
    }

    fn set_weight(&mut self, idx: usize, weight: Tensor) -> Result<()> {
        slot_bound(idx, self.weight_count())?;
        if weight.dims() != [self.vocab_size, self.dim] {
            return Err(InferenceError::Internal(format!(
                "embedding weight shape {:?} does not match [{}, {}]",
                weight.dims(),
                self.vocab_size,
                self.dim
            )));
        }
        self.weight = Some(weight);
        Ok(())
    }

    fn set_input(&mut self, idx: usize, input: Tensor) -> Result<()> {
        slot_bound(idx, self.input_count())?;
        self.inputs[idx] = Some(input);
        Ok(())
    }

    fn set_output(&mut self, idx: usize, output: Tensor) -> Result<()> {
        slot_bound(idx, self.output_count())?;
        self.output = Some(output);
        Ok(())
    }

    fn forward(&mut self) -> Result<()> {
        let (weight, tokens, count, output) = self.bound_tensors()?;
        let dim = self.dim;

        let token_count = *count
            .as_slice::<i32>()?
            .first()
            .ok_or_else(|| InferenceError::Internal("token count tensor is empty".to_string()))?;
        let token_count = usize::try_from(token_count).map_err(|_| {
            InferenceError::Internal(format!("negative token count {token_count}"))
        })?;
        if token_count > self.seq_len {
            return Err(InferenceError::CapacityExceeded(format!(
                "{token_count} tokens exceed the sequence capacity {}",
                self.seq_len
            )));
        }

        let ids = tokens.as_slice::<i32>()?;
        if token_count > ids.len() {
            return Err(InferenceError::Internal(format!(
                "token count {token_count} exceeds the token buffer length {}",
                ids.len()
            )));
        }
        let ids = &ids[..token_count];
        for &id in ids {
            if id < 0 || id as usize >= self.vocab_size {
                return Err(InferenceError::IndexOutOfRange {
                    index: id as i64,
                    bound: self.vocab_size,
                });
            }
        }
        if output.element_count() < token_count * dim {
            return Err(InferenceError::CapacityExceeded(format!(
                "output tensor {:?} cannot hold {token_count} embedding rows",
                output.dims()
            )));
        }

        if weight.device_type() == output.device_type() && output.device_type() == crate::device::DeviceType::Host {
            // Host fast path: gather rows in parallel.
            let table = weight.as_slice::<f32>()?;
            // SAFETY: the output buffer is only borrowed here for the
            // duration of the gather; one forward call is in flight per
            // model.
            let out = unsafe { output.as_mut_slice::<f32>()? };
            out[..token_count * dim]
                .par_chunks_mut(dim)
                .zip(ids.par_iter())
                .for_each(|(row, &id)| {
                    row.copy_from_slice(&table[id as usize * dim..(id as usize + 1) * dim]);
                });
            return Ok(());
        }

        // Device path: route each row through the direction-aware copy.
        let weight_buffer = weight.buffer().ok_or_else(|| {
            InferenceError::Internal("embedding weight has no backing buffer".to_string())
        })?;
        let output_buffer = output.buffer().ok_or_else(|| {
            InferenceError::Internal("embedding output has no backing buffer".to_string())
        })?;
        let row_bytes = dim * size_of::<f32>();
        for (row_idx, &id) in ids.iter().enumerate() {
            output_buffer.copy_from_region(
                row_idx * row_bytes,
                weight_buffer,
                id as usize * row_bytes,
                row_bytes,
            )?;
        }
        Ok(())
    }
}
