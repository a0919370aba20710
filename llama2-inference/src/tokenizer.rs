//! Subword tokenizer façade.
//!
//! The model consumes the tokenizer through a narrow contract: load a
//! vocabulary file, report the piece count, encode text into token ids,
//! look a piece up by id. The implementation behind it is a byte-pair
//! vocabulary stored in a self-describing little-endian binary file:
//!
//! - u32 piece count, u32 maximum piece length in bytes
//! - per piece: f32 merge score, u32 byte length, raw bytes
//!
//! Encoding looks up special `<...>` pieces and single characters, then
//! repeatedly merges the adjacent pair with the highest merge score.

use crate::error::{InferenceError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub struct Tokenizer {
    /// Each piece is a byte sequence, not necessarily valid UTF-8.
    vocab: Vec<Vec<u8>>,
    /// Merge scores, parallel to `vocab` (higher wins).
    merge_scores: Vec<f32>,
    /// Maximum piece length in bytes.
    max_piece_len: u32,
}

impl Tokenizer {
    /// Loads a vocabulary file.
    ///
    /// A missing or unreadable path fails with `PathNotValid`; truncated or
    /// malformed content fails with `ModelParse`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|_| {
            InferenceError::PathNotValid(format!(
                "failed to open the tokenizer file {}",
                path.display()
            ))
        })?;
        let mut reader = BufReader::new(file);

        macro_rules! read_u32 {
            ($field:literal) => {
                reader.read_u32::<LittleEndian>().map_err(|_| {
                    InferenceError::ModelParse(format!(
                        "failed to read {} from the tokenizer file",
                        $field
                    ))
                })?
            };
        }

        let piece_count = read_u32!("piece count") as usize;
        let max_piece_len = read_u32!("max piece length");

        let mut vocab = Vec::with_capacity(piece_count);
        let mut merge_scores = Vec::with_capacity(piece_count);
        for idx in 0..piece_count {
            let score = reader.read_f32::<LittleEndian>().map_err(|_| {
                InferenceError::ModelParse(format!("failed to read the score of piece {idx}"))
            })?;
            let len = reader.read_u32::<LittleEndian>().map_err(|_| {
                InferenceError::ModelParse(format!("failed to read the length of piece {idx}"))
            })? as usize;
            if len > max_piece_len as usize {
                return Err(InferenceError::ModelParse(format!(
                    "piece {idx} is {len} bytes, longer than the declared maximum {max_piece_len}"
                )));
            }
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes).map_err(|_| {
                InferenceError::ModelParse(format!("failed to read the bytes of piece {idx}"))
            })?;
            merge_scores.push(score);
            vocab.push(bytes);
        }

        Ok(Self {
            vocab,
            merge_scores,
            max_piece_len,
        })
    }

    /// Number of pieces in the vocabulary.
    pub fn piece_count(&self) -> i32 {
        self.vocab.len() as i32
    }

    /// Piece bytes for a token id, rendered lossily as text.
    pub fn piece(&self, token_id: i32) -> Cow<'_, str> {
        usize::try_from(token_id)
            .ok()
            .and_then(|idx| self.vocab.get(idx))
            .map_or(Cow::Borrowed(""), |bytes| String::from_utf8_lossy(bytes))
    }

    fn str_lookup(&self, piece: &[u8]) -> Option<usize> {
        self.vocab.iter().position(|token| token.as_slice() == piece)
    }

    /// Encodes text into an ordered sequence of non-negative token ids.
    ///
    /// Special `<...>` pieces are matched first, then single characters;
    /// characters absent from the vocabulary are skipped with a warning.
    /// Adjacent pairs are then merged greedily by merge score.
    pub fn encode(&self, text: &str) -> Vec<i32> {
        let mut tokens: Vec<usize> = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let mut found_special = false;

            if chars[i] == '<' {
                let search_limit = chars.len().min(i + self.max_piece_len as usize);
                let end_pos = (i + 1..search_limit).find(|&j| chars[j] == '>');
                if let Some(end) = end_pos {
                    let special: String = chars[i..=end].iter().collect();
                    if let Some(token_id) = self.str_lookup(special.as_bytes()) {
                        tokens.push(token_id);
                        i = end + 1;
                        found_special = true;
                    }
                }
            }

            if !found_special {
                let mut piece = [0u8; 4];
                let piece = chars[i].encode_utf8(&mut piece);
                match self.str_lookup(piece.as_bytes()) {
                    Some(token_id) => tokens.push(token_id),
                    None => warn!("unknown character {:?} in input, skipping", chars[i]),
                }
                i += 1;
            }
        }

        // Repeatedly merge the adjacent pair with the highest merge score
        // until no merges remain.
        loop {
            let mut best: Option<(f32, usize, usize)> = None;

            for idx in 0..tokens.len().saturating_sub(1) {
                let mut merged = self.vocab[tokens[idx]].clone();
                merged.extend_from_slice(&self.vocab[tokens[idx + 1]]);
                if let Some(id) = self.str_lookup(&merged) {
                    let score = self.merge_scores[id];
                    if best.is_none_or(|(best_score, _, _)| score > best_score) {
                        best = Some((score, id, idx));
                    }
                }
            }

            let Some((_, id, idx)) = best else { break };
            tokens[idx] = id;
            tokens.remove(idx + 1);
        }

        tokens.iter().map(|&id| id as i32).collect()
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("piece_count", &self.vocab.len())
            .field("max_piece_len", &self.max_piece_len)
            .finish_non_exhaustive()
    }
}
