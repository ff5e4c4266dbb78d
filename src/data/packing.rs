//! Constant-length packing of tokenized texts

use crate::{Error, Result};

/// A fixed-length block of token ids cut from the packed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedExample {
    pub input_ids: Vec<u32>,
}

/// Concatenate tokenized samples, each followed by `eos_id`, and cut the
/// stream into blocks of exactly `seq_len` tokens
///
/// The trailing partial block is dropped. Fails when the stream does not
/// fill a single block.
pub fn pack_sequences(sequences: &[Vec<u32>], eos_id: u32, seq_len: usize) -> Result<Vec<PackedExample>> {
    if seq_len == 0 {
        return Err(Error::InvalidParameter(
            "max_seq_length must be positive".to_string(),
        ));
    }

    let total: usize = sequences.iter().map(|s| s.len() + 1).sum();
    let mut stream = Vec::with_capacity(total);
    for sequence in sequences {
        stream.extend_from_slice(sequence);
        stream.push(eos_id);
    }

    if stream.len() < seq_len {
        return Err(Error::Dataset(format!(
            "Packed dataset has {} tokens, fewer than one block of {seq_len}",
            stream.len()
        )));
    }

    let examples: Vec<PackedExample> = stream
        .chunks_exact(seq_len)
        .map(|chunk| PackedExample {
            input_ids: chunk.to_vec(),
        })
        .collect();

    tracing::debug!(
        tokens = stream.len(),
        blocks = examples.len(),
        dropped = stream.len() % seq_len,
        "packed dataset"
    );
    Ok(examples)
}
