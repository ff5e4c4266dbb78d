//! Causal language modeling collator

use super::PackedExample;

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// A padded micro-batch, row-major `batch_size x seq_len`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    /// Token ids of one row
    pub fn row(&self, index: usize) -> &[u32] {
        &self.input_ids[index * self.seq_len..(index + 1) * self.seq_len]
    }

    /// Number of label positions that contribute to the loss
    pub fn num_targets(&self) -> usize {
        self.labels.iter().filter(|&&l| l != IGNORE_INDEX).count()
    }
}

/// Collator for next-token prediction without masking of inputs
///
/// Rows are right-padded to the longest example with `pad_id`. Labels copy
/// the inputs, with every pad-id position ignored. When the pad token is the
/// EOS token, EOS positions are ignored too.
#[derive(Debug, Clone, Copy)]
pub struct CausalLmCollator {
    pad_id: u32,
}

impl CausalLmCollator {
    pub fn new(pad_id: u32) -> Self {
        Self { pad_id }
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Collate examples into one batch
    pub fn collate(&self, examples: &[&PackedExample]) -> Batch {
        let seq_len = examples
            .iter()
            .map(|e| e.input_ids.len())
            .max()
            .unwrap_or(0);

        let mut input_ids = Vec::with_capacity(examples.len() * seq_len);
        for example in examples {
            input_ids.extend_from_slice(&example.input_ids);
            input_ids.resize(input_ids.len() + seq_len - example.input_ids.len(), self.pad_id);
        }

        let labels = input_ids
            .iter()
            .map(|&id| {
                if id == self.pad_id {
                    IGNORE_INDEX
                } else {
                    i64::from(id)
                }
            })
            .collect();

        Batch {
            input_ids,
            labels,
            batch_size: examples.len(),
            seq_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(ids: &[u32]) -> PackedExample {
        PackedExample {
            input_ids: ids.to_vec(),
        }
    }

    #[test]
    fn test_labels_copy_inputs() {
        let collator = CausalLmCollator::new(2);
        let a = example(&[5, 6, 7]);
        let batch = collator.collate(&[&a]);

        assert_eq!(batch.labels, vec![5, 6, 7]);
        assert_eq!(batch.num_targets(), 3);
    }

    #[test]
    fn test_pads_right_and_masks_pad() {
        let collator = CausalLmCollator::new(2);
        let a = example(&[5, 6, 7]);
        let b = example(&[8]);
        let batch = collator.collate(&[&a, &b]);

        assert_eq!(batch.seq_len, 3);
        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.row(1), &[8, 2, 2]);
        assert_eq!(batch.labels, vec![5, 6, 7, 8, IGNORE_INDEX, IGNORE_INDEX]);
    }

    #[test]
    fn test_eos_equal_to_pad_is_ignored() {
        let collator = CausalLmCollator::new(2);
        let a = example(&[5, 2, 6]);
        let batch = collator.collate(&[&a]);

        assert_eq!(batch.labels, vec![5, IGNORE_INDEX, 6]);
        assert_eq!(batch.num_targets(), 2);
    }

    #[test]
    fn test_empty_batch() {
        let batch = CausalLmCollator::new(0).collate(&[]);
        assert_eq!(batch.batch_size, 0);
        assert!(batch.input_ids.is_empty());
    }
}
