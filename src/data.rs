//! Token-sequence dataset and batching.
//!
//! The controller only sees the [`BatchSource`] trait: anything that yields
//! (batch, seq_len) tensors of token ids and reports its batch count for
//! progress display. [`SequenceDataset`] + [`SequenceBatcher`] are the
//! provided implementation: fixed-length padded id rows loaded from JSONL,
//! shuffled with a seeded RNG, split into train/validation sets.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::CaeError;

/// Special token ids
pub const PAD_TOKEN: u32 = 0;
pub const UNK_TOKEN: u32 = 1;
pub const SOS_TOKEN: u32 = 2;
pub const EOS_TOKEN: u32 = 3;

/// Batches of token-id sequences for the controller.
pub trait BatchSource {
    /// Total number of batches one pass yields.
    fn batch_count(&self) -> usize;
    /// Next batch as a (batch, seq_len) U32 tensor, or `None` when the pass
    /// is exhausted.
    fn next_batch(&mut self) -> Result<Option<Tensor>, CaeError>;
    /// Rewind to the start of the pass.
    fn reset(&mut self);
}

/// One training sample on disk (JSONL, one object per line).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSequenceSample {
    pub tokens: Vec<u32>,
}

/// In-memory corpus of fixed-length token-id rows.
pub struct SequenceDataset {
    sequences: Vec<Vec<u32>>,
    seq_len: usize,
}

impl SequenceDataset {
    /// Build from raw rows, padding with [`PAD_TOKEN`] and truncating to
    /// `seq_len`.
    pub fn new(sequences: Vec<Vec<u32>>, seq_len: usize) -> Self {
        let sequences = sequences
            .into_iter()
            .map(|mut row| {
                row.resize(seq_len, PAD_TOKEN);
                row
            })
            .collect();
        Self { sequences, seq_len }
    }

    /// Load from a JSONL file; malformed lines are skipped.
    pub fn from_jsonl<P: AsRef<Path>>(path: P, seq_len: usize) -> Result<Self, CaeError> {
        let file = File::open(path.as_ref())
            .map_err(|e| CaeError::DataLoadFailed(format!("{}: {e}", path.as_ref().display())))?;
        let reader = BufReader::new(file);

        let sequences: Vec<Vec<u32>> = reader
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str::<RawSequenceSample>(&line).ok())
            .map(|raw| raw.tokens)
            .collect();

        Ok(Self::new(sequences, seq_len))
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Shuffle rows in place with a seeded RNG.
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.sequences.shuffle(&mut rng);
    }

    /// Split into train and validation sets.
    pub fn split(self, train_ratio: f32) -> (Self, Self) {
        let split_idx = (self.sequences.len() as f32 * train_ratio) as usize;
        let mut train = self.sequences;
        let val = train.split_off(split_idx.min(train.len()));
        (
            Self {
                sequences: train,
                seq_len: self.seq_len,
            },
            Self {
                sequences: val,
                seq_len: self.seq_len,
            },
        )
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.sequences
    }
}

/// Cursor over a dataset yielding (batch, seq_len) tensors on a device.
pub struct SequenceBatcher<'a> {
    dataset: &'a SequenceDataset,
    batch_size: usize,
    device: Device,
    cursor: usize,
}

impl<'a> SequenceBatcher<'a> {
    /// `batch_size` must be nonzero.
    pub fn new(dataset: &'a SequenceDataset, batch_size: usize, device: Device) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            dataset,
            batch_size,
            device,
            cursor: 0,
        }
    }
}

impl BatchSource for SequenceBatcher<'_> {
    fn batch_count(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>, CaeError> {
        if self.cursor >= self.dataset.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.dataset.len());
        let rows = &self.dataset.rows()[self.cursor..end];
        self.cursor = end;

        let seq_len = self.dataset.seq_len();
        let mut flat = Vec::with_capacity(rows.len() * seq_len);
        for row in rows {
            flat.extend_from_slice(row);
        }
        let batch = Tensor::from_vec(flat, (rows.len(), seq_len), &self.device)?;
        Ok(Some(batch))
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dataset(rows: usize, seq_len: usize) -> SequenceDataset {
        let sequences = (0..rows)
            .map(|r| (0..seq_len as u32).map(|t| t + r as u32).collect())
            .collect();
        SequenceDataset::new(sequences, seq_len)
    }

    #[test]
    fn test_rows_padded_and_truncated() {
        let ds = SequenceDataset::new(vec![vec![5, 6], vec![1, 2, 3, 4, 5, 6]], 4);
        assert_eq!(ds.rows()[0], vec![5, 6, PAD_TOKEN, PAD_TOKEN]);
        assert_eq!(ds.rows()[1], vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_shuffle_is_seed_deterministic() {
        let mut a = dataset(32, 6);
        let mut b = dataset(32, 6);
        a.shuffle(7);
        b.shuffle(7);
        assert_eq!(a.rows(), b.rows());
        let mut c = dataset(32, 6);
        c.shuffle(8);
        assert_ne!(a.rows(), c.rows());
    }

    #[test]
    fn test_split_preserves_all_rows() {
        let (train, val) = dataset(10, 4).split(0.8);
        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);
    }

    #[test]
    fn test_batcher_shapes_and_count() {
        let ds = dataset(10, 4);
        let mut batcher = SequenceBatcher::new(&ds, 4, Device::Cpu);
        assert_eq!(batcher.batch_count(), 3);

        let sizes: Vec<usize> = std::iter::from_fn(|| batcher.next_batch().unwrap())
            .map(|b| b.dims()[0])
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        batcher.reset();
        let first = batcher.next_batch().unwrap().unwrap();
        assert_eq!(first.dims(), &[4, 4]);
    }

    #[test]
    #[should_panic(expected = "batch size must be positive")]
    fn test_zero_batch_size_rejected() {
        let ds = dataset(4, 3);
        let _ = SequenceBatcher::new(&ds, 0, Device::Cpu);
    }

    #[test]
    fn test_from_jsonl_skips_malformed_lines() {
        let path = std::env::temp_dir().join("textcae_dataset_test.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"tokens": [2, 5, 6, 3]}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"tokens": [2, 9, 3]}}"#).unwrap();
        drop(file);

        let ds = SequenceDataset::from_jsonl(&path, 5).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows()[0], vec![2, 5, 6, 3, PAD_TOKEN]);
        std::fs::remove_file(path).ok();
    }
}
