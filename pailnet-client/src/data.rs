//! The private data shard of a client.
//!
//! In a simulated federation one dataset lives in memory and every client
//! owns an ordered set of indices into it, its private shard. Mini-batches
//! are drawn from the shard in a freshly shuffled order every epoch.

use std::sync::Arc;

use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
/// Errors related to the construction of a data shard.
pub enum DataError {
    #[error("shard index {index} is out of range for a dataset of {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("the shard holds no samples")]
    EmptyShard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single labeled training sample.
pub struct Sample {
    /// The flattened input features.
    pub features: Vec<f64>,
    /// The class label.
    pub label: usize,
}

#[derive(Debug, Clone)]
/// A client's view onto a shared dataset, defined by an index set.
pub struct DatasetSplit {
    dataset: Arc<Vec<Sample>>,
    indices: Vec<usize>,
}

impl DatasetSplit {
    /// Creates a shard from a shared dataset and an ordered index set.
    ///
    /// # Errors
    /// Fails if the index set is empty or references a sample beyond the
    /// dataset.
    pub fn new(dataset: Arc<Vec<Sample>>, indices: Vec<usize>) -> Result<Self, DataError> {
        if indices.is_empty() {
            return Err(DataError::EmptyShard);
        }
        if let Some(index) = indices.iter().find(|index| **index >= dataset.len()) {
            return Err(DataError::IndexOutOfRange {
                index: *index,
                len: dataset.len(),
            });
        }
        Ok(Self { dataset, indices })
    }

    /// Gets the number of samples of this shard.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Checks if this shard holds no samples.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Draws the shard as shuffled mini-batches of at most `batch_size`
    /// samples.
    ///
    /// Every call reshuffles, so consecutive epochs see the samples in
    /// different orders. The last batch may be smaller than `batch_size`.
    pub fn batches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<&Sample>> {
        let mut order = self.indices.clone();
        order.shuffle(rng);
        order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.iter().map(|index| &self.dataset[*index]).collect())
            .collect()
    }
}
