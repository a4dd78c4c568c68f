//! Aggregation of per-client updates.
//!
//! This module pins down the contract an aggregator must satisfy towards
//! the clients. Plaintext updates (plain and DP-clipped modes) are
//! combined by federated averaging. Encrypted updates are combined by
//! ciphertext-wise homomorphic addition: the aggregator only needs the
//! [`Encryptor`] capability and never sees a plaintext weight. Paillier
//! offers no ciphertext division, so the encrypted aggregate is a *sum*;
//! any averaging factor has to be applied by the clients or folded into
//! the learning rate.

use thiserror::Error;

use crate::{
    crypto::{CryptoError, Encryptor},
    model::{ModelError, ModelState},
    update::EncryptedModelUpdate,
};

#[derive(Debug, Error)]
/// Errors related to the aggregation of model updates.
pub enum AggregationError {
    #[error("there is no update to aggregate")]
    NoUpdates,

    #[error("the update to aggregate is incompatible with the current aggregate: {0}")]
    Model(#[from] ModelError),

    #[error("the updates disagree on the parameter set: {0}")]
    ParameterMismatch(String),

    #[error("the ciphertext sequences for parameter {0} have different lengths")]
    LengthMismatch(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Default)]
/// An aggregator for plaintext model updates.
pub struct PlainAggregation {
    nb_updates: usize,
    sum: Option<ModelState>,
}

impl PlainAggregation {
    /// Creates a new, empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of updates aggregated so far.
    pub fn nb_updates(&self) -> usize {
        self.nb_updates
    }

    /// Validates if the given `state` may be safely aggregated.
    ///
    /// # Errors
    /// Fails if the parameter sets or tensor shapes disagree with the
    /// updates aggregated so far. An empty aggregator accepts any state.
    pub fn validate_aggregation(&self, state: &ModelState) -> Result<(), AggregationError> {
        if let Some(sum) = &self.sum {
            sum.same_parameters(state)?;
            // a throwaway sum surfaces shape disagreements early
            sum.added(state)?;
        }
        Ok(())
    }

    /// Aggregates the given `state` into the running sum.
    ///
    /// # Errors
    /// Same failure cases as [`validate_aggregation()`].
    ///
    /// [`validate_aggregation()`]: PlainAggregation::validate_aggregation
    pub fn aggregate(&mut self, state: ModelState) -> Result<(), AggregationError> {
        self.sum = match self.sum.take() {
            None => Some(state),
            Some(sum) => Some(sum.added(&state)?),
        };
        self.nb_updates += 1;
        Ok(())
    }

    /// Consumes the aggregator and returns the average of all updates.
    ///
    /// # Errors
    /// Fails if no update was aggregated.
    pub fn average(self) -> Result<ModelState, AggregationError> {
        let sum = self.sum.ok_or(AggregationError::NoUpdates)?;
        Ok(sum.scaled(1_f64 / self.nb_updates as f64))
    }
}

#[derive(Debug, Clone, Default)]
/// An aggregator for encrypted model updates.
///
/// Sums the per-parameter ciphertext sequences elementwise under
/// homomorphic addition. The result decrypts to the sum of the clients'
/// plaintext deltas.
pub struct EncryptedAggregation {
    nb_updates: usize,
    sum: Option<EncryptedModelUpdate>,
}

impl EncryptedAggregation {
    /// Creates a new, empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of updates aggregated so far.
    pub fn nb_updates(&self) -> usize {
        self.nb_updates
    }

    /// Validates if the given `update` may be safely aggregated.
    ///
    /// # Errors
    /// Fails if the parameter sets or sequence lengths disagree with the
    /// updates aggregated so far. An empty aggregator accepts any update.
    pub fn validate_aggregation(
        &self,
        update: &EncryptedModelUpdate,
    ) -> Result<(), AggregationError> {
        let sum = match &self.sum {
            None => return Ok(()),
            Some(sum) => sum,
        };
        for (name, ciphertexts) in sum.iter() {
            match update.get(name) {
                None => return Err(AggregationError::ParameterMismatch(name.clone())),
                Some(other) if other.len() != ciphertexts.len() => {
                    return Err(AggregationError::LengthMismatch(name.clone()))
                }
                Some(_) => {}
            }
        }
        for (name, _) in update.iter() {
            if sum.get(name).is_none() {
                return Err(AggregationError::ParameterMismatch(name.clone()));
            }
        }
        Ok(())
    }

    /// Aggregates the given `update` into the running homomorphic sum.
    ///
    /// # Errors
    /// Same failure cases as [`validate_aggregation()`], plus rejection of
    /// ciphertexts that do not belong to the group of the encryptor's key.
    ///
    /// [`validate_aggregation()`]: EncryptedAggregation::validate_aggregation
    pub fn aggregate(
        &mut self,
        update: EncryptedModelUpdate,
        encryptor: &dyn Encryptor,
    ) -> Result<(), AggregationError> {
        self.validate_aggregation(&update)?;
        self.sum = match self.sum.take() {
            None => Some(update),
            Some(sum) => {
                let combined = sum
                    .iter()
                    .map(|(name, ciphertexts)| {
                        // UNWRAP_SAFE: the parameter sets were just validated to coincide
                        let other = update.get(name).unwrap();
                        let summed = ciphertexts
                            .iter()
                            .zip(other.iter())
                            .map(|(lhs, rhs)| encryptor.add(lhs, rhs))
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok((name.clone(), summed))
                    })
                    .collect::<Result<Vec<_>, AggregationError>>()?;
                Some(combined.into_iter().collect())
            }
        };
        self.nb_updates += 1;
        Ok(())
    }

    /// Consumes the aggregator and returns the homomorphic sum.
    ///
    /// # Errors
    /// Fails if no update was aggregated.
    pub fn sum(self) -> Result<EncryptedModelUpdate, AggregationError> {
        self.sum.ok_or(AggregationError::NoUpdates)
    }
}
