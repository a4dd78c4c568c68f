//! Protected model updates exchanged between clients and the aggregator.
//!
//! A client's local training round produces a [`ModelUpdate`]: either a
//! plaintext [`ModelState`] (plain and DP-clipped modes) or an
//! [`EncryptedModelUpdate`] (Paillier mode), in which every parameter
//! tensor has been flattened in row-major order and encrypted scalar by
//! scalar. The flat sequences deliberately carry no shape information:
//! only the owning client can reshape them, against the shapes of its own
//! current model state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto::{Ciphertext, CryptoError, Decryptor, Encryptor},
    model::{ModelError, ModelState, Tensor},
};

#[derive(Debug, Error)]
/// Errors related to the protection and recovery of model updates.
pub enum UpdateError {
    #[error("the update holds no tensor for model parameter {0}")]
    MissingParameter(String),

    #[error("the update holds the unknown parameter {0}")]
    UnknownParameter(String),

    #[error("parameter {name} decrypted to {actual} weights but the model holds {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A protected local update, keyed by parameter name.
pub enum ModelUpdate {
    /// A plaintext update: a full model state or a weight delta.
    Plain(ModelState),
    /// A homomorphically encrypted weight delta.
    Encrypted(EncryptedModelUpdate),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// An encrypted weight delta: one flat ciphertext sequence per parameter.
pub struct EncryptedModelUpdate(BTreeMap<String, Vec<Ciphertext>>);

impl EncryptedModelUpdate {
    /// Encrypts a model state scalar by scalar under the given encryptor.
    ///
    /// Every parameter tensor is flattened in row-major order and each
    /// weight is encrypted independently. This costs one asymmetric
    /// encryption per weight and dominates the wall-clock time of a
    /// Paillier-mode training round.
    ///
    /// # Errors
    /// Fails if any weight is rejected by the encryptor.
    pub fn encrypt(state: &ModelState, encryptor: &dyn Encryptor) -> Result<Self, UpdateError> {
        let mut parameters = BTreeMap::new();
        for (name, tensor) in state.iter() {
            let ciphertexts = tensor
                .data()
                .iter()
                .map(|weight| encryptor.encrypt(*weight))
                .collect::<Result<Vec<_>, _>>()?;
            parameters.insert(name.clone(), ciphertexts);
        }
        Ok(Self(parameters))
    }

    /// Decrypts this update into a model state.
    ///
    /// The flat ciphertext sequences are decrypted in their original
    /// row-major order and reshaped against the shapes of `reference`,
    /// the caller's *current* model state, since the aggregator never had
    /// shape information. Element counts that disagree with the reference
    /// shapes fail loudly instead of truncating or padding.
    ///
    /// # Errors
    /// Fails if the parameter sets of update and reference disagree, if a
    /// sequence length disagrees with the reference shape, or if any
    /// ciphertext is rejected by the decryptor.
    pub fn decrypt(
        &self,
        reference: &ModelState,
        decryptor: &dyn Decryptor,
    ) -> Result<ModelState, UpdateError> {
        for name in self.0.keys() {
            if reference.get(name).is_none() {
                return Err(UpdateError::UnknownParameter(name.clone()));
            }
        }
        let mut state = ModelState::new();
        for (name, tensor) in reference.iter() {
            let ciphertexts = self
                .0
                .get(name)
                .ok_or_else(|| UpdateError::MissingParameter(name.clone()))?;
            if ciphertexts.len() != tensor.len() {
                return Err(UpdateError::LengthMismatch {
                    name: name.clone(),
                    expected: tensor.len(),
                    actual: ciphertexts.len(),
                });
            }
            let weights = ciphertexts
                .iter()
                .map(|ciphertext| decryptor.decrypt(ciphertext))
                .collect::<Result<Vec<_>, _>>()?;
            state.insert(name.clone(), Tensor::from_flat(tensor.shape(), weights)?);
        }
        Ok(state)
    }

    /// Gets the ciphertext sequence for a parameter name.
    pub fn get(&self, name: &str) -> Option<&[Ciphertext]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Creates an iterator over the parameters in lexicographic name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Ciphertext>)> {
        self.0.iter()
    }

    /// Gets the number of parameters of this update.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks if this update holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gets the total number of ciphertexts across all parameters.
    pub fn nb_ciphertexts(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

impl std::iter::FromIterator<(String, Vec<Ciphertext>)> for EncryptedModelUpdate {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Ciphertext>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
