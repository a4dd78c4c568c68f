//! The federated client.
//!
//! A [`Client`] owns a model replica and a private data shard. One round
//! consists of [`train()`], which runs local gradient descent and applies
//! the mode-dependent protection to the resulting weight delta, and
//! [`update()`], which applies the aggregate combined from all clients
//! back into the persisted model. `update()`
//! is the only operation that mutates the persisted model state, so a
//! client must finish one round's `update()` before starting the next
//! round's `train()`.
//!
//! [`train()`]: Client::train
//! [`update()`]: Client::update

use std::{sync::Arc, time::Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, info};

use pailnet_core::{
    crypto::{CryptoError, Decryptor, Encryptor},
    model::{ModelError, ModelState},
    update::{EncryptedModelUpdate, ModelUpdate, UpdateError},
};

use crate::{
    data::{DataError, DatasetSplit},
    model::{Trainable, TrainingError},
    settings::{ClientSettings, Mode},
};

#[derive(Debug, Error)]
/// Errors related to the lifecycle of a federated client.
pub enum ClientError {
    #[error("Paillier mode requires an encryptor at construction")]
    MissingEncryptor,

    #[error("applying an encrypted aggregate requires a decryptor this client does not hold")]
    MissingDecryptor,

    #[error("a {mode} mode client cannot apply this kind of aggregated update")]
    UpdateMismatch { mode: Mode },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A federated-learning client.
///
/// Generic over the [`Trainable`] model replica it owns; the key material
/// is injected at construction and split by capability: every Paillier
/// client holds an [`Encryptor`], while a [`Decryptor`] is only handed to
/// clients trusted to recover aggregated plaintext deltas.
pub struct Client<T> {
    settings: ClientSettings,
    shard: DatasetSplit,
    model: T,
    encryptor: Option<Arc<dyn Encryptor + Send + Sync>>,
    decryptor: Option<Arc<dyn Decryptor + Send + Sync>>,
    prng: ChaCha20Rng,
}

impl<T: Trainable> Client<T> {
    /// Creates a plain or DP mode client from an initial global state.
    ///
    /// # Errors
    /// Fails if the settings ask for Paillier mode (which needs key
    /// material, see [`with_keys`]) or if the initial state does not fit
    /// the model.
    ///
    /// [`with_keys`]: Client::with_keys
    pub fn new(
        settings: ClientSettings,
        shard: DatasetSplit,
        model: T,
        initial_state: &ModelState,
    ) -> Result<Self, ClientError> {
        if settings.mode == Mode::Paillier {
            return Err(ClientError::MissingEncryptor);
        }
        Self::init(settings, shard, model, initial_state, None, None)
    }

    /// Creates a Paillier mode client from an initial global state and the
    /// shared key material.
    ///
    /// The decryptor is optional: a client without one can train and
    /// encrypt but cannot apply encrypted aggregates.
    ///
    /// # Errors
    /// Fails if the initial state does not fit the model.
    pub fn with_keys(
        settings: ClientSettings,
        shard: DatasetSplit,
        model: T,
        initial_state: &ModelState,
        encryptor: Arc<dyn Encryptor + Send + Sync>,
        decryptor: Option<Arc<dyn Decryptor + Send + Sync>>,
    ) -> Result<Self, ClientError> {
        Self::init(
            settings,
            shard,
            model,
            initial_state,
            Some(encryptor),
            decryptor,
        )
    }

    fn init(
        settings: ClientSettings,
        shard: DatasetSplit,
        mut model: T,
        initial_state: &ModelState,
        encryptor: Option<Arc<dyn Encryptor + Send + Sync>>,
        decryptor: Option<Arc<dyn Decryptor + Send + Sync>>,
    ) -> Result<Self, ClientError> {
        model.load_state(initial_state)?;
        Ok(Self {
            settings,
            shard,
            model,
            encryptor,
            decryptor,
            prng: ChaCha20Rng::from_entropy(),
        })
    }

    /// Gets the protection mode of this client.
    pub fn mode(&self) -> Mode {
        self.settings.mode
    }

    /// Gets a deep copy of the persisted model state.
    pub fn model_state(&self) -> ModelState {
        self.model.state()
    }

    /// Runs one local training round and returns the protected weight
    /// delta together with the average loss.
    ///
    /// The persisted model state is snapshotted, trained with SGD with
    /// momentum for the configured number of epochs, and restored before
    /// returning: only [`update()`] mutates the persisted state. The loss
    /// is averaged over every batch of every local epoch. In Paillier mode
    /// the per-weight encryption loop dominates the wall-clock time of the
    /// round; its duration is reported as a `tracing` event.
    ///
    /// [`update()`]: Client::update
    pub fn train(&mut self) -> Result<(ModelUpdate, f64), ClientError> {
        let old_state = self.model.state();
        let outcome = self.run_epochs(&old_state);
        // the snapshot is restored even when a batch failed midway, so the
        // persisted model never holds partial intermediate weights
        self.model.load_state(&old_state)?;
        let (new_state, losses) = outcome?;
        let delta = new_state.delta(&old_state)?;
        let average_loss = losses.iter().sum::<f64>() / losses.len().max(1) as f64;

        let update = match self.settings.mode {
            Mode::Plain => ModelUpdate::Plain(delta),
            Mode::Dp => ModelUpdate::Plain(delta.clip_by_l2_norm(self.settings.clip_bound)),
            Mode::Paillier => {
                // UNWRAP_SAFE: construction guarantees an encryptor in Paillier mode
                let encryptor = self.encryptor.as_ref().unwrap().clone();
                let start = Instant::now();
                let encrypted = EncryptedModelUpdate::encrypt(&delta, encryptor.as_ref())?;
                info!(
                    nb_weights = encrypted.nb_ciphertexts(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "encrypted the local update"
                );
                ModelUpdate::Encrypted(encrypted)
            }
        };
        Ok((update, average_loss))
    }

    /// Runs the local epochs over a working copy of the snapshot and
    /// returns the trained weights and the per-batch losses.
    ///
    /// The persisted model is used as a scratchpad for the gradient
    /// computations; the caller restores the snapshot afterwards.
    fn run_epochs(
        &mut self,
        old_state: &ModelState,
    ) -> Result<(ModelState, Vec<f64>), ClientError> {
        let mut weights = old_state.clone();
        let mut velocity = old_state.zeros_like();
        let mut losses = Vec::new();

        for epoch in 0..self.settings.local_epochs {
            let mut epoch_losses = 0_f64;
            let mut nb_batches = 0_usize;
            for batch in self.shard.batches(self.settings.batch_size, &mut self.prng) {
                self.model.load_state(&weights)?;
                let (gradients, loss) = self.model.gradients(&batch)?;
                velocity = velocity.scaled(self.settings.momentum).added(&gradients)?;
                weights = weights.added(&velocity.scaled(-self.settings.learning_rate))?;
                epoch_losses += loss;
                nb_batches += 1;
                losses.push(loss);
            }
            debug!(
                epoch,
                nb_batches,
                epoch_loss = epoch_losses / nb_batches.max(1) as f64,
                "local epoch finished"
            );
        }
        Ok((weights, losses))
    }

    /// Applies an aggregated update into the persisted model state.
    ///
    /// In plain and DP modes the aggregate is a full model state that
    /// replaces the persisted state wholesale. In Paillier mode it is an
    /// encrypted incremental delta: every ciphertext is decrypted, the
    /// flat sequences are reshaped against this client's current shapes,
    /// and the delta is *added* to the current state. The complete next
    /// state is built before a single swap, so a decryption failure midway
    /// leaves the persisted state untouched.
    ///
    /// # Errors
    /// Fails if the kind of aggregate does not match the client's mode, if
    /// this client holds no decryptor, or if decryption or reshaping fail.
    pub fn update(&mut self, aggregate: ModelUpdate) -> Result<(), ClientError> {
        match (self.settings.mode, aggregate) {
            (Mode::Plain, ModelUpdate::Plain(state)) | (Mode::Dp, ModelUpdate::Plain(state)) => {
                self.model.load_state(&state)?;
                Ok(())
            }
            (Mode::Paillier, ModelUpdate::Encrypted(update)) => {
                let decryptor = self
                    .decryptor
                    .as_ref()
                    .ok_or(ClientError::MissingDecryptor)?
                    .clone();
                let current = self.model.state();
                let start = Instant::now();
                let delta = update.decrypt(&current, decryptor.as_ref())?;
                info!(
                    nb_weights = update.nb_ciphertexts(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "decrypted the aggregated update"
                );
                let next = current.added(&delta)?;
                self.model.load_state(&next)?;
                Ok(())
            }
            (mode, _) => Err(ClientError::UpdateMismatch { mode }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pailnet_core::{crypto::PaillierKeyPair, model::Tensor};

    use super::*;
    use crate::{data::Sample, model::SoftmaxRegression};

    fn settings(mode: Mode) -> ClientSettings {
        ClientSettings {
            mode,
            local_epochs: 1,
            batch_size: 2,
            learning_rate: 0.1,
            momentum: 0.9,
            clip_bound: 1e-3,
        }
    }

    fn shard() -> DatasetSplit {
        let dataset = Arc::new(vec![
            Sample {
                features: vec![1_f64, 0_f64],
                label: 0,
            },
            Sample {
                features: vec![0.9, 0.1],
                label: 0,
            },
            Sample {
                features: vec![0_f64, 1_f64],
                label: 1,
            },
            Sample {
                features: vec![0.1, 0.9],
                label: 1,
            },
        ]);
        DatasetSplit::new(dataset, vec![0, 1, 2, 3]).unwrap()
    }

    fn initial_state() -> ModelState {
        SoftmaxRegression::new(2, 2).state()
    }

    #[test]
    fn test_plain_train_produces_full_delta_and_finite_loss() {
        let mut client = Client::new(
            settings(Mode::Plain),
            shard(),
            SoftmaxRegression::new(2, 2),
            &initial_state(),
        )
        .unwrap();
        let (update, average_loss) = client.train().unwrap();

        let delta = match update {
            ModelUpdate::Plain(delta) => delta,
            ModelUpdate::Encrypted(_) => panic!("expected a plaintext delta"),
        };
        let names: Vec<&String> = delta.keys().collect();
        assert_eq!(names, vec!["bias", "weight"]);
        assert!(average_loss.is_finite() && average_loss >= 0_f64);
        // training must not touch the persisted state
        assert_eq!(client.model_state(), initial_state());
    }

    #[test]
    fn test_plain_update_replaces_wholesale() {
        let mut client = Client::new(
            settings(Mode::Plain),
            shard(),
            SoftmaxRegression::new(2, 2),
            &initial_state(),
        )
        .unwrap();
        let mut replacement = ModelState::new();
        replacement.insert(
            "weight",
            Tensor::new(vec![2, 2], vec![1_f64, 2_f64, 3_f64, 4_f64]).unwrap(),
        );
        replacement.insert("bias", Tensor::new(vec![2], vec![-1_f64, 1_f64]).unwrap());
        client.update(ModelUpdate::Plain(replacement.clone())).unwrap();
        assert_eq!(client.model_state(), replacement);
    }

    #[test]
    fn test_failed_training_leaves_state_untouched() {
        // a shard with one mislabeled sample; with batch_size 1 the error
        // surfaces after some successful SGD steps in most shuffle orders
        let dataset = Arc::new(vec![
            Sample {
                features: vec![1_f64, 0_f64],
                label: 0,
            },
            Sample {
                features: vec![0_f64, 1_f64],
                label: 1,
            },
            Sample {
                features: vec![0.5, 0.5],
                label: 2,
            },
        ]);
        let shard = DatasetSplit::new(dataset, vec![0, 1, 2]).unwrap();
        let mut client_settings = settings(Mode::Plain);
        client_settings.batch_size = 1;
        let mut client = Client::new(
            client_settings,
            shard,
            SoftmaxRegression::new(2, 2),
            &initial_state(),
        )
        .unwrap();

        for _ in 0..10 {
            assert!(matches!(
                client.train(),
                Err(ClientError::Training(TrainingError::LabelOutOfRange { .. }))
            ));
            assert_eq!(client.model_state(), initial_state());
        }
    }

    #[test]
    fn test_dp_delta_is_clipped_to_bound() {
        let bound = settings(Mode::Dp).clip_bound;
        let mut client = Client::new(
            settings(Mode::Dp),
            shard(),
            SoftmaxRegression::new(2, 2),
            &initial_state(),
        )
        .unwrap();
        let (update, _) = client.train().unwrap();
        let delta = match update {
            ModelUpdate::Plain(delta) => delta,
            ModelUpdate::Encrypted(_) => panic!("expected a clipped plaintext delta"),
        };
        for (_, tensor) in delta.iter() {
            assert!(tensor.l2_norm() <= bound + 1e-12);
        }
    }

    #[test]
    fn test_paillier_client_requires_keys() {
        assert!(matches!(
            Client::new(
                settings(Mode::Paillier),
                shard(),
                SoftmaxRegression::new(2, 2),
                &initial_state(),
            ),
            Err(ClientError::MissingEncryptor)
        ));
    }

    #[test]
    fn test_paillier_round_trip_is_additive() {
        let keys = PaillierKeyPair::generate_with_modulus_bits(256);
        let public = Arc::new(keys.public);
        let secret = Arc::new(keys.secret);
        let mut client = Client::with_keys(
            settings(Mode::Paillier),
            shard(),
            SoftmaxRegression::new(2, 2),
            &initial_state(),
            public.clone(),
            Some(secret),
        )
        .unwrap();

        let before = client.model_state();
        let mut delta = ModelState::new();
        delta.insert(
            "weight",
            Tensor::new(vec![2, 2], vec![0.25, -0.25, 0.5, -0.5]).unwrap(),
        );
        delta.insert("bias", Tensor::new(vec![2], vec![0.125, -0.125]).unwrap());
        let encrypted = EncryptedModelUpdate::encrypt(&delta, public.as_ref()).unwrap();

        client.update(ModelUpdate::Encrypted(encrypted)).unwrap();
        let after = client.model_state();
        let expected = before.added(&delta).unwrap();
        for (name, tensor) in expected.iter() {
            assert!(after
                .get(name)
                .unwrap()
                .data()
                .iter()
                .zip(tensor.data().iter())
                .all(|(actual, expected)| (actual - expected).abs() < 1e-6));
        }
    }

    #[test]
    fn test_paillier_update_without_decryptor_fails() {
        let keys = PaillierKeyPair::generate_with_modulus_bits(256);
        let public = Arc::new(keys.public);
        let mut client = Client::with_keys(
            settings(Mode::Paillier),
            shard(),
            SoftmaxRegression::new(2, 2),
            &initial_state(),
            public.clone(),
            None,
        )
        .unwrap();
        let encrypted =
            EncryptedModelUpdate::encrypt(&client.model_state(), public.as_ref()).unwrap();
        assert!(matches!(
            client.update(ModelUpdate::Encrypted(encrypted)),
            Err(ClientError::MissingDecryptor)
        ));
    }

    #[test]
    fn test_mismatched_aggregate_is_rejected() {
        let mut client = Client::new(
            settings(Mode::Plain),
            shard(),
            SoftmaxRegression::new(2, 2),
            &initial_state(),
        )
        .unwrap();
        let before = client.model_state();
        assert!(matches!(
            client.update(ModelUpdate::Encrypted(EncryptedModelUpdate::default())),
            Err(ClientError::UpdateMismatch { mode: Mode::Plain })
        ));
        // a rejected update leaves the persisted state untouched
        assert_eq!(client.model_state(), before);
    }

    #[test]
    fn test_failed_decryption_leaves_state_untouched() {
        let keys = PaillierKeyPair::generate_with_modulus_bits(256);
        let public = Arc::new(keys.public);
        let secret = Arc::new(keys.secret);
        let mut client = Client::with_keys(
            settings(Mode::Paillier),
            shard(),
            SoftmaxRegression::new(2, 2),
            &initial_state(),
            public.clone(),
            Some(secret),
        )
        .unwrap();
        let before = client.model_state();

        // an aggregate missing the bias parameter must not be half-applied
        let mut partial = ModelState::new();
        partial.insert("weight", Tensor::zeros(vec![2, 2]));
        let encrypted = EncryptedModelUpdate::encrypt(&partial, public.as_ref()).unwrap();
        assert!(client.update(ModelUpdate::Encrypted(encrypted)).is_err());
        assert_eq!(client.model_state(), before);
    }
}
