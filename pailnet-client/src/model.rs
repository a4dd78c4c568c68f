//! The trainable-model seam.
//!
//! The network architecture is an external collaborator: the client only
//! needs to read and replace parameters and to obtain per-batch gradients,
//! which is exactly the [`Trainable`] contract. [`SoftmaxRegression`] is a
//! minimal implementation of that contract, enough to drive the training
//! loop in tests and demos without dragging a real deep-learning stack into
//! the crate.

use pailnet_core::model::{ModelError, ModelState, Tensor};
use thiserror::Error;

use crate::data::Sample;

/// The parameter name of the weight matrix.
const WEIGHT: &str = "weight";
/// The parameter name of the bias vector.
const BIAS: &str = "bias";

#[derive(Debug, Error)]
/// Errors related to local training over a mini-batch.
pub enum TrainingError {
    #[error("sample holds {actual} features but the model expects {expected}")]
    FeatureCountMismatch { expected: usize, actual: usize },

    #[error("label {label} is out of range for {nb_classes} classes")]
    LabelOutOfRange { label: usize, nb_classes: usize },

    #[error("cannot compute gradients over an empty batch")]
    EmptyBatch,

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// An opaque trainable model replica.
///
/// The client snapshots parameters before a round, drives gradient descent
/// through [`gradients`], and swaps complete states back in through
/// [`load_state`]; the architecture behind the parameters stays external.
///
/// [`gradients`]: Trainable::gradients
/// [`load_state`]: Trainable::load_state
pub trait Trainable {
    /// Gets a deep copy of the current parameters.
    fn state(&self) -> ModelState;

    /// Replaces the parameters wholesale with the given state.
    ///
    /// # Errors
    /// Fails if the state disagrees with the model's parameter names or
    /// shapes; the model is left untouched in that case.
    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError>;

    /// Computes the parameter gradients and the mean loss for one
    /// mini-batch, without changing the parameters.
    fn gradients(&self, batch: &[&Sample]) -> Result<(ModelState, f64), TrainingError>;
}

#[derive(Debug, Clone)]
/// A multinomial logistic-regression classifier.
///
/// Parameters are a `[classes, features]` weight matrix and a `[classes]`
/// bias vector; the loss is the cross entropy of the softmax output.
pub struct SoftmaxRegression {
    weight: Tensor,
    bias: Tensor,
    nb_features: usize,
    nb_classes: usize,
}

impl SoftmaxRegression {
    /// Creates a zero-initialized classifier.
    pub fn new(nb_features: usize, nb_classes: usize) -> Self {
        Self {
            weight: Tensor::zeros(vec![nb_classes, nb_features]),
            bias: Tensor::zeros(vec![nb_classes]),
            nb_features,
            nb_classes,
        }
    }

    fn logits(&self, features: &[f64]) -> Vec<f64> {
        let weights = self.weight.data();
        let biases = self.bias.data();
        (0..self.nb_classes)
            .map(|class| {
                let row = &weights[class * self.nb_features..(class + 1) * self.nb_features];
                row.iter()
                    .zip(features.iter())
                    .map(|(weight, feature)| weight * feature)
                    .sum::<f64>()
                    + biases[class]
            })
            .collect()
    }

    fn softmax(logits: &[f64]) -> Vec<f64> {
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|logit| (logit - max).exp()).collect();
        let sum: f64 = exps.iter().sum();
        exps.iter().map(|exp| exp / sum).collect()
    }
}

impl Trainable for SoftmaxRegression {
    fn state(&self) -> ModelState {
        let mut state = ModelState::new();
        state.insert(WEIGHT, self.weight.clone());
        state.insert(BIAS, self.bias.clone());
        state
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        let weight = state
            .get(WEIGHT)
            .ok_or_else(|| ModelError::ParameterMismatch(WEIGHT.to_string()))?;
        let bias = state
            .get(BIAS)
            .ok_or_else(|| ModelError::ParameterMismatch(BIAS.to_string()))?;
        if weight.shape() != self.weight.shape() {
            return Err(ModelError::IncompatibleShapes(WEIGHT.to_string()));
        }
        if bias.shape() != self.bias.shape() {
            return Err(ModelError::IncompatibleShapes(BIAS.to_string()));
        }
        self.weight = weight.clone();
        self.bias = bias.clone();
        Ok(())
    }

    fn gradients(&self, batch: &[&Sample]) -> Result<(ModelState, f64), TrainingError> {
        if batch.is_empty() {
            return Err(TrainingError::EmptyBatch);
        }
        let mut weight_grad = vec![0_f64; self.nb_classes * self.nb_features];
        let mut bias_grad = vec![0_f64; self.nb_classes];
        let mut loss_sum = 0_f64;

        for sample in batch {
            if sample.features.len() != self.nb_features {
                return Err(TrainingError::FeatureCountMismatch {
                    expected: self.nb_features,
                    actual: sample.features.len(),
                });
            }
            if sample.label >= self.nb_classes {
                return Err(TrainingError::LabelOutOfRange {
                    label: sample.label,
                    nb_classes: self.nb_classes,
                });
            }
            let probabilities = Self::softmax(&self.logits(&sample.features));
            loss_sum -= probabilities[sample.label].max(f64::MIN_POSITIVE).ln();

            for class in 0..self.nb_classes {
                // d loss / d logit = softmax - one-hot
                let grad_logit =
                    probabilities[class] - if class == sample.label { 1_f64 } else { 0_f64 };
                bias_grad[class] += grad_logit;
                let row = &mut weight_grad
                    [class * self.nb_features..(class + 1) * self.nb_features];
                for (grad, feature) in row.iter_mut().zip(sample.features.iter()) {
                    *grad += grad_logit * feature;
                }
            }
        }

        let scale = 1_f64 / batch.len() as f64;
        let mut gradients = ModelState::new();
        gradients.insert(
            WEIGHT,
            Tensor::new(
                self.weight.shape().to_vec(),
                weight_grad.iter().map(|grad| grad * scale).collect(),
            )?,
        );
        gradients.insert(
            BIAS,
            Tensor::new(
                self.bias.shape().to_vec(),
                bias_grad.iter().map(|grad| grad * scale).collect(),
            )?,
        );
        Ok((gradients, loss_sum * scale))
    }
}
