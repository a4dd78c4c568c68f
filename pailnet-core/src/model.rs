//! Model representation: named, shaped tensors of weights.
//!
//! A [`ModelState`] is the unit of exchange of a federated round: the
//! initial global weights pushed into every client, the snapshot taken
//! before local training, and the delta sent back to the aggregator are
//! all model states. Parameters iterate in lexicographic name order, so
//! flattening and encryption enumerate weights identically on every
//! participant.

use std::collections::{
    btree_map::{IntoIter, Iter, Keys},
    BTreeMap,
};
use std::iter::FromIterator;

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
/// Errors related to tensor and model state manipulation.
pub enum ModelError {
    #[error("shape {shape:?} holds {expected} weights but {actual} were provided")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("the states disagree on the parameter set: missing {0}")]
    ParameterMismatch(String),

    #[error("the tensors for parameter {0} have incompatible shapes")]
    IncompatibleShapes(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A multi-dimensional array of weights in row-major order.
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Creates a tensor from a shape and row-major data.
    ///
    /// # Errors
    /// Fails if the element count disagrees with the shape product.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ModelError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(ModelError::ShapeMismatch {
                expected,
                actual: data.len(),
                shape,
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a zero-filled tensor with the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0_f64; len],
        }
    }

    /// Rebuilds a tensor of the given shape from a flat weight sequence.
    ///
    /// The inverse of flattening a tensor in row-major order. Fails loudly
    /// on a count mismatch instead of truncating or padding.
    pub fn from_flat(shape: &[usize], data: Vec<f64>) -> Result<Self, ModelError> {
        Self::new(shape.to_vec(), data)
    }

    /// Gets the shape of this tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Gets the weights of this tensor in row-major order.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Gets the number of weights of this tensor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Checks if this tensor holds no weights.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Computes the L2 norm of this tensor.
    pub fn l2_norm(&self) -> f64 {
        self.data.iter().map(|weight| weight * weight).sum::<f64>().sqrt()
    }

    /// Clips this tensor by its L2 norm against the given bound.
    ///
    /// Computes `t / max(1, ||t||_2 / bound)`: a tensor within the bound is
    /// returned unchanged, one beyond it is scaled down to a norm of
    /// exactly `bound`. This is the clipping step of differentially private
    /// learning; note that no noise is added here, so clipping alone does
    /// not provide a formal differential-privacy guarantee.
    pub fn clip_by_l2_norm(&self, bound: f64) -> Tensor {
        let scale = (self.l2_norm() / bound).max(1_f64);
        self.scaled(1_f64 / scale)
    }

    /// Scales every weight of this tensor by a factor.
    pub fn scaled(&self, factor: f64) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|weight| weight * factor).collect(),
        }
    }

    fn zip_map<F>(&self, other: &Tensor, name: &str, combine: F) -> Result<Tensor, ModelError>
    where
        F: Fn(f64, f64) -> f64,
    {
        if self.shape != other.shape {
            return Err(ModelError::IncompatibleShapes(name.to_string()));
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(lhs, rhs)| combine(*lhs, *rhs))
            .collect();
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, From, Into, Serialize, Deserialize)]
/// A mapping from parameter names to weight tensors.
pub struct ModelState(BTreeMap<String, Tensor>);

impl ModelState {
    /// Creates a new, empty model state.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts a tensor under a parameter name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.0.insert(name.into(), tensor);
    }

    /// Gets the tensor for a parameter name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    /// Creates an iterator over the parameter names in lexicographic order.
    pub fn keys(&self) -> Keys<String, Tensor> {
        self.0.keys()
    }

    /// Creates an iterator over the parameters in lexicographic name order.
    pub fn iter(&self) -> Iter<String, Tensor> {
        self.0.iter()
    }

    /// Gets the number of parameters (not weights) of this state.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks if this state holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gets the total number of weights across all parameters.
    pub fn nb_weights(&self) -> usize {
        self.0.values().map(Tensor::len).sum()
    }

    /// Computes the per-parameter difference `self - other`.
    ///
    /// # Errors
    /// Fails if the states disagree on their parameter sets or shapes.
    pub fn delta(&self, other: &ModelState) -> Result<ModelState, ModelError> {
        self.zip_map(other, |lhs, rhs| lhs - rhs)
    }

    /// Computes the per-parameter sum `self + other`.
    ///
    /// # Errors
    /// Fails if the states disagree on their parameter sets or shapes.
    pub fn added(&self, other: &ModelState) -> Result<ModelState, ModelError> {
        self.zip_map(other, |lhs, rhs| lhs + rhs)
    }

    /// Scales every weight of every parameter by a factor.
    pub fn scaled(&self, factor: f64) -> ModelState {
        self.0
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.scaled(factor)))
            .collect()
    }

    /// Clips every parameter independently by its L2 norm against `bound`.
    ///
    /// See [`Tensor::clip_by_l2_norm`]; clipping alone adds no noise and
    /// provides no formal differential-privacy guarantee.
    pub fn clip_by_l2_norm(&self, bound: f64) -> ModelState {
        self.0
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.clip_by_l2_norm(bound)))
            .collect()
    }

    /// Creates a zero-filled state with the same parameter names and shapes.
    pub fn zeros_like(&self) -> ModelState {
        self.0
            .iter()
            .map(|(name, tensor)| (name.clone(), Tensor::zeros(tensor.shape().to_vec())))
            .collect()
    }

    /// Checks that both states hold exactly the same parameter names.
    pub fn same_parameters(&self, other: &ModelState) -> Result<(), ModelError> {
        for name in self.0.keys() {
            if !other.0.contains_key(name) {
                return Err(ModelError::ParameterMismatch(name.clone()));
            }
        }
        for name in other.0.keys() {
            if !self.0.contains_key(name) {
                return Err(ModelError::ParameterMismatch(name.clone()));
            }
        }
        Ok(())
    }

    fn zip_map<F>(&self, other: &ModelState, combine: F) -> Result<ModelState, ModelError>
    where
        F: Fn(f64, f64) -> f64 + Copy,
    {
        self.same_parameters(other)?;
        self.0
            .iter()
            .map(|(name, tensor)| {
                // UNWRAP_SAFE: the parameter sets were just checked to coincide
                let other = other.0.get(name).unwrap();
                Ok((name.clone(), tensor.zip_map(other, name, combine)?))
            })
            .collect()
    }
}

impl FromIterator<(String, Tensor)> for ModelState {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ModelState {
    type Item = (String, Tensor);
    type IntoIter = IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
