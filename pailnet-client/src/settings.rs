//! Loading and validation of client settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables with the `PAILNET` prefix, e.g. `PAILNET_LOCAL_EPOCHS=5`.

use std::path::PathBuf;

use config::{Config, ConfigError, Environment};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The protection applied to a local weight delta before it leaves the client.
pub enum Mode {
    /// The delta is sent in plaintext.
    #[display(fmt = "plain")]
    Plain,
    /// Every tensor of the delta is clipped by its L2 norm against the
    /// configured bound.
    ///
    /// This is the clipping step of differentially private learning; no
    /// noise is added, so this mode bounds sensitivity but does not provide
    /// a formal differential-privacy guarantee on its own.
    #[display(fmt = "dp")]
    #[serde(alias = "DP")]
    Dp,
    /// Every weight of the delta is encrypted under the shared Paillier
    /// public key.
    #[display(fmt = "paillier")]
    #[serde(alias = "Paillier")]
    Paillier,
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_hyperparameters"))]
/// The local training and protection settings of a client.
///
/// An unrecognized `mode` string fails deserialization: mode selection is a
/// construction-time configuration error, never a recoverable runtime
/// condition.
pub struct ClientSettings {
    /// The protection mode of this client.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// mode = "paillier"
    /// ```
    pub mode: Mode,

    #[validate(range(min = 1))]
    /// The number of local training epochs per round.
    pub local_epochs: usize,

    #[validate(range(min = 1))]
    /// The number of samples per mini-batch.
    pub batch_size: usize,

    /// The learning rate of the local gradient descent.
    pub learning_rate: f64,

    /// The momentum of the local gradient descent.
    pub momentum: f64,

    /// The L2 clipping bound `C` of DP mode.
    pub clip_bound: f64,
}

impl ClientSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: ClientSettings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path))?;
        config.merge(Environment::with_prefix("pailnet").separator("__"))?;
        config.try_into()
    }
}

fn validate_hyperparameters(settings: &ClientSettings) -> Result<(), ValidationError> {
    if !(settings.learning_rate.is_finite() && settings.learning_rate > 0_f64) {
        return Err(ValidationError::new("learning_rate must be positive"));
    }
    if !(settings.momentum.is_finite() && (0_f64..1_f64).contains(&settings.momentum)) {
        return Err(ValidationError::new("momentum must lie in [0, 1)"));
    }
    if !(settings.clip_bound.is_finite() && settings.clip_bound > 0_f64) {
        return Err(ValidationError::new("clip_bound must be positive"));
    }
    Ok(())
}
