//! The client side of a federation.
//!
//! A [`Client`] trains a model replica on its private data shard and emits
//! a protected weight delta once per round. The protection is chosen at
//! construction time via [`ClientSettings`]:
//!
//! - **plain**: the delta leaves the client in plaintext,
//! - **dp**: the delta is clipped by its L2 norm before leaving,
//! - **paillier**: every weight of the delta is encrypted under the shared
//!   Paillier public key, so the aggregator can sum updates without seeing
//!   a single plaintext weight.
//!
//! The crate logs through [`tracing`]; binaries decide on a subscriber.
//!
//! [`Client`]: client::Client
//! [`ClientSettings`]: settings::ClientSettings

pub mod client;
pub mod data;
pub mod model;
pub mod settings;

pub use self::{
    client::{Client, ClientError},
    data::{DataError, DatasetSplit, Sample},
    model::{SoftmaxRegression, Trainable, TrainingError},
    settings::{ClientSettings, Mode, SettingsError},
};
