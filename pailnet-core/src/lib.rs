//! # Pailnet core: building blocks for privacy-preserving federated learning
//!
//! This crate provides everything a federated-learning client and its
//! aggregator share:
//!
//! - [`model`]: the numerical representation of a model as named, shaped
//!   tensors of `f64` weights, together with the elementwise operations a
//!   training round needs (deltas, in-place application, L2 clipping).
//! - [`crypto`]: the Paillier cryptosystem used to protect weight deltas.
//!   Encryption is additively homomorphic, so an aggregator can sum
//!   ciphertext-encoded updates from many clients without ever seeing a
//!   plaintext gradient. Key custody is split into two capabilities:
//!   [`Encryptor`] (public key, handed to every client) and [`Decryptor`]
//!   (secret key, held only by the trusted decrypting party).
//! - [`update`]: the protected update payloads exchanged with the
//!   aggregator, either plaintext model states or flat sequences of
//!   ciphertexts.
//! - [`aggregation`]: the combination rules an aggregator applies to
//!   per-client updates: plaintext federated averaging and ciphertext-wise
//!   homomorphic summation.
//!
//! [`Encryptor`]: crate::crypto::Encryptor
//! [`Decryptor`]: crate::crypto::Decryptor

pub mod aggregation;
pub mod crypto;
pub mod model;
pub mod update;
