//! The additively homomorphic cryptosystem protecting model updates.
//!
//! The [`paillier`] module implements the Paillier cryptosystem over the
//! big-integer arithmetic of the [num] crate, with a fixed-point encoding
//! that maps `f64` model weights into the plaintext group. The [`prng`]
//! module supplies the randomness: uniform sampling below a bound and
//! probable-prime generation.
//!
//! Key custody is modeled as two separate capabilities instead of a single
//! keypair object: every client receives an [`Encryptor`], while only the
//! party trusted with decryption receives a [`Decryptor`]. Both are plain
//! traits, so tests can substitute deterministic fakes for the real
//! cryptosystem.
//!
//! # Examples
//! ```
//! # use pailnet_core::crypto::{Decryptor, Encryptor, PaillierKeyPair};
//! let keys = PaillierKeyPair::generate_with_modulus_bits(512);
//! let cipher = keys.public.encrypt(0.25).unwrap();
//! assert!((keys.secret.decrypt(&cipher).unwrap() - 0.25).abs() < 1e-6);
//! ```
//!
//! [num]: https://docs.rs/num/

pub(crate) mod paillier;
pub(crate) mod prng;

pub use self::{
    paillier::{
        Ciphertext,
        CryptoError,
        PaillierKeyPair,
        PaillierPublicKey,
        PaillierSecretKey,
        DEFAULT_MODULUS_BITS,
    },
    prng::{generate_integer, generate_prime},
};

/// The encrypting capability distributed to every participant.
///
/// Implementors wrap a public key: they can produce ciphertexts and combine
/// them homomorphically, but can never recover a plaintext.
pub trait Encryptor {
    /// Encrypts a single weight under the public key.
    ///
    /// # Errors
    /// Fails if the weight is not finite or exceeds the plaintext capacity
    /// of the modulus.
    fn encrypt(&self, value: f64) -> Result<Ciphertext, CryptoError>;

    /// Adds two ciphertexts homomorphically.
    ///
    /// The result decrypts to the sum of the two plaintexts.
    ///
    /// # Errors
    /// Fails if either ciphertext does not belong to the group of this key.
    fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> Result<Ciphertext, CryptoError>;
}

/// The decrypting capability, held only by the trusted decrypting party.
pub trait Decryptor {
    /// Decrypts a single ciphertext back into a weight.
    ///
    /// This is the exact inverse of [`Encryptor::encrypt`] for any
    /// ciphertext produced under the matching public key, up to the
    /// fixed-point quantization error of the encoding. A ciphertext
    /// produced under a *different* key of the same modulus size cannot be
    /// detected and decrypts to garbage; one outside the group of this key
    /// is rejected.
    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<f64, CryptoError>;
}
