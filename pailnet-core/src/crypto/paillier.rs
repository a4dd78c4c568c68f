//! The Paillier cryptosystem over the plaintext group `Z_n`.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! The implementation follows the textbook scheme with the common choice
//! `g = n + 1`, which turns the generator exponentiation into a single
//! multiplication: `g^m = 1 + m*n (mod n^2)`. Model weights are `f64`
//! values; they enter the plaintext group through a fixed-point encoding
//! with [`PRECISION_BITS`] fractional bits, with negative values folded
//! into the upper half of the group.
//!
//! [crypto module]: crate::crypto

use num::{
    bigint::{BigInt, BigUint, ToBigInt},
    integer::Integer,
    traits::{identities::{One, Zero}, FromPrimitive, ToPrimitive},
};
use rand::{thread_rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    prng::{generate_integer, generate_prime},
    Decryptor,
    Encryptor,
};

/// The default size of the modulus `n` in bits.
pub const DEFAULT_MODULUS_BITS: usize = 2048;

/// The number of fractional bits of the fixed-point weight encoding.
///
/// The quantization error of an encode/decode round trip is at most
/// `2^-(PRECISION_BITS + 1)`, which is far below the `1e-6` tolerance
/// required for model weights.
const PRECISION_BITS: usize = 40;

#[derive(Debug, Error, PartialEq)]
/// Errors related to the Paillier cryptosystem.
pub enum CryptoError {
    #[error("cannot encrypt the non-finite value {0}")]
    NonFiniteValue(f64),

    #[error("the value {0} exceeds the plaintext capacity of the modulus")]
    PlaintextOverflow(f64),

    #[error("the ciphertext does not belong to the group of this key")]
    CiphertextOutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A Paillier public key: the modulus `n` and its cached square.
pub struct PaillierPublicKey {
    n: BigUint,
    nn: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A Paillier secret key: the Carmichael value of the modulus and the
/// precomputed decryption coefficient, together with the matching public key.
pub struct PaillierSecretKey {
    lambda: BigUint,
    mu: BigUint,
    public: PaillierPublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A Paillier key pair.
pub struct PaillierKeyPair {
    /// The public key, distributed to every participant.
    pub public: PaillierPublicKey,
    /// The secret key, held only by the trusted decrypting party.
    pub secret: PaillierSecretKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// An opaque Paillier ciphertext, an element of `Z_{n^2}`.
///
/// Ciphertexts support homomorphic addition through [`Encryptor::add`];
/// they carry no key material themselves.
pub struct Ciphertext(BigUint);

impl PaillierKeyPair {
    /// Generates a new key pair with the default modulus size.
    ///
    /// This is expensive: two probable primes of half the modulus size have
    /// to be found. In a simulated federation it is called exactly once and
    /// the halves of the pair are then distributed to the participants.
    pub fn generate() -> Self {
        Self::generate_with_modulus_bits(DEFAULT_MODULUS_BITS)
    }

    /// Generates a new key pair with a modulus of the given size in bits.
    ///
    /// Smaller moduli are useful for fast tests; anything below 2048 bits
    /// offers no real security.
    ///
    /// # Panics
    /// Panics if `bits` is odd or smaller than 64.
    pub fn generate_with_modulus_bits(bits: usize) -> Self {
        assert!(
            bits >= 64 && bits % 2 == 0,
            "modulus size must be an even number of at least 64 bits"
        );
        let mut prng = ChaCha20Rng::from_entropy();
        loop {
            let p = generate_prime(&mut prng, bits / 2);
            let q = generate_prime(&mut prng, bits / 2);
            if p == q {
                continue;
            }
            let n = &p * &q;
            if n.bits() as usize != bits {
                continue;
            }
            let lambda = (&p - 1_u32).lcm(&(&q - 1_u32));
            // lambda is invertible mod n whenever p and q are distinct
            // primes of the same size; retry on the degenerate case anyways.
            let mu = match mod_inverse(&lambda, &n) {
                Some(mu) => mu,
                None => continue,
            };
            let public = PaillierPublicKey::from_modulus(n);
            let secret = PaillierSecretKey {
                lambda,
                mu,
                public: public.clone(),
            };
            return Self { public, secret };
        }
    }
}

impl PaillierPublicKey {
    fn from_modulus(n: BigUint) -> Self {
        let nn = &n * &n;
        Self { n, nn }
    }

    /// Gets the size of the modulus in bits.
    pub fn modulus_bits(&self) -> u64 {
        self.n.bits()
    }

    /// Encodes a weight as a fixed-point element of the plaintext group.
    ///
    /// Negative values are folded into the upper half of the group, so that
    /// homomorphic sums carry signs correctly as long as the magnitudes
    /// stay below `n / 2`.
    fn encode(&self, value: f64) -> Result<BigUint, CryptoError> {
        if !value.is_finite() {
            return Err(CryptoError::NonFiniteValue(value));
        }
        let scaled = (value * (1_u64 << PRECISION_BITS) as f64).round();
        // UNWRAP_SAFE: scaled is finite since value is
        let fixed = BigInt::from_f64(scaled).unwrap();
        if fixed.magnitude() > &(&self.n >> 1_u32) {
            return Err(CryptoError::PlaintextOverflow(value));
        }
        let magnitude = fixed.magnitude().clone();
        if scaled < 0_f64 {
            Ok(&self.n - magnitude)
        } else {
            Ok(magnitude)
        }
    }

    /// Decodes an element of the plaintext group back into a weight.
    ///
    /// The inverse of [`encode`], up to the fixed-point quantization error.
    ///
    /// [`encode`]: PaillierPublicKey::encode
    fn decode(&self, plaintext: BigUint) -> f64 {
        let signed = if plaintext > (&self.n >> 1_u32) {
            // UNWRAP_SAFE: to_bigint never fails for BigUint
            plaintext.to_bigint().unwrap() - self.n.to_bigint().unwrap()
        } else {
            plaintext.to_bigint().unwrap()
        };
        // values beyond f64 range only arise from foreign-key garbage
        let float = signed.to_f64().unwrap_or(f64::INFINITY);
        float / (1_u64 << PRECISION_BITS) as f64
    }
}

impl Encryptor for PaillierPublicKey {
    fn encrypt(&self, value: f64) -> Result<Ciphertext, CryptoError> {
        let plaintext = self.encode(value)?;
        let mut rng = thread_rng();
        // blinding factor from Z_n^*
        let blind = loop {
            let blind = generate_integer(&mut rng, &self.n);
            if !blind.is_zero() && blind.gcd(&self.n).is_one() {
                break blind;
            }
        };
        // g = n + 1, so g^m = 1 + m*n (mod n^2)
        let generator_part = (BigUint::one() + plaintext * &self.n) % &self.nn;
        let blind_part = blind.modpow(&self.n, &self.nn);
        Ok(Ciphertext((generator_part * blind_part) % &self.nn))
    }

    fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> Result<Ciphertext, CryptoError> {
        if lhs.0.is_zero() || rhs.0.is_zero() || lhs.0 >= self.nn || rhs.0 >= self.nn {
            return Err(CryptoError::CiphertextOutOfRange);
        }
        Ok(Ciphertext((&lhs.0 * &rhs.0) % &self.nn))
    }
}

impl PaillierSecretKey {
    /// Gets the public key matching this secret key.
    pub fn public_key(&self) -> &PaillierPublicKey {
        &self.public
    }
}

impl Decryptor for PaillierSecretKey {
    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<f64, CryptoError> {
        if ciphertext.0.is_zero() || ciphertext.0 >= self.public.nn {
            return Err(CryptoError::CiphertextOutOfRange);
        }
        let raised = ciphertext.0.modpow(&self.lambda, &self.public.nn);
        if raised.is_zero() {
            // multiples of n collapse to zero and are not valid ciphertexts
            return Err(CryptoError::CiphertextOutOfRange);
        }
        let reduced = (raised - BigUint::one()) / &self.public.n;
        let plaintext = (reduced * &self.mu) % &self.public.n;
        Ok(self.public.decode(plaintext))
    }
}

/// Computes the modular inverse via the extended Euclidean algorithm.
///
/// Returns `None` if `value` and `modulus` are not coprime.
fn mod_inverse(value: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    // UNWRAP_SAFE: to_bigint never fails for BigUint
    let mut r0 = modulus.to_bigint().unwrap();
    let mut r1 = value.to_bigint().unwrap();
    let mut t0 = BigInt::zero();
    let mut t1 = BigInt::one();
    while !r1.is_zero() {
        let quotient = &r0 / &r1;
        let remainder = &r0 - &quotient * &r1;
        r0 = std::mem::replace(&mut r1, remainder);
        let coefficient = &t0 - &quotient * &t1;
        t0 = std::mem::replace(&mut t1, coefficient);
    }
    if !r0.is_one() {
        return None;
    }
    let modulus = modulus.to_bigint().unwrap();
    let inverse = ((t0 % &modulus) + &modulus) % &modulus;
    inverse.to_biguint()
}
