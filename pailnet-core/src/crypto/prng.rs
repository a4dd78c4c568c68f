//! PRNG utilities for the crypto primitives.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use num::{
    bigint::BigUint,
    traits::identities::{One, Zero},
};
use rand::{CryptoRng, RngCore};

/// The first odd primes, used for trial division before Miller-Rabin.
const SMALL_PRIMES: [u32; 46] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191, 193,
    197, 199, 211,
];

/// The number of Miller-Rabin rounds per candidate.
///
/// Bounds the error probability of a composite passing by `4^-25`.
const MILLER_RABIN_ROUNDS: usize = 25;

/// Generates a secure pseudo-random integer.
///
/// Draws from a uniform distribution over the integers between zero (included) and
/// `max_int` (excluded).
pub fn generate_integer<R: RngCore + CryptoRng>(prng: &mut R, max_int: &BigUint) -> BigUint {
    if max_int.is_zero() {
        return BigUint::zero();
    }
    let mut bytes = max_int.to_bytes_le();
    let mut rand_int = max_int.clone();
    while &rand_int >= max_int {
        prng.fill_bytes(&mut bytes);
        rand_int = BigUint::from_bytes_le(&bytes);
    }
    rand_int
}

/// Generates a probable prime with the given bit length.
///
/// Candidates are drawn uniformly with the two most significant bits and the least
/// significant bit forced, so that the product of two primes generated this way has
/// the full `2 * bits` length. Each candidate is subjected to trial division by
/// [`SMALL_PRIMES`] and [`MILLER_RABIN_ROUNDS`] rounds of Miller-Rabin.
///
/// # Panics
/// Panics if `bits < 8`, which cannot hold the forced bit pattern.
pub fn generate_prime<R: RngCore + CryptoRng>(prng: &mut R, bits: usize) -> BigUint {
    assert!(bits >= 8, "prime bit length must be at least 8");
    let one = BigUint::one();
    let max_int = &one << bits;
    let forced = (&one << (bits - 1)) | (&one << (bits - 2)) | &one;
    loop {
        let candidate = generate_integer(prng, &max_int) | &forced;
        if is_probable_prime(prng, &candidate) {
            return candidate;
        }
    }
}

/// Tests a candidate for primality with trial division and Miller-Rabin.
fn is_probable_prime<R: RngCore + CryptoRng>(prng: &mut R, candidate: &BigUint) -> bool {
    let one = BigUint::one();
    let two = &one + &one;
    if candidate < &two {
        return false;
    }
    if (candidate % &two).is_zero() {
        return candidate == &two;
    }
    for &small in SMALL_PRIMES.iter() {
        let small = BigUint::from(small);
        if candidate == &small {
            return true;
        }
        if (candidate % &small).is_zero() {
            return false;
        }
    }

    // candidate - 1 = d * 2^s with d odd
    let minus_one = candidate - &one;
    // UNWRAP_SAFE: minus_one is nonzero since candidate >= 2
    let s = minus_one.trailing_zeros().unwrap();
    let d = &minus_one >> s;

    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        // witness in [2, candidate - 1]
        let witness = generate_integer(prng, &(&minus_one - &one)) + &two;
        let mut x = witness.modpow(&d, candidate);
        if x == one || x == minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, candidate);
            if x == minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}
