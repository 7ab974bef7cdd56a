//! C4: secret generation and constant-time comparison.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/secrets.cpp`,
//! which seeds a 32-bit Mersenne Twister from 624 words of
//! `std::random_device` output. A Rust port has no reason to hand-roll a
//! PRNG when `rand` already provides a CSPRNG-backed generator seeded from
//! OS entropy; see SPEC_FULL.md §9 for that decision. The observable
//! behavior — character set, token length, key byte range — is unchanged.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

const CSRF_TOKEN_LEN: usize = 20;
const CSRF_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const SNAKE_OIL_KEY_MIN: usize = 5000;
const SNAKE_OIL_KEY_MAX: usize = 6000; // exclusive, matching uniform_int_distribution(5000, 6000)

/// Generates fresh per-Window secrets. One instance is owned by the
/// `Context` and shared (through `&self`) by every Window it creates.
pub struct SecretGenerator {
    // Boxed so `SecretGenerator` itself stays `Send + Sync` without forcing
    // every caller to hold a lock; `rand::thread_rng` is already
    // thread-local, so generation always happens on the API thread in
    // practice and no locking is needed here.
    _private: (),
}

impl SecretGenerator {
    pub fn new() -> SecretGenerator {
        SecretGenerator { _private: () }
    }

    /// A 20-character CSRF token drawn from `[0-9A-Za-z]`.
    pub fn csrf_token(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..CSRF_TOKEN_LEN)
            .map(|_| CSRF_ALPHABET[rng.gen_range(0..CSRF_ALPHABET.len())] as char)
            .collect()
    }

    /// 5000-5999 random bytes used to XOR-obfuscate key codes in URLs. Not
    /// a security mechanism, just casual obfuscation.
    pub fn snake_oil_cipher_key(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let len_dist = Uniform::from(SNAKE_OIL_KEY_MIN..SNAKE_OIL_KEY_MAX);
        let len = len_dist.sample(&mut rng);
        (0..len).map(|_| rng.gen::<u8>()).collect()
    }
}

impl Default for SecretGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares two byte strings in time that depends only on their lengths,
/// not their contents. Used for CSRF tokens and HTTP Basic credentials
/// (constant-time comparison, since these are compared against attacker input).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrf_token_has_correct_length_and_alphabet() {
        let gen = SecretGenerator::new();
        for _ in 0..50 {
            let token = gen.csrf_token();
            assert_eq!(token.len(), CSRF_TOKEN_LEN);
            assert!(token.bytes().all(|b| CSRF_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn snake_oil_key_length_in_range() {
        let gen = SecretGenerator::new();
        for _ in 0..20 {
            let key = gen.snake_oil_cipher_key();
            assert!(key.len() >= SNAKE_OIL_KEY_MIN && key.len() < SNAKE_OIL_KEY_MAX, "{}", key.len());
        }
    }

    #[test]
    fn two_generators_produce_different_tokens() {
        let gen = SecretGenerator::new();
        let a = gen.csrf_token();
        let b = gen.csrf_token();
        assert_ne!(a, b, "collision astronomically unlikely for 20 random chars");
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
        assert!(!constant_time_eq(b"short", b"longer-string"));
        assert!(constant_time_eq(b"", b""));
    }
}
