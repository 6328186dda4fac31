//! Randomness for session tokens and padding filler
//!
//! Everything here draws from the operating system generator through
//! `ring::rand::SystemRandom`.

use ring::rand::{SecureRandom, SystemRandom};

/// Alphabet session tokens are drawn from
pub const TOKEN_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/-_";

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Uniform random integer in `0..bound`. Returns 0 when `bound` is 0.
pub fn random_below(bound: usize) -> usize {
    if bound <= 1 {
        return 0;
    }
    let bound = bound as u64;
    // Largest multiple of `bound` that fits, to keep the draw unbiased
    let zone = u64::MAX - (u64::MAX % bound);
    loop {
        let mut buf = [0u8; 8];
        random_bytes(&mut buf);
        let v = u64::from_le_bytes(buf);
        if v < zone {
            return (v % bound) as usize;
        }
    }
}

/// Generate a random session token of `len` characters from [`TOKEN_ALPHABET`]
pub fn random_token(len: usize) -> String {
    let alphabet_len = TOKEN_ALPHABET.len();
    let zone = 256 - (256 % alphabet_len);

    let mut token = String::with_capacity(len);
    let mut buf = [0u8; 32];
    while token.len() < len {
        random_bytes(&mut buf);
        for &b in &buf {
            if (b as usize) < zone {
                token.push(TOKEN_ALPHABET[b as usize % alphabet_len] as char);
                if token.len() == len {
                    break;
                }
            }
        }
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_token_shape() {
        let token = random_token(16);
        assert_eq!(token.len(), 16);
        assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));

        assert_eq!(random_token(0), "");
        assert_eq!(random_token(100).len(), 100);
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(random_token(16), random_token(16));
    }

    #[test]
    fn test_random_below() {
        assert_eq!(random_below(0), 0);
        assert_eq!(random_below(1), 0);
        for _ in 0..1000 {
            assert!(random_below(7) < 7);
        }
    }
}
