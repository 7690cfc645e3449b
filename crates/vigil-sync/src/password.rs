//! Password generation for agent registration.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// `a-z A-Z 2-9` minus the look-alikes (`i l o I L O 0 1`).
const ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a password from the OS RNG, falling back to the thread RNG
/// when the entropy source fails (the failure is logged).
pub fn generate_password(length: usize) -> String {
    let mut password = String::with_capacity(length);
    while password.len() < length {
        let mut buffer = [0u8; 64];
        if let Err(err) = OsRng.try_fill_bytes(&mut buffer) {
            tracing::warn!(error = %err, "OS RNG unavailable, falling back to PRNG");
            rand::thread_rng().fill(&mut buffer);
        }
        for byte in buffer {
            // Rejection sampling keeps the distribution uniform: accept
            // only bytes below the largest multiple of the alphabet size.
            let limit = (u8::MAX as usize / ALPHABET.len()) * ALPHABET.len();
            if (byte as usize) < limit {
                password.push(ALPHABET[byte as usize % ALPHABET.len()] as char);
                if password.len() == length {
                    break;
                }
            }
        }
    }
    password
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_has_54_characters_without_lookalikes() {
        assert_eq!(ALPHABET.len(), 54);
        for c in [b'i', b'l', b'o', b'I', b'L', b'O', b'0', b'1'] {
            assert!(!ALPHABET.contains(&c), "{} should be excluded", c as char);
        }
    }

    #[test]
    fn generated_passwords_have_requested_length() {
        for _ in 0..50 {
            let password = generate_password(10);
            assert_eq!(password.len(), 10);
            assert!(password.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn passwords_differ() {
        assert_ne!(generate_password(10), generate_password(10));
    }
}
