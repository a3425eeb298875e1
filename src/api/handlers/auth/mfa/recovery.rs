//! Backup code generation and verification.
//!
//! Codes are random, shown in plaintext exactly once at generation, and
//! stored as Argon2id hashes keyed with a server-side pepper. A database
//! dump alone is not enough to forge a code.

use anyhow::{Result, anyhow};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{Rng, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

pub const CODES_PER_BATCH: usize = 10;
const CODE_LENGTH: usize = 10;
const GROUP_SIZE: usize = 5;

// No 0/o/1/l/i, codes get read over the phone.
const CODE_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

fn peppered_argon2(pepper: &SecretString) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper.expose_secret().as_bytes(),
        Algorithm::Argon2id,
        Version::V0x13,
        Params::default(),
    )
    .map_err(|err| anyhow!("failed to build peppered hasher: {err}"))
}

/// A freshly generated batch: plaintext codes for the response, hashes
/// for storage.
pub struct BackupCodeBatch {
    pub batch_id: Uuid,
    pub codes: Vec<String>,
    pub hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// # Errors
    /// Returns error if hashing fails.
    pub fn generate(pepper: &SecretString) -> Result<Self> {
        let hasher = peppered_argon2(pepper)?;
        let mut codes = Vec::with_capacity(CODES_PER_BATCH);
        let mut hashes = Vec::with_capacity(CODES_PER_BATCH);

        for _ in 0..CODES_PER_BATCH {
            let code = random_code();
            let salt = SaltString::generate(&mut OsRng);
            let hash = hasher
                .hash_password(normalize_code(&code).as_bytes(), &salt)
                .map_err(|err| anyhow!("failed to hash backup code: {err}"))?
                .to_string();
            codes.push(code);
            hashes.push(hash);
        }

        Ok(Self {
            batch_id: Uuid::new_v4(),
            codes,
            hashes,
        })
    }
}

fn random_code() -> String {
    let mut rng = OsRng;
    let raw: String = (0..CODE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect();
    format_code(&raw)
}

/// Insert group separators for display: `a3k9c-x2m4p`.
fn format_code(raw: &str) -> String {
    raw.as_bytes()
        .chunks(GROUP_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Strip separators and whitespace, lowercase. Verification and hashing
/// both go through this, so user formatting never matters.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Verify a submitted code against a stored peppered hash.
///
/// # Errors
/// Returns error if the hasher cannot be built or the stored hash is
/// malformed.
pub fn verify_code(pepper: &SecretString, code: &str, stored_hash: &str) -> Result<bool> {
    let hasher = peppered_argon2(pepper)?;
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|err| anyhow!("invalid stored backup code hash: {err}"))?;
    Ok(hasher
        .verify_password(normalize_code(code).as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pepper() -> SecretString {
        SecretString::from("test-pepper")
    }

    #[test]
    fn batch_has_expected_shape() -> Result<()> {
        let batch = BackupCodeBatch::generate(&pepper())?;
        assert_eq!(batch.codes.len(), CODES_PER_BATCH);
        assert_eq!(batch.hashes.len(), CODES_PER_BATCH);
        for code in &batch.codes {
            // 10 chars in two groups of five.
            assert_eq!(code.len(), CODE_LENGTH + 1);
            assert_eq!(code.matches('-').count(), 1);
            assert_eq!(normalize_code(code).len(), CODE_LENGTH);
        }
        Ok(())
    }

    #[test]
    fn codes_verify_against_their_hashes() -> Result<()> {
        let batch = BackupCodeBatch::generate(&pepper())?;
        assert!(verify_code(&pepper(), &batch.codes[0], &batch.hashes[0])?);
        assert!(!verify_code(&pepper(), &batch.codes[0], &batch.hashes[1])?);
        Ok(())
    }

    #[test]
    fn verification_requires_the_pepper() -> Result<()> {
        let batch = BackupCodeBatch::generate(&pepper())?;
        assert!(!verify_code(
            &SecretString::from("other-pepper"),
            &batch.codes[0],
            &batch.hashes[0]
        )?);
        Ok(())
    }

    #[test]
    fn normalization_forgives_formatting() -> Result<()> {
        let batch = BackupCodeBatch::generate(&pepper())?;
        let shouty = batch.codes[0].to_uppercase().replace('-', " ");
        assert!(verify_code(&pepper(), &shouty, &batch.hashes[0])?);
        Ok(())
    }

    #[test]
    fn codes_avoid_ambiguous_characters() {
        for _ in 0..20 {
            let code = random_code();
            for c in normalize_code(&code).chars() {
                assert!(!matches!(c, '0' | 'o' | '1' | 'l' | 'i'), "ambiguous char in {code}");
            }
        }
    }
}
