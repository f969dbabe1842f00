use std::fmt::Display;
use std::str::FromStr;

use crate::error::BastionError;

/// Reversible transform applied to sensitive fields at the store edge.
///
/// Business logic never sees protected strings: records are revealed into
/// typed values before anything compares them.
pub trait FieldProtector: Send + Sync {
    fn protect(&self, plain: &str) -> Result<String, BastionError>;

    fn reveal(&self, stored: &str) -> Result<String, BastionError>;
}

/// Identity transform. Used when no master key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProtector;

impl FieldProtector for PassthroughProtector {
    fn protect(&self, plain: &str) -> Result<String, BastionError> {
        Ok(plain.to_owned())
    }

    fn reveal(&self, stored: &str) -> Result<String, BastionError> {
        Ok(stored.to_owned())
    }
}

pub fn protect_value<T: Display>(
    protector: &dyn FieldProtector,
    value: &T,
) -> Result<String, BastionError> {
    protector.protect(&value.to_string())
}

pub fn reveal_value<T>(protector: &dyn FieldProtector, stored: &str) -> Result<T, BastionError>
where
    T: FromStr,
    T::Err: Display,
{
    let plain = protector.reveal(stored)?;
    plain
        .parse()
        .map_err(|e| BastionError::Protection(format!("revealed value did not parse: {e}")))
}

#[cfg(feature = "at-rest")]
pub use aes::AesGcmProtector;

#[cfg(feature = "at-rest")]
mod aes {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Key, Nonce};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use hkdf::Hkdf;
    use secrecy::{ExposeSecret, SecretBox, SecretString};
    use sha2::{Digest, Sha256};

    use super::FieldProtector;
    use crate::error::BastionError;

    pub const MASTER_KEY_ENV: &str = "BASTION_MASTER_KEY";
    const HKDF_SALT: &[u8] = b"bastion-at-rest-v1";
    const NONCE_LEN: usize = 12;

    /// AES-256-GCM with a nonce derived from the plaintext, so equal values
    /// protect to equal strings (equality lookups stay possible at the edge).
    pub struct AesGcmProtector {
        cipher: Aes256Gcm,
        nonce_key: SecretBox<[u8; 32]>,
    }

    impl std::fmt::Debug for AesGcmProtector {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("AesGcmProtector").finish_non_exhaustive()
        }
    }

    impl AesGcmProtector {
        pub fn from_master_key(master: &SecretString) -> Result<Self, BastionError> {
            let master = master.expose_secret();
            if master.len() < 16 {
                return Err(BastionError::Protection(format!(
                    "{MASTER_KEY_ENV} must be at least 16 bytes"
                )));
            }
            let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), master.as_bytes());
            let mut enc_key = [0u8; 32];
            let mut nonce_key = [0u8; 32];
            hk.expand(b"field-encryption", &mut enc_key)
                .and_then(|()| hk.expand(b"field-nonce", &mut nonce_key))
                .map_err(|e| BastionError::Protection(format!("key derivation: {e}")))?;

            Ok(Self {
                cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&enc_key)),
                nonce_key: SecretBox::new(Box::new(nonce_key)),
            })
        }

        /// Build from `BASTION_MASTER_KEY`; `None` when unset.
        pub fn from_env() -> Result<Option<Self>, BastionError> {
            match std::env::var(MASTER_KEY_ENV) {
                Ok(value) => Self::from_master_key(&SecretString::from(value)).map(Some),
                Err(_) => Ok(None),
            }
        }

        fn nonce_for(&self, plain: &str) -> [u8; NONCE_LEN] {
            let mut hasher = Sha256::new();
            hasher.update(self.nonce_key.expose_secret());
            hasher.update(plain.as_bytes());
            let digest = hasher.finalize();
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&digest[..NONCE_LEN]);
            nonce
        }
    }

    impl FieldProtector for AesGcmProtector {
        fn protect(&self, plain: &str) -> Result<String, BastionError> {
            let nonce = self.nonce_for(plain);
            let ciphertext = self
                .cipher
                .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
                .map_err(|e| BastionError::Protection(format!("encrypt: {e}")))?;
            let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(STANDARD.encode(out))
        }

        fn reveal(&self, stored: &str) -> Result<String, BastionError> {
            let raw = STANDARD
                .decode(stored)
                .map_err(|e| BastionError::Protection(format!("decode: {e}")))?;
            if raw.len() <= NONCE_LEN {
                return Err(BastionError::Protection("ciphertext too short".to_owned()));
            }
            let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
            let plain = self
                .cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|e| BastionError::Protection(format!("decrypt: {e}")))?;
            String::from_utf8(plain).map_err(|e| BastionError::Protection(e.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn protector() -> AesGcmProtector {
            AesGcmProtector::from_master_key(&SecretString::from(
                "correct horse battery staple".to_owned(),
            ))
            .unwrap()
        }

        #[test]
        fn protect_reveal_restores_plaintext() {
            let p = protector();
            let stored = p.protect("alice").unwrap();
            assert_ne!(stored, "alice");
            assert_eq!(p.reveal(&stored).unwrap(), "alice");
        }

        #[test]
        fn equal_plaintexts_protect_equally() {
            let p = protector();
            assert_eq!(p.protect("true").unwrap(), p.protect("true").unwrap());
            assert_ne!(p.protect("true").unwrap(), p.protect("false").unwrap());
        }

        #[test]
        fn tampered_ciphertext_is_rejected() {
            let p = protector();
            let mut raw = STANDARD.decode(p.protect("alice").unwrap()).unwrap();
            let last = raw.len() - 1;
            raw[last] ^= 0x01;
            let err = p.reveal(&STANDARD.encode(raw)).unwrap_err();
            assert!(matches!(err, BastionError::Protection(_)));
        }

        #[test]
        fn short_master_key_rejected() {
            let err = AesGcmProtector::from_master_key(&SecretString::from("short".to_owned()))
                .unwrap_err();
            assert!(matches!(err, BastionError::Protection(_)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values_survive_passthrough() {
        let p = PassthroughProtector;
        let stored = protect_value(&p, &true).unwrap();
        assert_eq!(stored, "true");
        assert!(reveal_value::<bool>(&p, &stored).unwrap());
    }

    #[test]
    fn unparsable_revealed_value_is_a_protection_error() {
        let err = reveal_value::<bool>(&PassthroughProtector, "maybe").unwrap_err();
        assert!(matches!(err, BastionError::Protection(_)));
    }
}
