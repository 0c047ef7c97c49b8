//! Encryption capability used by the packager.
//!
//! The packager only sees the [`Cipher`] trait. Two implementations ship:
//! an in-process ChaCha20-Poly1305 cipher keyed from a key file, and an
//! adapter that drives `gpg` for users who keep their keys in a keyring.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::debug;

/// Reference to key material: a key file path for the built-in cipher, a
/// recipient id for gpg
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRef(String);

impl KeyRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encrypt/decrypt capability
pub trait Cipher: Send + Sync {
    /// Short name recorded in artifact headers
    fn name(&self) -> &'static str;

    fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> Result<Vec<u8>>;
}

/// Which cipher implementation a target uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherBackend {
    #[default]
    Builtin,
    Gpg,
}

/// Instantiate the configured cipher
pub fn cipher_for(backend: CipherBackend) -> Result<Arc<dyn Cipher>> {
    match backend {
        #[cfg(feature = "encryption")]
        CipherBackend::Builtin => Ok(Arc::new(ChaChaCipher)),
        #[cfg(not(feature = "encryption"))]
        CipherBackend::Builtin => Err(Error::Configuration {
            reason: "built-in encryption requires the `encryption` feature".to_string(),
        }),
        CipherBackend::Gpg => Ok(Arc::new(GpgCipher::default())),
    }
}

#[cfg(feature = "encryption")]
pub use self::chacha::ChaChaCipher;

#[cfg(feature = "encryption")]
mod chacha {
    use super::{Cipher, KeyRef};
    use crate::{Error, Result};
    use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
    use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
    use std::fs;
    use std::path::Path;
    use zeroize::Zeroize;

    const KEY_CONTEXT: &str = "autostash 2024-05 artifact payload key";
    const NONCE_LEN: usize = 12;

    /// ChaCha20-Poly1305 with a key derived from a key file.
    ///
    /// Ciphertext layout is `nonce(12) | sealed bytes`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ChaChaCipher;

    impl ChaChaCipher {
        /// Write a fresh random key file
        pub fn generate_key_file<P: AsRef<Path>>(path: P) -> Result<KeyRef> {
            let path = path.as_ref();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut key = ChaCha20Poly1305::generate_key(&mut OsRng);
            fs::write(path, key.as_slice())?;
            key.as_mut_slice().zeroize();
            Ok(KeyRef::new(path.to_string_lossy()))
        }

        fn load(key: &KeyRef) -> Result<ChaCha20Poly1305> {
            let mut material = fs::read(key.as_str()).map_err(|e| Error::Crypto {
                reason: format!("Cannot read key file {}: {}", key, e),
            })?;
            if material.is_empty() {
                return Err(Error::Crypto {
                    reason: format!("Key file {} is empty", key),
                });
            }
            let mut derived = blake3::derive_key(KEY_CONTEXT, &material);
            material.zeroize();
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&derived));
            derived.zeroize();
            Ok(cipher)
        }
    }

    impl Cipher for ChaChaCipher {
        fn name(&self) -> &'static str {
            "chacha20poly1305"
        }

        fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> Result<Vec<u8>> {
            let cipher = Self::load(key)?;
            let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
            let sealed = cipher.encrypt(&nonce, plaintext).map_err(|_| Error::Crypto {
                reason: "encryption failed".to_string(),
            })?;

            let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
            out.extend_from_slice(nonce.as_slice());
            out.extend_from_slice(&sealed);
            Ok(out)
        }

        fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> Result<Vec<u8>> {
            if ciphertext.len() < NONCE_LEN {
                return Err(Error::Crypto {
                    reason: "ciphertext shorter than its nonce".to_string(),
                });
            }
            let cipher = Self::load(key)?;
            let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| Error::Crypto {
                    reason: "decryption failed: wrong key or corrupt ciphertext".to_string(),
                })
        }
    }
}

/// Adapter over the `gpg` binary. The key reference is the recipient.
#[derive(Debug, Clone)]
pub struct GpgCipher {
    program: String,
}

impl Default for GpgCipher {
    fn default() -> Self {
        Self {
            program: "gpg".to_string(),
        }
    }
}

impl GpgCipher {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
        debug!("Running {} {}", self.program, args.join(" "));
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Crypto {
                reason: format!("Failed to start {}: {}", self.program, e),
            })?;

        // Feed stdin from a separate thread so a full stdout pipe cannot deadlock us
        let mut stdin = child.stdin.take().ok_or_else(|| Error::Crypto {
            reason: "gpg stdin unavailable".to_string(),
        })?;
        let input = input.to_vec();
        let writer = std::thread::spawn(move || stdin.write_all(&input));

        let output = child.wait_with_output()?;
        match writer.join() {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Crypto {
                    reason: "gpg input writer panicked".to_string(),
                })
            }
        }

        if !output.status.success() {
            return Err(Error::Crypto {
                reason: format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }
}

impl Cipher for GpgCipher {
    fn name(&self) -> &'static str {
        "gpg"
    }

    fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> Result<Vec<u8>> {
        self.run(
            &[
                "--batch",
                "--yes",
                "--trust-model",
                "always",
                "--encrypt",
                "--recipient",
                key.as_str(),
                "--output",
                "-",
            ],
            plaintext,
        )
    }

    fn decrypt(&self, ciphertext: &[u8], _key: &KeyRef) -> Result<Vec<u8>> {
        self.run(&["--batch", "--yes", "--decrypt", "--output", "-"], ciphertext)
    }
}

#[cfg(all(test, feature = "encryption"))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_chacha_roundtrip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let key = ChaChaCipher::generate_key_file(temp_dir.path().join("key"))?;
        let cipher = ChaChaCipher;

        let sealed = cipher.encrypt(b"secret notes", &key)?;
        assert_ne!(&sealed[12..], b"secret notes");
        assert_eq!(cipher.decrypt(&sealed, &key)?, b"secret notes");
        Ok(())
    }

    #[test]
    fn test_chacha_rejects_wrong_key_and_tampering() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let key = ChaChaCipher::generate_key_file(temp_dir.path().join("key"))?;
        let other = ChaChaCipher::generate_key_file(temp_dir.path().join("other"))?;
        let cipher = ChaChaCipher;

        let mut sealed = cipher.encrypt(b"payload", &key)?;
        assert!(matches!(cipher.decrypt(&sealed, &other), Err(Error::Crypto { .. })));

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(cipher.decrypt(&sealed, &key), Err(Error::Crypto { .. })));

        let missing = KeyRef::new(temp_dir.path().join("absent").to_string_lossy());
        assert!(matches!(cipher.encrypt(b"x", &missing), Err(Error::Crypto { .. })));
        Ok(())
    }
}
