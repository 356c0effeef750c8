//! RSA-OAEP (SHA-256) envelope for the encrypted update channel.

use std::path::Path;

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

pub const PRIVATE_KEY_FILE: &str = "private_key.pem";
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";
pub const DEFAULT_KEY_BITS: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("key generation failed: {0}")]
    Generate(String),
}

fn read_pem(path: &Path) -> Result<String, CryptoError> {
    std::fs::read_to_string(path).map_err(|source| CryptoError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Agent side: encrypts payloads with the server's public key.
#[derive(Debug, Clone)]
pub struct Encryptor {
    key: RsaPublicKey,
}

impl Encryptor {
    /// Accepts `RSA PUBLIC KEY` (PKCS#1) or `PUBLIC KEY` (SPKI) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path)?)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::thread_rng();
        self.key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))
    }
}

/// Server side: decrypts payloads with the private key.
#[derive(Debug, Clone)]
pub struct Decryptor {
    key: RsaPrivateKey,
}

impl Decryptor {
    /// Accepts `RSA PRIVATE KEY` (PKCS#1) or `PRIVATE KEY` (PKCS#8) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path)?)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    pub fn encryptor(&self) -> Encryptor {
        Encryptor {
            key: self.key.to_public_key(),
        }
    }
}

/// PKCS#1 PEM pair as (private, public).
pub fn generate_keypair(bits: usize) -> Result<(String, String), CryptoError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, bits).map_err(|e| CryptoError::Generate(e.to_string()))?;
    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Generate(e.to_string()))?;
    let public_pem = private
        .to_public_key()
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Generate(e.to_string()))?;
    Ok((private_pem.to_string(), public_pem))
}

/// Writes `private_key.pem` and `public_key.pem` into `dir`.
pub fn write_keypair(dir: &Path, bits: usize) -> Result<(), CryptoError> {
    let (private_pem, public_pem) = generate_keypair(bits)?;
    let write = |name: &str, contents: &str| {
        let path = dir.join(name);
        std::fs::write(&path, contents).map_err(|source| CryptoError::Read {
            path: path.display().to_string(),
            source,
        })
    };
    std::fs::create_dir_all(dir).map_err(|source| CryptoError::Read {
        path: dir.display().to_string(),
        source,
    })?;
    write(PRIVATE_KEY_FILE, &private_pem)?;
    write(PUBLIC_KEY_FILE, &public_pem)?;
    Ok(())
}
