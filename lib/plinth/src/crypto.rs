//! Cryptographic surface of the platform: an RSA key exchange used to agree a
//! symmetric key, and AES-256 block encryption applied to package bodies.
//!
//! The symmetric side encrypts each 16-byte block independently with zero
//! padding, and the plaintext length travels in the package header, so padding
//! bytes are simply ignored on decrypt. Independent-block mode leaks equal
//! plaintext blocks to an observer; the cipher sits behind
//! [`AesBlockCipher::encrypt_blocks`]/[`AesBlockCipher::decrypt_blocks`] so a
//! chained mode can replace it without touching any caller.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::Oaep;
use sha2::Sha256;

pub const AES_KEY_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;
pub const RSA_MODULUS_BITS: usize = 1024;

/// Opaque failure of a cryptographic operation. The cause is deliberately not
/// surfaced; callers treat any failure as a hard protocol error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CryptoError;

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Returns the on-wire length of a plaintext of `plain_length` bytes, rounded
/// up to a whole number of AES blocks.
#[inline]
pub fn aes_cipher_length(plain_length: usize) -> usize {
    let over = plain_length % AES_BLOCK_SIZE;
    match over {
        0 => plain_length,
        _ => plain_length + AES_BLOCK_SIZE - over,
    }
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// AES-256 key. Lives only in process memory.
#[derive(Clone)]
pub struct AesKey([u8; AES_KEY_SIZE]);

impl AesKey {
    /// Generates a fresh random key.
    #[inline]
    pub fn random() -> AesKey {
        let mut key = [0u8; AES_KEY_SIZE];
        random_bytes(&mut key);
        AesKey(key)
    }

    /// Builds a key from raw bytes. Fails if the slice is not exactly
    /// `AES_KEY_SIZE` bytes.
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<AesKey> {
        if bytes.len() != AES_KEY_SIZE {
            return Err(CryptoError);
        }

        let mut key = [0u8; AES_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(AesKey(key))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Block-at-a-time AES-256 cipher over a fixed key.
pub struct AesBlockCipher {
    cipher: Aes256,
}

impl AesBlockCipher {
    #[inline]
    pub fn new(key: &AesKey) -> AesBlockCipher {
        AesBlockCipher {
            cipher: Aes256::new(GenericArray::from_slice(&key.0)),
        }
    }

    /// Encrypts `data` in place. The length must be a multiple of
    /// `AES_BLOCK_SIZE`.
    #[inline]
    pub fn encrypt_blocks(&self, data: &mut [u8]) {
        debug_assert!(data.len() % AES_BLOCK_SIZE == 0);

        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    /// Decrypts `data` in place. The length must be a multiple of
    /// `AES_BLOCK_SIZE`.
    #[inline]
    pub fn decrypt_blocks(&self, data: &mut [u8]) {
        debug_assert!(data.len() % AES_BLOCK_SIZE == 0);

        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
    }
}

/// RSA public key handle. Serialized as DER (SPKI) on the wire.
#[derive(Clone)]
pub struct RsaPublicKey(rsa::RsaPublicKey);

impl RsaPublicKey {
    pub fn to_der(&self) -> CryptoResult<Vec<u8>> {
        self.0
            .to_public_key_der()
            .map(|der| der.as_bytes().to_vec())
            .map_err(|_| CryptoError)
    }

    pub fn from_der(der: &[u8]) -> CryptoResult<RsaPublicKey> {
        rsa::RsaPublicKey::from_public_key_der(der)
            .map(RsaPublicKey)
            .map_err(|_| CryptoError)
    }

    /// OAEP-SHA256 encryption of a short plaintext (a symmetric key).
    pub fn encrypt(&self, plain: &[u8]) -> CryptoResult<Vec<u8>> {
        self.0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plain)
            .map_err(|_| CryptoError)
    }
}

/// RSA private key handle. Discarded as soon as the wrapped symmetric key has
/// been recovered.
pub struct RsaPrivateKey(rsa::RsaPrivateKey);

impl RsaPrivateKey {
    /// OAEP-SHA256 decryption, inverse of [`RsaPublicKey::encrypt`].
    pub fn decrypt(&self, cipher: &[u8]) -> CryptoResult<Vec<u8>> {
        self.0
            .decrypt(Oaep::new::<Sha256>(), cipher)
            .map_err(|_| CryptoError)
    }
}

pub struct RsaKeyPair {
    pub public: RsaPublicKey,
    pub private: RsaPrivateKey,
}

/// Generates a fresh RSA key pair with the default modulus size.
pub fn generate_rsa_key_pair() -> CryptoResult<RsaKeyPair> {
    let private = rsa::RsaPrivateKey::new(&mut OsRng, RSA_MODULUS_BITS).map_err(|_| CryptoError)?;
    let public = rsa::RsaPublicKey::from(&private);

    Ok(RsaKeyPair {
        public: RsaPublicKey(public),
        private: RsaPrivateKey(private),
    })
}
