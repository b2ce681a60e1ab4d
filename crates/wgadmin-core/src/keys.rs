//! `WireGuard` key types and the stateless key service.
//!
//! `WireGuard` uses Curve25519 for key exchange. Keys are 32 bytes and are
//! exchanged as 44-character base64 strings in tunnel files and at the
//! public API boundary, and as lowercase hex on the control socket.

use std::fmt;

use base64::Engine;
use rand::RngCore;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::InvalidKeyError;

/// `WireGuard` key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

/// Length of a key in its base64 form.
pub const KEY_BASE64_LEN: usize = 44;

fn decode_base64(s: &str) -> Result<[u8; KEY_SIZE], InvalidKeyError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| InvalidKeyError::InvalidBase64(e.to_string()))?;
    to_array(&bytes)
}

fn decode_hex(s: &str) -> Result<[u8; KEY_SIZE], InvalidKeyError> {
    let bytes = hex::decode(s.trim()).map_err(|e| InvalidKeyError::InvalidHex(e.to_string()))?;
    to_array(&bytes)
}

fn to_array(bytes: &[u8]) -> Result<[u8; KEY_SIZE], InvalidKeyError> {
    <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| InvalidKeyError::InvalidLength(bytes.len()))
}

/// A `WireGuard` public key (Curve25519, 32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a public key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidKeyError> {
        to_array(bytes).map(Self)
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a public key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, InvalidKeyError> {
        decode_base64(s).map(Self)
    }

    /// Encodes the key as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decodes a public key from hex.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid hex or wrong length.
    pub fn from_hex(s: &str) -> Result<Self, InvalidKeyError> {
        decode_hex(s).map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        let short = &b64[..8.min(b64.len())];
        write!(f, "PublicKey({short}...)")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self::from_bytes_array(*key.as_bytes())
    }
}

/// A `WireGuard` private key (Curve25519, 32 bytes). Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a new random private key.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self(secret.to_bytes())
    }

    /// Creates a private key from a 32-byte array.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a private key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidKeyError> {
        to_array(bytes).map(Self)
    }

    /// Returns the raw bytes of the private key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        let public = X25519PublicKey::from(&secret);
        PublicKey::from(public)
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a private key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, InvalidKeyError> {
        decode_base64(s).map(Self)
    }

    /// Encodes the key as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decodes a private key from hex.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid hex or wrong length.
    pub fn from_hex(s: &str) -> Result<Self, InvalidKeyError> {
        decode_hex(s).map(Self)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

/// A `WireGuard` preshared key (symmetric, 32 bytes). Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; KEY_SIZE]);

impl PresharedKey {
    /// Generates a new random preshared key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Creates a preshared key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidKeyError> {
        to_array(bytes).map(Self)
    }

    /// Returns the raw bytes of the preshared key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a preshared key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, InvalidKeyError> {
        decode_base64(s).map(Self)
    }

    /// Encodes the key as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decodes a preshared key from hex.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid hex or wrong length.
    pub fn from_hex(s: &str) -> Result<Self, InvalidKeyError> {
        decode_hex(s).map(Self)
    }

    /// Returns true for the all-zero key, which the control protocol uses
    /// to mean "no preshared key".
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&[0u8; KEY_SIZE]).into()
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresharedKey").field("key", &"[REDACTED]").finish()
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PresharedKey {}

/// A matched private/public pair, as base64 strings.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct KeyPair {
    /// Private key, base64.
    pub private_key: String,
    /// Public key, base64.
    pub public_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generates a new private key, base64-encoded.
#[must_use]
pub fn generate_private_key() -> String {
    PrivateKey::generate().to_base64()
}

/// Derives the base64 public key for a base64 private key.
///
/// # Errors
///
/// Returns `InvalidKeyError` if `private_key` is not 32 bytes of base64.
pub fn derive_public_key(private_key: &str) -> Result<String, InvalidKeyError> {
    Ok(PrivateKey::from_base64(private_key)?.public_key().to_base64())
}

/// Generates a new preshared key, base64-encoded.
#[must_use]
pub fn generate_preshared_key() -> String {
    PresharedKey::generate().to_base64()
}

/// Generates a matched private/public pair.
#[must_use]
pub fn generate_key_pair() -> KeyPair {
    let private = PrivateKey::generate();
    KeyPair {
        public_key: private.public_key().to_base64(),
        private_key: private.to_base64(),
    }
}
