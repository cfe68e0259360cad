//! Channel cryptography
//!
//! Mesh channels are encrypted with AES-CTR under a pre-shared key. This
//! module expands short PSKs, computes the one-byte channel hash used to
//! pre-filter keys, builds the per-packet nonce and applies the keystream.
//! It also fingerprints node public keys for the security scanner.

use core::fmt;

use aes::{Aes128, Aes256};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ctr::cipher::{KeyIvInit, StreamCipher};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{MeshmonError, RegistryError};
use crate::types::{KeyFingerprint, NodeNum};
use crate::Result;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Well-known default channel key selected by one-byte PSKs
pub const DEFAULT_CHANNEL_KEY: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// AES-CTR nonce length
pub const NONCE_SIZE: usize = 16;

// ----------------------------------------------------------------------------
// Channel Key
// ----------------------------------------------------------------------------

/// Expanded symmetric channel key (16 or 32 bytes)
///
/// `Debug` never prints key bytes. Serialized form is standard base64.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey {
    bytes: Vec<u8>,
}

impl ChannelKey {
    /// Build a key from PSK bytes as configured on a device
    ///
    /// One-byte PSKs select a variant of the default key: `1` is the default
    /// key itself, `n` adds `n - 1` to its last byte. `0` means "no
    /// encryption" and is rejected.
    pub fn from_psk(psk: &[u8]) -> core::result::Result<Self, RegistryError> {
        match psk.len() {
            1 => {
                let index = psk[0];
                if index == 0 {
                    return Err(RegistryError::NoEncryptionKey);
                }
                let mut bytes = DEFAULT_CHANNEL_KEY.to_vec();
                bytes[15] = bytes[15].wrapping_add(index - 1);
                Ok(Self { bytes })
            }
            16 | 32 => Ok(Self {
                bytes: psk.to_vec(),
            }),
            length => Err(RegistryError::InvalidKeyLength { length }),
        }
    }

    /// Parse a base64 PSK as shown in channel URLs and device settings
    pub fn from_base64(encoded: &str) -> core::result::Result<Self, RegistryError> {
        let psk = STANDARD
            .decode(encoded.trim())
            .map_err(|_| RegistryError::InvalidKeyEncoding)?;
        Self::from_psk(&psk)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Key size in bits (128 or 256)
    pub fn bits(&self) -> usize {
        self.bytes.len() * 8
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey(<redacted>, {}-bit)", self.bits())
    }
}

impl Serialize for ChannelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        ChannelKey::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Channel Hash
// ----------------------------------------------------------------------------

/// XOR of all bytes
pub fn xor_hash(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// One-byte channel hash a packet declares for its channel name and key
pub fn channel_hash(name: &str, key: &ChannelKey) -> u8 {
    xor_hash(name.as_bytes()) ^ xor_hash(key.as_bytes())
}

// ----------------------------------------------------------------------------
// Payload Encryption
// ----------------------------------------------------------------------------

/// Per-packet nonce: packet id (u64 LE), sender (u32 LE), four zero bytes
pub fn packet_nonce(packet_id: u32, from: NodeNum) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    nonce[8..12].copy_from_slice(&from.value().to_le_bytes());
    nonce
}

/// Apply the AES-CTR keystream in place; encryption and decryption are the
/// same operation
pub fn apply_keystream(key: &ChannelKey, nonce: &[u8; NONCE_SIZE], buffer: &mut [u8]) -> Result<()> {
    let invalid = |_| MeshmonError::crypto_error("cipher rejected key length");
    match key.as_bytes().len() {
        16 => {
            let mut cipher = Aes128Ctr::new_from_slices(key.as_bytes(), nonce).map_err(invalid)?;
            cipher.apply_keystream(buffer);
        }
        32 => {
            let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), nonce).map_err(invalid)?;
            cipher.apply_keystream(buffer);
        }
        length => {
            return Err(MeshmonError::Registry(RegistryError::InvalidKeyLength {
                length,
            }))
        }
    }
    Ok(())
}

/// Decrypt a channel payload sent by `from` with the given packet id
pub fn decrypt_payload(
    key: &ChannelKey,
    packet_id: u32,
    from: NodeNum,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let mut buffer = ciphertext.to_vec();
    apply_keystream(key, &packet_nonce(packet_id, from), &mut buffer)?;
    Ok(buffer)
}

/// Encrypt a channel payload the way a sending node does
pub fn encrypt_payload(
    key: &ChannelKey,
    packet_id: u32,
    from: NodeNum,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    decrypt_payload(key, packet_id, from, plaintext)
}

// ----------------------------------------------------------------------------
// Public Key Fingerprints
// ----------------------------------------------------------------------------

/// Generate a SHA-256 fingerprint from a node's public key
pub fn key_fingerprint<T: AsRef<[u8]>>(public_key: T) -> KeyFingerprint {
    KeyFingerprint::of_key(public_key.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_expansion() {
        let key = ChannelKey::from_psk(&[1]).unwrap();
        assert_eq!(key.as_bytes(), &DEFAULT_CHANNEL_KEY);

        let key = ChannelKey::from_psk(&[3]).unwrap();
        assert_eq!(key.as_bytes()[15], 0x03);
        assert_eq!(&key.as_bytes()[..15], &DEFAULT_CHANNEL_KEY[..15]);
    }

    #[test]
    fn test_invalid_psks_rejected() {
        assert_eq!(
            ChannelKey::from_psk(&[0]).unwrap_err(),
            RegistryError::NoEncryptionKey
        );
        assert_eq!(
            ChannelKey::from_psk(&[1, 2, 3]).unwrap_err(),
            RegistryError::InvalidKeyLength { length: 3 }
        );
        assert_eq!(
            ChannelKey::from_base64("not base64!").unwrap_err(),
            RegistryError::InvalidKeyEncoding
        );
    }

    #[test]
    fn test_default_channel_hash() {
        // Default "LongFast" channel with the default key hashes to 8
        let key = ChannelKey::from_base64("AQ==").unwrap();
        assert_eq!(channel_hash("LongFast", &key), 8);
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = packet_nonce(0x01020304, NodeNum::new(0xaabbccdd));
        assert_eq!(
            nonce,
            [
                0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0, 0xdd, 0xcc, 0xbb, 0xaa, 0, 0, 0, 0
            ]
        );
    }

    #[test]
    fn test_keystream_roundtrip_both_key_sizes() {
        let from = NodeNum::new(0x1234);
        for key in [
            ChannelKey::from_psk(&[7u8; 16]).unwrap(),
            ChannelKey::from_psk(&[9u8; 32]).unwrap(),
        ] {
            let ciphertext = encrypt_payload(&key, 99, from, b"mesh payload").unwrap();
            assert_ne!(ciphertext, b"mesh payload");
            let plaintext = decrypt_payload(&key, 99, from, &ciphertext).unwrap();
            assert_eq!(plaintext, b"mesh payload");
        }
    }

    #[test]
    fn test_nonce_binds_sender_and_packet() {
        let key = ChannelKey::from_psk(&[1]).unwrap();
        let a = encrypt_payload(&key, 1, NodeNum::new(1), b"same").unwrap();
        let b = encrypt_payload(&key, 2, NodeNum::new(1), b"same").unwrap();
        let c = encrypt_payload(&key, 1, NodeNum::new(2), b"same").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = ChannelKey::from_psk(&[0xAB; 16]).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.to_lowercase().contains("ab"));
        assert!(rendered.contains("128-bit"));
    }

    #[test]
    fn test_key_serde_as_base64() {
        let key = ChannelKey::from_psk(&[5u8; 16]).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_base64()));
        let back: ChannelKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
