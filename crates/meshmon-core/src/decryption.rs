//! Server-side channel decryption
//!
//! The engine walks enabled registry entries in ascending sort order and stops
//! at the first key whose plaintext decodes as a well-formed `Data` message
//! with a recognised, non-zero port. A key that produces garbage is simply a
//! miss; nothing here aborts iteration early.

use prost::Message;
use tracing::{debug, trace};

use crate::crypto::{channel_hash, decrypt_payload};
use crate::packet_log::DecryptionTag;
use crate::protocol::schema::{Data, PortNum};
use crate::registry::{ChannelKeyEntry, EntryId};
use crate::types::NodeNum;

// ----------------------------------------------------------------------------
// Inputs and Outcomes
// ----------------------------------------------------------------------------

/// Ciphertext plus the header fields the cipher and pre-filter need
#[derive(Debug, Clone, Copy)]
pub struct EncryptedPayload<'a> {
    pub from: NodeNum,
    pub packet_id: u32,
    /// Channel hash declared by the packet
    pub channel_hash: u8,
    pub ciphertext: &'a [u8],
}

/// Result of trying a single entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// Name validation is enforced and the channel hash did not match
    SkippedNameMismatch,
    /// The cipher could not run with this key
    CipherError,
    /// Plaintext did not decode as a valid `Data` message
    StructurallyInvalid,
    Matched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAttempt {
    pub entry: EntryId,
    pub result: AttemptResult,
}

/// Everything the engine did for one packet
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptionOutcome {
    /// Entries in the order they were considered, including skipped ones
    pub attempts: Vec<KeyAttempt>,
    /// Winning entry and the recovered message
    pub matched: Option<(EntryId, Data)>,
}

impl DecryptionOutcome {
    pub fn tag(&self) -> DecryptionTag {
        match &self.matched {
            Some((entry, _)) => DecryptionTag::Registry(*entry),
            None => DecryptionTag::Undecryptable,
        }
    }

    /// Entries whose key was actually run against the ciphertext
    pub fn decrypted_with(&self) -> Vec<EntryId> {
        self.attempts
            .iter()
            .filter(|a| a.result != AttemptResult::SkippedNameMismatch)
            .map(|a| a.entry)
            .collect()
    }

    /// Entries excluded by the channel-hash pre-filter
    pub fn skipped(&self) -> Vec<EntryId> {
        self.attempts
            .iter()
            .filter(|a| a.result == AttemptResult::SkippedNameMismatch)
            .map(|a| a.entry)
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Ordered trial decryption over registry entries
pub struct DecryptionEngine;

impl DecryptionEngine {
    /// Try `entries` in order; `entries` must already be the enabled entries
    /// sorted by priority (see `ChannelKeyRegistry::enabled_in_order`)
    ///
    /// Does not credit usage counters; callers credit the winner once the
    /// packet's tag is committed.
    pub fn attempt(entries: &[ChannelKeyEntry], payload: &EncryptedPayload<'_>) -> DecryptionOutcome {
        let mut attempts = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.enforce_name_validation
                && channel_hash(&entry.name, entry.key()) != payload.channel_hash
            {
                trace!(entry = %entry.id, "Channel hash mismatch, key skipped");
                attempts.push(KeyAttempt {
                    entry: entry.id,
                    result: AttemptResult::SkippedNameMismatch,
                });
                continue;
            }

            let plaintext = match decrypt_payload(
                entry.key(),
                payload.packet_id,
                payload.from,
                payload.ciphertext,
            ) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    debug!(entry = %entry.id, error = %e, "Cipher failed");
                    attempts.push(KeyAttempt {
                        entry: entry.id,
                        result: AttemptResult::CipherError,
                    });
                    continue;
                }
            };

            match validate_plaintext(&plaintext) {
                Some(data) => {
                    attempts.push(KeyAttempt {
                        entry: entry.id,
                        result: AttemptResult::Matched,
                    });
                    debug!(
                        entry = %entry.id,
                        from = %payload.from,
                        packet_id = payload.packet_id,
                        "Packet decrypted with registry key"
                    );
                    return DecryptionOutcome {
                        attempts,
                        matched: Some((entry.id, data)),
                    };
                }
                None => attempts.push(KeyAttempt {
                    entry: entry.id,
                    result: AttemptResult::StructurallyInvalid,
                }),
            }
        }

        DecryptionOutcome {
            attempts,
            matched: None,
        }
    }
}

/// Accept plaintext only if it is a `Data` message with a known, non-zero port
pub fn validate_plaintext(plaintext: &[u8]) -> Option<Data> {
    let data = Data::decode(plaintext).ok()?;
    match PortNum::try_from(data.portnum) {
        Ok(PortNum::UnknownApp) | Err(_) => None,
        Ok(_) => Some(data),
    }
}
