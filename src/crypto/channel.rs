//! Stateful data channel
//!
//! Owns at most two key sets: the current one, used for every encrypt, and
//! a retiring one that keeps decrypting in-flight frames for a grace period
//! after a re-key.

use super::{CryptoBox, CryptoError, Frame, KeyId, KeySet, ReplayWindow};
use std::time::{Duration, Instant};

/// Outbound sequence after which a re-key is requested
pub const SEQUENCE_SOFT_LIMIT: u32 = 0xFF00_0000;

/// One installed key set and its direction state
struct KeyEpoch {
    crypto: CryptoBox,
    next_sequence: u64,
    replay: ReplayWindow,
    installed_at: Instant,
    retired_at: Option<Instant>,
    packets_out: u64,
    bytes_out: u64,
}

impl KeyEpoch {
    fn new(key_id: KeyId, keys: KeySet, now: Instant) -> Self {
        Self {
            crypto: CryptoBox::new(key_id, keys),
            next_sequence: 0,
            replay: ReplayWindow::new(),
            installed_at: now,
            retired_at: None,
            packets_out: 0,
            bytes_out: 0,
        }
    }

    fn info(&self, now: Instant) -> KeySlotInfo {
        KeySlotInfo {
            key_id: self.crypto.key_id(),
            next_sequence: self.next_sequence,
            packets_out: self.packets_out,
            bytes_out: self.bytes_out,
            age: now.saturating_duration_since(self.installed_at),
            retiring: self.retired_at.is_some(),
        }
    }
}

/// Snapshot of an installed key set's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlotInfo {
    pub key_id: KeyId,
    pub next_sequence: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub age: Duration,
    pub retiring: bool,
}

/// Data channel crypto state of one session
pub struct DataChannel {
    current: Option<KeyEpoch>,
    retiring: Option<KeyEpoch>,
    replay_protection: bool,
    grace: Duration,
}

impl DataChannel {
    pub fn new(replay_protection: bool, grace: Duration) -> Self {
        Self {
            current: None,
            retiring: None,
            replay_protection,
            grace,
        }
    }

    /// Make `keys` current for all subsequent encrypts
    ///
    /// The previous current key set becomes the retiring one; an older
    /// retiring key set is dropped.
    pub fn install(&mut self, key_id: KeyId, keys: KeySet, now: Instant) {
        let previous = self.current.replace(KeyEpoch::new(key_id, keys, now));
        if let Some(mut previous) = previous {
            if previous.crypto.key_id() == key_id {
                tracing::warn!(%key_id, "re-installed key id, previous key set dropped");
            } else {
                previous.retired_at = Some(now);
                if let Some(old) = self.retiring.replace(previous) {
                    tracing::debug!(key_id = %old.crypto.key_id(), "dropping superseded retiring key set");
                }
            }
        }
        tracing::info!(%key_id, retiring = ?self.retiring_key_id(), "data channel keys installed");
    }

    pub fn current_key_id(&self) -> Option<KeyId> {
        self.current.as_ref().map(|e| e.crypto.key_id())
    }

    pub fn retiring_key_id(&self) -> Option<KeyId> {
        self.retiring.as_ref().map(|e| e.crypto.key_id())
    }

    pub fn is_keyed(&self) -> bool {
        self.current.is_some()
    }

    /// Encrypt under the current key set with the next sequence number
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Frame, CryptoError> {
        let epoch = self.current.as_mut().ok_or(CryptoError::NoActiveKey)?;
        if epoch.next_sequence > u64::from(u32::MAX) {
            return Err(CryptoError::SequenceExhausted(epoch.crypto.key_id().value()));
        }
        let sequence = epoch.next_sequence as u32;
        let frame = epoch.crypto.seal(sequence, plaintext)?;
        epoch.next_sequence += 1;
        epoch.packets_out += 1;
        epoch.bytes_out += plaintext.len() as u64;
        Ok(frame)
    }

    /// Authenticate, replay-check and decrypt a frame
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (key_id, _) = Frame::peek(frame)?;
        let replay_protection = self.replay_protection;
        let epoch = self.epoch_mut(key_id).ok_or(CryptoError::UnknownKey(key_id.value()))?;

        let sequence = epoch.crypto.authenticate(frame)?;
        if replay_protection && !epoch.replay.check(sequence) {
            return Err(CryptoError::Replay(sequence));
        }
        let plaintext = epoch.crypto.decrypt_authenticated(frame)?;
        if replay_protection {
            epoch.replay.mark(sequence);
        }
        Ok(plaintext)
    }

    fn epoch_mut(&mut self, key_id: KeyId) -> Option<&mut KeyEpoch> {
        if self.current.as_ref().map(|e| e.crypto.key_id()) == Some(key_id) {
            return self.current.as_mut();
        }
        self.retiring
            .as_mut()
            .filter(|e| e.crypto.key_id() == key_id)
    }

    /// Whether the current key set is close to exhausting its sequence space
    pub fn needs_rekey(&self) -> bool {
        self.current
            .as_ref()
            .map(|e| e.next_sequence >= u64::from(SEQUENCE_SOFT_LIMIT))
            .unwrap_or(false)
    }

    /// Drop the retiring key set on explicit confirmation
    pub fn retire_previous(&mut self) -> Option<KeyId> {
        let retired = self.retiring.take().map(|e| e.crypto.key_id());
        if let Some(key_id) = retired {
            tracing::info!(%key_id, "retiring key set dropped");
        }
        retired
    }

    /// Drop the retiring key set once its grace period has elapsed
    pub fn expire_retiring(&mut self, now: Instant) -> Option<KeyId> {
        let expired = self
            .retiring
            .as_ref()
            .and_then(|e| e.retired_at)
            .map(|at| now.saturating_duration_since(at) >= self.grace)
            .unwrap_or(false);
        if expired {
            self.retire_previous()
        } else {
            None
        }
    }

    /// Drop every key set
    pub fn clear(&mut self) {
        self.current = None;
        self.retiring = None;
    }

    pub fn current_info(&self, now: Instant) -> Option<KeySlotInfo> {
        self.current.as_ref().map(|e| e.info(now))
    }

    pub fn retiring_info(&self, now: Instant) -> Option<KeySlotInfo> {
        self.retiring.as_ref().map(|e| e.info(now))
    }

    #[cfg(test)]
    pub(crate) fn force_next_sequence(&mut self, next: u64) {
        if let Some(epoch) = self.current.as_mut() {
            epoch.next_sequence = next;
        }
    }
}
