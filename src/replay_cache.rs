use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;

use crate::error::AuthError;

/// How long a cshirt2 handshake public key is remembered by default, in
/// seconds.
pub(crate) const REPLAY_WINDOW_SECS: u64 = 600;

/// Remembers recently seen handshake public keys so that a replayed
/// handshake can be recognised as active probing.
///
/// One cache is shared by every connection a listener accepts. Keys are
/// hashed down to 32 bytes before they are stored.
#[derive(Debug)]
pub struct ReplayCache(Mutex<Inner>);

#[derive(Debug)]
struct Inner {
    window_secs: u64,
    keys: HashSet<[u8; 32]>,
    oldest: VecDeque<(u64, [u8; 32])>,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl ReplayCache {
    /// Creates an empty cache with room for `capacity` keys before it
    /// reallocates, remembering keys for ten minutes.
    pub fn with_capacity(capacity: usize) -> Self {
        ReplayCache(Mutex::new(Inner {
            window_secs: REPLAY_WINDOW_SECS,
            keys: HashSet::with_capacity(capacity),
            oldest: VecDeque::with_capacity(capacity),
        }))
    }

    /// Sets how long a key is remembered. Sub-second parts are ignored.
    pub fn with_window(self, window: Duration) -> Self {
        let mut inner = self.0.into_inner();
        inner.window_secs = window.as_secs();
        ReplayCache(Mutex::new(inner))
    }

    /// Records `key` as seen at `now` (Unix seconds).
    ///
    /// Returns [`AuthError::ActiveProbing`] if the key is already present.
    pub(crate) fn check_or_insert(&self, key: [u8; 32], now: u64) -> Result<(), AuthError> {
        let mut inner = self.0.lock();

        while let Some(&(seen_at, old)) = inner.oldest.front() {
            if now.saturating_sub(seen_at) < inner.window_secs {
                break;
            }
            inner.keys.remove(&old);
            inner.oldest.pop_front();
        }

        if !inner.keys.insert(key) {
            return Err(AuthError::ActiveProbing);
        }
        inner.oldest.push_back((now, key));
        Ok(())
    }
}
