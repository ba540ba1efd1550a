use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// Pairing alphabet without the easily confused I, L, O, 0 and 1.
pub const CLAIM_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const CLAIM_CODE_LEN: usize = 8;
pub const CLAIM_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCode {
    pub code: String,
    pub issued_at: Instant,
}

impl ClaimCode {
    pub fn generate(now: Instant) -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CLAIM_CODE_LEN)
            .map(|_| CLAIM_ALPHABET[rng.gen_range(0..CLAIM_ALPHABET.len())] as char)
            .collect();
        Self {
            code,
            issued_at: now,
        }
    }

    pub fn expires_in(&self, now: Instant, ttl: Duration) -> Duration {
        ttl.saturating_sub(now.saturating_duration_since(self.issued_at))
    }
}

/// Holds the current claim code and regenerates it on rotation or expiry.
#[derive(Debug)]
pub struct ClaimStore {
    current: Mutex<Option<ClaimCode>>,
    ttl: Duration,
}

impl ClaimStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            ttl,
        }
    }

    /// Returns the live code, minting a new one when asked to rotate, when
    /// none exists yet, or when the previous one expired.
    pub fn current(&self, rotate: bool) -> ClaimCode {
        self.current_at(rotate, Instant::now())
    }

    pub fn current_at(&self, rotate: bool, now: Instant) -> ClaimCode {
        let mut slot = self.current.lock();
        let stale = match slot.as_ref() {
            Some(code) => code.expires_in(now, self.ttl).is_zero(),
            None => true,
        };
        if rotate || stale {
            *slot = Some(ClaimCode::generate(now));
        }
        (*slot).clone().unwrap_or_else(|| ClaimCode::generate(now))
    }

    /// Remaining lifetime of the current code; a full TTL if none was issued.
    pub fn expires_in(&self, now: Instant) -> Duration {
        let slot = self.current.lock();
        slot.as_ref()
            .map(|code| code.expires_in(now, self.ttl))
            .unwrap_or(self.ttl)
    }
}

impl Default for ClaimStore {
    fn default() -> Self {
        Self::new(CLAIM_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_the_unambiguous_alphabet() {
        for _ in 0..64 {
            let code = ClaimCode::generate(Instant::now());
            assert_eq!(code.code.len(), CLAIM_CODE_LEN);
            assert!(code.code.bytes().all(|b| CLAIM_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn code_is_stable_until_rotated() {
        let store = ClaimStore::default();
        let now = Instant::now();
        let first = store.current_at(false, now);
        let again = store.current_at(false, now + Duration::from_secs(5));
        assert_eq!(first, again);

        let rotated = store.current_at(true, now + Duration::from_secs(6));
        assert_eq!(rotated.issued_at, now + Duration::from_secs(6));
    }

    #[test]
    fn expired_code_is_replaced_on_read() {
        let store = ClaimStore::new(Duration::from_secs(60));
        let now = Instant::now();
        let first = store.current_at(false, now);
        let later = now + Duration::from_secs(61);
        let next = store.current_at(false, later);
        assert_eq!(next.issued_at, later);
        assert_ne!(first.issued_at, next.issued_at);
        assert_eq!(store.expires_in(later), Duration::from_secs(60));
    }
}
