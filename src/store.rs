use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Clock used for expiry checks. Injectable so tests can advance time
/// without sleeping.
pub type Nower = Box<dyn Fn() -> Instant + Send + Sync>;

struct ValueEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }
}

/// In-memory key-value store with per-key millisecond expiry. Readers share
/// a read permit; writers take an exclusive one. Operations never suspend.
pub struct Store {
    data: RwLock<HashMap<Bytes, ValueEntry>>,
    nower: Nower,
}

impl Store {
    pub fn new() -> Self {
        Self::with_nower(Box::new(Instant::now))
    }

    pub fn with_nower(nower: Nower) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            nower,
        }
    }

    /// Unconditional overwrite. A supplied expiry replaces any previous one;
    /// omitting it clears it.
    pub fn set(&self, key: Bytes, value: Bytes, expiry_ms: Option<u64>) {
        let expires_at = expiry_ms.map(|ms| (self.nower)() + Duration::from_millis(ms));
        self.data
            .write()
            .unwrap()
            .insert(key, ValueEntry { value, expires_at });
    }

    /// Expired entries answer as absent and are removed opportunistically.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let now = (self.nower)();
        {
            let data = self.data.read().unwrap();
            match data.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        self.remove_if_expired(key, now);
        None
    }

    pub fn delete(&self, key: &[u8]) {
        self.data.write().unwrap().remove(key);
    }

    fn remove_if_expired(&self, key: &[u8], now: Instant) {
        let mut data = self.data.write().unwrap();
        // Re-check under the write permit: the key may have been overwritten
        // since the read permit was released.
        if data.get(key).is_some_and(|entry| entry.is_expired(now)) {
            data.remove(key);
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_clock::TestClock;
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = Store::new();
        store.set(b("hello"), b("world"), None);
        assert_eq!(store.get(b"hello"), Some(b("world")));
        assert_eq!(store.get(b"missing"), None);
    }

    #[test]
    fn duplicate_keys_overwrite() {
        let store = Store::new();
        store.set(b("k"), b("one"), None);
        store.set(b("k"), b("two"), None);
        assert_eq!(store.get(b"k"), Some(b("two")));
    }

    #[test]
    fn delete_removes_the_entry() {
        let store = Store::new();
        store.set(b("k"), b("v"), None);
        store.delete(b"k");
        assert_eq!(store.get(b"k"), None);
    }

    #[test]
    fn px_expiry_is_readable_before_and_gone_after() {
        let clock = TestClock::new();
        let store = Store::with_nower(clock.nower());

        store.set(b("hello"), b("world"), Some(3000));
        clock.advance(Duration::from_millis(2999));
        assert_eq!(store.get(b"hello"), Some(b("world")));

        clock.advance(Duration::from_millis(2));
        assert_eq!(store.get(b"hello"), None);
    }

    #[test]
    fn expired_entries_are_removed_on_read() {
        let clock = TestClock::new();
        let store = Store::with_nower(clock.nower());

        store.set(b("k"), b("v"), Some(10));
        clock.advance(Duration::from_millis(11));
        assert_eq!(store.get(b"k"), None);
        assert!(!store.data.read().unwrap().contains_key(b"k".as_slice()));
    }

    #[test]
    fn overwrite_without_expiry_clears_the_old_one() {
        let clock = TestClock::new();
        let store = Store::with_nower(clock.nower());

        store.set(b("k"), b("v"), Some(10));
        store.set(b("k"), b("v2"), None);
        clock.advance(Duration::from_millis(100));
        assert_eq!(store.get(b"k"), Some(b("v2")));
    }
}
