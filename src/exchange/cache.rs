// =============================================================================
// Read-through snapshot cache for balance / position reads
// =============================================================================
//
// `get_balance` and `get_positions` may serve a snapshot up to `ttl` old;
// every successful mutation invalidates the cell. The whole value is swapped
// under one write lock, so readers see either the pre-mutation or the
// post-mutation snapshot, never a partial view.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// A single cached snapshot with a time-to-live.
pub struct TtlCell<T> {
    inner: RwLock<Option<(Instant, T)>>,
    ttl: Duration,
}

impl<T: Clone> TtlCell<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(None),
            ttl,
        }
    }

    /// Return the cached value when it is still fresh.
    pub fn get(&self) -> Option<T> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    /// Store a fresh snapshot.
    pub fn put(&self, value: T) {
        *self.inner.write() = Some((Instant::now(), value));
    }

    /// Drop the snapshot; the next read goes to the venue.
    pub fn invalidate(&self) {
        *self.inner.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cell_misses() {
        let cell: TtlCell<u32> = TtlCell::new(Duration::from_secs(10));
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn fresh_value_hits() {
        let cell = TtlCell::new(Duration::from_secs(10));
        cell.put(42u32);
        assert_eq!(cell.get(), Some(42));
    }

    #[test]
    fn invalidate_forces_miss() {
        let cell = TtlCell::new(Duration::from_secs(10));
        cell.put(42u32);
        cell.invalidate();
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn expired_value_misses() {
        let cell = TtlCell::new(Duration::from_millis(0));
        cell.put(42u32);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn put_replaces_previous() {
        let cell = TtlCell::new(Duration::from_secs(10));
        cell.put(1u32);
        cell.put(2u32);
        assert_eq!(cell.get(), Some(2));
    }
}
