//! Pooled sensitive buffers, zeroed before release.
//!
//! Key material and passwords pass through short-lived byte buffers. The
//! pool keeps a bounded number of them around for reuse and guarantees two
//! things: a buffer returned to the pool is zeroed first, and `purge()`
//! zeroes and frees everything still retained. The mount driver installs
//! the pool before initializing the encrypted root and purges it during
//! teardown.

use std::sync::OnceLock;

use parking_lot::Mutex;
use zeroize::{Zeroize, Zeroizing};

static POOL: OnceLock<SecretPool> = OnceLock::new();

/// Process-wide pool of reusable sensitive buffers.
#[derive(Debug)]
pub struct SecretPool {
    slots: Mutex<Vec<Zeroizing<Vec<u8>>>>,
    max_retained: usize,
}

impl SecretPool {
    /// Installs the process-wide pool, sized for the session's threading
    /// mode. Idempotent: later calls return the already-installed pool.
    pub fn install(threaded: bool) -> &'static SecretPool {
        POOL.get_or_init(|| SecretPool::with_retention(if threaded { 8 } else { 2 }))
    }

    /// The installed pool, if any.
    pub fn get() -> Option<&'static SecretPool> {
        POOL.get()
    }

    fn with_retention(max_retained: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            max_retained,
        }
    }

    /// Hands out a zeroed buffer of at least `len` bytes.
    ///
    /// The buffer zeroes itself on drop; callers that want reuse hand it
    /// back through [`SecretPool::release`] instead.
    pub fn acquire(&self, len: usize) -> Zeroizing<Vec<u8>> {
        let mut buf = {
            let mut slots = self.slots.lock();
            slots.pop().unwrap_or_else(|| Zeroizing::new(Vec::new()))
        };
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Returns a buffer to the pool, zeroing it first.
    ///
    /// Buffers beyond the retention bound are dropped (which also zeroes).
    pub fn release(&self, mut buf: Zeroizing<Vec<u8>>) {
        buf.zeroize();
        let mut slots = self.slots.lock();
        if slots.len() < self.max_retained {
            slots.push(buf);
        }
    }

    /// Zeroes and frees every retained buffer.
    pub fn purge(&self) {
        let mut slots = self.slots.lock();
        slots.clear();
        slots.shrink_to_fit();
    }

    /// Number of buffers currently retained.
    pub fn retained(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_zeroed_before_retention() {
        let pool = SecretPool::with_retention(2);
        let mut buf = pool.acquire(16);
        buf.copy_from_slice(b"sixteen byte key");
        pool.release(buf);

        let again = pool.acquire(16);
        assert_eq!(&again[..], &[0u8; 16][..]);
    }

    #[test]
    fn retention_is_bounded() {
        let pool = SecretPool::with_retention(2);
        for _ in 0..5 {
            let buf = pool.acquire(8);
            pool.release(buf);
        }
        assert!(pool.retained() <= 2);
    }

    #[test]
    fn purge_drops_everything() {
        let pool = SecretPool::with_retention(2);
        pool.release(pool.acquire(8));
        pool.release(pool.acquire(8));
        assert!(pool.retained() > 0);
        pool.purge();
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn install_is_idempotent() {
        let first = SecretPool::install(true);
        let second = SecretPool::install(false);
        assert!(std::ptr::eq(first, second));
        assert!(SecretPool::get().is_some());
    }
}
