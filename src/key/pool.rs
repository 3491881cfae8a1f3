//! Key Pool
//!
//! Recycles `Key` buffers for single-key lookups so the read path does not
//! allocate. Keys are checked out with [`KeyPool::get`] and go back to the
//! pool when the guard drops.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use super::Key;

/// Keys retained beyond this are dropped on release
const MAX_POOLED_KEYS: usize = 64;

/// Bounded free list of reusable keys
pub struct KeyPool {
    free: Mutex<Vec<Key>>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> PooledKey<'_> {
        let key = self.free.lock().pop().unwrap_or_default();
        PooledKey { pool: self, key }
    }

    /// Number of idle keys (for testing and debugging)
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, key: Key) {
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_KEYS {
            free.push(key);
        }
    }
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A key checked out of a [`KeyPool`]
pub struct PooledKey<'a> {
    pool: &'a KeyPool,
    key: Key,
}

impl Deref for PooledKey<'_> {
    type Target = Key;

    fn deref(&self) -> &Key {
        &self.key
    }
}

impl DerefMut for PooledKey<'_> {
    fn deref_mut(&mut self) -> &mut Key {
        &mut self.key
    }
}

impl Drop for PooledKey<'_> {
    fn drop(&mut self) {
        let key = std::mem::replace(&mut self.key, Key::empty());
        self.pool.release(key);
    }
}
