//! Operation Context
//!
//! Per-batch scratch state for the write path: a reusable key, a reusable
//! value buffer and a reusable write batch. Contexts are checked out of a
//! bounded [`ContextPool`] and returned when the guard drops, so release
//! happens on every exit path, including errors.
//!
//! A context is owned by exactly one caller while checked out.

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::key::Key;
use crate::kv::WriteBatch;
use crate::record::codec;

/// Idle contexts retained beyond this are dropped on release
const MAX_POOLED_CONTEXTS: usize = 16;

struct ContextState {
    key: Key,
    buffer: Vec<u8>,
    wb: WriteBatch,
}

/// Bounded pool of write contexts for one shard
pub struct ContextPool {
    free: Mutex<Vec<ContextState>>,
    save_buffer_size: usize,
    max_save_buffer_size: usize,
}

impl ContextPool {
    pub fn new(save_buffer_size: usize, max_save_buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            save_buffer_size,
            max_save_buffer_size,
        }
    }

    pub fn acquire(&self) -> Context<'_> {
        let state = self.free.lock().pop().unwrap_or_else(|| ContextState {
            key: Key::new(),
            buffer: Vec::with_capacity(self.save_buffer_size),
            wb: WriteBatch::new(),
        });
        Context { pool: self, state }
    }

    /// Number of idle contexts (for testing and debugging)
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, mut state: ContextState) {
        state.wb.clear();
        state.wb.shrink_to(self.max_save_buffer_size);
        if state.buffer.capacity() > self.max_save_buffer_size {
            state.buffer = Vec::with_capacity(self.save_buffer_size);
        }

        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_CONTEXTS {
            free.push(state);
        }
    }
}

/// A write context checked out of a [`ContextPool`]
pub struct Context<'a> {
    pool: &'a ContextPool,
    state: ContextState,
}

impl Context<'_> {
    /// The reusable key; re-target it before each staged mutation
    pub fn key(&mut self) -> &mut Key {
        &mut self.state.key
    }

    /// The reusable value buffer, emptied, with room for at least `size`
    /// bytes
    pub fn value_buffer(&mut self, size: usize) -> &mut Vec<u8> {
        let buffer = &mut self.state.buffer;
        buffer.clear();
        buffer.reserve(size);
        buffer
    }

    pub fn write_batch(&self) -> &WriteBatch {
        &self.state.wb
    }

    /// Mutation already staged for the current key: `Some(None)` is a staged
    /// delete, `None` means the key is untouched by this batch
    pub fn staged_value(&self) -> Option<Option<&[u8]>> {
        self.state.wb.get(self.state.key.as_bytes())
    }

    /// Stage `value`, framed, under the current key
    pub fn put_record<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.value_buffer(codec::encoded_size(value)?);
        let ContextState { key, buffer, wb } = &mut self.state;
        codec::encode_record_into(value, buffer)?;
        wb.put(key.as_bytes(), buffer);
        Ok(())
    }

    /// Stage a MaxIndex value under the current key
    pub fn put_max_index(&mut self, index: u64) {
        self.value_buffer(codec::MAX_INDEX_VALUE_SIZE);
        let ContextState { key, buffer, wb } = &mut self.state;
        codec::encode_max_index(index, buffer);
        wb.put(key.as_bytes(), buffer);
    }

    /// Stage a delete of the current key
    pub fn delete_key(&mut self) {
        let ContextState { key, wb, .. } = &mut self.state;
        wb.delete(key.as_bytes());
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        let state = std::mem::replace(
            &mut self.state,
            ContextState {
                key: Key::empty(),
                buffer: Vec::new(),
                wb: WriteBatch::new(),
            },
        );
        self.pool.release(state);
    }
}
