//! Write Batch
//!
//! Stages puts and deletes in one contiguous arena so a batch can be reused
//! across commits without per-operation allocations. A batch is committed
//! through [`KvStore::commit_write_batch`](super::KvStore::commit_write_batch)
//! and discarded with [`WriteBatch::clear`].

/// Byte span inside the batch arena
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy)]
enum BatchOp {
    Put { key: Span, value: Span },
    Delete { key: Span },
}

/// A staged mutation, borrowed from the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchItem<'a> {
    Put(&'a [u8], &'a [u8]),
    Delete(&'a [u8]),
}

/// Mutations applied atomically in staging order
#[derive(Debug, Default)]
pub struct WriteBatch {
    data: Vec<u8>,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        let key = self.push(key);
        let value = self.push(value);
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn delete(&mut self, key: &[u8]) {
        let key = self.push(key);
        self.ops.push(BatchOp::Delete { key });
    }

    /// Number of staged mutations
    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Discard all staged mutations, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.ops.clear();
    }

    /// Release memory above `max_bytes` of arena capacity
    pub fn shrink_to(&mut self, max_bytes: usize) {
        if self.data.capacity() > max_bytes {
            self.data = Vec::new();
            self.ops = Vec::new();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = BatchItem<'_>> + '_ {
        self.ops.iter().map(move |op| self.item(*op))
    }

    /// Latest staged mutation for `key`
    ///
    /// - `None` — nothing staged for the key
    /// - `Some(None)` — staged delete
    /// - `Some(Some(value))` — staged put
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops.iter().rev().find_map(|op| match self.item(*op) {
            BatchItem::Put(k, v) if k == key => Some(Some(v)),
            BatchItem::Delete(k) if k == key => Some(None),
            _ => None,
        })
    }

    fn push(&mut self, bytes: &[u8]) -> Span {
        let start = self.data.len();
        self.data.extend_from_slice(bytes);
        Span {
            start,
            end: self.data.len(),
        }
    }

    fn slice(&self, span: Span) -> &[u8] {
        &self.data[span.start..span.end]
    }

    fn item(&self, op: BatchOp) -> BatchItem<'_> {
        match op {
            BatchOp::Put { key, value } => BatchItem::Put(self.slice(key), self.slice(value)),
            BatchOp::Delete { key } => BatchItem::Delete(self.slice(key)),
        }
    }
}
