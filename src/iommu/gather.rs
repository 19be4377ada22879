//! IOTLB invalidation gathering
//!
//! Unmapped leaves are collected into one `[start, end]` range of a single
//! page size, so that a run of adjacent leaves costs one invalidation.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotlbGather {
    /// Page size of the gathered leaves, 0 when empty.
    pub pgsize: usize,
    pub start: u64,
    /// Inclusive.
    pub end: u64,
}

impl IotlbGather {
    pub const fn new() -> Self {
        Self {
            pgsize: 0,
            start: u64::MAX,
            end: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pgsize == 0
    }

    /// Bytes covered by the gathered range.
    pub fn size(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// Neither overlapping nor adjacent.
    fn is_disjoint(&self, iova: u64, size: usize) -> bool {
        let end = iova + size as u64 - 1;
        !self.is_empty() && (end.saturating_add(1) < self.start || iova > self.end.saturating_add(1))
    }

    fn add_range(&mut self, iova: u64, size: usize) {
        let end = iova + size as u64 - 1;
        self.start = self.start.min(iova);
        self.end = self.end.max(end);
    }

    /// Add a removed leaf, draining the current range through `sync` first
    /// when the leaf cannot be merged into it.
    pub fn add_page(&mut self, iova: u64, size: usize, sync: impl FnOnce(&IotlbGather)) {
        if (self.pgsize != 0 && self.pgsize != size) || self.is_disjoint(iova, size) {
            self.sync(sync);
        }
        self.pgsize = size;
        self.add_range(iova, size);
    }

    /// Invalidate the gathered range and start over.
    pub fn sync(&mut self, sync: impl FnOnce(&IotlbGather)) {
        if !self.is_empty() {
            sync(self);
        }
        *self = Self::new();
    }
}

impl Default for IotlbGather {
    fn default() -> Self {
        Self::new()
    }
}
