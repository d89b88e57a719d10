//! First-fit offset assignment for buffers with known lifetimes.

use crate::schedule::Lifetime;
use serde::{Deserialize, Serialize};

/// A buffer to place: byte size and the (inclusive) interval it is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveBuffer {
    pub name: String,
    pub size_bytes: u64,
    pub lifetime: Lifetime,
}

impl LiveBuffer {
    pub fn new(name: &str, size_bytes: u64, lifetime: Lifetime) -> Self {
        Self {
            name: name.to_string(),
            size_bytes,
            lifetime,
        }
    }
}

/// A placed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub name: String,
    /// Byte offset within the region
    pub offset: u64,
    /// Allocation size in bytes (aligned)
    pub size_bytes: u64,
    pub lifetime: Lifetime,
}

impl Allocation {
    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.size_bytes
    }

    fn conflicts(&self, offset: u64, size: u64, lifetime: &Lifetime) -> bool {
        self.lifetime.overlaps(lifetime) && offset < self.end() && self.offset < offset + size
    }
}

/// Assigns offsets so that buffers live at the same time never share bytes.
#[derive(Debug, Clone)]
pub struct LifetimeScheduler {
    alignment: u64,
}

impl LifetimeScheduler {
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }

    fn align(&self, value: u64) -> u64 {
        value.div_ceil(self.alignment) * self.alignment
    }

    /// Place `buffers`, largest first, each at the lowest aligned offset that
    /// does not collide with an already placed buffer of overlapping lifetime.
    ///
    /// Allocations are returned in the order of `buffers`.
    pub fn schedule(&self, buffers: &[LiveBuffer]) -> Vec<Allocation> {
        let mut order: Vec<usize> = (0..buffers.len()).collect();
        order.sort_by(|&a, &b| {
            let (x, y) = (&buffers[a], &buffers[b]);
            y.size_bytes
                .cmp(&x.size_bytes)
                .then(x.lifetime.start.cmp(&y.lifetime.start))
                .then(x.name.cmp(&y.name))
        });

        let mut placed: Vec<Option<Allocation>> = vec![None; buffers.len()];
        let mut active: Vec<Allocation> = Vec::new();
        for i in order {
            let buffer = &buffers[i];
            let size = self.align(buffer.size_bytes);
            let mut live: Vec<&Allocation> = active
                .iter()
                .filter(|a| a.lifetime.overlaps(&buffer.lifetime))
                .collect();
            live.sort_by_key(|a| a.offset);

            let mut offset = 0;
            for a in live {
                if a.conflicts(offset, size, &buffer.lifetime) {
                    offset = self.align(a.end());
                }
            }
            let alloc = Allocation {
                name: buffer.name.clone(),
                offset,
                size_bytes: size,
                lifetime: buffer.lifetime,
            };
            log::trace!("{} -> [{}, {}) live {}", alloc.name, alloc.offset, alloc.end(), alloc.lifetime);
            active.push(alloc.clone());
            placed[i] = Some(alloc);
        }
        placed.into_iter().flatten().collect()
    }
}

impl Default for LifetimeScheduler {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Bytes needed to hold every allocation.
pub fn usage(allocations: &[Allocation]) -> u64 {
    allocations.iter().map(Allocation::end).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_lifetimes_share_offsets() {
        let buffers = vec![
            LiveBuffer::new("a", 100, Lifetime::new(0, 1)),
            LiveBuffer::new("b", 100, Lifetime::new(2, 3)),
        ];
        let allocs = LifetimeScheduler::new(1).schedule(&buffers);
        assert_eq!(allocs[0].offset, 0);
        assert_eq!(allocs[1].offset, 0);
        assert_eq!(usage(&allocs), 100);
    }

    #[test]
    fn test_overlapping_lifetimes_stack() {
        let buffers = vec![
            LiveBuffer::new("small", 10, Lifetime::new(0, 4)),
            LiveBuffer::new("big", 100, Lifetime::new(2, 3)),
        ];
        let allocs = LifetimeScheduler::new(16).schedule(&buffers);
        // big goes first and takes offset 0
        assert_eq!(allocs[1].name, "big");
        assert_eq!(allocs[1].offset, 0);
        assert_eq!(allocs[1].size_bytes, 112);
        assert_eq!(allocs[0].offset, 112);
        assert_eq!(usage(&allocs), 128);
    }

    #[test]
    fn test_fills_gap() {
        let buffers = vec![
            LiveBuffer::new("a", 64, Lifetime::new(0, 10)),
            LiveBuffer::new("b", 64, Lifetime::new(0, 2)),
            LiveBuffer::new("c", 64, Lifetime::new(5, 10)),
            LiveBuffer::new("d", 32, Lifetime::new(4, 10)),
        ];
        let allocs = LifetimeScheduler::new(1).schedule(&buffers);
        for (i, x) in allocs.iter().enumerate() {
            for y in &allocs[i + 1..] {
                assert!(!x.conflicts(y.offset, y.size_bytes, &y.lifetime), "{:?} {:?}", x, y);
            }
        }
        // b is dead by the time c and d are live
        assert_eq!(allocs[1].offset, allocs[2].offset);
        assert_eq!(usage(&allocs), 64 * 2 + 32);
    }
}
