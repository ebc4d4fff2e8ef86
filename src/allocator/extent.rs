//! Free-space tracking with coalescing extents
//!
//! Space is counted in units of [`UNIT_SIZE`](super::UNIT_SIZE) bytes. Free
//! space is a set of non-overlapping extents keyed by start unit, which keeps
//! them sorted for neighbour lookups during coalescing.

use std::collections::BTreeMap;

/// A contiguous range of units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First unit
    pub start: usize,
    /// Number of contiguous units
    pub length: usize,
}

impl Extent {
    pub fn new(start: usize, length: usize) -> Self {
        Extent { start, length }
    }

    /// One past the last unit
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn contains(&self, unit: usize) -> bool {
        unit >= self.start && unit < self.end()
    }

    /// Check if this extent is adjacent to another (can be coalesced)
    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Coalesce two adjacent extents
    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }

        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Some(Extent::new(start, end - start))
    }
}

/// Free extents of one region
///
/// Does not know which units are allocated; callers free only what they
/// allocated.
#[derive(Debug, Clone)]
pub struct ExtentMap {
    free_extents: BTreeMap<usize, Extent>,
    total_units: usize,
    free_units: usize,
}

impl ExtentMap {
    /// Create a map where all `total_units` are free
    pub fn new(total_units: usize) -> Self {
        let mut free_extents = BTreeMap::new();
        if total_units > 0 {
            free_extents.insert(0, Extent::new(0, total_units));
        }

        ExtentMap {
            free_extents,
            total_units,
            free_units: total_units,
        }
    }

    /// Take `units` contiguous units whose start satisfies the alignment
    ///
    /// The returned start `s` satisfies `(s + phase) % align_units == 0`;
    /// `phase` is the region base expressed in units. Best fit: the smallest
    /// free extent that can hold the aligned request, lowest address on ties.
    pub fn allocate(&mut self, units: usize, align_units: usize, phase: usize) -> Option<usize> {
        if units == 0 || units > self.free_units {
            return None;
        }

        let padding = |extent: &Extent| {
            let misalign = (extent.start + phase) % align_units;
            (align_units - misalign) % align_units
        };

        let (key, extent, pad) = self
            .free_extents
            .iter()
            .map(|(&key, extent)| (key, *extent, padding(extent)))
            .filter(|(_, extent, pad)| {
                pad.checked_add(units)
                    .map_or(false, |needed| needed <= extent.length)
            })
            .min_by_key(|(_, extent, _)| extent.length)?;

        self.free_extents.remove(&key);

        if pad > 0 {
            self.free_extents
                .insert(extent.start, Extent::new(extent.start, pad));
        }

        let start = extent.start + pad;
        let remaining = extent.length - pad - units;
        if remaining > 0 {
            let rest = start + units;
            self.free_extents.insert(rest, Extent::new(rest, remaining));
        }

        self.free_units -= units;
        Some(start)
    }

    /// Return `[start, start + units)` to free space, coalescing neighbours
    pub fn free(&mut self, start: usize, units: usize) {
        if units == 0 {
            return;
        }

        self.insert_and_coalesce(Extent::new(start, units));
        self.free_units += units;
    }

    /// Grow an allocation ending at `end` by `extra` units in place
    ///
    /// Succeeds only if a free extent starts exactly at `end` and is large
    /// enough.
    pub fn extend_at(&mut self, end: usize, extra: usize) -> bool {
        let next = match self.free_extents.get(&end) {
            Some(extent) if extent.length >= extra => *extent,
            _ => return false,
        };

        self.free_extents.remove(&end);
        if next.length > extra {
            let rest = end + extra;
            self.free_extents
                .insert(rest, Extent::new(rest, next.length - extra));
        }

        self.free_units -= extra;
        true
    }

    /// Insert a free extent and coalesce with adjacent extents
    fn insert_and_coalesce(&mut self, mut extent: Extent) {
        let mut to_remove = Vec::new();

        if let Some((&prev_start, prev)) = self.free_extents.range(..extent.start).next_back() {
            if let Some(merged) = prev.coalesce(&extent) {
                extent = merged;
                to_remove.push(prev_start);
            }
        }

        if let Some((&next_start, next)) = self.free_extents.range(extent.end()..).next() {
            if let Some(merged) = extent.coalesce(next) {
                extent = merged;
                to_remove.push(next_start);
            }
        }

        for key in to_remove {
            self.free_extents.remove(&key);
        }

        self.free_extents.insert(extent.start, extent);
    }

    /// Check if a specific unit is free
    pub fn is_free(&self, unit: usize) -> bool {
        self.free_extents
            .range(..=unit)
            .next_back()
            .map_or(false, |(_, extent)| extent.contains(unit))
    }

    /// Free extents in address order
    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.free_extents.values()
    }

    /// Get current number of free extents (fragmentation indicator)
    pub fn extent_count(&self) -> usize {
        self.free_extents.len()
    }

    pub fn total_units(&self) -> usize {
        self.total_units
    }

    pub fn free_units(&self) -> usize {
        self.free_units
    }
}
