use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// First-fit allocator over the free extents of one writable object.
///
/// Extents are kept in offset order and coalesced on free. Space past `end`
/// is always available.
#[derive(Debug, Clone)]
pub struct ExtentList {
    allocation_size: u64,
    free: BTreeMap<u64, u64>,
    end: u64,
}

impl ExtentList {
    pub fn new(allocation_size: u64) -> Self {
        Self::with_end(allocation_size, 0)
    }

    /// Allocator for an object that already holds `end` bytes.
    pub fn with_end(allocation_size: u64, end: u64) -> Self {
        Self {
            allocation_size,
            free: BTreeMap::new(),
            end: round_up(end, allocation_size),
        }
    }

    /// Space a block of `len` bytes occupies on disk.
    pub fn rounded(&self, len: u64) -> u64 {
        round_up(len.max(1), self.allocation_size)
    }

    pub fn alloc(&mut self, len: u64) -> u64 {
        let len = self.rounded(len);

        let found = self
            .free
            .iter()
            .find(|(_, &size)| size >= len)
            .map(|(&offset, &size)| (offset, size));

        if let Some((offset, size)) = found {
            self.free.remove(&offset);
            if size > len {
                self.free.insert(offset + len, size - len);
            }
            return offset;
        }

        let offset = self.end;
        self.end += len;
        offset
    }

    pub fn free(&mut self, offset: u64, len: u64) -> Result<()> {
        let len = self.rounded(len);
        let in_range = offset
            .checked_add(len)
            .map_or(false, |block_end| block_end <= self.end);
        if offset % self.allocation_size != 0 || !in_range {
            return Err(Error::InvalidOperation(format!(
                "free of {} bytes at {} outside allocated space [0, {})",
                len, offset, self.end
            )));
        }
        if self.overlaps(offset, len) {
            return Err(Error::InvalidOperation(format!(
                "double free of [{}, {})",
                offset,
                offset + len
            )));
        }

        let mut start = offset;
        let mut size = len;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                size += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            size += next_len;
        }

        if start + size == self.end {
            self.end = start;
        } else {
            self.free.insert(start, size);
        }
        Ok(())
    }

    fn overlaps(&self, offset: u64, len: u64) -> bool {
        let before = self
            .free
            .range(..=offset)
            .next_back()
            .map_or(false, |(&o, &l)| o + l > offset);
        let after = self
            .free
            .range(offset..offset + len)
            .next()
            .is_some();
        before || after
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    pub fn extents(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free.iter().map(|(&o, &l)| (o, l))
    }
}

fn round_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_alloc_rounds_to_allocation_size() {
        let mut extents = ExtentList::new(512);
        assert_eq!(extents.alloc(1), 0);
        assert_eq!(extents.alloc(513), 512);
        assert_eq!(extents.alloc(512), 1536);
        assert_eq!(extents.end(), 2048);
    }

    #[test]
    fn test_free_near_end_of_address_space() {
        let mut extents = ExtentList::new(512);
        extents.alloc(512);
        assert!(matches!(
            extents.free(u64::MAX - 511, 512),
            Err(Error::InvalidOperation(_))
        ));
        assert!(extents.free(1024, 512).is_err());
        assert_eq!(extents.end(), 512);
    }

    #[test]
    fn test_first_fit_reuses_and_splits() -> Result<()> {
        let mut extents = ExtentList::new(512);
        let a = extents.alloc(1024);
        let _b = extents.alloc(512);
        extents.free(a, 1024)?;

        assert_eq!(extents.alloc(512), 0);
        assert_eq!(extents.extents().collect::<Vec<_>>(), vec![(512, 512)]);
        assert_eq!(extents.alloc(512), 512);
        assert_eq!(extents.free_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_coalesce_and_shrink_end() -> Result<()> {
        let mut extents = ExtentList::new(512);
        let a = extents.alloc(512);
        let b = extents.alloc(512);
        let c = extents.alloc(512);
        let _d = extents.alloc(512);

        extents.free(a, 512)?;
        extents.free(c, 512)?;
        extents.free(b, 512)?;
        assert_eq!(extents.extents().collect::<Vec<_>>(), vec![(0, 1536)]);

        let mut tail = ExtentList::new(512);
        let x = tail.alloc(512);
        let y = tail.alloc(512);
        tail.free(y, 512)?;
        assert_eq!(tail.end(), 512);
        tail.free(x, 512)?;
        assert_eq!(tail.end(), 0);
        Ok(())
    }

    #[test]
    fn test_rejects_double_and_out_of_range_free() -> Result<()> {
        let mut extents = ExtentList::new(512);
        let a = extents.alloc(512);
        let _b = extents.alloc(512);
        extents.free(a, 512)?;
        assert!(extents.free(a, 512).is_err());
        assert!(extents.free(4096, 512).is_err());
        assert!(extents.free(100, 512).is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_allocations_never_overlap(sizes in proptest::collection::vec(1u64..5000, 1..40),
                                          frees in proptest::collection::vec(any::<bool>(), 40)) {
            let mut extents = ExtentList::new(512);
            let mut live: Vec<(u64, u64)> = Vec::new();

            for (i, size) in sizes.iter().enumerate() {
                if frees[i] && !live.is_empty() {
                    let (offset, len) = live.remove(i % live.len());
                    extents.free(offset, len).unwrap();
                }
                let offset = extents.alloc(*size);
                let len = extents.rounded(*size);
                for &(o, l) in &live {
                    prop_assert!(offset + len <= o || o + l <= offset);
                }
                live.push((offset, len));
            }
        }
    }
}
