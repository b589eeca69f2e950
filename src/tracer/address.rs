use std::fmt::{Display, Formatter};

/// Address in the target process virtual address space.
/// A relocated address is a [`GlobalAddress`] plus the base offset of the
/// object mapped at that location.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
pub struct RelocatedAddress(u64);

impl RelocatedAddress {
    /// Strip the mapped object base offset, returning an object-file address.
    #[inline(always)]
    pub fn remove_base_offset(self, offset: i64) -> GlobalAddress {
        GlobalAddress(self.0.wrapping_sub(offset as u64))
    }

    #[inline(always)]
    pub fn offset(self, offset: i64) -> RelocatedAddress {
        RelocatedAddress(self.0.wrapping_add(offset as u64))
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr as u64)
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl From<RelocatedAddress> for usize {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0 as usize
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#018x}", self.0))
    }
}

/// Address inside an object file.
/// This address is unique per object file but not per process.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct GlobalAddress(u64);

impl GlobalAddress {
    /// Relocate the address into the segment of an object mapped with `offset`.
    #[inline(always)]
    pub fn relocate(self, offset: i64) -> RelocatedAddress {
        RelocatedAddress(self.0.wrapping_add(offset as u64))
    }

    pub fn in_range(self, range: &gimli::Range) -> bool {
        self.0 >= range.begin && self.0 < range.end
    }

    pub fn in_ranges(self, ranges: &[gimli::Range]) -> bool {
        ranges.iter().any(|range| self.in_range(range))
    }

    #[inline(always)]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for GlobalAddress {
    fn from(addr: u64) -> Self {
        GlobalAddress(addr)
    }
}

impl From<usize> for GlobalAddress {
    fn from(addr: usize) -> Self {
        GlobalAddress(addr as u64)
    }
}

impl From<GlobalAddress> for u64 {
    fn from(addr: GlobalAddress) -> Self {
        addr.0
    }
}

impl Display for GlobalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#018x}", self.0))
    }
}
