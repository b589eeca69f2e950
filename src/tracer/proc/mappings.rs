use crate::tracer::address::RelocatedAddress;
use crate::tracer::obj::MappedObject;
use std::cmp::Ordering;
use std::io::{self, Write};
use std::rc::Rc;

/// One contiguous range of the target address space backed by an object file.
#[derive(Clone)]
pub struct MappingEntry {
    pub base: RelocatedAddress,
    pub len: u64,
    pub file_offset: u64,
    pub object: Rc<MappedObject>,
}

impl MappingEntry {
    fn contains(&self, addr: RelocatedAddress) -> bool {
        addr >= self.base && addr.as_u64() < self.base.as_u64() + self.len
    }
}

/// Ordered array of mapping entries with deferred sorting.
///
/// Insertions mark the array dirty; the first lookup after that re-sorts
/// (ascending base, ties by ascending length) so every lookup is a binary
/// search over half-open ranges.
#[derive(Default)]
pub struct MappingIndex {
    entries: Vec<MappingEntry>,
    dirty: bool,
}

impl MappingIndex {
    pub fn insert(&mut self, entry: MappingEntry) {
        self.entries.push(entry);
        self.dirty = true;
    }

    fn ensure_sorted(&mut self) {
        if self.dirty {
            self.entries
                .sort_by(|a, b| a.base.cmp(&b.base).then(a.len.cmp(&b.len)));
            self.dirty = false;
        }
    }

    /// Find the entry whose `[base, base + len)` range contains `addr`.
    pub fn find(&mut self, addr: RelocatedAddress) -> Option<&MappingEntry> {
        self.ensure_sorted();

        let idx = self
            .entries
            .binary_search_by(|entry| {
                if addr < entry.base {
                    Ordering::Greater
                } else if entry.contains(addr) {
                    Ordering::Equal
                } else {
                    Ordering::Less
                }
            })
            .ok()?;
        Some(&self.entries[idx])
    }

    /// Write the textual memory map, coalescing exactly adjacent entries
    /// that belong to the same object. Display only: the index itself is
    /// not altered.
    pub fn dump(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.ensure_sorted();

        writeln!(
            out,
            "\nMEMORY MAP: (executable, shared objects and named mmaps)"
        )?;
        let mut i = 0;
        while i < self.entries.len() {
            let map = &self.entries[i];
            let mut upper = map.base.as_u64() + map.len;

            for next in &self.entries[i + 1..] {
                if Rc::ptr_eq(&next.object, &map.object) && next.base.as_u64() == upper {
                    upper = next.base.as_u64() + next.len;
                    i += 1;
                    continue;
                }
                break;
            }

            writeln!(
                out,
                "{} - {:#018x} {}",
                map.base,
                upper,
                map.object.name()
            )?;
            i += 1;
        }
        writeln!(out)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(name: &str, base: u64, len: u64) -> MappingEntry {
        MappingEntry {
            base: RelocatedAddress::from(base),
            len,
            file_offset: 0,
            object: Rc::new(MappedObject::new(name, RelocatedAddress::from(base))),
        }
    }

    #[test]
    fn test_lookup_half_open_ranges() {
        let mut index = MappingIndex::default();
        index.insert(entry("a", 0x1000, 0x1000));
        index.insert(entry("b", 0x3000, 0x1000));

        let hit = index.find(RelocatedAddress::from(0x1500u64)).unwrap();
        assert_eq!(hit.object.name(), "a");
        assert!(index.find(RelocatedAddress::from(0x2500u64)).is_none());
        let hit = index.find(RelocatedAddress::from(0x3FFFu64)).unwrap();
        assert_eq!(hit.object.name(), "b");
        assert!(index.find(RelocatedAddress::from(0x4000u64)).is_none());
    }

    #[test]
    fn test_lookup_after_out_of_order_insert() {
        let mut index = MappingIndex::default();
        index.insert(entry("c", 0x9000, 0x1000));
        index.insert(entry("a", 0x1000, 0x1000));
        index.insert(entry("b", 0x5000, 0x2000));

        assert_eq!(
            index
                .find(RelocatedAddress::from(0x6FFFu64))
                .unwrap()
                .object
                .name(),
            "b"
        );

        // resort happens again after new inserts
        index.insert(entry("d", 0x3000, 0x800));
        assert_eq!(
            index
                .find(RelocatedAddress::from(0x3400u64))
                .unwrap()
                .object
                .name(),
            "d"
        );
    }

    #[test]
    fn test_dump_coalesces_adjacent_same_object() {
        let mut index = MappingIndex::default();
        let obj = Rc::new(MappedObject::new("obj", RelocatedAddress::from(0x1000u64)));
        index.insert(MappingEntry {
            base: RelocatedAddress::from(0x1000u64),
            len: 0x1000,
            file_offset: 0,
            object: obj.clone(),
        });
        index.insert(MappingEntry {
            base: RelocatedAddress::from(0x2000u64),
            len: 0x1000,
            file_offset: 0x1000,
            object: obj,
        });
        index.insert(entry("other", 0x4000, 0x1000));

        let mut out = Vec::new();
        index.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("0x0000000000001000 - 0x0000000000003000 obj"));
        assert!(text.contains("0x0000000000004000 - 0x0000000000005000 other"));
    }
}
