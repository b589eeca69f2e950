use crate::tracer::address::GlobalAddress;
use std::collections::HashMap;

/// Size recorded for the last symbol of an object when the real size is
/// unknown and there is no next symbol to synthesize it from.
pub const FALLBACK_SYMBOL_SIZE: u64 = 8;

/// One entry of an object symbol table.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Demangled name, `None` when demangling leaves the raw name unchanged.
    name: Option<String>,
    pub raw_name: String,
    pub addr: GlobalAddress,
    pub size: u64,
}

impl Symbol {
    /// Readable name: the demangled one when it differs from the raw name.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.raw_name)
    }
}

/// Flat symbol vector plus a hash by raw name.
///
/// The table accumulates symbols in insertion order and is baked (sorted,
/// rehashed, sizes synthesized) on the first read after a change.
#[derive(Debug, Default)]
pub struct SymbolTable {
    syms: Vec<Symbol>,
    by_raw_name: HashMap<String, usize>,
    changed: bool,
}

impl SymbolTable {
    pub fn add(&mut self, raw_name: &str, addr: GlobalAddress, size: u64) {
        let demangled = format!("{:#}", rustc_demangle::demangle(raw_name));
        let name = (demangled != raw_name).then_some(demangled);
        self.syms.push(Symbol {
            name,
            raw_name: raw_name.to_string(),
            addr,
            size,
        });
        self.changed = true;
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Sort by ascending address (ties by ascending size, then insertion
    /// order), synthesize missing sizes from the next symbol address and
    /// rebuild the raw name hash. Duplicate names keep the first entry.
    pub fn bake(&mut self) {
        if !self.changed {
            return;
        }
        self.changed = false;

        self.syms
            .sort_by(|a, b| a.addr.cmp(&b.addr).then(a.size.cmp(&b.size)));

        for i in 0..self.syms.len() {
            if self.syms[i].size != 0 {
                continue;
            }
            let addr = self.syms[i].addr;
            self.syms[i].size = self.syms[i + 1..]
                .iter()
                .find(|next| next.addr > addr)
                .map(|next| next.addr.as_u64() - addr.as_u64())
                .unwrap_or(FALLBACK_SYMBOL_SIZE);
        }

        self.by_raw_name.clear();
        for (idx, sym) in self.syms.iter().enumerate() {
            self.by_raw_name.entry(sym.raw_name.clone()).or_insert(idx);
        }
    }

    /// Lookup by exact raw name. The table must be baked.
    pub fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.by_raw_name.get(name).map(|&idx| &self.syms[idx])
    }

    /// Best-fit symbol for an address. The table must be baked.
    ///
    /// The binary search hit may sit inside a run of symbols all covering
    /// `addr`; the run is widened in both directions and the most readable
    /// candidate wins (ties by lowest index).
    pub fn find_by_addr(&self, addr: GlobalAddress) -> Option<&Symbol> {
        if self.syms.is_empty() {
            return None;
        }

        let hit = self
            .syms
            .binary_search_by(|sym| {
                use std::cmp::Ordering;
                if addr < sym.addr {
                    Ordering::Greater
                } else if addr.as_u64() < sym.addr.as_u64() + sym.size {
                    Ordering::Equal
                } else {
                    Ordering::Less
                }
            })
            .ok()?;

        let mut first = hit;
        while first > 0 && self.syms[first - 1].addr >= addr {
            first -= 1;
        }
        let mut last = hit;
        while last + 1 < self.syms.len() && self.syms[last + 1].addr <= addr {
            last += 1;
        }

        self.syms[first..=last]
            .iter()
            .min_by_key(|sym| readability_penalty(sym.name()))
    }
}

/// Lower is better. Leading underscores weigh heavier than interior ones;
/// any other decoration (`$`, `.`, ...) costs nothing.
fn readability_penalty(name: &str) -> u32 {
    let mut start = true;
    let mut value = 0;
    for b in name.bytes() {
        if b == b'_' {
            value += if start { 2 } else { 1 };
        } else {
            start = false;
        }
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(syms: &[(&str, u64, u64)]) -> SymbolTable {
        let mut tab = SymbolTable::default();
        for &(name, addr, size) in syms {
            tab.add(name, GlobalAddress::from(addr), size);
        }
        tab.bake();
        tab
    }

    #[test]
    fn test_readability_penalty() {
        assert_eq!(readability_penalty("bar"), 0);
        assert_eq!(readability_penalty("_foo"), 2);
        assert_eq!(readability_penalty("__foo"), 4);
        assert_eq!(readability_penalty("f_o_o"), 2);
        assert_eq!(readability_penalty("$dollar.name"), 0);
    }

    #[test]
    fn test_best_fit_prefers_readable_alias() {
        let tab = table(&[("_foo", 0x100, 0x20), ("bar", 0x100, 0x20)]);
        let sym = tab.find_by_addr(GlobalAddress::from(0x110u64)).unwrap();
        assert_eq!(sym.name(), "bar");
    }

    #[test]
    fn test_best_fit_tie_takes_lowest_index() {
        let tab = table(&[("one", 0x100, 0x20), ("two", 0x100, 0x20)]);
        let sym = tab.find_by_addr(GlobalAddress::from(0x100u64)).unwrap();
        assert_eq!(sym.name(), "one");
    }

    #[test]
    fn test_lookup_outside_any_range() {
        let tab = table(&[("one", 0x100, 0x10), ("two", 0x200, 0x10)]);
        assert!(tab.find_by_addr(GlobalAddress::from(0x150u64)).is_none());
        assert!(tab.find_by_addr(GlobalAddress::from(0x90u64)).is_none());
        assert!(tab.find_by_addr(GlobalAddress::from(0x210u64)).is_none());
    }

    #[test]
    fn test_size_synthesis() {
        let mut tab = SymbolTable::default();
        tab.add("one", GlobalAddress::from(0x100u64), 0);
        tab.add("two", GlobalAddress::from(0x140u64), 0);
        tab.bake();

        let one = tab.find_by_name("one").unwrap();
        assert_eq!(one.size, 0x40);
        let two = tab.find_by_name("two").unwrap();
        assert_eq!(two.size, FALLBACK_SYMBOL_SIZE);
    }

    #[test]
    fn test_duplicate_names_first_wins() {
        let mut tab = SymbolTable::default();
        tab.add("dup", GlobalAddress::from(0x100u64), 0x10);
        tab.add("dup", GlobalAddress::from(0x200u64), 0x10);
        tab.bake();
        assert_eq!(
            tab.find_by_name("dup").unwrap().addr,
            GlobalAddress::from(0x100u64)
        );
    }
}
