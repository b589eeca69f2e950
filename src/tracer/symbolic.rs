use crate::tracer::address::RelocatedAddress;
use crate::tracer::obj::symtab::Symbol;
use crate::tracer::obj::MappedObject;
use crate::tracer::proc::Proc;
use log::debug;
use std::path::Path;
use std::rc::Rc;

/// A name lookup hit: the symbol together with the object that owns it.
pub struct SymbolRef {
    pub object: Rc<MappedObject>,
    pub symbol: Symbol,
}

impl SymbolRef {
    /// Address of the symbol in the target address space.
    pub fn relocated_addr(&self) -> RelocatedAddress {
        self.object.to_relocated(self.symbol.addr)
    }
}

/// Address and name resolution over the whole mapped-object set.
pub struct Symbolicator<'a> {
    proc: &'a Proc,
}

impl<'a> Symbolicator<'a> {
    pub fn new(proc: &'a Proc) -> Self {
        Self { proc }
    }

    /// Readable label for a code address:
    /// `object`symbol`, `object`symbol+hexoff` or `object`0xaddr`; empty
    /// when the address is outside every known mapping.
    pub fn pc_sym_name(&self, addr: RelocatedAddress) -> String {
        let Some(mapping) = self.proc.mapping_for_addr(addr) else {
            return String::new();
        };

        let object = mapping.object;
        let global = object.to_global(addr);
        match object.find_symbol_for_addr(global) {
            Some(sym) if global == sym.addr => format!("{}`{}", object.name(), sym.name()),
            Some(sym) => format!(
                "{}`{}+{:x}",
                object.name(),
                sym.name(),
                global.as_u64() - sym.addr.as_u64()
            ),
            None => format!("{}`{:#x}", object.name(), addr.as_u64()),
        }
    }

    /// Like [`Symbolicator::pc_sym_name`] but the final fallback names only
    /// the containing object; the caller annotates with the address.
    pub fn data_sym_name(&self, addr: RelocatedAddress) -> String {
        let Some(mapping) = self.proc.mapping_for_addr(addr) else {
            return String::new();
        };

        let object = mapping.object;
        let global = object.to_global(addr);
        match object.find_symbol_for_addr(global) {
            Some(sym) if global == sym.addr => format!("{}`{}", object.name(), sym.name()),
            Some(sym) => format!(
                "{}`{}+{:x}",
                object.name(),
                sym.name(),
                global.as_u64() - sym.addr.as_u64()
            ),
            None => object.name().to_string(),
        }
    }

    /// Lookup a symbol by raw name.
    ///
    /// With no object name every object is searched and the first hit wins.
    /// An unknown object name is retried as a basename, then as a symlink
    /// resolved against each object's directory; a hit through either
    /// fallback is interned as an alias for later O(1) lookups.
    pub fn sym_lookup(&self, object: Option<&str>, name: &str) -> Option<SymbolRef> {
        let Some(wanted) = object else {
            let hit = self.proc.with_objects(|registry| {
                registry.distinct().into_iter().find_map(|object| {
                    let symbol = object.find_symbol(name)?;
                    Some(SymbolRef { object, symbol })
                })
            });
            debug!(target: "tracer", "sym_lookup: {name} => {:?}",
                hit.as_ref().map(|h| h.symbol.addr));
            return hit;
        };

        let object = match self.proc.find_object(Some(wanted)) {
            Some(object) => object,
            None => {
                let aliased = self
                    .find_by_basename(wanted)
                    .or_else(|| self.find_by_symlink(wanted))?;
                self.proc.intern_object_alias(wanted, aliased.clone());
                aliased
            }
        };

        let symbol = object.find_symbol(name)?;
        debug!(target: "tracer", "sym_lookup: {wanted}`{name} => {}", symbol.addr);
        Some(SymbolRef { object, symbol })
    }

    fn find_by_basename(&self, wanted: &str) -> Option<Rc<MappedObject>> {
        self.proc.with_objects(|registry| {
            registry.distinct().into_iter().find(|object| {
                Path::new(object.name())
                    .file_name()
                    .map(|base| base.to_string_lossy() == wanted)
                    .unwrap_or(false)
            })
        })
    }

    /// The given name may be a symlink that points at one of the mapped
    /// objects; resolve it relative to each object's directory.
    fn find_by_symlink(&self, wanted: &str) -> Option<Rc<MappedObject>> {
        self.proc.with_objects(|registry| {
            registry.distinct().into_iter().find(|object| {
                let Some(dir) = Path::new(object.name()).parent() else {
                    return false;
                };
                match std::fs::canonicalize(dir.join(wanted)) {
                    Ok(real) => real == Path::new(object.name()),
                    Err(_) => false,
                }
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracer::address::GlobalAddress;
    use crate::tracer::testing::scripted_proc;

    fn wedgie_proc() -> Proc {
        let proc = scripted_proc(&[("./wedgie", 0x400000, 0x2000)], &[]);
        let object = proc.find_object(Some("./wedgie")).unwrap();
        object.push_symbol("main", GlobalAddress::from(0x400c00u64), 0x100);
        proc
    }

    #[test]
    fn test_label_at_symbol_start_has_no_offset() {
        let proc = wedgie_proc();
        let sym = Symbolicator::new(&proc);
        assert_eq!(
            sym.pc_sym_name(RelocatedAddress::from(0x400c00u64)),
            "./wedgie`main"
        );
    }

    #[test]
    fn test_label_inside_symbol_has_hex_offset() {
        let proc = wedgie_proc();
        let sym = Symbolicator::new(&proc);
        assert_eq!(
            sym.pc_sym_name(RelocatedAddress::from(0x400c52u64)),
            "./wedgie`main+52"
        );
    }

    #[test]
    fn test_label_without_symbol_falls_back_to_address() {
        let proc = wedgie_proc();
        let sym = Symbolicator::new(&proc);
        assert_eq!(
            sym.pc_sym_name(RelocatedAddress::from(0x401f00u64)),
            "./wedgie`0x401f00"
        );
        assert_eq!(
            sym.data_sym_name(RelocatedAddress::from(0x401f00u64)),
            "./wedgie"
        );
    }

    #[test]
    fn test_label_outside_mappings_is_empty() {
        let proc = wedgie_proc();
        let sym = Symbolicator::new(&proc);
        assert_eq!(sym.pc_sym_name(RelocatedAddress::from(0x10u64)), "");
    }

    #[test]
    fn test_sym_lookup_by_basename_interns_alias() {
        let proc = wedgie_proc();
        let sym = Symbolicator::new(&proc);

        let hit = sym.sym_lookup(Some("wedgie"), "main").unwrap();
        assert_eq!(hit.symbol.addr, GlobalAddress::from(0x400c00u64));
        // alias now resolves directly
        assert!(proc.find_object(Some("wedgie")).is_some());
    }

    #[test]
    fn test_sym_lookup_any_object() {
        let proc = wedgie_proc();
        let sym = Symbolicator::new(&proc);
        assert!(sym.sym_lookup(None, "main").is_some());
        assert!(sym.sym_lookup(None, "missing").is_none());
    }
}
