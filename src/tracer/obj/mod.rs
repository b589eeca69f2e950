pub mod symtab;

use crate::muted_error;
use crate::tracer::address::{GlobalAddress, RelocatedAddress};
use crate::tracer::dwarf::{self, DebugInformation};
use crate::tracer::error::Error;
use crate::tracer::obj::symtab::{Symbol, SymbolTable};
use crate::tracer::types::{TypeCollection, TypeId};
use log::{debug, info};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol};
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

/// Raw bytes and link-time address of one object file section.
#[derive(Clone)]
pub struct SectionInfo {
    pub address: u64,
    pub data: Arc<[u8]>,
}

/// The in-memory view of one file mapped into the target: symbols, sections,
/// debug information and the type collection decoded from it.
///
/// Objects are created lazily the first time a mapping names them and are
/// shared (`Rc`) between the registry and mapping entries.
pub struct MappedObject {
    name: String,
    path: PathBuf,
    load_base: RelocatedAddress,
    /// `load_base - preferred_vaddr`; converts between relocated and
    /// object-file addresses.
    base_offset: i64,
    data: Option<Arc<Mmap>>,
    sections: HashMap<String, SectionInfo>,
    symtab: RefCell<SymbolTable>,
    debug: OnceCell<Option<Rc<DebugInformation>>>,
    types: RefCell<TypeCollection>,
    die_types: RefCell<HashMap<(usize, gimli::UnitOffset), TypeId>>,
}

impl MappedObject {
    /// Open and index the named file. A vanished or unparseable file leaves
    /// an empty object (the target may outlive its executable).
    pub fn new(name: &str, load_base: RelocatedAddress) -> Self {
        let path = PathBuf::from(name);
        let mut obj = Self {
            name: name.to_string(),
            path,
            load_base,
            base_offset: 0,
            data: None,
            sections: HashMap::new(),
            symtab: RefCell::new(SymbolTable::default()),
            debug: OnceCell::new(),
            types: RefCell::new(TypeCollection::default()),
            die_types: RefCell::new(HashMap::new()),
        };

        match obj.open_and_index() {
            Ok(()) => {
                debug!(target: "tracer",
                    "object {name}: base={load_base} base_offset={:#x}", obj.base_offset)
            }
            Err(e) => info!(target: "tracer", "object {name} not indexed: {e:#}"),
        }
        obj
    }

    fn open_and_index(&mut self) -> Result<(), Error> {
        let file = fs::File::open(&self.path)?;
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });
        let parsed = object::File::parse(&**mmap)?;

        self.base_offset =
            self.load_base.as_u64() as i64 - parsed.relative_address_base() as i64;

        for section in parsed.sections() {
            let Ok(name) = section.name() else { continue };
            let Ok(data) = section.uncompressed_data() else {
                continue;
            };
            self.sections.insert(
                name.to_string(),
                SectionInfo {
                    address: section.address(),
                    data: Arc::from(&*data),
                },
            );
        }

        {
            let mut symtab = self.symtab.borrow_mut();
            let static_syms = parsed.symbols();
            let dynamic_syms = parsed.dynamic_symbols();
            for symbol in static_syms.chain(dynamic_syms) {
                let Ok(raw_name) = symbol.name() else { continue };
                if raw_name.is_empty() {
                    continue;
                }
                symtab.add(
                    raw_name,
                    GlobalAddress::from(symbol.address()),
                    symbol.size(),
                );
            }
        }

        self.data = Some(mmap);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Convert a target address into this object's address space.
    pub fn to_global(&self, addr: RelocatedAddress) -> GlobalAddress {
        addr.remove_base_offset(self.base_offset)
    }

    /// Convert an object-file address into the target address space.
    pub fn to_relocated(&self, addr: GlobalAddress) -> RelocatedAddress {
        addr.relocate(self.base_offset)
    }

    pub fn section(&self, name: &str) -> Option<SectionInfo> {
        self.sections.get(name).cloned()
    }

    pub fn has_symbols(&self) -> bool {
        !self.symtab.borrow().is_empty()
    }

    /// Best-fit symbol for an object-file address.
    pub fn find_symbol_for_addr(&self, addr: GlobalAddress) -> Option<Symbol> {
        let mut symtab = self.symtab.borrow_mut();
        symtab.bake();
        symtab.find_by_addr(addr).cloned()
    }

    /// Symbol lookup by exact raw name.
    pub fn find_symbol(&self, name: &str) -> Option<Symbol> {
        let mut symtab = self.symtab.borrow_mut();
        symtab.bake();
        symtab.find_by_name(name).cloned()
    }

    /// Debug information, parsed on first use. `None` when the file is gone
    /// or carries no usable sections.
    pub fn debug_info(&self) -> Option<Rc<DebugInformation>> {
        self.debug
            .get_or_init(|| {
                let data = self.data.as_ref()?;
                let parsed = muted_error!(object::File::parse(&***data))?;
                let di = muted_error!(
                    DebugInformation::build(&self.path, &parsed),
                    "debug information load:"
                )?;
                Some(Rc::new(di))
            })
            .clone()
    }

    /// Decode the type referenced by a DIE into this object's type
    /// collection. Results are cached by DIE offset.
    pub fn type_for_die(
        &self,
        unit_idx: usize,
        offset: gimli::UnitOffset,
    ) -> Option<TypeId> {
        let di = self.debug_info()?;
        let mut types = self.types.borrow_mut();
        let mut cache = self.die_types.borrow_mut();
        dwarf::types::resolve_type(&di, unit_idx, offset, &mut types, &mut cache)
    }

    /// Run a closure against the decoded type collection.
    pub fn with_types<R>(&self, f: impl FnOnce(&TypeCollection) -> R) -> R {
        f(&self.types.borrow())
    }

    #[cfg(test)]
    pub(crate) fn push_symbol(&self, raw_name: &str, addr: GlobalAddress, size: u64) {
        self.symtab.borrow_mut().add(raw_name, addr, size);
    }
}
