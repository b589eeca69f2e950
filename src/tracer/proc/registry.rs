use crate::tracer::address::RelocatedAddress;
use crate::tracer::obj::MappedObject;
use std::collections::HashMap;
use std::rc::Rc;

/// Registry of mapped objects keyed by canonical name.
///
/// The registry is the owner of record; mapping entries and lookups hold
/// `Rc` clones. The first registered object is the main executable.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: HashMap<String, Rc<MappedObject>>,
    first: Option<Rc<MappedObject>>,
}

impl ObjectRegistry {
    /// Lookup by name; `None` returns the main executable.
    pub fn find(&self, name: Option<&str>) -> Option<Rc<MappedObject>> {
        match name {
            None => self.first.clone(),
            Some(name) => self.objects.get(name).cloned(),
        }
    }

    /// Find an object or create it from the named file. New objects index
    /// their symbols eagerly and their debug information on first use.
    pub fn get_or_create(&mut self, name: &str, base: RelocatedAddress) -> Rc<MappedObject> {
        if let Some(object) = self.objects.get(name) {
            return object.clone();
        }

        let object = Rc::new(MappedObject::new(name, base));
        self.objects.insert(name.to_string(), object.clone());
        if self.first.is_none() {
            self.first = Some(object.clone());
        }
        object
    }

    /// Remember an alternate name (basename or resolved symlink) for an
    /// already registered object, making future lookups O(1).
    pub fn intern_alias(&mut self, alias: &str, object: Rc<MappedObject>) {
        self.objects.entry(alias.to_string()).or_insert(object);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<MappedObject>> {
        self.objects.values()
    }

    /// Objects without alias duplicates, each yielded once.
    pub fn distinct(&self) -> Vec<Rc<MappedObject>> {
        let mut seen = vec![];
        for object in self.objects.values() {
            if !seen.iter().any(|o| Rc::ptr_eq(o, object)) {
                seen.push(object.clone());
            }
        }
        seen
    }
}
