use std::ops::ControlFlow;
use strum_macros::Display;

/// Stable handle of a type inside its owning [`TypeCollection`].
pub type TypeId = usize;

/// Integer encoding flags.
pub const INT_SIGNED: u32 = 0x1;
pub const INT_CHAR: u32 = 0x2;
pub const INT_BOOL: u32 = 0x4;

/// Float encoding formats.
pub const FP_SINGLE: u32 = 1;
pub const FP_DOUBLE: u32 = 2;

/// Generic encoding information of a numeric type or bit-field member.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TypeEncoding {
    pub format: u32,
    /// offset of the value in bits
    pub offset: u32,
    /// storage width in bits
    pub bits: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TypeKind {
    Integer,
    Float,
    Pointer,
    Array,
    Function,
    Struct,
    Union,
    Enum,
    Typedef,
    Volatile,
    Const,
    Restrict,
}

#[derive(Clone, Debug)]
pub struct Member {
    pub name: String,
    pub type_id: TypeId,
    pub bit_offset: u64,
    /// Set for bit-field members placed by explicit encoding.
    pub bit_size: Option<u32>,
}

#[derive(Clone, Debug)]
pub enum TypeDeclaration {
    Integer {
        name: String,
        enc: TypeEncoding,
    },
    Float {
        name: String,
        enc: TypeEncoding,
    },
    Pointer {
        /// `None` is a pointer to void.
        target: Option<TypeId>,
    },
    Array {
        element: TypeId,
        index: Option<TypeId>,
        nelems: u32,
    },
    Function {
        return_type: Option<TypeId>,
        args: Vec<TypeId>,
        variadic: bool,
    },
    Struct {
        name: Option<String>,
        members: Vec<Member>,
        /// bytes consumed by sequentially placed members
        cursor: u64,
        align: u64,
        /// size recorded in debug info, overrides the computed layout
        explicit_size: Option<u64>,
    },
    Union {
        name: Option<String>,
        members: Vec<Member>,
        largest: u64,
        align: u64,
        explicit_size: Option<u64>,
    },
    Enum {
        name: Option<String>,
        enumerators: Vec<(String, i64)>,
        byte_size: u64,
    },
    Typedef {
        name: String,
        target: Option<TypeId>,
    },
    Volatile {
        target: Option<TypeId>,
    },
    Const {
        target: Option<TypeId>,
    },
    Restrict {
        target: Option<TypeId>,
    },
}

impl TypeDeclaration {
    pub fn kind(&self) -> TypeKind {
        match self {
            TypeDeclaration::Integer { .. } => TypeKind::Integer,
            TypeDeclaration::Float { .. } => TypeKind::Float,
            TypeDeclaration::Pointer { .. } => TypeKind::Pointer,
            TypeDeclaration::Array { .. } => TypeKind::Array,
            TypeDeclaration::Function { .. } => TypeKind::Function,
            TypeDeclaration::Struct { .. } => TypeKind::Struct,
            TypeDeclaration::Union { .. } => TypeKind::Union,
            TypeDeclaration::Enum { .. } => TypeKind::Enum,
            TypeDeclaration::Typedef { .. } => TypeKind::Typedef,
            TypeDeclaration::Volatile { .. } => TypeKind::Volatile,
            TypeDeclaration::Const { .. } => TypeKind::Const,
            TypeDeclaration::Restrict { .. } => TypeKind::Restrict,
        }
    }
}

/// Member resolution result: type and offset in bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub type_id: TypeId,
    pub bit_offset: u64,
}

/// A graph of type declarations linked by [`TypeId`] edges.
///
/// The collection owns every declaration registered through the
/// constructors; handles stay valid for the life of the collection.
#[derive(Debug)]
pub struct TypeCollection {
    types: Vec<TypeDeclaration>,
    addr_size: u64,
}

impl Default for TypeCollection {
    fn default() -> Self {
        Self {
            types: vec![],
            addr_size: 8,
        }
    }
}

impl TypeCollection {
    pub fn get(&self, id: TypeId) -> &TypeDeclaration {
        &self.types[id]
    }

    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.types[id].kind()
    }

    fn register(&mut self, decl: TypeDeclaration) -> TypeId {
        self.types.push(decl);
        self.types.len() - 1
    }

    pub fn new_integer(&mut self, name: &str, enc: TypeEncoding) -> TypeId {
        self.register(TypeDeclaration::Integer {
            name: name.to_string(),
            enc,
        })
    }

    pub fn new_float(&mut self, name: &str, enc: TypeEncoding) -> TypeId {
        self.register(TypeDeclaration::Float {
            name: name.to_string(),
            enc,
        })
    }

    pub fn new_pointer(&mut self, target: Option<TypeId>) -> TypeId {
        self.register(TypeDeclaration::Pointer { target })
    }

    pub fn new_array(&mut self, element: TypeId, index: Option<TypeId>, nelems: u32) -> TypeId {
        self.register(TypeDeclaration::Array {
            element,
            index,
            nelems,
        })
    }

    pub fn new_function(
        &mut self,
        return_type: Option<TypeId>,
        args: Vec<TypeId>,
        variadic: bool,
    ) -> TypeId {
        self.register(TypeDeclaration::Function {
            return_type,
            args,
            variadic,
        })
    }

    pub fn new_struct(&mut self, name: Option<&str>) -> TypeId {
        self.register(TypeDeclaration::Struct {
            name: name.map(str::to_string),
            members: vec![],
            cursor: 0,
            align: 1,
            explicit_size: None,
        })
    }

    pub fn new_union(&mut self, name: Option<&str>) -> TypeId {
        self.register(TypeDeclaration::Union {
            name: name.map(str::to_string),
            members: vec![],
            largest: 0,
            align: 1,
            explicit_size: None,
        })
    }

    pub fn new_enum(
        &mut self,
        name: Option<&str>,
        enumerators: Vec<(String, i64)>,
        byte_size: u64,
    ) -> TypeId {
        self.register(TypeDeclaration::Enum {
            name: name.map(str::to_string),
            enumerators,
            byte_size,
        })
    }

    pub fn new_typedef(&mut self, name: &str, target: Option<TypeId>) -> TypeId {
        self.register(TypeDeclaration::Typedef {
            name: name.to_string(),
            target,
        })
    }

    pub fn new_const(&mut self, target: Option<TypeId>) -> TypeId {
        self.register(TypeDeclaration::Const { target })
    }

    pub fn new_volatile(&mut self, target: Option<TypeId>) -> TypeId {
        self.register(TypeDeclaration::Volatile { target })
    }

    pub fn new_restrict(&mut self, target: Option<TypeId>) -> TypeId {
        self.register(TypeDeclaration::Restrict { target })
    }

    /// Patch a pointer created ahead of its target (cyclic graphs).
    pub(crate) fn set_pointer_target(&mut self, pointer: TypeId, new_target: TypeId) {
        if let TypeDeclaration::Pointer { target } = &mut self.types[pointer] {
            *target = Some(new_target);
        }
    }

    pub(crate) fn set_aggregate_size(&mut self, aggregate: TypeId, byte_size: u64) {
        match &mut self.types[aggregate] {
            TypeDeclaration::Struct { explicit_size, .. }
            | TypeDeclaration::Union { explicit_size, .. } => *explicit_size = Some(byte_size),
            _ => {}
        }
    }

    /// Append a member, placing it at the current aggregate size aligned up
    /// to the member's natural alignment. Union members always land at
    /// offset zero. Returns false when the target is not an aggregate.
    pub fn add_member(&mut self, aggregate: TypeId, name: &str, member: TypeId) -> bool {
        let size = self.size(member);
        let natural = self.align(member).max(1);

        match &mut self.types[aggregate] {
            TypeDeclaration::Struct {
                members,
                cursor,
                align,
                ..
            } => {
                let offset = (*cursor + natural - 1) / natural * natural;
                members.push(Member {
                    name: name.to_string(),
                    type_id: member,
                    bit_offset: offset * 8,
                    bit_size: None,
                });
                *cursor = offset + size;
                *align = (*align).max(natural);
                true
            }
            TypeDeclaration::Union {
                members,
                largest,
                align,
                ..
            } => {
                members.push(Member {
                    name: name.to_string(),
                    type_id: member,
                    bit_offset: 0,
                    bit_size: None,
                });
                *largest = (*largest).max(size);
                *align = (*align).max(natural);
                true
            }
            _ => false,
        }
    }

    /// Append a member at an explicit bit position (bit-fields and members
    /// carrying debug-info offsets). Sequential placement resumes after the
    /// highest byte touched.
    pub fn add_member_at(
        &mut self,
        aggregate: TypeId,
        name: &str,
        member: TypeId,
        bit_offset: u64,
        bit_size: Option<u32>,
    ) -> bool {
        let size = self.size(member);
        let natural = self.align(member).max(1);
        let occupied_bits = bit_offset + bit_size.map(u64::from).unwrap_or(size * 8);

        match &mut self.types[aggregate] {
            TypeDeclaration::Struct {
                members,
                cursor,
                align,
                ..
            } => {
                members.push(Member {
                    name: name.to_string(),
                    type_id: member,
                    bit_offset,
                    bit_size,
                });
                *cursor = (*cursor).max((occupied_bits + 7) / 8);
                *align = (*align).max(natural);
                true
            }
            TypeDeclaration::Union {
                members,
                largest,
                align,
                ..
            } => {
                members.push(Member {
                    name: name.to_string(),
                    type_id: member,
                    bit_offset: 0,
                    bit_size,
                });
                *largest = (*largest).max(size);
                *align = (*align).max(natural);
                true
            }
            _ => false,
        }
    }

    /// Padded byte size of an instance of the type. Aliases forward to
    /// their target.
    pub fn size(&self, id: TypeId) -> u64 {
        match self.get(id) {
            TypeDeclaration::Integer { enc, .. } | TypeDeclaration::Float { enc, .. } => {
                ((enc.bits as u64) + 7) / 8
            }
            TypeDeclaration::Pointer { .. } => self.addr_size,
            TypeDeclaration::Array {
                element, nelems, ..
            } => self.size(*element) * *nelems as u64,
            TypeDeclaration::Function { .. } => 0,
            TypeDeclaration::Struct {
                cursor,
                align,
                explicit_size,
                ..
            } => explicit_size.unwrap_or_else(|| (*cursor + align - 1) / align * align),
            TypeDeclaration::Union {
                largest,
                align,
                explicit_size,
                ..
            } => explicit_size.unwrap_or_else(|| (*largest + align - 1) / align * align),
            TypeDeclaration::Enum { byte_size, .. } => *byte_size,
            TypeDeclaration::Typedef { target, .. }
            | TypeDeclaration::Volatile { target }
            | TypeDeclaration::Const { target }
            | TypeDeclaration::Restrict { target } => {
                target.map(|t| self.size(t)).unwrap_or(0)
            }
        }
    }

    /// Natural alignment of the type.
    pub fn align(&self, id: TypeId) -> u64 {
        match self.get(id) {
            TypeDeclaration::Integer { .. }
            | TypeDeclaration::Float { .. }
            | TypeDeclaration::Enum { .. } => self.size(id).clamp(1, self.addr_size),
            TypeDeclaration::Pointer { .. } | TypeDeclaration::Function { .. } => self.addr_size,
            TypeDeclaration::Array { element, .. } => self.align(*element),
            TypeDeclaration::Struct { align, .. } | TypeDeclaration::Union { align, .. } => *align,
            TypeDeclaration::Typedef { target, .. }
            | TypeDeclaration::Volatile { target }
            | TypeDeclaration::Const { target }
            | TypeDeclaration::Restrict { target } => {
                target.map(|t| self.align(t)).unwrap_or(1)
            }
        }
    }

    /// Follow the type graph, skipping aliasing nodes (typedef, volatile,
    /// const, restrict) until a base type is reached.
    pub fn resolve(&self, id: TypeId) -> TypeId {
        let mut current = id;
        loop {
            match self.get(current) {
                TypeDeclaration::Typedef {
                    target: Some(t), ..
                }
                | TypeDeclaration::Volatile { target: Some(t) }
                | TypeDeclaration::Const { target: Some(t) }
                | TypeDeclaration::Restrict { target: Some(t) } => current = *t,
                _ => return current,
            }
        }
    }

    /// C-style declarator of the type, e.g. `const int *` or `struct foo`.
    pub fn declname(&self, id: TypeId) -> String {
        match self.get(id) {
            TypeDeclaration::Integer { name, .. } | TypeDeclaration::Float { name, .. } => {
                name.clone()
            }
            TypeDeclaration::Pointer { target } => match target {
                Some(t) => format!("{} *", self.declname(*t)),
                None => "void *".to_string(),
            },
            TypeDeclaration::Array {
                element, nelems, ..
            } => format!("{}[{}]", self.declname(*element), nelems),
            TypeDeclaration::Function { return_type, .. } => match return_type {
                Some(t) => format!("{} ()", self.declname(*t)),
                None => "void ()".to_string(),
            },
            TypeDeclaration::Struct { name, .. } => {
                format!("struct {}", name.as_deref().unwrap_or("<anon>"))
            }
            TypeDeclaration::Union { name, .. } => {
                format!("union {}", name.as_deref().unwrap_or("<anon>"))
            }
            TypeDeclaration::Enum { name, .. } => {
                format!("enum {}", name.as_deref().unwrap_or("<anon>"))
            }
            TypeDeclaration::Typedef { name, .. } => name.clone(),
            TypeDeclaration::Volatile { target } => match target {
                Some(t) => format!("volatile {}", self.declname(*t)),
                None => "volatile void".to_string(),
            },
            TypeDeclaration::Const { target } => match target {
                Some(t) => format!("const {}", self.declname(*t)),
                None => "const void".to_string(),
            },
            TypeDeclaration::Restrict { target } => match target {
                Some(t) => format!("{} restrict", self.declname(*t)),
                None => "void restrict".to_string(),
            },
        }
    }

    /// Search a struct or union (resolving aliases first) for a member by
    /// name. Union members always report offset zero.
    pub fn membinfo(&self, id: TypeId, name: &str) -> Option<MemberInfo> {
        let base = self.resolve(id);
        let members = match self.get(base) {
            TypeDeclaration::Struct { members, .. } | TypeDeclaration::Union { members, .. } => {
                members
            }
            _ => return None,
        };
        members.iter().find(|m| m.name == name).map(|m| MemberInfo {
            type_id: m.type_id,
            bit_offset: m.bit_offset,
        })
    }

    /// Depth-first, left-to-right traversal of the type graph, invoking the
    /// visitor for every inner node and leaf with the member name, the
    /// accumulated bit offset and the recursion depth. Pointer targets are
    /// not followed.
    pub fn visit(
        &self,
        root: TypeId,
        f: &mut dyn FnMut(Option<&str>, TypeId, u64, usize) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        self.visit_node(None, root, 0, 0, f)
    }

    fn visit_node(
        &self,
        name: Option<&str>,
        id: TypeId,
        offset: u64,
        depth: usize,
        f: &mut dyn FnMut(Option<&str>, TypeId, u64, usize) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        f(name, id, offset, depth)?;

        match self.get(id) {
            TypeDeclaration::Struct { members, .. } | TypeDeclaration::Union { members, .. } => {
                for member in members {
                    self.visit_node(
                        Some(&member.name),
                        member.type_id,
                        offset + member.bit_offset,
                        depth + 1,
                        f,
                    )?;
                }
            }
            TypeDeclaration::Array { element, .. } => {
                self.visit_node(None, *element, offset, depth + 1, f)?;
            }
            TypeDeclaration::Typedef {
                target: Some(t), ..
            }
            | TypeDeclaration::Volatile { target: Some(t) }
            | TypeDeclaration::Const { target: Some(t) }
            | TypeDeclaration::Restrict { target: Some(t) } => {
                self.visit_node(None, *t, offset, depth + 1, f)?;
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn int32(types: &mut TypeCollection) -> TypeId {
        types.new_integer(
            "int",
            TypeEncoding {
                format: INT_SIGNED,
                offset: 0,
                bits: 32,
            },
        )
    }

    fn char8(types: &mut TypeCollection) -> TypeId {
        types.new_integer(
            "char",
            TypeEncoding {
                format: INT_SIGNED | INT_CHAR,
                offset: 0,
                bits: 8,
            },
        )
    }

    #[test]
    fn test_struct_layout_int_then_charptr() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);
        let char_t = char8(&mut types);
        let char_ptr = types.new_pointer(Some(char_t));

        let s = types.new_struct(Some("S"));
        assert!(types.add_member(s, "one", int));
        assert!(types.add_member(s, "two", char_ptr));

        assert_eq!(
            types.membinfo(s, "one"),
            Some(MemberInfo {
                type_id: int,
                bit_offset: 0
            })
        );
        assert_eq!(types.membinfo(s, "two").unwrap().bit_offset, 64);
        assert_eq!(types.size(s), 16);
        assert!(types.membinfo(s, "three").is_none());
    }

    #[test]
    fn test_sequential_member_offsets_monotonic() {
        let mut types = TypeCollection::default();
        let char_t = char8(&mut types);
        let int = int32(&mut types);

        let s = types.new_struct(Some("mixed"));
        types.add_member(s, "a", char_t);
        types.add_member(s, "b", int);
        types.add_member(s, "c", char_t);
        types.add_member(s, "d", int);

        let offsets: Vec<u64> = ["a", "b", "c", "d"]
            .iter()
            .map(|name| types.membinfo(s, name).unwrap().bit_offset)
            .collect();
        assert_eq!(offsets, vec![0, 32, 64, 96]);

        let mut prev_end = 0;
        for (name, off) in ["a", "b", "c", "d"].iter().zip(&offsets) {
            assert!(*off >= prev_end, "member {name} overlaps its predecessor");
            let info = types.membinfo(s, name).unwrap();
            prev_end = off + types.size(info.type_id) * 8;
        }
    }

    #[test]
    fn test_union_members_at_offset_zero() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);
        let char_t = char8(&mut types);
        let ptr = types.new_pointer(Some(char_t));

        let u = types.new_union(Some("U"));
        types.add_member(u, "num", int);
        types.add_member(u, "str", ptr);

        assert_eq!(types.membinfo(u, "num").unwrap().bit_offset, 0);
        assert_eq!(types.membinfo(u, "str").unwrap().bit_offset, 0);
        assert_eq!(types.size(u), 8);
    }

    #[test]
    fn test_resolve_is_idempotent_and_strips_aliases() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);
        let vol = types.new_volatile(Some(int));
        let cst = types.new_const(Some(vol));
        let alias = types.new_typedef("number", Some(cst));

        assert_eq!(types.resolve(alias), int);
        assert_eq!(types.resolve(cst), int);
        assert_eq!(types.resolve(types.resolve(alias)), types.resolve(alias));
        assert_eq!(types.resolve(int), int);
    }

    #[test]
    fn test_alias_size_forwards_to_target() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);
        let cst = types.new_const(Some(int));
        let rst = types.new_restrict(Some(cst));

        assert_eq!(types.size(cst), 4);
        assert_eq!(types.size(rst), 4);
    }

    #[test]
    fn test_declname() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);
        let cst = types.new_const(Some(int));
        let ptr = types.new_pointer(Some(cst));
        let s = types.new_struct(Some("foo"));
        let void_ptr = types.new_pointer(None);

        assert_eq!(types.declname(int), "int");
        assert_eq!(types.declname(cst), "const int");
        assert_eq!(types.declname(ptr), "const int *");
        assert_eq!(types.declname(s), "struct foo");
        assert_eq!(types.declname(void_ptr), "void *");
    }

    #[test]
    fn test_bitfield_members_keep_insertion_order() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);

        let s = types.new_struct(Some("flags"));
        types.add_member_at(s, "bit1", int, 0, Some(1));
        types.add_member_at(s, "bit2", int, 1, Some(1));
        types.add_member_at(s, "rest", int, 2, Some(30));

        assert_eq!(types.membinfo(s, "bit1").unwrap().bit_offset, 0);
        assert_eq!(types.membinfo(s, "bit2").unwrap().bit_offset, 1);
        assert_eq!(types.membinfo(s, "rest").unwrap().bit_offset, 2);
        assert_eq!(types.size(s), 4);
    }

    #[test]
    fn test_visit_depth_first_left_to_right() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);
        let char_t = char8(&mut types);
        let ptr = types.new_pointer(Some(char_t));

        let inner = types.new_struct(Some("inner"));
        types.add_member(inner, "x", int);

        let outer = types.new_struct(Some("outer"));
        types.add_member(outer, "first", inner);
        types.add_member(outer, "second", ptr);

        let mut seen = vec![];
        let flow = types.visit(outer, &mut |name, id, offset, depth| {
            seen.push((name.map(str::to_string), types.kind(id), offset, depth));
            ControlFlow::Continue(())
        });
        assert_eq!(flow, ControlFlow::Continue(()));

        assert_eq!(
            seen,
            vec![
                (None, TypeKind::Struct, 0, 0),
                (Some("first".into()), TypeKind::Struct, 0, 1),
                (Some("x".into()), TypeKind::Integer, 0, 2),
                (Some("second".into()), TypeKind::Pointer, 64, 1),
            ]
        );
    }

    #[test]
    fn test_visit_break_stops_traversal() {
        let mut types = TypeCollection::default();
        let int = int32(&mut types);
        let s = types.new_struct(Some("s"));
        types.add_member(s, "a", int);
        types.add_member(s, "b", int);

        let mut count = 0;
        let flow = types.visit(s, &mut |_, _, _, _| {
            count += 1;
            if count == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(count, 2);
    }
}
