use crate::muted_error;
use crate::tracer::address::{GlobalAddress, RelocatedAddress};
use crate::tracer::dwarf::eval::{EvalOption, ExpressionEvaluator};
use crate::tracer::dwarf::unwind::unwind_once;
use crate::tracer::dwarf::{attr_as_expression, DebugInformation, EndianArcSlice, UnitData};
use crate::tracer::obj::MappedObject;
use crate::tracer::proc::Proc;
use crate::tracer::symbolic::Symbolicator;
use crate::tracer::types::{TypeCollection, TypeDeclaration, TypeId, INT_BOOL, INT_CHAR, INT_SIGNED};
use crate::tracer::unwind::UnwindCursor;
use itertools::Itertools;
use std::rc::Rc;

const MAX_RENDER_DEPTH: usize = 2;
const MAX_RENDER_ITEMS: usize = 8;
const MAX_STRING_PREVIEW: usize = 32;

/// A formal parameter of the frame in declaration order, resolved as far as
/// the debug information allows.
pub struct FrameParameter {
    pub name: String,
    pub type_id: Option<TypeId>,
    pub addr: Option<RelocatedAddress>,
    pub size: u64,
    pub declname: String,
}

/// Resolve every formal parameter of the subprogram enclosing the cursor's
/// pc. Parameters whose location cannot be evaluated (optimized out) keep
/// `addr = None`.
pub fn frame_parameters(proc: &Proc, cursor: &UnwindCursor) -> Vec<FrameParameter> {
    let Some(mapping) = proc.mapping_for_addr(cursor.pc()) else {
        return vec![];
    };
    let object = mapping.object;
    let Some(di) = object.debug_info() else {
        return vec![];
    };
    // unwind tables alone cannot name parameters
    if !di.has_debug_info() {
        return vec![];
    }

    let global_pc = object.to_global(cursor.pc());
    let Some((unit_idx, function)) = di.find_function_by_pc(global_pc) else {
        return vec![];
    };
    let unit = di.unit(unit_idx);

    let evaluator = ExpressionEvaluator::new(
        proc,
        unit.unit.encoding(),
        object.base_offset(),
        cursor.dwarf_regs().clone(),
    );

    let cfa = muted_error!(unwind_once(
        proc,
        &object,
        &di,
        cursor.dwarf_regs(),
        cursor.pc()
    ))
    .flatten()
    .map(|frame| frame.cfa.as_u64());

    let frame_base = function.frame_base.as_ref().and_then(|attr| {
        let expr = attr_as_expression(&di, unit, attr, global_pc)?;
        let mut opts = EvalOption::new();
        if let Some(cfa) = cfa {
            opts = opts.with_cfa(cfa);
        }
        evaluator.evaluate_with_opts(expr, opts).ok()?.into_scalar().ok()
    });

    function
        .params
        .iter()
        .map(|param| {
            let type_id = param
                .type_offset
                .and_then(|offset| object.type_for_die(unit_idx, offset));
            let addr = param.location.as_ref().and_then(|attr| {
                resolve_location(&di, unit, attr, global_pc, &evaluator, frame_base, cfa)
            });
            let (size, declname) = match type_id {
                Some(type_id) => {
                    object.with_types(|types| (types.size(type_id), types.declname(type_id)))
                }
                None => (0, "<optimized out>".to_string()),
            };

            FrameParameter {
                name: param.name.clone().unwrap_or_default(),
                type_id,
                addr,
                size,
                declname,
            }
        })
        .collect()
}

/// Resolve one named formal parameter of the frame (case-sensitive) to its
/// type and target address.
pub fn resolve_parameter(
    proc: &Proc,
    cursor: &UnwindCursor,
    name: &str,
) -> Option<(Rc<MappedObject>, TypeId, RelocatedAddress)> {
    let object = proc.mapping_for_addr(cursor.pc())?.object;
    let param = frame_parameters(proc, cursor)
        .into_iter()
        .find(|param| param.name == name)?;
    Some((object, param.type_id?, param.addr?))
}

fn resolve_location(
    di: &DebugInformation,
    unit: &UnitData,
    attr: &gimli::Attribute<EndianArcSlice>,
    global_pc: GlobalAddress,
    evaluator: &ExpressionEvaluator,
    frame_base: Option<u64>,
    cfa: Option<u64>,
) -> Option<RelocatedAddress> {
    let expr = attr_as_expression(di, unit, attr, global_pc)?;
    let mut opts = EvalOption::new();
    if let Some(frame_base) = frame_base {
        opts = opts.with_frame_base(frame_base);
    }
    if let Some(cfa) = cfa {
        opts = opts.with_cfa(cfa);
    }
    evaluator.evaluate_with_opts(expr, opts).ok()?.into_address()
}

/// Pretty-print the value at `addr` according to its decoded type.
pub fn render_value(
    proc: &Proc,
    object: &MappedObject,
    type_id: TypeId,
    addr: RelocatedAddress,
) -> String {
    object.with_types(|types| render(proc, types, type_id, addr, 0))
}

fn render(
    proc: &Proc,
    types: &TypeCollection,
    type_id: TypeId,
    addr: RelocatedAddress,
    depth: usize,
) -> String {
    let base = types.resolve(type_id);
    let size = types.size(base) as usize;

    match types.get(base) {
        TypeDeclaration::Integer { enc, .. } => {
            let Some(raw) = read_scalar(proc, addr, size) else {
                return "<unreadable>".to_string();
            };
            if enc.format & INT_BOOL != 0 {
                return if raw == 0 { "false" } else { "true" }.to_string();
            }
            if enc.format & INT_CHAR != 0 {
                let byte = raw as u8;
                return match byte.is_ascii_graphic() || byte == b' ' {
                    true => format!("{} '{}'", raw as i64 as i8, byte as char),
                    false => format!("{}", raw as i64 as i8),
                };
            }
            if enc.format & INT_SIGNED != 0 {
                format!("{}", sign_extend(raw, size))
            } else {
                format!("{raw}")
            }
        }

        TypeDeclaration::Float { .. } => {
            let Some(raw) = read_scalar(proc, addr, size) else {
                return "<unreadable>".to_string();
            };
            match size {
                4 => format!("{}", f32::from_bits(raw as u32)),
                _ => format!("{}", f64::from_bits(raw)),
            }
        }

        TypeDeclaration::Pointer { target } => {
            let Some(raw) = read_scalar(proc, addr, size) else {
                return "<unreadable>".to_string();
            };
            let mut out = format!("{raw:#x}");
            // a readable char pointer gets a string preview, anything else
            // a data-symbol annotation when the pointee resolves to one
            if raw != 0 && is_char_pointer(types, *target) {
                let mut preview = proc.read_string(RelocatedAddress::from(raw));
                if preview.len() > MAX_STRING_PREVIEW {
                    preview.truncate(MAX_STRING_PREVIEW);
                    preview.push_str("...");
                }
                out.push_str(&format!(" \"{preview}\""));
            } else if raw != 0 {
                let label = Symbolicator::new(proc).data_sym_name(RelocatedAddress::from(raw));
                if !label.is_empty() {
                    out.push_str(&format!(" <{label}>"));
                }
            }
            out
        }

        TypeDeclaration::Enum { enumerators, .. } => {
            let Some(raw) = read_scalar(proc, addr, size) else {
                return "<unreadable>".to_string();
            };
            let value = sign_extend(raw, size);
            match enumerators.iter().find(|(_, v)| *v == value) {
                Some((name, _)) => name.clone(),
                None => format!("{value}"),
            }
        }

        TypeDeclaration::Struct { members, .. } | TypeDeclaration::Union { members, .. } => {
            if depth >= MAX_RENDER_DEPTH {
                return "{...}".to_string();
            }
            let rendered = members
                .iter()
                .take(MAX_RENDER_ITEMS)
                .map(|member| {
                    let member_addr = addr.offset((member.bit_offset / 8) as i64);
                    format!(
                        "{} = {}",
                        member.name,
                        render(proc, types, member.type_id, member_addr, depth + 1)
                    )
                })
                .join(", ");
            match members.len() > MAX_RENDER_ITEMS {
                true => format!("{{{rendered}, ...}}"),
                false => format!("{{{rendered}}}"),
            }
        }

        TypeDeclaration::Array {
            element, nelems, ..
        } => {
            if depth >= MAX_RENDER_DEPTH {
                return "[...]".to_string();
            }
            let element_size = types.size(*element);
            let shown = (*nelems as usize).min(MAX_RENDER_ITEMS);
            let rendered = (0..shown)
                .map(|idx| {
                    let element_addr = addr.offset(idx as i64 * element_size as i64);
                    render(proc, types, *element, element_addr, depth + 1)
                })
                .join(", ");
            match *nelems as usize > shown {
                true => format!("[{rendered}, ...]"),
                false => format!("[{rendered}]"),
            }
        }

        TypeDeclaration::Function { .. } => format!("<fn@{addr}>"),

        // resolve() leaves only base kinds
        _ => "<optimized out>".to_string(),
    }
}

fn is_char_pointer(types: &TypeCollection, target: Option<TypeId>) -> bool {
    let Some(target) = target else { return false };
    match types.get(types.resolve(target)) {
        TypeDeclaration::Integer { enc, .. } => enc.format & INT_CHAR != 0,
        _ => false,
    }
}

fn read_scalar(proc: &Proc, addr: RelocatedAddress, size: usize) -> Option<u64> {
    let size = size.clamp(1, 8);
    let mut buf = [0u8; 8];
    if proc.read_mem(addr, &mut buf[..size]) != size {
        return None;
    }
    Some(u64::from_ne_bytes(buf))
}

fn sign_extend(raw: u64, size: usize) -> i64 {
    let bits = (size.clamp(1, 8) * 8) as u32;
    if bits == 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracer::testing::scripted_proc;
    use crate::tracer::types::TypeEncoding;

    fn collection_with_int(bits: u32, format: u32) -> (TypeCollection, TypeId) {
        let mut types = TypeCollection::default();
        let id = types.new_integer(
            "int",
            TypeEncoding {
                format,
                offset: 0,
                bits,
            },
        );
        (types, id)
    }

    #[test]
    fn test_render_signed_integer() {
        let proc = scripted_proc(&[], &[(0x1000, (-42i32).to_ne_bytes().to_vec())]);
        let (types, int) = collection_with_int(32, INT_SIGNED);
        assert_eq!(
            render(&proc, &types, int, RelocatedAddress::from(0x1000u64), 0),
            "-42"
        );
    }

    #[test]
    fn test_render_unreadable_memory() {
        let proc = scripted_proc(&[], &[]);
        let (types, int) = collection_with_int(32, INT_SIGNED);
        assert_eq!(
            render(&proc, &types, int, RelocatedAddress::from(0x1000u64), 0),
            "<unreadable>"
        );
    }

    #[test]
    fn test_render_char_pointer_with_preview() {
        let mut memory = vec![(0x1000u64, 0x2000u64.to_ne_bytes().to_vec())];
        memory.push((0x2000, b"hello\0".to_vec()));
        let proc = scripted_proc(&[], &memory);

        let mut types = TypeCollection::default();
        let ch = types.new_integer(
            "char",
            TypeEncoding {
                format: INT_SIGNED | INT_CHAR,
                offset: 0,
                bits: 8,
            },
        );
        let ptr = types.new_pointer(Some(ch));

        assert_eq!(
            render(&proc, &types, ptr, RelocatedAddress::from(0x1000u64), 0),
            "0x2000 \"hello\""
        );
    }

    #[test]
    fn test_render_pointer_annotated_with_data_symbol() {
        let proc = scripted_proc(
            &[("./wedgie", 0x400000, 0x10000)],
            &[(0x1000, 0x401004u64.to_ne_bytes().to_vec())],
        );
        let object = proc.find_object(Some("./wedgie")).unwrap();
        object.push_symbol("greeting", GlobalAddress::from(0x401000u64), 0x10);

        let (mut types, int) = collection_with_int(32, INT_SIGNED);
        let ptr = types.new_pointer(Some(int));

        assert_eq!(
            render(&proc, &types, ptr, RelocatedAddress::from(0x1000u64), 0),
            "0x401004 <./wedgie`greeting+4>"
        );
    }

    #[test]
    fn test_render_struct_members() {
        let mut bytes = 1i32.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&2i32.to_ne_bytes());
        let proc = scripted_proc(&[], &[(0x1000, bytes)]);

        let mut types = TypeCollection::default();
        let int = types.new_integer(
            "int",
            TypeEncoding {
                format: INT_SIGNED,
                offset: 0,
                bits: 32,
            },
        );
        let s = types.new_struct(Some("pair"));
        types.add_member(s, "a", int);
        types.add_member(s, "b", int);

        assert_eq!(
            render(&proc, &types, s, RelocatedAddress::from(0x1000u64), 0),
            "{a = 1, b = 2}"
        );
    }

    #[test]
    fn test_render_enum_by_name() {
        let proc = scripted_proc(&[], &[(0x1000, 1i32.to_ne_bytes().to_vec())]);
        let mut types = TypeCollection::default();
        let e = types.new_enum(
            Some("color"),
            vec![("red".to_string(), 0), ("green".to_string(), 1)],
            4,
        );
        assert_eq!(
            render(&proc, &types, e, RelocatedAddress::from(0x1000u64), 0),
            "green"
        );
    }
}
