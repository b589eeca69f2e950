use crate::tracer::dwarf::{die_name, DebugInformation, EndianArcSlice};
use crate::tracer::error::Error;
use crate::tracer::types::{
    TypeCollection, TypeEncoding, TypeId, FP_DOUBLE, FP_SINGLE, INT_BOOL, INT_CHAR, INT_SIGNED,
};
use gimli::{AttributeValue, DebuggingInformationEntry, DwTag, UnitOffset};
use log::debug;
use std::collections::HashMap;

type DieKey = (usize, UnitOffset);

/// Decode the type DIE at `offset` into the object's type collection.
/// Decoded entries are cached so shared and cyclic graphs converge.
pub(crate) fn resolve_type(
    di: &DebugInformation,
    unit_idx: usize,
    offset: UnitOffset,
    types: &mut TypeCollection,
    cache: &mut HashMap<DieKey, TypeId>,
) -> Option<TypeId> {
    match decode(di, unit_idx, offset, types, cache) {
        Ok(id) => Some(id),
        Err(e) => {
            debug!(target: "tracer", "type decoding failed: {e:#}");
            None
        }
    }
}

struct RootDie {
    tag: DwTag,
    name: Option<String>,
    type_offset: Option<UnitOffset>,
    byte_size: Option<u64>,
    encoding: Option<gimli::DwAte>,
}

struct ChildDie {
    tag: DwTag,
    name: Option<String>,
    type_offset: Option<UnitOffset>,
    byte_offset: Option<u64>,
    data_bit_offset: Option<u64>,
    bit_size: Option<u32>,
    const_value: Option<i64>,
    count: Option<u64>,
    upper_bound: Option<u64>,
}

fn decode(
    di: &DebugInformation,
    unit_idx: usize,
    offset: UnitOffset,
    types: &mut TypeCollection,
    cache: &mut HashMap<DieKey, TypeId>,
) -> Result<TypeId, Error> {
    if let Some(&id) = cache.get(&(unit_idx, offset)) {
        return Ok(id);
    }

    let (root, children) = read_die(di, unit_idx, offset)?;
    let decode_ref = |offset: Option<UnitOffset>,
                          types: &mut TypeCollection,
                          cache: &mut HashMap<DieKey, TypeId>|
     -> Option<TypeId> {
        offset.and_then(|offset| decode(di, unit_idx, offset, types, cache).ok())
    };

    let id = match root.tag {
        gimli::DW_TAG_base_type => {
            let bits = (root.byte_size.unwrap_or(0) * 8) as u32;
            let name = root.name.as_deref().unwrap_or("<unnamed>");
            match root.encoding {
                Some(gimli::DW_ATE_float) => types.new_float(
                    name,
                    TypeEncoding {
                        format: if bits == 32 { FP_SINGLE } else { FP_DOUBLE },
                        offset: 0,
                        bits,
                    },
                ),
                encoding => {
                    let format = match encoding {
                        Some(gimli::DW_ATE_signed) => INT_SIGNED,
                        Some(gimli::DW_ATE_signed_char) => INT_SIGNED | INT_CHAR,
                        Some(gimli::DW_ATE_unsigned_char) => INT_CHAR,
                        Some(gimli::DW_ATE_boolean) => INT_BOOL,
                        _ => 0,
                    };
                    types.new_integer(
                        name,
                        TypeEncoding {
                            format,
                            offset: 0,
                            bits,
                        },
                    )
                }
            }
        }

        gimli::DW_TAG_pointer_type => {
            // registered ahead of its target so pointer cycles terminate
            let id = types.new_pointer(None);
            cache.insert((unit_idx, offset), id);
            if let Some(target) = decode_ref(root.type_offset, types, cache) {
                types.set_pointer_target(id, target);
            }
            return Ok(id);
        }

        gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => {
            let id = if root.tag == gimli::DW_TAG_structure_type {
                types.new_struct(root.name.as_deref())
            } else {
                types.new_union(root.name.as_deref())
            };
            cache.insert((unit_idx, offset), id);
            if let Some(byte_size) = root.byte_size {
                types.set_aggregate_size(id, byte_size);
            }

            for child in children {
                if child.tag != gimli::DW_TAG_member {
                    continue;
                }
                let Some(member_type) = decode_ref(child.type_offset, types, cache) else {
                    continue;
                };
                let bit_offset = child
                    .data_bit_offset
                    .unwrap_or_else(|| child.byte_offset.unwrap_or(0) * 8);
                types.add_member_at(
                    id,
                    child.name.as_deref().unwrap_or_default(),
                    member_type,
                    bit_offset,
                    child.bit_size,
                );
            }
            return Ok(id);
        }

        gimli::DW_TAG_enumeration_type => {
            let enumerators = children
                .iter()
                .filter(|child| child.tag == gimli::DW_TAG_enumerator)
                .map(|child| {
                    (
                        child.name.clone().unwrap_or_default(),
                        child.const_value.unwrap_or(0),
                    )
                })
                .collect();
            types.new_enum(
                root.name.as_deref(),
                enumerators,
                root.byte_size.unwrap_or(4),
            )
        }

        gimli::DW_TAG_array_type => {
            let element =
                decode_ref(root.type_offset, types, cache).ok_or(Error::TypeNotFound)?;
            let subrange = children
                .iter()
                .find(|child| child.tag == gimli::DW_TAG_subrange_type);
            let nelems = subrange
                .and_then(|sub| sub.count.or(sub.upper_bound.map(|ub| ub + 1)))
                .unwrap_or(0);
            let index =
                subrange.and_then(|sub| decode_ref(sub.type_offset, types, cache));
            types.new_array(element, index, nelems as u32)
        }

        gimli::DW_TAG_subroutine_type => {
            let return_type = decode_ref(root.type_offset, types, cache);
            let args = children
                .iter()
                .filter(|child| child.tag == gimli::DW_TAG_formal_parameter)
                .filter_map(|child| decode_ref(child.type_offset, types, cache))
                .collect();
            let variadic = children
                .iter()
                .any(|child| child.tag == gimli::DW_TAG_unspecified_parameters);
            types.new_function(return_type, args, variadic)
        }

        gimli::DW_TAG_typedef => {
            let target = decode_ref(root.type_offset, types, cache);
            types.new_typedef(root.name.as_deref().unwrap_or("<unnamed>"), target)
        }
        gimli::DW_TAG_const_type => {
            let target = decode_ref(root.type_offset, types, cache);
            types.new_const(target)
        }
        gimli::DW_TAG_volatile_type => {
            let target = decode_ref(root.type_offset, types, cache);
            types.new_volatile(target)
        }
        gimli::DW_TAG_restrict_type => {
            let target = decode_ref(root.type_offset, types, cache);
            types.new_restrict(target)
        }

        _ => return Err(Error::TypeNotFound),
    };

    cache.insert((unit_idx, offset), id);
    Ok(id)
}

fn read_die(
    di: &DebugInformation,
    unit_idx: usize,
    offset: UnitOffset,
) -> Result<(RootDie, Vec<ChildDie>), Error> {
    let unit_data = di.unit(unit_idx);
    let unit = &unit_data.unit;

    let mut entries = unit.entries_at_offset(offset)?;
    let Some((_, entry)) = entries.next_dfs()? else {
        return Err(Error::TypeNotFound);
    };

    let root = RootDie {
        tag: entry.tag(),
        name: die_name(di.dwarf(), unit, entry),
        type_offset: attr_type_ref(entry),
        byte_size: attr_udata(entry, gimli::DW_AT_byte_size),
        encoding: match entry.attr_value(gimli::DW_AT_encoding)? {
            Some(AttributeValue::Encoding(ate)) => Some(ate),
            _ => None,
        },
    };

    let mut children = vec![];
    let mut depth = 0isize;
    while let Some((delta, entry)) = entries.next_dfs()? {
        depth += delta;
        if depth <= 0 {
            break;
        }
        if depth != 1 {
            continue;
        }
        children.push(ChildDie {
            tag: entry.tag(),
            name: die_name(di.dwarf(), unit, entry),
            type_offset: attr_type_ref(entry),
            byte_offset: attr_udata(entry, gimli::DW_AT_data_member_location),
            data_bit_offset: attr_udata(entry, gimli::DW_AT_data_bit_offset),
            bit_size: attr_udata(entry, gimli::DW_AT_bit_size).map(|v| v as u32),
            const_value: attr_const(entry),
            count: attr_udata(entry, gimli::DW_AT_count),
            upper_bound: attr_udata(entry, gimli::DW_AT_upper_bound),
        });
    }

    Ok((root, children))
}

fn attr_type_ref(entry: &DebuggingInformationEntry<EndianArcSlice>) -> Option<UnitOffset> {
    match entry.attr_value(gimli::DW_AT_type).ok()? {
        Some(AttributeValue::UnitRef(offset)) => Some(offset),
        _ => None,
    }
}

fn attr_udata(
    entry: &DebuggingInformationEntry<EndianArcSlice>,
    name: gimli::DwAt,
) -> Option<u64> {
    entry.attr_value(name).ok()?.and_then(|v| v.udata_value())
}

fn attr_const(entry: &DebuggingInformationEntry<EndianArcSlice>) -> Option<i64> {
    let value = entry.attr_value(gimli::DW_AT_const_value).ok()??;
    value
        .sdata_value()
        .or_else(|| value.udata_value().map(|v| v as i64))
}
