use crate::tracer::dwarf::EndianArcSlice;
use crate::tracer::error::Error;
use gimli::{Dwarf, RunTimeEndian, SectionId};
use object::{Object, ObjectSection};
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

const DWARF_SECTIONS: &[SectionId] = &[
    SectionId::DebugAbbrev,
    SectionId::DebugAddr,
    SectionId::DebugAranges,
    SectionId::DebugInfo,
    SectionId::DebugLine,
    SectionId::DebugLineStr,
    SectionId::DebugStr,
    SectionId::DebugStrOffsets,
    SectionId::DebugTypes,
    SectionId::DebugLoc,
    SectionId::DebugLocLists,
    SectionId::DebugRanges,
    SectionId::DebugRngLists,
];

pub fn load_section(id: SectionId, file: &object::File, endian: RunTimeEndian) -> EndianArcSlice {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    gimli::EndianArcSlice::new(Arc::from(&*data), endian)
}

/// Load debug sections from a file. For better loading time all sections
/// load in parallel inside a thread pool.
pub fn load_par(file: &object::File, endian: RunTimeEndian) -> Result<Dwarf<EndianArcSlice>, Error> {
    let sections: HashMap<SectionId, EndianArcSlice> = DWARF_SECTIONS
        .par_iter()
        .map(|&id| (id, load_section(id, file, endian)))
        .collect();

    let empty = gimli::EndianArcSlice::new(Arc::from(&[][..]), endian);
    let dwarf = Dwarf::load(|id| -> gimli::Result<EndianArcSlice> {
        Ok(sections.get(&id).cloned().unwrap_or_else(|| empty.clone()))
    })?;
    Ok(dwarf)
}
