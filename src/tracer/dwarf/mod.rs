pub mod eval;
pub mod loader;
pub mod types;
pub mod unwind;

use crate::tracer::address::GlobalAddress;
use crate::tracer::error::Error;
use fallible_iterator::FallibleIterator;
use gimli::{
    Attribute, AttributeValue, BaseAddresses, DebugFrame, Dwarf, EhFrame, Expression, Range,
    Reader, RunTimeEndian, Section, UnitOffset,
};
use log::info;
use object::{Object, ObjectSection};
use rayon::prelude::*;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Source position resolved from the line-number table.
#[derive(Debug, Clone)]
pub struct Place {
    pub file: PathBuf,
    pub line: u64,
}

#[derive(Debug, Clone)]
struct LineRow {
    addr: u64,
    file: u64,
    line: u64,
}

/// Formal parameter of a subprogram, in declaration order.
pub struct ParamData {
    pub name: Option<String>,
    pub type_offset: Option<UnitOffset>,
    pub location: Option<Attribute<EndianArcSlice>>,
}

/// Subprogram entry with everything the tracer interrogates.
pub struct FunctionData {
    pub name: Option<String>,
    pub ranges: Vec<Range>,
    pub frame_base: Option<Attribute<EndianArcSlice>>,
    pub params: Vec<ParamData>,
}

/// One compilation unit: its address ranges, sorted line rows, file table
/// and subprograms.
pub struct UnitData {
    pub(super) unit: gimli::Unit<EndianArcSlice>,
    pub ranges: Vec<Range>,
    lines: Vec<LineRow>,
    files: Vec<PathBuf>,
    pub functions: Vec<FunctionData>,
    /// (range, function index), sorted by range begin
    fn_ranges: Vec<(Range, usize)>,
}

impl UnitData {
    /// Best matched source place for a pc inside this unit.
    fn find_place(&self, pc: GlobalAddress) -> Option<Place> {
        if !pc.in_ranges(&self.ranges) {
            return None;
        }

        let pos = self.lines.partition_point(|row| row.addr <= pc.as_u64());
        let row = self.lines[..pos].last()?;
        let file = self.files.get(row.file as usize)?.clone();
        Some(Place {
            file,
            line: row.line,
        })
    }

    fn find_function(&self, pc: GlobalAddress) -> Option<(usize, &FunctionData)> {
        let pc = pc.as_u64();
        let pos = self.fn_ranges.partition_point(|(range, _)| range.begin <= pc);
        self.fn_ranges[..pos]
            .iter()
            .rev()
            .find(|(range, _)| range.begin <= pc && pc < range.end)
            .map(|&(_, idx)| (idx, &self.functions[idx]))
    }
}

/// Parsed debug information of one object file: DWARF sections, unwind
/// tables and the per-unit indexes built at load time.
pub struct DebugInformation {
    file: PathBuf,
    pub(super) inner: Dwarf<EndianArcSlice>,
    pub(super) eh_frame: EhFrame<EndianArcSlice>,
    pub(super) debug_frame: Option<DebugFrame<EndianArcSlice>>,
    pub(super) bases: BaseAddresses,
    units: Vec<UnitData>,
    /// address range -> unit index, sorted by range begin
    aranges: Vec<(Range, usize)>,
}

impl DebugInformation {
    pub fn build(obj_path: &Path, file: &object::File) -> Result<Self, Error> {
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let section_reader = |name: &str| -> EndianArcSlice {
            let data = file
                .section_by_name(name)
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[]));
            gimli::EndianArcSlice::new(Arc::from(&*data), endian)
        };

        let eh_frame = EhFrame::load(|id| -> gimli::Result<EndianArcSlice> {
            Ok(section_reader(id.name()))
        })?;
        let debug_frame_data = section_reader(".debug_frame");
        let debug_frame = (!debug_frame_data.is_empty()).then(|| DebugFrame::from(debug_frame_data));

        let section_addr = |name: &str| -> Option<u64> {
            file.section_by_name(name).map(|section| section.address())
        };
        let mut bases = BaseAddresses::default();
        if let Some(got) = section_addr(".got") {
            bases = bases.set_got(got);
        }
        if let Some(text) = section_addr(".text") {
            bases = bases.set_text(text);
        }
        if let Some(eh) = section_addr(".eh_frame") {
            bases = bases.set_eh_frame(eh);
        }
        if let Some(eh_frame_hdr) = section_addr(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(eh_frame_hdr);
        }

        let dwarf = loader::load_par(file, endian)?;
        let headers = dwarf.units().collect::<Vec<_>>()?;
        if headers.is_empty() {
            info!(target: "tracer", "no debug information for {obj_path:?}");
        }

        let mut units = headers
            .into_par_iter()
            .map(|header| parse_unit(&dwarf, header))
            .collect::<gimli::Result<Vec<_>>>()?;
        units.sort_by_key(|unit| unit.ranges.first().map(|r| r.begin).unwrap_or(u64::MAX));

        let mut aranges: Vec<(Range, usize)> = units
            .iter()
            .enumerate()
            .flat_map(|(idx, unit)| unit.ranges.iter().map(move |&range| (range, idx)))
            .collect();
        aranges.sort_by_key(|(range, _)| range.begin);

        Ok(Self {
            file: obj_path.to_path_buf(),
            inner: dwarf,
            eh_frame,
            debug_frame,
            bases,
            units,
            aranges,
        })
    }

    pub fn pathname(&self) -> &Path {
        &self.file
    }

    pub fn has_debug_info(&self) -> bool {
        !self.units.is_empty()
    }

    pub(crate) fn dwarf(&self) -> &Dwarf<EndianArcSlice> {
        &self.inner
    }

    pub(crate) fn unit(&self, idx: usize) -> &UnitData {
        &self.units[idx]
    }

    /// Searches for a unit by occurrence of the pc in its address ranges.
    pub fn find_unit_by_pc(&self, pc: GlobalAddress) -> Option<(usize, &UnitData)> {
        let pc = pc.as_u64();
        let pos = self.aranges.partition_point(|(range, _)| range.begin <= pc);
        self.aranges[..pos]
            .iter()
            .rev()
            .find(|(range, _)| range.begin <= pc && pc < range.end)
            .map(|&(_, idx)| (idx, &self.units[idx]))
    }

    /// Encoding of the unit covering the pc, or a plausible default when
    /// the pc falls outside every unit.
    pub(crate) fn unit_encoding_for(&self, pc: u64) -> gimli::Encoding {
        self.find_unit_by_pc(GlobalAddress::from(pc))
            .map(|(_, unit)| unit.unit.encoding())
            .unwrap_or(gimli::Encoding {
                format: gimli::Format::Dwarf32,
                version: 4,
                address_size: 8,
            })
    }

    /// Best matched source place for a pc.
    pub fn find_place_from_pc(&self, pc: GlobalAddress) -> Option<Place> {
        let (_, unit) = self.find_unit_by_pc(pc)?;
        unit.find_place(pc)
    }

    /// The subprogram whose range covers the pc.
    pub fn find_function_by_pc(&self, pc: GlobalAddress) -> Option<(usize, &FunctionData)> {
        let (unit_idx, unit) = self.find_unit_by_pc(pc)?;
        unit.find_function(pc).map(|(_, func)| (unit_idx, func))
    }
}

fn parse_unit(
    dwarf: &Dwarf<EndianArcSlice>,
    header: gimli::UnitHeader<EndianArcSlice>,
) -> gimli::Result<UnitData> {
    let unit = dwarf.unit(header)?;

    let mut ranges = vec![];
    let mut range_iter = dwarf.unit_ranges(&unit)?;
    while let Some(range) = range_iter.next()? {
        if range.begin < range.end {
            ranges.push(range);
        }
    }
    ranges.sort_by_key(|r| r.begin);

    let mut lines = vec![];
    let mut files = vec![];
    if let Some(program) = unit.line_program.clone() {
        let header = program.header().clone();

        let mut rows_iter = program.rows();
        while let Some((_, row)) = rows_iter.next_row()? {
            if row.end_sequence() {
                continue;
            }
            lines.push(LineRow {
                addr: row.address(),
                file: row.file_index(),
                line: row.line().map(|l| l.get()).unwrap_or(0),
            });
        }
        lines.sort_by_key(|row| row.addr);

        for idx in 0..=header.file_names().len() as u64 {
            let path = header
                .file(idx)
                .and_then(|fe| render_file_path(dwarf, &unit, fe, &header).ok())
                .unwrap_or_else(|| PathBuf::from("??"));
            files.push(path);
        }
    }

    let mut functions: Vec<FunctionData> = vec![];
    let mut current_fn: Option<(usize, isize)> = None;
    let mut depth = 0isize;
    let mut entries = unit.entries();
    while let Some((delta, entry)) = entries.next_dfs()? {
        depth += delta;
        if let Some((_, fn_depth)) = current_fn {
            if depth <= fn_depth {
                current_fn = None;
            }
        }

        match entry.tag() {
            gimli::DW_TAG_subprogram => {
                let mut fn_ranges = vec![];
                let mut die_ranges = dwarf.die_ranges(&unit, entry)?;
                while let Some(range) = die_ranges.next()? {
                    if range.begin < range.end {
                        fn_ranges.push(range);
                    }
                }

                functions.push(FunctionData {
                    name: die_name(dwarf, &unit, entry),
                    ranges: fn_ranges,
                    frame_base: entry.attr(gimli::DW_AT_frame_base)?,
                    params: vec![],
                });
                current_fn = Some((functions.len() - 1, depth));
            }
            gimli::DW_TAG_formal_parameter => {
                if let Some((fn_idx, fn_depth)) = current_fn {
                    // direct children only, parameters of nested scopes are
                    // not formals of this subprogram
                    if depth == fn_depth + 1 {
                        let type_offset = match entry.attr_value(gimli::DW_AT_type)? {
                            Some(AttributeValue::UnitRef(offset)) => Some(offset),
                            _ => None,
                        };
                        functions[fn_idx].params.push(ParamData {
                            name: die_name(dwarf, &unit, entry),
                            type_offset,
                            location: entry.attr(gimli::DW_AT_location)?,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    let mut fn_ranges: Vec<(Range, usize)> = functions
        .iter()
        .enumerate()
        .flat_map(|(idx, func)| func.ranges.iter().map(move |&range| (range, idx)))
        .collect();
    fn_ranges.sort_by_key(|(range, _)| range.begin);

    Ok(UnitData {
        unit,
        ranges,
        lines,
        files,
        functions,
        fn_ranges,
    })
}

pub(super) fn die_name(
    dwarf: &Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Option<String> {
    let attr = entry
        .attr_value(gimli::DW_AT_name)
        .ok()
        .flatten()
        .or_else(|| entry.attr_value(gimli::DW_AT_linkage_name).ok().flatten())?;
    let name = dwarf.attr_string(unit, attr).ok()?;
    Some(name.to_string_lossy().ok()?.into_owned())
}

fn render_file_path(
    dwarf: &Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    file: &gimli::FileEntry<EndianArcSlice>,
    header: &gimli::LineProgramHeader<EndianArcSlice>,
) -> Result<PathBuf, gimli::Error> {
    let name = dwarf.attr_string(unit, file.path_name())?;
    let mut path = PathBuf::from(name.to_string_lossy()?.into_owned());

    if path.is_relative() {
        if let Some(dir) = file.directory(header) {
            let dir = dwarf.attr_string(unit, dir)?;
            path = PathBuf::from(dir.to_string_lossy()?.into_owned()).join(path);
        }
    }
    if path.is_relative() {
        if let Some(comp_dir) = &unit.comp_dir {
            path = PathBuf::from(comp_dir.to_string_lossy()?.into_owned()).join(path);
        }
    }
    Ok(path)
}

/// Convert a location attribute into a DWARF expression, selecting the
/// location-list entry that covers the pc when needed.
pub(crate) fn attr_as_expression(
    di: &DebugInformation,
    unit: &UnitData,
    attr: &Attribute<EndianArcSlice>,
    pc: GlobalAddress,
) -> Option<Expression<EndianArcSlice>> {
    if let Some(expr) = attr.exprloc_value() {
        return Some(expr);
    }

    let offset = match attr.value() {
        AttributeValue::LocationListsRef(offset) => offset,
        AttributeValue::DebugLocListsIndex(index) => di
            .inner
            .locations
            .get_offset(unit.unit.encoding(), unit.unit.loclists_base, index)
            .ok()?,
        _ => return None,
    };

    let mut iter = di
        .inner
        .locations
        .locations(
            offset,
            unit.unit.encoding(),
            unit.unit.low_pc,
            &di.inner.debug_addr,
            unit.unit.addr_base,
        )
        .ok()?;

    let pc = pc.as_u64();
    while let Ok(Some(entry)) = iter.next() {
        if entry.range.begin <= pc && pc < entry.range.end {
            return Some(entry.data);
        }
    }
    None
}
