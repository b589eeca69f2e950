use crate::tracer::address::RelocatedAddress;
use crate::tracer::dwarf::eval::ExpressionEvaluator;
use crate::tracer::dwarf::{DebugInformation, EndianArcSlice};
use crate::tracer::error::Error;
use crate::tracer::obj::MappedObject;
use crate::tracer::proc::Proc;
use crate::tracer::register::{DwarfRegisterMap, DWARF_SP};
use crate::weak_error;
use gimli::CfaRule::RegisterAndOffset;
use gimli::{CfaRule, DebugFrame, EhFrame, RegisterRule, UnwindSection};

/// Result of evaluating one call-frame-information row: the register file
/// of the caller, the canonical frame address and the return address.
pub(crate) struct UnwoundFrame {
    pub registers: DwarfRegisterMap,
    pub cfa: RelocatedAddress,
    pub ret_addr: Option<RelocatedAddress>,
}

/// Compute the caller frame from debug unwind tables.
///
/// Returns `Ok(None)` when neither `.eh_frame` nor `.debug_frame` describes
/// the pc, which sends the caller to the frame-pointer fallback.
pub(crate) fn unwind_once(
    proc: &Proc,
    object: &MappedObject,
    di: &DebugInformation,
    registers: &DwarfRegisterMap,
    pc: RelocatedAddress,
) -> Result<Option<UnwoundFrame>, Error> {
    let global_pc = object.to_global(pc).as_u64();

    let mut ucx = Box::new(gimli::UnwindContext::new());
    let (cie_ra, row) = match di
        .eh_frame
        .fde_for_address(&di.bases, global_pc, EhFrame::cie_from_offset)
    {
        Ok(fde) => {
            let ra = fde.cie().return_address_register();
            let row = fde.unwind_info_for_address(&di.eh_frame, &di.bases, &mut ucx, global_pc)?;
            (ra, row.clone())
        }
        Err(gimli::Error::NoUnwindInfoForAddress) => {
            let Some(debug_frame) = di.debug_frame.as_ref() else {
                return Ok(None);
            };
            let fde = match debug_frame.fde_for_address(
                &di.bases,
                global_pc,
                DebugFrame::cie_from_offset,
            ) {
                Ok(fde) => fde,
                Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let ra = fde.cie().return_address_register();
            let row = fde.unwind_info_for_address(debug_frame, &di.bases, &mut ucx, global_pc)?;
            (ra, row.clone())
        }
        Err(e) => return Err(e.into()),
    };

    let evaluator = ExpressionEvaluator::new(
        proc,
        di.unit_encoding_for(global_pc),
        object.base_offset(),
        registers.clone(),
    );

    let cfa = match row.cfa() {
        RegisterAndOffset { register, offset } => {
            RelocatedAddress::from(registers.value(*register)?).offset(*offset)
        }
        CfaRule::Expression(expr) => {
            RelocatedAddress::from(evaluator.evaluate(expr.clone())?.into_scalar()?)
        }
    };

    let mut next_registers = registers.clone();
    for (register, rule) in row.registers() {
        let value = match rule {
            RegisterRule::Undefined => continue,
            RegisterRule::SameValue => match weak_error!(registers.value(*register)) {
                Some(v) => v,
                None => continue,
            },
            RegisterRule::Offset(offset) => {
                match weak_error!(proc.read_ptr(cfa.offset(*offset))) {
                    Some(v) => v,
                    None => continue,
                }
            }
            RegisterRule::ValOffset(offset) => cfa.offset(*offset).as_u64(),
            RegisterRule::Register(reg) => match weak_error!(registers.value(*reg)) {
                Some(v) => v,
                None => continue,
            },
            RegisterRule::Expression(expr) => {
                let addr = weak_error!(evaluator
                    .evaluate(expr.clone())
                    .and_then(|result| result.into_scalar()));
                match addr.and_then(|addr| {
                    weak_error!(proc.read_ptr(RelocatedAddress::from(addr)))
                }) {
                    Some(v) => v,
                    None => continue,
                }
            }
            RegisterRule::ValExpression(expr) => {
                match weak_error!(evaluator
                    .evaluate(expr.clone())
                    .and_then(|result| result.into_scalar()))
                {
                    Some(v) => v,
                    None => continue,
                }
            }
            RegisterRule::Constant(value) => *value,
            RegisterRule::Architectural => continue,
            _ => continue,
        };
        next_registers.update(*register, value);
    }

    // the callers stack pointer is the CFA by definition
    next_registers.update(DWARF_SP, cfa.as_u64());
    let ret_addr = next_registers.value(cie_ra).ok().map(RelocatedAddress::from);

    Ok(Some(UnwoundFrame {
        registers: next_registers,
        cfa,
        ret_addr,
    }))
}
