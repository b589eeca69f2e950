use crate::tracer::address::RelocatedAddress;
use crate::tracer::dwarf::EndianArcSlice;
use crate::tracer::error::Error;
use crate::tracer::error::Error::{EvalOptionRequired, EvalUnsupportedRequire};
use crate::tracer::proc::Proc;
use crate::tracer::register::DwarfRegisterMap;
use gimli::{Encoding, EvaluationResult, Expression, Location, Piece, Value, ValueType};

/// External context an expression may require during evaluation.
#[derive(Default)]
pub struct EvalOption {
    frame_base: Option<u64>,
    cfa: Option<u64>,
}

impl EvalOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_base(self, frame_base: u64) -> Self {
        Self {
            frame_base: Some(frame_base),
            ..self
        }
    }

    pub fn with_cfa(self, cfa: u64) -> Self {
        Self {
            cfa: Some(cfa),
            ..self
        }
    }
}

/// Drives a DWARF expression against the registers of one frame and the
/// memory of the stopped target.
pub struct ExpressionEvaluator<'a> {
    proc: &'a Proc,
    encoding: Encoding,
    /// relocation of the object the expression came from
    base_offset: i64,
    registers: DwarfRegisterMap,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(
        proc: &'a Proc,
        encoding: Encoding,
        base_offset: i64,
        registers: DwarfRegisterMap,
    ) -> Self {
        Self {
            proc,
            encoding,
            base_offset,
            registers,
        }
    }

    pub fn evaluate(&self, expr: Expression<EndianArcSlice>) -> Result<CompletedResult, Error> {
        self.evaluate_with_opts(expr, EvalOption::default())
    }

    pub fn evaluate_with_opts(
        &self,
        expr: Expression<EndianArcSlice>,
        opts: EvalOption,
    ) -> Result<CompletedResult, Error> {
        let mut eval = expr.evaluation(self.encoding);

        let mut result = eval.evaluate()?;
        while result != EvaluationResult::Complete {
            match result {
                EvaluationResult::RequiresRegister { register, .. } => {
                    let value = Value::Generic(self.registers.value(register)?);
                    result = eval.resume_with_register(value)?;
                }
                EvaluationResult::RequiresFrameBase => {
                    result = eval.resume_with_frame_base(
                        opts.frame_base.ok_or(EvalOptionRequired("frame_base"))?,
                    )?;
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    result =
                        eval.resume_with_call_frame_cfa(opts.cfa.ok_or(EvalOptionRequired("cfa"))?)?;
                }
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let mut buf = [0u8; 8];
                    let size = usize::min(size as usize, buf.len());
                    self.proc
                        .read_exact(RelocatedAddress::from(address), &mut buf[..size])?;
                    result = eval.resume_with_memory(Value::Generic(u64::from_ne_bytes(buf)))?;
                }
                EvaluationResult::RequiresRelocatedAddress(addr) => {
                    result = eval
                        .resume_with_relocated_address(addr.wrapping_add(self.base_offset as u64))?;
                }
                EvaluationResult::RequiresBaseType(_) => {
                    result = eval.resume_with_base_type(ValueType::Generic)?;
                }
                _ => {
                    return Err(EvalUnsupportedRequire(format!("{result:?}")));
                }
            };
        }

        Ok(CompletedResult {
            pieces: eval.result(),
            registers: self.registers.clone(),
        })
    }
}

pub struct CompletedResult {
    pieces: Vec<Piece<EndianArcSlice>>,
    registers: DwarfRegisterMap,
}

impl CompletedResult {
    /// The target address the expression located, when it names memory.
    pub fn into_address(self) -> Option<RelocatedAddress> {
        match self.pieces.into_iter().next()?.location {
            Location::Address { address } => Some(RelocatedAddress::from(address)),
            _ => None,
        }
    }

    /// Scalar result of an address-valued or value-valued expression.
    pub fn into_scalar(self) -> Result<u64, Error> {
        let piece = self
            .pieces
            .into_iter()
            .next()
            .ok_or(EvalUnsupportedRequire("empty result".to_string()))?;
        match piece.location {
            Location::Address { address } => Ok(address),
            Location::Value { value } => Ok(value_as_u64(value)),
            Location::Register { register } => self.registers.value(register),
            other => Err(EvalUnsupportedRequire(format!("{other:?}"))),
        }
    }
}

fn value_as_u64(value: Value) -> u64 {
    match value {
        Value::Generic(v) | Value::U64(v) => v,
        Value::I8(v) => v as u64,
        Value::U8(v) => v as u64,
        Value::I16(v) => v as u64,
        Value::U16(v) => v as u64,
        Value::I32(v) => v as u64,
        Value::U32(v) => v as u64,
        Value::I64(v) => v as u64,
        Value::F32(v) => v as u64,
        Value::F64(v) => v as u64,
    }
}
