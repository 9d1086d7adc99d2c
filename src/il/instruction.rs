//! Single instructions and their operands.

use super::list::InstrId;
use super::module::{FieldRef, MethodRef};
use super::opcodes::Op;
use super::types::TypeSig;
use std::fmt;

/// Instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Int32(i32),
    Int64(i64),
    String(String),
    Local(u16),
    Arg(u16),
    Target(InstrId),
    Switch(Vec<InstrId>),
    Method(MethodRef),
    Field(FieldRef),
    Type(TypeSig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self { op, operand: Operand::None }
    }

    pub fn with(op: Op, operand: Operand) -> Self {
        Self { op, operand }
    }

    pub fn nop() -> Self {
        Self::new(Op::Nop)
    }

    /// `ldc.i4` in its shortest encoding.
    pub fn ldc_i4(value: i32) -> Self {
        let op = match value {
            -1 => Op::LdcI4M1,
            0 => Op::LdcI40,
            1 => Op::LdcI41,
            2 => Op::LdcI42,
            3 => Op::LdcI43,
            4 => Op::LdcI44,
            5 => Op::LdcI45,
            6 => Op::LdcI46,
            7 => Op::LdcI47,
            8 => Op::LdcI48,
            v if (-128..=127).contains(&v) => return Self::with(Op::LdcI4S, Operand::Int32(v)),
            v => return Self::with(Op::LdcI4, Operand::Int32(v)),
        };
        Self::new(op)
    }

    pub fn ldc_bool(value: bool) -> Self {
        Self::ldc_i4(value as i32)
    }

    pub fn ldc_i8(value: i64) -> Self {
        Self::with(Op::LdcI8, Operand::Int64(value))
    }

    pub fn ldstr(value: impl Into<String>) -> Self {
        Self::with(Op::Ldstr, Operand::String(value.into()))
    }

    pub fn ldarg(index: u16) -> Self {
        match index {
            0 => Self::new(Op::Ldarg0),
            1 => Self::new(Op::Ldarg1),
            2 => Self::new(Op::Ldarg2),
            3 => Self::new(Op::Ldarg3),
            i if i <= 255 => Self::with(Op::LdargS, Operand::Arg(i)),
            i => Self::with(Op::Ldarg, Operand::Arg(i)),
        }
    }

    pub fn ldarga(index: u16) -> Self {
        let op = if index <= 255 { Op::LdargaS } else { Op::Ldarga };
        Self::with(op, Operand::Arg(index))
    }

    pub fn starg(index: u16) -> Self {
        let op = if index <= 255 { Op::StargS } else { Op::Starg };
        Self::with(op, Operand::Arg(index))
    }

    pub fn ldloc(index: u16) -> Self {
        match index {
            0 => Self::new(Op::Ldloc0),
            1 => Self::new(Op::Ldloc1),
            2 => Self::new(Op::Ldloc2),
            3 => Self::new(Op::Ldloc3),
            i if i <= 255 => Self::with(Op::LdlocS, Operand::Local(i)),
            i => Self::with(Op::Ldloc, Operand::Local(i)),
        }
    }

    pub fn ldloca(index: u16) -> Self {
        let op = if index <= 255 { Op::LdlocaS } else { Op::Ldloca };
        Self::with(op, Operand::Local(index))
    }

    pub fn stloc(index: u16) -> Self {
        match index {
            0 => Self::new(Op::Stloc0),
            1 => Self::new(Op::Stloc1),
            2 => Self::new(Op::Stloc2),
            3 => Self::new(Op::Stloc3),
            i if i <= 255 => Self::with(Op::StlocS, Operand::Local(i)),
            i => Self::with(Op::Stloc, Operand::Local(i)),
        }
    }

    pub fn branch(op: Op, target: InstrId) -> Self {
        Self::with(op, Operand::Target(target))
    }

    pub fn call(method: MethodRef) -> Self {
        Self::with(Op::Call, Operand::Method(method))
    }

    pub fn callvirt(method: MethodRef) -> Self {
        Self::with(Op::Callvirt, Operand::Method(method))
    }

    pub fn newobj(ctor: MethodRef) -> Self {
        Self::with(Op::Newobj, Operand::Method(ctor))
    }

    pub fn field(op: Op, field: FieldRef) -> Self {
        Self::with(op, Operand::Field(field))
    }

    pub fn typed(op: Op, ty: TypeSig) -> Self {
        Self::with(op, Operand::Type(ty))
    }

    /// Local slot touched by a `ldloc`/`stloc`/`ldloca` in any encoding.
    pub fn local_index(&self) -> Option<u16> {
        if let Some(index) = self.op.local_macro_index() {
            return Some(index);
        }
        match (&self.operand, self.op.is_ldloc() || self.op.is_stloc() || self.op.is_ldloca()) {
            (Operand::Local(index), true) => Some(*index),
            _ => None,
        }
    }

    /// Argument slot touched by a `ldarg`/`starg`/`ldarga` in any encoding.
    pub fn arg_index(&self) -> Option<u16> {
        if let Some(index) = self.op.arg_macro_index() {
            return Some(index);
        }
        match (&self.operand, self.op.is_ldarg() || self.op.is_starg() || self.op.is_ldarga()) {
            (Operand::Arg(index), true) => Some(*index),
            _ => None,
        }
    }

    pub fn i32_constant(&self) -> Option<i32> {
        if let Some(value) = self.op.ldc_macro_value() {
            return Some(value);
        }
        match (&self.operand, self.op) {
            (Operand::Int32(value), Op::LdcI4S | Op::LdcI4) => Some(*value),
            _ => None,
        }
    }

    pub fn branch_target(&self) -> Option<InstrId> {
        match &self.operand {
            Operand::Target(id) => Some(*id),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&MethodRef> {
        match &self.operand {
            Operand::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn field_ref(&self) -> Option<&FieldRef> {
        match &self.operand {
            Operand::Field(f) => Some(f),
            _ => None,
        }
    }

    /// The load that reads back what this local store wrote.
    pub fn stloc_to_ldloc(&self) -> Option<Instruction> {
        if !self.op.is_stloc() {
            return None;
        }
        self.local_index().map(Instruction::ldloc)
    }

    /// The store that writes the local this load reads.
    pub fn ldloc_to_stloc(&self) -> Option<Instruction> {
        if !self.op.is_ldloc() {
            return None;
        }
        self.local_index().map(Instruction::stloc)
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> u32 {
        match (&self.operand, self.op) {
            (Operand::Switch(targets), Op::Switch) => 1 + 4 + 4 * targets.len() as u32,
            _ => self.op.encoded_size(),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int32(v) => write!(f, "{}", v),
            Operand::Int64(v) => write!(f, "{}", v),
            Operand::String(s) => write!(f, "{:?}", s),
            Operand::Local(i) => write!(f, "V_{}", i),
            Operand::Arg(i) => write!(f, "A_{}", i),
            Operand::Target(id) => write!(f, "{}", id),
            Operand::Switch(ids) => {
                write!(f, "(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", id)?;
                }
                write!(f, ")")
            }
            Operand::Method(m) => write!(f, "{}", m),
            Operand::Field(fr) => write!(f, "{}", fr),
            Operand::Type(t) => write!(f, "{}", t),
        }
    }
}
