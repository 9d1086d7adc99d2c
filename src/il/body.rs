//! Method bodies: the instruction list, local slots and protected regions.

use super::instruction::{Instruction, Operand};
use super::list::{InstrId, InstrList};
use super::module::{FieldRef, MethodRef};
use super::opcodes::Op;
use super::types::TypeSig;
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Catch(TypeSig),
    Finally,
    Fault,
}

/// A protected region with explicit extents. Ends are exclusive; a `None` handler end
/// runs to the end of the body.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: InstrId,
    pub try_end: InstrId,
    pub handler_start: InstrId,
    pub handler_end: Option<InstrId>,
}

impl ExceptionHandler {
    pub fn is_catch(&self) -> bool {
        matches!(self.kind, HandlerKind::Catch(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    pub instructions: InstrList,
    pub variables: Vec<TypeSig>,
    pub handlers: Vec<ExceptionHandler>,
    pub init_locals: bool,
}

impl MethodBody {
    pub fn new() -> Self {
        Self { init_locals: true, ..Self::default() }
    }

    /// Append a local slot and return its index.
    pub fn create_variable(&mut self, ty: TypeSig) -> u16 {
        self.variables.push(ty);
        (self.variables.len() - 1) as u16
    }

    /// A body holding nothing but no-ops and returns.
    pub fn is_trivial(&self) -> bool {
        self.instructions
            .iter()
            .all(|(_, i)| matches!(i.op, Op::Nop | Op::Ret))
    }

    /// Byte offset of every linked instruction, from encoded sizes.
    pub fn offsets(&self) -> HashMap<InstrId, u32> {
        let mut offsets = HashMap::with_capacity(self.instructions.len());
        let mut offset = 0;
        for (id, instr) in self.instructions.iter() {
            offsets.insert(id, offset);
            offset += instr.size();
        }
        offsets
    }

    pub fn offset_of(&self, id: InstrId) -> u32 {
        let mut offset = 0;
        for (candidate, instr) in self.instructions.iter() {
            if candidate == id {
                break;
            }
            offset += instr.size();
        }
        offset
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum OperandRepr {
    #[default]
    None,
    Int32(i32),
    Int64(i64),
    String(String),
    Local(u16),
    Arg(u16),
    Target(usize),
    Switch(Vec<usize>),
    Method(MethodRef),
    Field(FieldRef),
    Type(TypeSig),
}

impl OperandRepr {
    fn is_none(&self) -> bool {
        matches!(self, OperandRepr::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstrRepr {
    op: Op,
    #[serde(default, skip_serializing_if = "OperandRepr::is_none")]
    operand: OperandRepr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandlerRepr {
    kind: HandlerKind,
    try_start: usize,
    try_end: usize,
    handler_start: usize,
    #[serde(default)]
    handler_end: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BodyRepr {
    #[serde(default)]
    instructions: Vec<InstrRepr>,
    #[serde(default)]
    variables: Vec<TypeSig>,
    #[serde(default)]
    handlers: Vec<HandlerRepr>,
    #[serde(default = "default_true")]
    init_locals: bool,
}

fn default_true() -> bool {
    true
}

impl BodyRepr {
    fn from_body(body: &MethodBody) -> Result<Self> {
        let positions: HashMap<InstrId, usize> = body
            .instructions
            .iter()
            .enumerate()
            .map(|(pos, (id, _))| (id, pos))
            .collect();
        let index = |id: InstrId| -> Result<usize> {
            positions
                .get(&id)
                .copied()
                .ok_or_else(|| Error::body_error(format!("reference to detached instruction {}", id)))
        };

        let mut instructions = Vec::with_capacity(positions.len());
        for (_, instr) in body.instructions.iter() {
            let operand = match &instr.operand {
                Operand::None => OperandRepr::None,
                Operand::Int32(v) => OperandRepr::Int32(*v),
                Operand::Int64(v) => OperandRepr::Int64(*v),
                Operand::String(s) => OperandRepr::String(s.clone()),
                Operand::Local(i) => OperandRepr::Local(*i),
                Operand::Arg(i) => OperandRepr::Arg(*i),
                Operand::Target(id) => OperandRepr::Target(index(*id)?),
                Operand::Switch(ids) => {
                    OperandRepr::Switch(ids.iter().map(|id| index(*id)).collect::<Result<_>>()?)
                }
                Operand::Method(m) => OperandRepr::Method(m.clone()),
                Operand::Field(f) => OperandRepr::Field(f.clone()),
                Operand::Type(t) => OperandRepr::Type(t.clone()),
            };
            instructions.push(InstrRepr { op: instr.op, operand });
        }

        let mut handlers = Vec::with_capacity(body.handlers.len());
        for h in &body.handlers {
            handlers.push(HandlerRepr {
                kind: h.kind.clone(),
                try_start: index(h.try_start)?,
                try_end: index(h.try_end)?,
                handler_start: index(h.handler_start)?,
                handler_end: h.handler_end.map(index).transpose()?,
            });
        }

        Ok(Self {
            instructions,
            variables: body.variables.clone(),
            handlers,
            init_locals: body.init_locals,
        })
    }

    fn into_body(self) -> Result<MethodBody> {
        let mut list = InstrList::new();
        let ids: Vec<InstrId> = (0..self.instructions.len())
            .map(|_| list.push(Instruction::nop()))
            .collect();
        let resolve = |pos: usize| -> Result<InstrId> {
            ids.get(pos)
                .copied()
                .ok_or_else(|| Error::body_error(format!("instruction index {} out of range", pos)))
        };

        for (pos, repr) in self.instructions.into_iter().enumerate() {
            let operand = match repr.operand {
                OperandRepr::None => Operand::None,
                OperandRepr::Int32(v) => Operand::Int32(v),
                OperandRepr::Int64(v) => Operand::Int64(v),
                OperandRepr::String(s) => Operand::String(s),
                OperandRepr::Local(i) => Operand::Local(i),
                OperandRepr::Arg(i) => Operand::Arg(i),
                OperandRepr::Target(t) => Operand::Target(resolve(t)?),
                OperandRepr::Switch(ts) => {
                    Operand::Switch(ts.into_iter().map(&resolve).collect::<Result<_>>()?)
                }
                OperandRepr::Method(m) => Operand::Method(m),
                OperandRepr::Field(f) => Operand::Field(f),
                OperandRepr::Type(t) => Operand::Type(t),
            };
            if repr.op.is_branch() && !matches!(operand, Operand::Target(_)) {
                return Err(Error::body_error(format!(
                    "{} at index {} has no branch target",
                    repr.op, pos
                )));
            }
            list.replace(ids[pos], Instruction::with(repr.op, operand));
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for h in self.handlers {
            handlers.push(ExceptionHandler {
                kind: h.kind,
                try_start: resolve(h.try_start)?,
                try_end: resolve(h.try_end)?,
                handler_start: resolve(h.handler_start)?,
                handler_end: h.handler_end.map(&resolve).transpose()?,
            });
        }

        Ok(MethodBody {
            instructions: list,
            variables: self.variables,
            handlers,
            init_locals: self.init_locals,
        })
    }
}

impl Serialize for MethodBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        BodyRepr::from_body(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MethodBody {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        BodyRepr::deserialize(deserializer)?
            .into_body()
            .map_err(serde::de::Error::custom)
    }
}
