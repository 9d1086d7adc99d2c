//! Instruction-sequence toolkit: build runs of instructions and splice them into a body.

use super::body::MethodBody;
use super::instruction::Instruction;
use super::list::InstrId;
use super::module::{AttrArg, MethodDef, MethodRef};
use super::opcodes::Op;
use super::types::TypeSig;
use crate::common::consts::{TYPE_METHOD_BASE, TYPE_SYSTEM_TYPE};

/// Builds a run of detached instructions for one body, then links it in one go.
pub struct CodeEmitter<'a> {
    body: &'a mut MethodBody,
    pending: Vec<InstrId>,
}

impl<'a> CodeEmitter<'a> {
    pub fn new(body: &'a mut MethodBody) -> Self {
        Self { body, pending: Vec::new() }
    }

    pub fn body(&mut self) -> &mut MethodBody {
        &mut *self.body
    }

    pub fn variable(&mut self, ty: TypeSig) -> u16 {
        self.body.create_variable(ty)
    }

    pub fn emit(&mut self, instr: Instruction) -> InstrId {
        let id = self.body.instructions.alloc(instr);
        self.pending.push(id);
        id
    }

    pub fn emit_all(&mut self, instrs: impl IntoIterator<Item = Instruction>) {
        for instr in instrs {
            self.emit(instr);
        }
    }

    pub fn op(&mut self, op: Op) -> InstrId {
        self.emit(Instruction::new(op))
    }

    pub fn branch(&mut self, op: Op, target: InstrId) -> InstrId {
        self.emit(Instruction::branch(op, target))
    }

    /// A detached no-op to be used as a branch target and placed later.
    pub fn label(&mut self) -> InstrId {
        self.body.instructions.alloc(Instruction::nop())
    }

    /// Place a previously allocated node at the current position.
    pub fn place(&mut self, id: InstrId) {
        self.pending.push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn finish(self) -> Vec<InstrId> {
        self.pending
    }

    pub fn finish_back(self) {
        let Self { body, pending } = self;
        for id in pending {
            body.instructions.link_back(id);
        }
    }

    pub fn finish_before(self, anchor: InstrId) {
        let Self { body, pending } = self;
        body.instructions.link_seq_before(anchor, &pending);
    }

    pub fn finish_after(self, anchor: InstrId) {
        let Self { body, pending } = self;
        body.instructions.link_seq_after(anchor, &pending);
    }

    pub fn finish_front(self) {
        let Self { body, pending } = self;
        body.instructions.link_seq_front(&pending);
    }
}

/// `ldloc` for reference-typed slots, `ldloca` when the slot holds a value type
/// whose members will be accessed in place.
pub fn ldloc_or_a(index: u16, ty: &TypeSig) -> Instruction {
    if ty.is_value_type() {
        Instruction::ldloca(index)
    } else {
        Instruction::ldloc(index)
    }
}

pub fn get_type_from_handle() -> MethodRef {
    MethodRef::static_method(
        TypeSig::class(TYPE_SYSTEM_TYPE),
        "GetTypeFromHandle",
        vec![TypeSig::value_type("System.RuntimeTypeHandle")],
        TypeSig::class(TYPE_SYSTEM_TYPE),
    )
}

pub fn get_method_from_handle() -> MethodRef {
    MethodRef::static_method(
        TypeSig::class(TYPE_METHOD_BASE),
        "GetMethodFromHandle",
        vec![TypeSig::value_type("System.RuntimeMethodHandle")],
        TypeSig::class(TYPE_METHOD_BASE),
    )
}

/// Push a `System.Type` for the given type.
pub fn load_type(ty: TypeSig) -> Vec<Instruction> {
    vec![
        Instruction::typed(Op::Ldtoken, ty),
        Instruction::call(get_type_from_handle()),
    ]
}

/// Push a `MethodBase` for the given method.
pub fn load_method(method: MethodRef) -> Vec<Instruction> {
    vec![
        Instruction::with(Op::Ldtoken, super::instruction::Operand::Method(method)),
        Instruction::call(get_method_from_handle()),
    ]
}

/// Push a constructor or property argument captured at bind time.
pub fn load_attr_arg(arg: &AttrArg) -> Vec<Instruction> {
    match arg {
        AttrArg::Null => vec![Instruction::new(Op::Ldnull)],
        AttrArg::Bool(b) => vec![Instruction::ldc_bool(*b)],
        AttrArg::Int32(v) => vec![Instruction::ldc_i4(*v)],
        AttrArg::Int64(v) => vec![Instruction::ldc_i8(*v)],
        AttrArg::String(s) => vec![Instruction::ldstr(s.clone())],
        AttrArg::Type(name) => load_type(TypeSig::class(name.clone())),
    }
}

/// Load argument slot `arg` and, if it is passed by reference, the value behind it.
pub fn load_arg_value(arg: u16, ty: &TypeSig) -> Vec<Instruction> {
    let mut out = vec![Instruction::ldarg(arg)];
    if let TypeSig::ByRef { inner } = ty {
        if inner.needs_box() {
            out.push(Instruction::typed(Op::Ldobj, (**inner).clone()));
        } else {
            out.push(Instruction::new(Op::LdindRef));
        }
    }
    out
}

/// Convert the object on the stack to `ty`.
pub fn unbox_or_cast(ty: &TypeSig) -> Option<Instruction> {
    if ty.needs_box() {
        Some(Instruction::typed(Op::UnboxAny, ty.clone()))
    } else if ty.is_object() {
        None
    } else {
        Some(Instruction::typed(Op::Castclass, ty.clone()))
    }
}

/// Copy a method under a new name as a private, attribute-free sibling.
pub fn clone_method_as(method: &MethodDef, new_name: impl Into<String>) -> MethodDef {
    let mut shadow = method.clone();
    shadow.name = new_name.into();
    shadow.is_private = true;
    shadow.attributes.clear();
    shadow
}
