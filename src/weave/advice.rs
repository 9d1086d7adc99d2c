//! Advice-invocation primitive and the construction code every weaver shares.
//!
//! The interceptor set is either unrolled into typed locals or held in an `IMo[]`. Once the
//! set is larger than the configured threshold, hooks are invoked by a counted loop over the
//! array; the loop skips slots that never implement the hook, using a precomputed slot mask
//! when the set fits in one and the interceptor's runtime feature mask otherwise. Both forms
//! issue the same calls in the same order.

use super::binding::{Hook, InterceptorBinding, Omit, TargetMethod};
use super::classify::MethodShape;
use super::refs;
use crate::consts::FEATURE_MASK_WIDTH;
use crate::il::emit::{load_arg_value, load_attr_arg, load_method, load_type};
use crate::il::{CodeEmitter, FieldRef, InstrId, Instruction, MethodDef, MethodRef, Op, TypeSig};
use crate::Config;

/// Where a woven value lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Local(u16),
    /// A field of the object pushed by `owner`.
    Field { owner: Vec<Instruction>, field: FieldRef },
}

impl Storage {
    pub fn field(owner: Instruction, field: FieldRef) -> Self {
        Storage::Field { owner: vec![owner], field }
    }

    pub fn load(&self) -> Vec<Instruction> {
        match self {
            Storage::Local(index) => vec![Instruction::ldloc(*index)],
            Storage::Field { owner, field } => {
                let mut out = owner.clone();
                out.push(Instruction::field(Op::Ldfld, field.clone()));
                out
            }
        }
    }

    /// Store whatever `value` pushes.
    pub fn store(&self, value: Vec<Instruction>) -> Vec<Instruction> {
        match self {
            Storage::Local(index) => {
                let mut out = value;
                out.push(Instruction::stloc(*index));
                out
            }
            Storage::Field { owner, field } => {
                let mut out = owner.clone();
                out.extend(value);
                out.push(Instruction::field(Op::Stfld, field.clone()));
                out
            }
        }
    }
}

/// How the interceptor set is held.
#[derive(Debug, Clone, PartialEq)]
pub enum MoSet {
    /// One typed local per binding.
    Locals(Vec<u16>),
    /// An `IMo[]` in a local or field.
    Array(Storage),
}

/// Direction of each hook chain. Entry always runs in bound order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOrder {
    pub reverse_non_entry: bool,
}

impl CallOrder {
    pub fn from_config(config: &Config) -> Self {
        Self { reverse_non_entry: config.reverse_non_entry() }
    }

    pub fn reversed(self, hook: Hook) -> bool {
        hook != Hook::OnEntry && self.reverse_non_entry
    }

    /// Value passed to the context so runtime consumers of its interceptor list agree.
    pub fn mos_non_entry_fifo(self) -> bool {
        !self.reverse_non_entry
    }
}

/// Emits hook chains for one woven method.
pub struct Advice<'t> {
    pub target: &'t TargetMethod,
    pub mos: MoSet,
    pub context: Storage,
    pub order: CallOrder,
    threshold: usize,
}

impl<'t> Advice<'t> {
    pub fn new(target: &'t TargetMethod, mos: MoSet, context: Storage, config: &Config) -> Self {
        Self {
            target,
            mos,
            context,
            order: CallOrder::from_config(config),
            threshold: config.mo_array_threshold,
        }
    }

    pub fn load_context(&self, e: &mut CodeEmitter<'_>) {
        e.emit_all(self.context.load());
    }

    /// `context.<method>(...)` with any arguments already emitted by `args`.
    pub fn context_call(&self, e: &mut CodeEmitter<'_>, method: MethodRef, args: Vec<Instruction>) {
        self.load_context(e);
        e.emit_all(args);
        e.emit(Instruction::callvirt(method));
    }

    /// `if (context.RetryCount > 0) { context.RetryCount = 0; <fallthrough> }`, jumping to
    /// `no_retry` otherwise. The caller emits the jump back.
    pub fn emit_retry_check(&self, e: &mut CodeEmitter<'_>, no_retry: InstrId) {
        self.context_call(e, refs::get_retry_count(), vec![]);
        e.emit(Instruction::ldc_i4(0));
        e.branch(Op::Ble, no_retry);
        self.context_call(e, refs::set_retry_count(), vec![Instruction::ldc_i4(0)]);
    }

    /// Invoke `hook` on every interceptor that implements it.
    pub fn emit_hook(&self, e: &mut CodeEmitter<'_>, hook: Hook) {
        let bindings = &self.target.bindings;
        if !bindings.iter().any(|b| b.has(hook)) {
            return;
        }
        let reversed = self.order.reversed(hook);
        match &self.mos {
            MoSet::Locals(locals) => {
                for index in ordered(bindings.len(), reversed) {
                    if bindings[index].has(hook) {
                        e.emit(Instruction::ldloc(locals[index]));
                        self.emit_hook_call(e, hook);
                    }
                }
            }
            MoSet::Array(array) if bindings.len() <= self.threshold => {
                for index in ordered(bindings.len(), reversed) {
                    if bindings[index].has(hook) {
                        e.emit_all(array.load());
                        e.emit(Instruction::ldc_i4(index as i32));
                        e.op(Op::LdelemRef);
                        self.emit_hook_call(e, hook);
                    }
                }
            }
            MoSet::Array(array) => self.emit_hook_loop(e, array, hook, reversed),
        }
    }

    fn emit_hook_call(&self, e: &mut CodeEmitter<'_>, hook: Hook) {
        self.load_context(e);
        e.emit(Instruction::callvirt(refs::hook(hook)));
    }

    fn emit_hook_loop(&self, e: &mut CodeEmitter<'_>, array: &Storage, hook: Hook, reversed: bool) {
        let bindings = &self.target.bindings;
        let count = bindings.len() as i32;
        let index = e.variable(TypeSig::Int32);
        let body = e.label();
        let next = e.label();
        let cond = e.label();

        e.emit(Instruction::ldc_i4(if reversed { count - 1 } else { 0 }));
        e.emit(Instruction::stloc(index));
        e.branch(Op::Br, cond);

        e.place(body);
        if bindings.len() <= FEATURE_MASK_WIDTH {
            let mask = slot_mask(bindings, hook);
            let full = if bindings.len() == FEATURE_MASK_WIDTH { u32::MAX } else { (1u32 << bindings.len()) - 1 };
            if mask != full {
                e.emit(Instruction::ldc_i4(mask as i32));
                e.emit(Instruction::ldloc(index));
                e.op(Op::ShrUn);
                e.emit(Instruction::ldc_i4(1));
                e.op(Op::And);
                e.branch(Op::Brfalse, next);
            }
        } else {
            e.emit_all(array.load());
            e.emit(Instruction::ldloc(index));
            e.op(Op::LdelemRef);
            e.emit(Instruction::callvirt(refs::get_features()));
            e.emit(Instruction::ldc_i4(hook.feature().bits() as i32));
            e.op(Op::And);
            e.branch(Op::Brfalse, next);
        }
        e.emit_all(array.load());
        e.emit(Instruction::ldloc(index));
        e.op(Op::LdelemRef);
        self.emit_hook_call(e, hook);

        e.place(next);
        e.emit(Instruction::ldloc(index));
        e.emit(Instruction::ldc_i4(1));
        e.op(if reversed { Op::Sub } else { Op::Add });
        e.emit(Instruction::stloc(index));

        e.place(cond);
        e.emit(Instruction::ldloc(index));
        if reversed {
            e.emit(Instruction::ldc_i4(0));
            e.branch(Op::Bge, body);
        } else {
            e.emit(Instruction::ldc_i4(count));
            e.branch(Op::Blt, body);
        }
    }
}

fn ordered(count: usize, reversed: bool) -> Box<dyn Iterator<Item = usize>> {
    if reversed {
        Box::new((0..count).rev())
    } else {
        Box::new(0..count)
    }
}

/// Bit `i` set when binding `i` implements `hook`.
pub fn slot_mask(bindings: &[InterceptorBinding], hook: Hook) -> u32 {
    bindings
        .iter()
        .take(FEATURE_MASK_WIDTH)
        .enumerate()
        .filter(|(_, b)| b.has(hook))
        .fold(0u32, |mask, (i, _)| mask | (1 << i))
}

/// `new T(args) { Prop = value, ... }`, leaving the instance on the stack.
pub fn emit_construct_mo(e: &mut CodeEmitter<'_>, binding: &InterceptorBinding) {
    for arg in &binding.ctor_args {
        e.emit_all(load_attr_arg(arg));
    }
    e.emit(Instruction::newobj(binding.ctor.clone()));
    for (setter, value) in &binding.setters {
        e.op(Op::Dup);
        e.emit_all(load_attr_arg(value));
        e.emit(Instruction::callvirt(setter.clone()));
    }
}

/// `new IMo[] { new A(), new B(), ... }`, leaving the array on the stack.
pub fn emit_mo_array(e: &mut CodeEmitter<'_>, bindings: &[InterceptorBinding]) {
    e.emit(Instruction::ldc_i4(bindings.len() as i32));
    e.emit(Instruction::typed(Op::Newarr, refs::imo_type()));
    for (index, binding) in bindings.iter().enumerate() {
        e.op(Op::Dup);
        e.emit(Instruction::ldc_i4(index as i32));
        emit_construct_mo(e, binding);
        e.op(Op::StelemRef);
    }
}

/// Construct the interceptor set for a plain method body: typed locals up to the
/// threshold, one array local beyond it.
pub fn emit_mo_set(e: &mut CodeEmitter<'_>, target: &TargetMethod, config: &Config) -> MoSet {
    if target.bindings.len() <= config.mo_array_threshold {
        let mut locals = Vec::with_capacity(target.bindings.len());
        for binding in &target.bindings {
            let local = e.variable(binding.type_sig.clone());
            emit_construct_mo(e, binding);
            e.emit(Instruction::stloc(local));
            locals.push(local);
        }
        MoSet::Locals(locals)
    } else {
        let local = e.variable(refs::imo_array());
        emit_mo_array(e, &target.bindings);
        e.emit(Instruction::stloc(local));
        MoSet::Array(Storage::Local(local))
    }
}

/// Where `emit_context` reads the target instance and the argument values from.
#[derive(Debug, Clone, Copy)]
pub enum ArgumentSource<'a> {
    /// The method's own argument slots: the method itself or the stub starting its machine.
    Slots,
    /// Fields of the state machine, read from its step function (`ldarg.0` is the machine).
    MachineFields {
        this: Option<&'a FieldRef>,
        parameters: &'a [Option<FieldRef>],
    },
}

/// `new MethodContext(...)` for `method`, leaving the context on the stack.
pub fn emit_context(
    e: &mut CodeEmitter<'_>,
    declaring: &TypeSig,
    method: &MethodDef,
    target: &TargetMethod,
    mos: &MoSet,
    order: CallOrder,
    source: ArgumentSource<'_>,
) {
    match source {
        _ if method.is_static => {
            e.op(Op::Ldnull);
        }
        ArgumentSource::Slots => {
            e.emit(Instruction::ldarg(0));
            if declaring.is_value_type() {
                e.emit(Instruction::typed(Op::Ldobj, declaring.clone()));
                e.emit(Instruction::typed(Op::Box, declaring.clone()));
            }
        }
        ArgumentSource::MachineFields { this: Some(this), .. } => emit_field_value(e, this),
        ArgumentSource::MachineFields { this: None, .. } => {
            e.op(Op::Ldnull);
        }
    }
    e.emit_all(load_type(declaring.clone()));
    e.emit_all(load_method(method.to_ref(declaring.clone())));
    let shape = target.shape;
    e.emit(Instruction::ldc_bool(matches!(
        shape,
        MethodShape::AsyncTask | MethodShape::AsyncIterator
    )));
    e.emit(Instruction::ldc_bool(matches!(
        shape,
        MethodShape::Iterator | MethodShape::AsyncIterator
    )));
    e.emit(Instruction::ldc_bool(order.mos_non_entry_fifo()));

    if target.omits.contains(Omit::MOS) {
        e.op(Op::Ldnull);
    } else {
        match mos {
            MoSet::Locals(locals) => {
                e.emit(Instruction::ldc_i4(locals.len() as i32));
                e.emit(Instruction::typed(Op::Newarr, refs::imo_type()));
                for (index, local) in locals.iter().enumerate() {
                    e.op(Op::Dup);
                    e.emit(Instruction::ldc_i4(index as i32));
                    e.emit(Instruction::ldloc(*local));
                    e.op(Op::StelemRef);
                }
            }
            MoSet::Array(array) => e.emit_all(array.load()),
        }
    }

    if target.omits.contains(Omit::ARGUMENTS) {
        e.op(Op::Ldnull);
    } else {
        e.emit(Instruction::ldc_i4(method.params.len() as i32));
        e.emit(Instruction::typed(Op::Newarr, TypeSig::Object));
        let offset = method.arg_offset();
        for (index, param) in method.params.iter().enumerate() {
            e.op(Op::Dup);
            e.emit(Instruction::ldc_i4(index as i32));
            match source {
                ArgumentSource::Slots => {
                    e.emit_all(load_arg_value(offset + index as u16, &param.ty));
                    let element = param.ty.element();
                    if element.needs_box() {
                        e.emit(Instruction::typed(Op::Box, element.clone()));
                    }
                }
                ArgumentSource::MachineFields { parameters, .. } => match parameters.get(index) {
                    Some(Some(field)) => emit_field_value(e, field),
                    _ => {
                        e.op(Op::Ldnull);
                    }
                },
            }
            e.op(Op::StelemRef);
        }
    }

    e.emit(Instruction::newobj(refs::context_ctor()));
}

/// `(object)this.<field>`
fn emit_field_value(e: &mut CodeEmitter<'_>, field: &FieldRef) {
    e.emit(Instruction::ldarg(0));
    e.emit(Instruction::field(Op::Ldfld, field.clone()));
    if field.field_type.needs_box() {
        e.emit(Instruction::typed(Op::Box, field.field_type.clone()));
    }
}
