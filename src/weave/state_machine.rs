//! Pieces shared by the weavers that splice into a compiler-generated state machine.
//!
//! The interceptor array and context live in fields added to the companion type. Async
//! task machines get them from the stub that creates and starts the machine. Iterator
//! machines build them lazily on the first step instead: an enumerable hands out a new
//! machine per `GetEnumerator`, and only the step function sees each one. Inside the step
//! function a guard on the state field runs entry advice only on the first step; the retry
//! anchor sits right after the guard, so a retry re-enters the original dispatch with the
//! state reset to its not-started sentinel.

use super::advice::{emit_context, emit_mo_array, Advice, ArgumentSource, CallOrder, MoSet, Storage};
use super::binding::{Feature, Hook, Omit, TargetMethod};
use super::classify::state_machine_name;
use super::refs;
use crate::common::consts::{
    FIELD_CONTEXT, FIELD_ITEMS, FIELD_MOS, FIELD_STATE, FIELD_THIS, METHOD_MOVE_NEXT, PARAMETER_COPY_PREFIX,
};
use crate::il::emit::unbox_or_cast;
use crate::il::pattern::parameter_fields;
use crate::il::{
    CodeEmitter, FieldDef, FieldRef, InstrId, Instruction, MethodDef, MethodHandle, Module, Op, TypeDef, TypeSig,
};
use crate::{Config, Error, Result};

/// The companion type of a state-machine target and the fields the weaver uses on it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub type_name: String,
    pub sig: TypeSig,
    pub move_next: MethodHandle,
    pub state: FieldRef,
    pub mos: FieldRef,
    pub context: FieldRef,
    /// Present when iterator values are recorded.
    pub items: Option<FieldRef>,
    /// Captured `this`, absent for static targets.
    pub this: Option<FieldRef>,
    /// Per declared parameter, the field the step function reads it from.
    pub parameters: Vec<Option<FieldRef>>,
    /// State value meaning "not started yet".
    pub sentinel: i32,
    /// Set when the context is built by the step function rather than by the stub.
    pub deferred: Option<DeferredContext>,
}

/// What the step function needs to build the context of the stub method.
#[derive(Debug, Clone)]
pub struct DeferredContext {
    pub declaring: TypeSig,
    pub stub: MethodDef,
    pub order: CallOrder,
}

impl StateMachine {
    /// Find the companion type named by the target's marker attribute and its step function.
    pub fn resolve(module: &Module, target: &TargetMethod, sentinel: i32, record_items: bool) -> Result<Self> {
        let method = module.method(target.handle);
        let type_name = state_machine_name(method, target.shape)
            .ok_or_else(|| Error::missing_anchor(&target.full_name, "state machine type on the marker attribute"))?
            .to_string();
        let type_index = module.find_type(&type_name).ok_or_else(|| Error::unresolved_type(&type_name))?;
        let ty = &module.types[type_index];
        let method_index = ty
            .find_method(METHOD_MOVE_NEXT)
            .filter(|i| ty.methods[*i].body.is_some())
            .ok_or_else(|| Error::missing_anchor(&target.full_name, format!("{}::{}", type_name, METHOD_MOVE_NEXT)))?;
        let state = ty
            .field_ref(FIELD_STATE)
            .ok_or_else(|| Error::missing_anchor(&target.full_name, format!("{}::{}", type_name, FIELD_STATE)))?;
        if ty.find_field(FIELD_CONTEXT).is_some() {
            return Err(Error::weave_error(&target.full_name, format!("{} is already woven", type_name)));
        }

        let sig = ty.sig();
        Ok(Self {
            type_name,
            move_next: MethodHandle { type_index, method_index },
            state,
            mos: FieldRef::new(sig.clone(), FIELD_MOS, refs::imo_array()),
            context: FieldRef::new(sig.clone(), FIELD_CONTEXT, refs::context_type()),
            items: record_items.then(|| FieldRef::new(sig.clone(), FIELD_ITEMS, refs::object_list_type())),
            this: ty.field_ref(FIELD_THIS),
            parameters: parameter_fields(method)
                .into_iter()
                .map(|field| field.map(|field| working_field(ty, field)))
                .collect(),
            sentinel,
            deferred: None,
            sig,
        })
    }

    /// Build the interceptor array and context on the first step instead of in the stub.
    pub fn defer_context(mut self, module: &Module, target: &TargetMethod, config: &Config) -> Self {
        self.deferred = Some(DeferredContext {
            declaring: module.declaring_type(target.handle).sig(),
            stub: module.method(target.handle).clone(),
            order: CallOrder::from_config(config),
        });
        self
    }

    /// Add the interceptor-array, context and (optional) item-list fields.
    pub fn add_fields(&self, module: &mut Module) {
        let ty = &mut module.types[self.move_next.type_index];
        ty.fields.push(FieldDef::new(FIELD_MOS, self.mos.field_type.clone()));
        ty.fields.push(FieldDef::new(FIELD_CONTEXT, self.context.field_type.clone()));
        if let Some(items) = &self.items {
            ty.fields.push(FieldDef::new(FIELD_ITEMS, items.field_type.clone()));
        }
    }

    /// `this.<field>` inside the step function.
    pub fn this_field(&self, field: &FieldRef) -> Storage {
        Storage::field(Instruction::ldarg(0), field.clone())
    }

    /// Advice reading the interceptor set and context from the machine's own fields.
    pub fn advice<'t>(&self, target: &'t TargetMethod, config: &Config) -> Advice<'t> {
        Advice::new(target, MoSet::Array(self.this_field(&self.mos)), self.this_field(&self.context), config)
    }

    /// Stub-side initialisation of the added fields. `owner` pushes the machine instance.
    pub fn emit_stub_init(
        &self,
        e: &mut CodeEmitter<'_>,
        declaring: &TypeSig,
        stub: &MethodDef,
        target: &TargetMethod,
        config: &Config,
        owner: Instruction,
    ) {
        e.emit(owner.clone());
        emit_mo_array(e, &target.bindings);
        e.emit(Instruction::field(Op::Stfld, self.mos.clone()));

        let mos = MoSet::Array(Storage::field(owner.clone(), self.mos.clone()));
        e.emit(owner);
        emit_context(e, declaring, stub, target, &mos, CallOrder::from_config(config), ArgumentSource::Slots);
        e.emit(Instruction::field(Op::Stfld, self.context.clone()));
    }

    /// `if (this.context == null) { this.mos = new IMo[] {...}; this.context = new MethodContext(...) }`
    fn emit_lazy_init(&self, e: &mut CodeEmitter<'_>, deferred: &DeferredContext, target: &TargetMethod) {
        let ready = e.label();
        e.emit(Instruction::ldarg(0));
        e.emit(Instruction::field(Op::Ldfld, self.context.clone()));
        e.branch(Op::Brtrue, ready);

        e.emit(Instruction::ldarg(0));
        emit_mo_array(e, &target.bindings);
        e.emit(Instruction::field(Op::Stfld, self.mos.clone()));

        let source = ArgumentSource::MachineFields { this: self.this.as_ref(), parameters: &self.parameters };
        e.emit(Instruction::ldarg(0));
        emit_context(
            e,
            &deferred.declaring,
            &deferred.stub,
            target,
            &MoSet::Array(self.this_field(&self.mos)),
            deferred.order,
            source,
        );
        e.emit(Instruction::field(Op::Stfld, self.context.clone()));
        e.place(ready);
    }

    /// `this.state = value`
    pub fn emit_set_state(&self, e: &mut CodeEmitter<'_>, value: i32) {
        e.emit(Instruction::ldarg(0));
        e.emit(Instruction::ldc_i4(value));
        e.emit(Instruction::field(Op::Stfld, self.state.clone()));
    }

    /// `this.items = new List<object>()`
    pub fn emit_reset_items(&self, e: &mut CodeEmitter<'_>) {
        if let Some(items) = &self.items {
            e.emit(Instruction::ldarg(0));
            e.emit(Instruction::newobj(refs::list_ctor()));
            e.emit(Instruction::field(Op::Stfld, items.clone()));
        }
    }

    /// `this.items.Add((object)this.<current>)`
    pub fn emit_record_item(&self, e: &mut CodeEmitter<'_>, current: &FieldRef) {
        let Some(items) = &self.items else { return };
        e.emit(Instruction::ldarg(0));
        e.emit(Instruction::field(Op::Ldfld, items.clone()));
        e.emit(Instruction::ldarg(0));
        e.emit(Instruction::field(Op::Ldfld, current.clone()));
        if current.field_type.needs_box() {
            e.emit(Instruction::typed(Op::Box, current.field_type.clone()));
        }
        e.emit(Instruction::callvirt(refs::list_add()));
    }

    /// `context.CaptureReturnValue(this.items.ToArray())`
    pub fn emit_capture_items(&self, e: &mut CodeEmitter<'_>, advice: &Advice<'_>) {
        let Some(items) = &self.items else { return };
        if advice.target.omits.contains(Omit::RETURN_VALUE) {
            return;
        }
        advice.context_call(
            e,
            refs::capture_return_value(),
            vec![
                Instruction::ldarg(0),
                Instruction::field(Op::Ldfld, items.clone()),
                Instruction::callvirt(refs::list_to_array()),
            ],
        );
    }

    /// First-entry guard. Emits everything up to and including the retry anchor, which is
    /// returned; `entry_replace` may add a short-circuit after the entry chain.
    pub fn emit_prologue(
        &self,
        e: &mut CodeEmitter<'_>,
        advice: &Advice<'_>,
        entry_replace: impl FnOnce(&mut CodeEmitter<'_>),
    ) -> InstrId {
        let retry = e.label();
        e.emit(Instruction::ldarg(0));
        e.emit(Instruction::field(Op::Ldfld, self.state.clone()));
        e.emit(Instruction::ldc_i4(self.sentinel));
        e.branch(Op::BneUn, retry);

        if let Some(deferred) = &self.deferred {
            self.emit_lazy_init(e, deferred, advice.target);
        }
        self.emit_reset_items(e);
        advice.emit_hook(e, Hook::OnEntry);
        entry_replace(e);
        if advice.target.has(Feature::REWRITE_ARGS) && !advice.target.omits.contains(Omit::ARGUMENTS) {
            self.emit_rewrite_args(e, advice);
        }
        e.place(retry);
        retry
    }

    /// Reload the parameter copies from the context's argument array.
    fn emit_rewrite_args(&self, e: &mut CodeEmitter<'_>, advice: &Advice<'_>) {
        if self.parameters.iter().all(Option::is_none) {
            return;
        }
        let done = e.label();
        advice.context_call(e, refs::get_rewrite_arguments(), vec![]);
        e.branch(Op::Brfalse, done);
        for (index, field) in self.parameters.iter().enumerate() {
            let Some(field) = field else { continue };
            let ty = &field.field_type;
            let next = e.label();
            let mut item = advice.context.load();
            item.push(Instruction::callvirt(refs::get_arguments()));
            item.push(Instruction::ldc_i4(index as i32));
            item.push(Instruction::new(Op::LdelemRef));

            if ty.default_needs_initobj() {
                let present = e.label();
                e.emit_all(item.clone());
                e.branch(Op::Brtrue, present);
                e.emit(Instruction::ldarg(0));
                e.emit(Instruction::field(Op::Ldflda, field.clone()));
                e.emit(Instruction::typed(Op::Initobj, ty.clone()));
                e.branch(Op::Br, next);
                e.place(present);
            }
            e.emit(Instruction::ldarg(0));
            e.emit_all(item);
            if let Some(convert) = unbox_or_cast(ty) {
                e.emit(convert);
            }
            e.emit(Instruction::field(Op::Stfld, field.clone()));
            e.place(next);
        }
        e.place(done);
    }

    /// `if (context.RetryCount > 0) { context.RetryCount = 0; state = sentinel; jump RETRY }`
    pub fn emit_retry(&self, e: &mut CodeEmitter<'_>, advice: &Advice<'_>, retry: InstrId, jump: Op) {
        let no_retry = e.label();
        advice.emit_retry_check(e, no_retry);
        self.emit_set_state(e, self.sentinel);
        self.emit_reset_items(e);
        e.branch(jump, retry);
        e.place(no_retry);
    }

    /// `(T)context.ReturnValue`
    pub fn emit_context_return_value(&self, e: &mut CodeEmitter<'_>, advice: &Advice<'_>, ty: &TypeSig) {
        advice.context_call(e, refs::get_return_value(), vec![]);
        if let Some(convert) = unbox_or_cast(ty) {
            e.emit(convert);
        }
    }
}

/// Insert the stub-side initialisation before `anchor` in the target method.
pub fn init_in_stub(
    module: &mut Module,
    machine: &StateMachine,
    target: &TargetMethod,
    config: &Config,
    anchor: InstrId,
    owner: Instruction,
) -> Result<()> {
    let declaring = module.declaring_type(target.handle).sig();
    let stub = module.method(target.handle).clone();
    let body = module
        .method_mut(target.handle)
        .body
        .as_mut()
        .ok_or_else(|| Error::weave_error(&target.full_name, "method has no body"))?;
    let mut e = CodeEmitter::new(body);
    machine.emit_stub_init(&mut e, &declaring, &stub, target, config, owner);
    e.finish_before(anchor);
    Ok(())
}

/// The field a parameter copy is handed out through: `<>3__n` feeds `n`, which is what
/// the step function reads and what a rewrite must change.
fn working_field(ty: &TypeDef, field: FieldRef) -> FieldRef {
    field
        .name
        .strip_prefix(PARAMETER_COPY_PREFIX)
        .and_then(|name| ty.field_ref(name))
        .unwrap_or(field)
}

/// Take the step function's body out of the module for editing.
pub fn take_move_next(module: &mut Module, machine: &StateMachine, target: &TargetMethod) -> Result<crate::il::MethodBody> {
    module
        .method_mut(machine.move_next)
        .body
        .take()
        .ok_or_else(|| Error::missing_anchor(&target.full_name, format!("{}::{}", machine.type_name, METHOD_MOVE_NEXT)))
}
