//! Weaver for methods lowered into an async state machine.
//!
//! Anchors, all located before anything is changed:
//!
//! - stub: the builder `Create` call; the machine local is the instruction before it
//! - step function: the outermost catch, its leading exception store, the builder
//!   `SetException` call inside it and the catch's final `leave`
//! - step function: the builder `SetResult` call and, for valued tasks, the result load
//!   right before it
//!
//! Each completion call is preceded by `ldarg.0; ldflda builder; [value]`; advice goes in
//! front of that `ldarg.0`, after the compiler has already marked the machine finished.

use super::advice::Advice;
use super::binding::{Feature, Hook, Omit, TargetMethod};
use super::state_machine::{init_in_stub, take_move_next, StateMachine};
use super::{refs, WovenMethod};
use crate::common::consts::{ASYNC_BUILDER_PREFIXES, METHOD_CREATE, METHOD_SET_EXCEPTION, METHOD_SET_RESULT};
use crate::consts::{ASYNC_STATE_NOT_STARTED, STATE_FINISHED};
use crate::il::emit::{ldloc_or_a, unbox_or_cast};
use crate::il::optimize::optimize_body;
use crate::il::pattern::{
    find_call, find_call_in_range, find_calls, is_ldarg0, last_leave_in_handler, outer_catch_handler, CallMatcher,
};
use crate::il::{CodeEmitter, InstrId, Instruction, MethodBody, MethodRef, Module, Op, TypeSig};
use crate::{Config, Error, Result};

/// Positions inside the step function.
struct Anchors {
    exception_load: Instruction,
    set_exception_at: InstrId,
    handler_leave: InstrId,
    set_result: MethodRef,
    set_result_at: InstrId,
    builder_load: Instruction,
    /// Load of the result local, the matching store, and the task's value type.
    result: Option<(Instruction, Instruction, TypeSig)>,
}

impl Anchors {
    fn locate(body: &MethodBody, method: &str) -> Result<Self> {
        let list = &body.instructions;
        let unexpected = |id: InstrId, message: &str| Error::unexpected_shape(method, body.offset_of(id), message);

        let handler = outer_catch_handler(body)
            .map(|index| &body.handlers[index])
            .ok_or_else(|| Error::missing_anchor(method, "outer catch region of MoveNext"))?;
        let exception_load = list
            .get(handler.handler_start)
            .stloc_to_ldloc()
            .ok_or_else(|| unexpected(handler.handler_start, "catch does not start by storing the exception"))?;
        let set_exception = find_call_in_range(
            list,
            handler.handler_start,
            handler.handler_end,
            &CallMatcher::new(ASYNC_BUILDER_PREFIXES, METHOD_SET_EXCEPTION),
        )
        .ok_or_else(|| Error::missing_anchor(method, "builder SetException call"))?;
        let set_exception_at = list
            .step_back(set_exception, 3)
            .filter(|id| is_ldarg0(list, *id))
            .ok_or_else(|| unexpected(set_exception, "SetException is not preceded by ldarg.0; ldflda builder; ldloc"))?;
        let handler_leave = last_leave_in_handler(list, handler)
            .ok_or_else(|| Error::missing_anchor(method, "leave at the end of the catch region"))?;

        let set_result_call = find_calls(list, &CallMatcher::new(ASYNC_BUILDER_PREFIXES, METHOD_SET_RESULT))
            .pop()
            .ok_or_else(|| Error::missing_anchor(method, "builder SetResult call"))?;
        let set_result = list
            .get(set_result_call)
            .method()
            .cloned()
            .ok_or_else(|| unexpected(set_result_call, "call without a method operand"))?;
        let value_type = result_type(&set_result);
        let steps = if value_type.is_some() { 3 } else { 2 };
        let set_result_at = list
            .step_back(set_result_call, steps)
            .filter(|id| is_ldarg0(list, *id))
            .ok_or_else(|| unexpected(set_result_call, "SetResult is not preceded by ldarg.0; ldflda builder"))?;
        let builder_load = list
            .next(set_result_at)
            .map(|id| list.get(id).clone())
            .filter(|i| matches!(i.op, Op::Ldflda | Op::Ldfld))
            .ok_or_else(|| unexpected(set_result_at, "builder field load expected after ldarg.0"))?;

        let result = match value_type {
            Some(ty) => {
                let load_id = list
                    .prev(set_result_call)
                    .ok_or_else(|| unexpected(set_result_call, "SetResult has no value load"))?;
                let load = list.get(load_id).clone();
                let store = load
                    .ldloc_to_stloc()
                    .ok_or_else(|| unexpected(load_id, "SetResult value is not loaded from a local"))?;
                Some((load, store, ty))
            }
            None => None,
        };

        Ok(Self {
            exception_load,
            set_exception_at,
            handler_leave,
            set_result,
            set_result_at,
            builder_load,
            result,
        })
    }

    /// `this.builder.SetResult([(T)value])`
    fn emit_set_result(&self, e: &mut CodeEmitter<'_>, value: Option<Instruction>) {
        e.emit(Instruction::ldarg(0));
        e.emit(self.builder_load.clone());
        if let (Some(load), Some((_, _, ty))) = (value, &self.result) {
            e.emit(load);
            if let Some(convert) = unbox_or_cast(ty) {
                e.emit(convert);
            }
        }
        e.emit(Instruction::call(self.set_result.clone()));
    }
}

fn result_type(set_result: &MethodRef) -> Option<TypeSig> {
    if set_result.params.len() != 1 {
        return None;
    }
    Some(
        set_result
            .declaring
            .generic_arg(0)
            .cloned()
            .unwrap_or_else(|| set_result.params[0].clone()),
    )
}

pub fn weave_async_task(module: &mut Module, target: &TargetMethod, config: &Config) -> Result<WovenMethod> {
    let machine = StateMachine::resolve(module, target, ASYNC_STATE_NOT_STARTED, false)?;

    let stub = module
        .method(target.handle)
        .body
        .as_ref()
        .ok_or_else(|| Error::weave_error(&target.full_name, "method has no body"))?;
    let create = find_call(&stub.instructions, &CallMatcher::new(ASYNC_BUILDER_PREFIXES, METHOD_CREATE))
        .ok_or_else(|| Error::missing_anchor(&target.full_name, "builder Create call"))?;
    let machine_load = stub
        .instructions
        .prev(create)
        .ok_or_else(|| Error::unexpected_shape(&target.full_name, 0, "builder Create is the first instruction"))?;
    let owner = stub
        .instructions
        .get(machine_load)
        .local_index()
        .and_then(|local| stub.variables.get(local as usize).map(|ty| ldloc_or_a(local, ty)))
        .ok_or_else(|| {
            Error::unexpected_shape(
                &target.full_name,
                stub.offset_of(machine_load),
                "state machine local is not loaded before builder Create",
            )
        })?;

    let mut body = take_move_next(module, &machine, target)?;
    let anchors = Anchors::locate(&body, &target.full_name)?;

    machine.add_fields(module);
    init_in_stub(module, &machine, target, config, machine_load, owner)?;
    splice(&mut body, &machine, &anchors, target, config);

    optimize_body(&mut body);
    module.method_mut(machine.move_next).body = Some(body);
    if let Some(stub) = module.method_mut(target.handle).body.as_mut() {
        optimize_body(stub);
    }

    log::debug!("{}: spliced into {}::MoveNext", target.full_name, machine.type_name);
    Ok(WovenMethod {
        method: target.full_name.clone(),
        shape: target.shape,
        shadow: None,
        companion: Some(machine.type_name.clone()),
    })
}

/// Weave the step function. There is no by-ref refresh: async methods cannot declare
/// `ref` or `out` parameters, so the machine holds no by-ref fields to read back.
fn splice(body: &mut MethodBody, machine: &StateMachine, anchors: &Anchors, target: &TargetMethod, config: &Config) {
    let advice = machine.advice(target, config);
    let has_value = anchors.result.is_some();

    // first step: entry advice and the short-circuit when entry replaced the result
    let mut e = CodeEmitter::new(body);
    let retry = machine.emit_prologue(&mut e, &advice, |e| {
        if !target.has(Feature::ENTRY_REPLACE) {
            return;
        }
        let proceed = e.label();
        advice.context_call(e, refs::get_return_value_replaced(), vec![]);
        e.branch(Op::Brfalse, proceed);
        let holder = has_value.then(|| stash_return_value(e, &advice));
        machine.emit_set_state(e, STATE_FINISHED);
        advice.emit_hook(e, Hook::OnExit);
        anchors.emit_set_result(e, holder.map(Instruction::ldloc));
        e.op(Op::Ret);
        e.place(proceed);
    });
    e.finish_front();

    // exception path, inside the compiler's catch
    let mut e = CodeEmitter::new(body);
    advice.context_call(&mut e, refs::set_exception(), vec![anchors.exception_load.clone()]);
    advice.emit_hook(&mut e, Hook::OnException);
    if target.has(Feature::EXCEPTION_RETRY) {
        machine.emit_retry(&mut e, &advice, retry, Op::Leave);
    }
    let handles = target.has(Feature::EXCEPTION_HANDLE);
    let mut stash = None;
    if handles {
        let handled = e.variable(TypeSig::Bool);
        advice.context_call(&mut e, refs::get_exception_handled(), vec![]);
        e.emit(Instruction::stloc(handled));
        stash = Some((handled, has_value.then(|| stash_return_value(&mut e, &advice))));
    }
    advice.emit_hook(&mut e, Hook::OnExit);
    if let Some((handled, holder)) = stash {
        let unhandled = e.label();
        e.emit(Instruction::ldloc(handled));
        e.branch(Op::Brfalse, unhandled);
        anchors.emit_set_result(&mut e, holder.map(Instruction::ldloc));
        e.branch(Op::Br, anchors.handler_leave);
        e.place(unhandled);
    }
    e.finish_before(anchors.set_exception_at);

    // success path, before the completion call
    let mut e = CodeEmitter::new(body);
    if let Some((load, _, ty)) = &anchors.result {
        if !target.omits.contains(Omit::RETURN_VALUE) {
            let mut value = vec![load.clone()];
            if ty.needs_box() {
                value.push(Instruction::typed(Op::Box, ty.clone()));
            }
            advice.context_call(&mut e, refs::capture_return_value(), value);
        }
    }
    advice.emit_hook(&mut e, Hook::OnSuccess);
    if target.has(Feature::SUCCESS_RETRY) {
        machine.emit_retry(&mut e, &advice, retry, Op::Leave);
    }
    if let (true, Some((_, store, ty))) = (target.has(Feature::SUCCESS_REPLACE), &anchors.result) {
        let keep = e.label();
        advice.context_call(&mut e, refs::get_return_value_replaced(), vec![]);
        e.branch(Op::Brfalse, keep);
        machine.emit_context_return_value(&mut e, &advice, ty);
        e.emit(store.clone());
        e.place(keep);
    }
    advice.emit_hook(&mut e, Hook::OnExit);
    e.finish_before(anchors.set_result_at);
}

/// `holder = context.ReturnValue`, returning the holder local.
fn stash_return_value(e: &mut CodeEmitter<'_>, advice: &Advice<'_>) -> u16 {
    let holder = e.variable(TypeSig::Object);
    advice.context_call(e, refs::get_return_value(), vec![]);
    e.emit(Instruction::stloc(holder));
    holder
}
