//! Weaver for async generator methods.
//!
//! Like the async-task weaver this splices into the compiler's own catch and completion
//! code, but completion goes through the machine's value-or-end promise: the sequence
//! ends at the `SetResult(false)` call, and a handled exception ends it the same way.
//! Yielded values are recorded after each store into the current-value field that lies in
//! the protected region; the stores that clear it on completion are outside it.

use super::binding::{Feature, Hook, TargetMethod};
use super::iterator::current_field;
use super::state_machine::{take_move_next, StateMachine};
use super::{refs, WovenMethod};
use crate::common::consts::{
    FIELD_CURRENT, METHOD_SET_EXCEPTION, METHOD_SET_RESULT, TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE,
};
use crate::consts::ASYNC_ITERATOR_STATE_NOT_STARTED;
use crate::il::optimize::optimize_body;
use crate::il::pattern::{
    find_call_in_range, find_calls, find_field_stores, in_range, is_ldarg0, last_leave_in_handler,
    outer_catch_handler, CallMatcher,
};
use crate::il::{CodeEmitter, FieldRef, InstrId, Instruction, MethodBody, MethodRef, Module, Op, TypeSig};
use crate::{Config, Error, Result};

const PROMISE_PREFIXES: &[&str] = &[TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE];

struct Anchors {
    exception_load: Instruction,
    set_exception_at: InstrId,
    handler_leave: InstrId,
    set_result: MethodRef,
    set_result_at: InstrId,
    promise_load: Instruction,
    current_stores: Vec<InstrId>,
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
            &CallMatcher::new(PROMISE_PREFIXES, METHOD_SET_EXCEPTION),
        )
        .ok_or_else(|| Error::missing_anchor(method, "promise SetException call"))?;
        let set_exception_at = list
            .step_back(set_exception, 3)
            .filter(|id| is_ldarg0(list, *id))
            .ok_or_else(|| unexpected(set_exception, "SetException is not preceded by ldarg.0; ldflda promise; ldloc"))?;
        let handler_leave = last_leave_in_handler(list, handler)
            .ok_or_else(|| Error::missing_anchor(method, "leave at the end of the catch region"))?;

        // the end of the sequence: SetResult(false)
        let set_result_call = find_calls(list, &CallMatcher::new(PROMISE_PREFIXES, METHOD_SET_RESULT).with_arity(1))
            .into_iter()
            .filter(|id| {
                list.prev(*id)
                    .map_or(false, |prev| list.get(prev).i32_constant() == Some(0))
            })
            .last()
            .ok_or_else(|| Error::missing_anchor(method, "promise SetResult(false) call"))?;
        let set_result = list
            .get(set_result_call)
            .method()
            .cloned()
            .ok_or_else(|| unexpected(set_result_call, "call without a method operand"))?;
        let set_result_at = list
            .step_back(set_result_call, 3)
            .filter(|id| is_ldarg0(list, *id))
            .ok_or_else(|| unexpected(set_result_call, "SetResult is not preceded by ldarg.0; ldflda promise"))?;
        let promise_load = list
            .next(set_result_at)
            .map(|id| list.get(id).clone())
            .filter(|i| matches!(i.op, Op::Ldflda | Op::Ldfld))
            .ok_or_else(|| unexpected(set_result_at, "promise field load expected after ldarg.0"))?;

        let current_stores = find_field_stores(list, FIELD_CURRENT)
            .into_iter()
            .filter(|id| in_range(list, *id, handler.try_start, Some(handler.try_end)))
            .collect();

        Ok(Self {
            exception_load,
            set_exception_at,
            handler_leave,
            set_result,
            set_result_at,
            promise_load,
            current_stores,
        })
    }

    /// `this.promise.SetResult(false)`
    fn emit_end_sequence(&self, e: &mut CodeEmitter<'_>) {
        e.emit(Instruction::ldarg(0));
        e.emit(self.promise_load.clone());
        e.emit(Instruction::ldc_i4(0));
        e.emit(Instruction::call(self.set_result.clone()));
    }
}

pub fn weave_async_iterator(module: &mut Module, target: &TargetMethod, config: &Config) -> Result<WovenMethod> {
    let machine = StateMachine::resolve(module, target, ASYNC_ITERATOR_STATE_NOT_STARTED, config.enumerable_returns)?
        .defer_context(module, target, config);
    let current = current_field(module, &machine, target)?;

    let mut body = take_move_next(module, &machine, target)?;
    let anchors = Anchors::locate(&body, &target.full_name)?;

    machine.add_fields(module);
    splice(&mut body, &machine, &anchors, &current, target, config);

    optimize_body(&mut body);
    module.method_mut(machine.move_next).body = Some(body);

    log::debug!("{}: spliced into {}::MoveNext", target.full_name, machine.type_name);
    Ok(WovenMethod {
        method: target.full_name.clone(),
        shape: target.shape,
        shadow: None,
        companion: Some(machine.type_name.clone()),
    })
}

fn splice(
    body: &mut MethodBody,
    machine: &StateMachine,
    anchors: &Anchors,
    current: &FieldRef,
    target: &TargetMethod,
    config: &Config,
) {
    let advice = machine.advice(target, config);

    let mut e = CodeEmitter::new(body);
    let retry = machine.emit_prologue(&mut e, &advice, |_| {});
    e.finish_front();

    for store in &anchors.current_stores {
        let mut e = CodeEmitter::new(body);
        machine.emit_record_item(&mut e, current);
        e.finish_after(*store);
    }

    // exception path, inside the compiler's catch
    let mut e = CodeEmitter::new(body);
    advice.context_call(&mut e, refs::set_exception(), vec![anchors.exception_load.clone()]);
    advice.emit_hook(&mut e, Hook::OnException);
    if target.has(Feature::EXCEPTION_RETRY) {
        machine.emit_retry(&mut e, &advice, retry, Op::Leave);
    }
    let handled = target.has(Feature::EXCEPTION_HANDLE).then(|| {
        let handled = e.variable(TypeSig::Bool);
        advice.context_call(&mut e, refs::get_exception_handled(), vec![]);
        e.emit(Instruction::stloc(handled));
        handled
    });
    advice.emit_hook(&mut e, Hook::OnExit);
    if let Some(handled) = handled {
        let unhandled = e.label();
        e.emit(Instruction::ldloc(handled));
        e.branch(Op::Brfalse, unhandled);
        anchors.emit_end_sequence(&mut e);
        e.branch(Op::Br, anchors.handler_leave);
        e.place(unhandled);
    }
    e.finish_before(anchors.set_exception_at);

    // end of the sequence
    let mut e = CodeEmitter::new(body);
    machine.emit_capture_items(&mut e, &advice);
    advice.emit_hook(&mut e, Hook::OnSuccess);
    if target.has(Feature::SUCCESS_RETRY) {
        machine.emit_retry(&mut e, &advice, retry, Op::Leave);
    }
    advice.emit_hook(&mut e, Hook::OnExit);
    e.finish_before(anchors.set_result_at);
}
