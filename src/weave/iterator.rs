//! Weaver for generator methods.
//!
//! The step function has no catch of its own, so the weaver wraps its whole original body
//! in one. Every `ret` becomes a store into a `hasNext` local followed by a `leave` to a
//! common tail, which records the yielded value or, once the sequence is exhausted, runs
//! the success and exit chains. The context field is cleared after exit so a finished
//! enumerator asked for more does not report again.

use super::binding::{Feature, Hook, TargetMethod};
use super::state_machine::{take_move_next, StateMachine};
use super::{refs, WovenMethod};
use crate::common::consts::FIELD_CURRENT;
use crate::consts::ITERATOR_STATE_NOT_STARTED;
use crate::il::optimize::optimize_body;
use crate::il::{CodeEmitter, ExceptionHandler, FieldRef, HandlerKind, InstrId, Instruction, MethodBody, Module, Op, TypeSig};
use crate::{Config, Error, Result};

pub fn weave_iterator(module: &mut Module, target: &TargetMethod, config: &Config) -> Result<WovenMethod> {
    let machine = StateMachine::resolve(module, target, ITERATOR_STATE_NOT_STARTED, config.enumerable_returns)?
        .defer_context(module, target, config);
    let current = current_field(module, &machine, target)?;

    let mut body = take_move_next(module, &machine, target)?;
    let returns: Vec<InstrId> = body
        .instructions
        .iter()
        .filter(|(_, i)| i.op == Op::Ret)
        .map(|(id, _)| id)
        .collect();
    let try_start = body.instructions.first();
    let (Some(try_start), false) = (try_start, returns.is_empty()) else {
        return Err(Error::missing_anchor(&target.full_name, "ret in MoveNext"));
    };

    machine.add_fields(module);
    splice(&mut body, &machine, &current, target, config, try_start, &returns);

    optimize_body(&mut body);
    module.method_mut(machine.move_next).body = Some(body);

    log::debug!("{}: wrapped {}::MoveNext", target.full_name, machine.type_name);
    Ok(WovenMethod {
        method: target.full_name.clone(),
        shape: target.shape,
        shadow: None,
        companion: Some(machine.type_name.clone()),
    })
}

/// The machine's current-value field; only required when values are recorded.
pub(crate) fn current_field(module: &Module, machine: &StateMachine, target: &TargetMethod) -> Result<FieldRef> {
    let ty = &module.types[machine.move_next.type_index];
    match ty.field_ref(FIELD_CURRENT) {
        Some(field) => Ok(field),
        None if machine.items.is_none() => Ok(FieldRef::new(machine.sig.clone(), FIELD_CURRENT, TypeSig::Object)),
        None => Err(Error::missing_anchor(
            &target.full_name,
            format!("{}::{}", machine.type_name, FIELD_CURRENT),
        )),
    }
}

fn splice(
    body: &mut MethodBody,
    machine: &StateMachine,
    current: &FieldRef,
    target: &TargetMethod,
    config: &Config,
    try_start: InstrId,
    returns: &[InstrId],
) {
    let advice = machine.advice(target, config);
    let context = machine.context.clone();

    let mut e = CodeEmitter::new(body);
    let retry = machine.emit_prologue(&mut e, &advice, |_| {});
    e.finish_front();

    let mut e = CodeEmitter::new(body);
    let has_next = e.variable(TypeSig::Bool);
    let after = e.label();
    let finished = e.label();
    let return_false = e.label();
    let rethrow = e.label();
    let exception = e.variable(refs::exception_type());
    let handles = target.has(Feature::EXCEPTION_HANDLE);

    // catch (Exception)
    let handler_start = e.emit(Instruction::stloc(exception));
    advice.context_call(&mut e, refs::set_exception(), vec![Instruction::ldloc(exception)]);
    advice.emit_hook(&mut e, Hook::OnException);
    if target.has(Feature::EXCEPTION_RETRY) {
        machine.emit_retry(&mut e, &advice, retry, Op::Leave);
    }
    let handled = handles.then(|| {
        let handled = e.variable(TypeSig::Bool);
        advice.context_call(&mut e, refs::get_exception_handled(), vec![]);
        e.emit(Instruction::stloc(handled));
        handled
    });
    advice.emit_hook(&mut e, Hook::OnExit);
    emit_clear_context(&mut e, &context);
    if let Some(handled) = handled {
        e.emit(Instruction::ldloc(handled));
        e.branch(Op::Brfalse, rethrow);
        e.branch(Op::Leave, return_false);
    }
    e.place(rethrow);
    e.op(Op::Rethrow);

    // common tail
    e.place(after);
    e.emit(Instruction::ldloc(has_next));
    e.branch(Op::Brfalse, finished);
    machine.emit_record_item(&mut e, current);
    e.emit(Instruction::ldc_i4(1));
    e.op(Op::Ret);

    e.place(finished);
    e.emit(Instruction::ldarg(0));
    e.emit(Instruction::field(Op::Ldfld, context.clone()));
    e.branch(Op::Brfalse, return_false);
    machine.emit_capture_items(&mut e, &advice);
    advice.emit_hook(&mut e, Hook::OnSuccess);
    if target.has(Feature::SUCCESS_RETRY) {
        machine.emit_retry(&mut e, &advice, retry, Op::Br);
    }
    advice.emit_hook(&mut e, Hook::OnExit);
    emit_clear_context(&mut e, &context);
    e.place(return_false);
    e.emit(Instruction::ldc_i4(0));
    e.op(Op::Ret);
    e.finish_back();

    for ret in returns {
        body.instructions.replace(*ret, Instruction::stloc(has_next));
        body.instructions.insert_after(*ret, Instruction::branch(Op::Leave, after));
    }
    body.handlers.push(ExceptionHandler {
        kind: HandlerKind::Catch(refs::exception_type()),
        try_start,
        try_end: handler_start,
        handler_start,
        handler_end: Some(after),
    });
}

/// `this.context = null`
fn emit_clear_context(e: &mut CodeEmitter<'_>, context: &FieldRef) {
    e.emit(Instruction::ldarg(0));
    e.op(Op::Ldnull);
    e.emit(Instruction::field(Op::Stfld, context.clone()));
}
