//! Synchronous weaver: the original logic moves into a private shadow method and the
//! original slot becomes a proxy with a retry loop around a protected call.
//!
//! Proxy layout:
//!
//! ```text
//!     <interceptor set>; context = new MethodContext(...)
//!     OnEntry
//!     if (context.ReturnValueReplaced) { result = context.ReturnValue; OnExit; goto RETURN }
//!     if (context.RewriteArguments) { argN = context.Arguments[N] ... }
//! RETRY:
//!     try { result = shadow(args) }
//!     catch (Exception ex) {
//!         context.Exception = ex; OnException; <refresh by-ref args>
//!         if (context.RetryCount > 0) { context.RetryCount = 0; leave RETRY }
//!         handled = context.ExceptionHandled
//!         if (handled) result = context.ReturnValue
//!         OnExit
//!         if (handled) leave RETURN
//!         rethrow
//!     }
//!     context.CaptureReturnValue(result); OnSuccess; <refresh by-ref args>
//!     if (context.RetryCount > 0) { context.RetryCount = 0; goto RETRY }
//!     if (context.ReturnValueReplaced) result = context.ReturnValue
//!     OnExit
//! RETURN:
//!     return result
//! ```

use super::advice::{emit_context, emit_mo_set, Advice, ArgumentSource, CallOrder, Storage};
use super::binding::{Feature, Hook, Omit, TargetMethod};
use super::{refs, WovenMethod};
use crate::common::consts::SHADOW_SUFFIX;
use crate::il::emit::{clone_method_as, load_arg_value, unbox_or_cast};
use crate::il::optimize::optimize_body;
use crate::il::{CodeEmitter, ExceptionHandler, HandlerKind, Instruction, MethodBody, MethodDef, Module, Op, TypeSig};
use crate::{Config, Error, Result};

pub fn weave_sync(module: &mut Module, target: &TargetMethod, config: &Config) -> Result<WovenMethod> {
    let declaring_type = module.declaring_type(target.handle);
    let declaring = declaring_type.sig();
    let method = module.method(target.handle).clone();
    if method.body.is_none() {
        return Err(Error::weave_error(&target.full_name, "method has no body"));
    }
    let shadow_name = format!("{}{}", method.name, SHADOW_SUFFIX);
    if declaring_type.find_method(&shadow_name).is_some() {
        return Err(Error::weave_error(&target.full_name, format!("{} already exists", shadow_name)));
    }

    let shadow = clone_method_as(&method, &shadow_name);
    let shadow_ref = shadow.to_ref(declaring.clone());
    module.types[target.handle.type_index].methods.push(shadow);

    let mut body = MethodBody::new();
    let has_result = !method.return_type.is_void();
    let mut e = CodeEmitter::new(&mut body);
    let result = if has_result { Some(e.variable(method.return_type.clone())) } else { None };

    let mos = emit_mo_set(&mut e, target, config);
    emit_context(&mut e, &declaring, &method, target, &mos, CallOrder::from_config(config), ArgumentSource::Slots);
    let context = e.variable(refs::context_type());
    e.emit(Instruction::stloc(context));
    let advice = Advice::new(target, mos, Storage::Local(context), config);

    let retry = e.label();
    let catch_end = e.label();
    let ret = e.label();

    advice.emit_hook(&mut e, Hook::OnEntry);

    if target.has(Feature::ENTRY_REPLACE) {
        let proceed = e.label();
        advice.context_call(&mut e, refs::get_return_value_replaced(), vec![]);
        e.branch(Op::Brfalse, proceed);
        if let Some(result) = result {
            emit_context_return_value(&mut e, &advice, &method.return_type);
            e.emit(Instruction::stloc(result));
        }
        advice.emit_hook(&mut e, Hook::OnExit);
        e.branch(Op::Br, ret);
        e.place(proceed);
    }

    if target.has(Feature::REWRITE_ARGS) && !target.omits.contains(Omit::ARGUMENTS) && !method.params.is_empty() {
        emit_rewrite_args(&mut e, &advice, &method);
    }

    // protected call
    e.place(retry);
    let arg_count = method.params.len() as u16 + method.arg_offset();
    let mut try_start = None;
    for arg in 0..arg_count {
        let id = e.emit(Instruction::ldarg(arg));
        try_start.get_or_insert(id);
    }
    let call = e.emit(Instruction::call(shadow_ref));
    let try_start = try_start.unwrap_or(call);
    if let Some(result) = result {
        e.emit(Instruction::stloc(result));
    }
    e.branch(Op::Leave, catch_end);

    // catch (Exception)
    let exception = e.variable(refs::exception_type());
    let handler_start = e.emit(Instruction::stloc(exception));
    advice.context_call(&mut e, refs::set_exception(), vec![Instruction::ldloc(exception)]);
    advice.emit_hook(&mut e, Hook::OnException);
    emit_refresh_by_ref_args(&mut e, &advice, &method);
    if target.has(Feature::EXCEPTION_RETRY) {
        let no_retry = e.label();
        advice.emit_retry_check(&mut e, no_retry);
        e.branch(Op::Leave, retry);
        e.place(no_retry);
    }
    // the flag as OnException left it decides between return and rethrow
    let handled = target.has(Feature::EXCEPTION_HANDLE).then(|| {
        let handled = e.variable(TypeSig::Bool);
        advice.context_call(&mut e, refs::get_exception_handled(), vec![]);
        e.emit(Instruction::stloc(handled));
        if let Some(result) = result {
            let unhandled = e.label();
            e.emit(Instruction::ldloc(handled));
            e.branch(Op::Brfalse, unhandled);
            emit_context_return_value(&mut e, &advice, &method.return_type);
            e.emit(Instruction::stloc(result));
            e.place(unhandled);
        }
        handled
    });
    advice.emit_hook(&mut e, Hook::OnExit);
    if let Some(handled) = handled {
        let rethrow = e.label();
        e.emit(Instruction::ldloc(handled));
        e.branch(Op::Brfalse, rethrow);
        e.branch(Op::Leave, ret);
        e.place(rethrow);
    }
    e.op(Op::Rethrow);

    // normal completion
    e.place(catch_end);
    if let Some(result) = result {
        if !target.omits.contains(Omit::RETURN_VALUE) {
            let mut value = vec![Instruction::ldloc(result)];
            if method.return_type.needs_box() {
                value.push(Instruction::typed(Op::Box, method.return_type.clone()));
            }
            advice.context_call(&mut e, refs::capture_return_value(), value);
        }
    }
    advice.emit_hook(&mut e, Hook::OnSuccess);
    emit_refresh_by_ref_args(&mut e, &advice, &method);
    if target.has(Feature::SUCCESS_RETRY) {
        let no_retry = e.label();
        advice.emit_retry_check(&mut e, no_retry);
        e.branch(Op::Br, retry);
        e.place(no_retry);
    }
    if target.has(Feature::SUCCESS_REPLACE) {
        if let Some(result) = result {
            let keep = e.label();
            advice.context_call(&mut e, refs::get_return_value_replaced(), vec![]);
            e.branch(Op::Brfalse, keep);
            emit_context_return_value(&mut e, &advice, &method.return_type);
            e.emit(Instruction::stloc(result));
            e.place(keep);
        }
    }
    advice.emit_hook(&mut e, Hook::OnExit);

    e.place(ret);
    if let Some(result) = result {
        e.emit(Instruction::ldloc(result));
    }
    e.op(Op::Ret);
    e.finish_back();

    body.handlers.push(ExceptionHandler {
        kind: HandlerKind::Catch(refs::exception_type()),
        try_start,
        try_end: handler_start,
        handler_start,
        handler_end: Some(catch_end),
    });
    optimize_body(&mut body);
    module.method_mut(target.handle).body = Some(body);

    log::debug!("{}: original logic moved to {}", target.full_name, shadow_name);
    Ok(WovenMethod {
        method: target.full_name.clone(),
        shape: target.shape,
        shadow: Some(shadow_name),
        companion: None,
    })
}

/// `(T)context.ReturnValue`
fn emit_context_return_value(e: &mut CodeEmitter<'_>, advice: &Advice<'_>, ty: &TypeSig) {
    advice.context_call(e, refs::get_return_value(), vec![]);
    if let Some(convert) = unbox_or_cast(ty) {
        e.emit(convert);
    }
}

/// `context.Arguments[index]`
fn context_argument(advice: &Advice<'_>, index: usize) -> Vec<Instruction> {
    let mut out = advice.context.load();
    out.push(Instruction::callvirt(refs::get_arguments()));
    out.push(Instruction::ldc_i4(index as i32));
    out.push(Instruction::new(Op::LdelemRef));
    out
}

/// Reload every parameter slot from the context's argument array. A null element
/// becomes the parameter type's default.
fn emit_rewrite_args(e: &mut CodeEmitter<'_>, advice: &Advice<'_>, method: &MethodDef) {
    let done = e.label();
    advice.context_call(e, refs::get_rewrite_arguments(), vec![]);
    e.branch(Op::Brfalse, done);

    let offset = method.arg_offset();
    for (index, param) in method.params.iter().enumerate() {
        let arg = offset + index as u16;
        let by_ref = param.ty.is_by_ref();
        let ty = param.ty.element().clone();
        let next = e.label();

        if ty.default_needs_initobj() {
            let present = e.label();
            e.emit_all(context_argument(advice, index));
            e.branch(Op::Brtrue, present);
            e.emit(if by_ref { Instruction::ldarg(arg) } else { Instruction::ldarga(arg) });
            e.emit(Instruction::typed(Op::Initobj, ty.clone()));
            e.branch(Op::Br, next);
            e.place(present);
        }

        if by_ref {
            e.emit(Instruction::ldarg(arg));
        }
        e.emit_all(context_argument(advice, index));
        if let Some(convert) = unbox_or_cast(&ty) {
            e.emit(convert);
        }
        if by_ref {
            if ty.needs_box() {
                e.emit(Instruction::typed(Op::Stobj, ty.clone()));
            } else {
                e.op(Op::StindRef);
            }
        } else {
            e.emit(Instruction::starg(arg));
        }
        e.place(next);
    }
    e.place(done);
}

/// Copy by-ref parameters back into the context so later hooks see what the body wrote.
fn emit_refresh_by_ref_args(e: &mut CodeEmitter<'_>, advice: &Advice<'_>, method: &MethodDef) {
    let target = advice.target;
    if !target.has(Feature::FRESH_ARGS) || target.omits.contains(Omit::ARGUMENTS) {
        return;
    }
    let offset = method.arg_offset();
    for (index, param) in method.params.iter().enumerate() {
        if !param.ty.is_by_ref() {
            continue;
        }
        advice.context_call(e, refs::get_arguments(), vec![]);
        e.emit(Instruction::ldc_i4(index as i32));
        e.emit_all(load_arg_value(offset + index as u16, &param.ty));
        let element = param.ty.element();
        if element.needs_box() {
            e.emit(Instruction::typed(Op::Box, element.clone()));
        }
        e.op(Op::StelemRef);
    }
}
