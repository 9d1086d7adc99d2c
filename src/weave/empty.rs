//! Weaver for bodies with nothing to protect.

use super::advice::{emit_context, emit_mo_set, Advice, ArgumentSource, CallOrder, Storage};
use super::binding::{Feature, Hook, TargetMethod};
use super::{refs, WovenMethod};
use crate::il::optimize::optimize_body;
use crate::il::{CodeEmitter, Instruction, Module, Op};
use crate::{Config, Error, Result};

/// Entry, success and exit only: an empty body cannot fail.
pub fn weave_empty(module: &mut Module, target: &TargetMethod, config: &Config) -> Result<WovenMethod> {
    let declaring = module.declaring_type(target.handle).sig();
    let method = module.method(target.handle).clone();
    let mut body = method
        .body
        .clone()
        .ok_or_else(|| Error::weave_error(&target.full_name, "method has no body"))?;
    body.instructions.clear();
    body.handlers.clear();

    let mut e = CodeEmitter::new(&mut body);
    let mos = emit_mo_set(&mut e, target, config);
    emit_context(&mut e, &declaring, &method, target, &mos, CallOrder::from_config(config), ArgumentSource::Slots);
    let context = e.variable(refs::context_type());
    e.emit(Instruction::stloc(context));

    let advice = Advice::new(target, mos, Storage::Local(context), config);
    advice.emit_hook(&mut e, Hook::OnEntry);
    let exit = e.label();
    if target.has(Feature::ENTRY_REPLACE) {
        advice.context_call(&mut e, refs::get_return_value_replaced(), vec![]);
        e.branch(Op::Brtrue, exit);
    }
    advice.emit_hook(&mut e, Hook::OnSuccess);
    e.place(exit);
    advice.emit_hook(&mut e, Hook::OnExit);
    e.op(Op::Ret);
    e.finish_back();

    optimize_body(&mut body);
    module.method_mut(target.handle).body = Some(body);
    Ok(WovenMethod { method: target.full_name.clone(), shape: target.shape, shadow: None, companion: None })
}
