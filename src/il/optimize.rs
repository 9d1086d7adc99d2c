//! Branch normalisation pass run once over every body the weaver touched.
//!
//! Splicing code between a short branch and its target can push the target out of
//! short range, so every short branch is first widened. Offsets are then recomputed
//! from encoded sizes and each branch whose displacement fits in a signed byte is
//! shortened again. Local, argument and constant loads are folded to their macro forms.

use super::body::MethodBody;
use super::instruction::Instruction;
use super::list::InstrId;
use super::opcodes::Op;

/// Widen, fold macros, then re-shorten. Never changes what the body does.
pub fn optimize_body(body: &mut MethodBody) {
    expand_branches(body);
    simplify_macros(body);
    let mut rounds = 0;
    while shorten_branches(body) > 0 {
        rounds += 1;
    }
    log::trace!("branch shortening settled after {} round(s)", rounds);
}

/// Replace every short branch by its long form. Returns the number rewritten.
pub fn expand_branches(body: &mut MethodBody) -> usize {
    let ids: Vec<InstrId> = body.instructions.ids();
    let mut count = 0;
    for id in ids {
        let instr = body.instructions.get_mut(id);
        if instr.op.is_short_branch() {
            instr.op = instr.op.long_form();
            count += 1;
        }
    }
    count
}

/// Shorten every long branch whose displacement fits in a signed byte. Returns the number
/// shortened; later shortenings only shrink distances so decisions made on the current
/// layout stay valid.
pub fn shorten_branches(body: &mut MethodBody) -> usize {
    let offsets = body.offsets();
    let ids: Vec<InstrId> = body.instructions.ids();
    let mut count = 0;
    for id in ids {
        let (op, target) = {
            let instr = body.instructions.get(id);
            (instr.op, instr.branch_target())
        };
        let Some(target) = target else { continue };
        if !op.is_branch() || op.is_short_branch() || op.short_form() == op {
            continue;
        }
        let (Some(&at), Some(&to)) = (offsets.get(&id), offsets.get(&target)) else {
            continue;
        };
        let (at, to) = (at as i64, to as i64);
        let displacement = if to > at {
            to - (at + op.encoded_size() as i64)
        } else {
            to - (at + op.short_form().encoded_size() as i64)
        };
        if (-128..=127).contains(&displacement) {
            body.instructions.get_mut(id).op = op.short_form();
            count += 1;
        }
    }
    count
}

/// Fold slot and constant loads into their shortest encodings.
pub fn simplify_macros(body: &mut MethodBody) {
    let ids: Vec<InstrId> = body.instructions.ids();
    for id in ids {
        let instr = body.instructions.get(id);
        let folded = if instr.op.is_ldloc() {
            instr.local_index().map(Instruction::ldloc)
        } else if instr.op.is_stloc() {
            instr.local_index().map(Instruction::stloc)
        } else if instr.op.is_ldloca() {
            instr.local_index().map(Instruction::ldloca)
        } else if instr.op.is_ldarg() {
            instr.arg_index().map(Instruction::ldarg)
        } else if instr.op.is_ldarga() {
            instr.arg_index().map(Instruction::ldarga)
        } else if instr.op.is_starg() {
            instr.arg_index().map(Instruction::starg)
        } else if instr.op.is_ldc_i4() {
            instr.i32_constant().map(Instruction::ldc_i4)
        } else {
            None
        };
        if let Some(folded) = folded {
            body.instructions.replace(id, folded);
        }
    }
}

/// Whether every branch in the body can reach its target with its current encoding.
pub fn branches_in_range(body: &MethodBody) -> bool {
    let offsets = body.offsets();
    body.instructions.iter().all(|(id, instr)| {
        if !instr.op.is_short_branch() {
            return true;
        }
        match (instr.branch_target().and_then(|t| offsets.get(&t)), offsets.get(&id)) {
            (Some(&to), Some(&at)) => {
                let displacement = to as i64 - (at as i64 + instr.size() as i64);
                (-128..=127).contains(&displacement)
            }
            _ => false,
        }
    })
}
