//! Structural predicates over lowered method bodies.
//!
//! Nothing here mutates a body. Weavers use these to locate anchors first and only then
//! splice, so every predicate can be exercised on its own.

use super::body::{ExceptionHandler, MethodBody};
use super::list::{InstrId, InstrList};
use super::module::{FieldRef, MethodDef};
use super::opcodes::Op;

/// Matches a call whose target is declared on a type with one of the given name prefixes.
#[derive(Debug, Clone, Copy)]
pub struct CallMatcher<'a> {
    pub type_prefixes: &'a [&'a str],
    pub name: &'a str,
    pub arity: Option<usize>,
}

impl<'a> CallMatcher<'a> {
    pub fn new(type_prefixes: &'a [&'a str], name: &'a str) -> Self {
        Self { type_prefixes, name, arity: None }
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    pub fn matches(&self, list: &InstrList, id: InstrId) -> bool {
        let instr = list.get(id);
        if !matches!(instr.op, Op::Call | Op::Callvirt) {
            return false;
        }
        match instr.method() {
            Some(m) => {
                m.name == self.name
                    && m.declaring.name_starts_with(self.type_prefixes)
                    && self.arity.map_or(true, |n| m.params.len() == n)
            }
            None => false,
        }
    }
}

/// First call in the body matching `matcher`.
pub fn find_call(list: &InstrList, matcher: &CallMatcher<'_>) -> Option<InstrId> {
    list.iter().map(|(id, _)| id).find(|id| matcher.matches(list, *id))
}

/// Every call in the body matching `matcher`, in order.
pub fn find_calls(list: &InstrList, matcher: &CallMatcher<'_>) -> Vec<InstrId> {
    list.iter()
        .map(|(id, _)| id)
        .filter(|id| matcher.matches(list, *id))
        .collect()
}

/// First matching call in `[start, end)`; `None` end runs to the end of the body.
pub fn find_call_in_range(
    list: &InstrList,
    start: InstrId,
    end: Option<InstrId>,
    matcher: &CallMatcher<'_>,
) -> Option<InstrId> {
    let mut cursor = Some(start);
    while let Some(id) = cursor {
        if Some(id) == end {
            return None;
        }
        if matcher.matches(list, id) {
            return Some(id);
        }
        cursor = list.next(id);
    }
    None
}

/// Whether `id` lies in `[start, end)`.
pub fn in_range(list: &InstrList, id: InstrId, start: InstrId, end: Option<InstrId>) -> bool {
    let mut cursor = Some(start);
    while let Some(current) = cursor {
        if Some(current) == end {
            return false;
        }
        if current == id {
            return true;
        }
        cursor = list.next(current);
    }
    false
}

/// The catch handler whose protected region ends last: the compiler's outermost catch.
pub fn outer_catch_handler(body: &MethodBody) -> Option<usize> {
    let positions = body.instructions.ids();
    let position = |id: InstrId| positions.iter().position(|p| *p == id);
    body.handlers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.is_catch())
        .filter_map(|(index, h)| position(h.try_end).map(|pos| (index, pos)))
        .max_by_key(|(_, pos)| *pos)
        .map(|(index, _)| index)
}

/// The last `leave` inside a handler block.
pub fn last_leave_in_handler(list: &InstrList, handler: &ExceptionHandler) -> Option<InstrId> {
    let mut cursor = match handler.handler_end {
        Some(end) => list.prev(end),
        None => list.last(),
    };
    while let Some(id) = cursor {
        if list.get(id).op.is_leave() {
            return Some(id);
        }
        if id == handler.handler_start {
            return None;
        }
        cursor = list.prev(id);
    }
    None
}

pub fn is_ldarg0(list: &InstrList, id: InstrId) -> bool {
    list.get(id).op == Op::Ldarg0
}

/// For each declared parameter, the field the stub method copies it into
/// (`ldarg n` immediately followed by `stfld`).
pub fn parameter_fields(method: &MethodDef) -> Vec<Option<FieldRef>> {
    let mut fields = vec![None; method.params.len()];
    let Some(body) = method.body.as_ref() else {
        return fields;
    };
    let offset = method.arg_offset();
    let list = &body.instructions;
    for (id, instr) in list.iter() {
        if !instr.op.is_ldarg() {
            continue;
        }
        let Some(arg) = instr.arg_index() else { continue };
        if arg < offset {
            continue;
        }
        let param = (arg - offset) as usize;
        if param >= fields.len() {
            continue;
        }
        let Some(next) = list.next(id) else { continue };
        let next = list.get(next);
        if next.op == Op::Stfld {
            if let Some(field) = next.field_ref() {
                fields[param] = Some(field.clone());
            }
        }
    }
    fields
}

/// Every `stfld` writing the named field.
pub fn find_field_stores(list: &InstrList, field_name: &str) -> Vec<InstrId> {
    list.iter()
        .filter(|(_, i)| i.op == Op::Stfld && i.field_ref().map_or(false, |f| f.name == field_name))
        .map(|(id, _)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::body::HandlerKind;
    use crate::il::instruction::Instruction;
    use crate::il::module::{MethodRef, ParamDef};
    use crate::il::types::TypeSig;

    fn builder_call(name: &str, arity: usize) -> Instruction {
        Instruction::call(MethodRef::instance(
            TypeSig::generic(
                TypeSig::value_type("System.Runtime.CompilerServices.AsyncTaskMethodBuilder`1"),
                vec![TypeSig::Int32],
            ),
            name,
            vec![TypeSig::Int32; arity],
            TypeSig::Void,
        ))
    }

    #[test]
    fn test_find_call_by_declaring_prefix() {
        let mut list = InstrList::new();
        list.push(Instruction::ldarg(0));
        let set = list.push(builder_call("SetResult", 1));
        list.push(Instruction::new(Op::Ret));

        let prefixes = ["System.Runtime.CompilerServices.AsyncTaskMethodBuilder"];
        assert_eq!(find_call(&list, &CallMatcher::new(&prefixes, "SetResult")), Some(set));
        assert_eq!(find_call(&list, &CallMatcher::new(&prefixes, "SetResult").with_arity(0)), None);
        assert_eq!(find_call(&list, &CallMatcher::new(&["System.Foo"], "SetResult")), None);
    }

    #[test]
    fn test_outer_catch_and_leave() {
        let mut body = MethodBody::new();
        let l = &mut body.instructions;
        let ret = l.alloc(Instruction::new(Op::Ret));
        let t0 = l.push(Instruction::nop());
        let inner_try = l.push(Instruction::nop());
        let inner_catch = l.push(Instruction::new(Op::Pop));
        let after_inner = l.push(Instruction::nop());
        let outer_catch = l.push(Instruction::stloc(0));
        let leave = l.push(Instruction::branch(Op::LeaveS, ret));
        l.link_back(ret);
        let exception = HandlerKind::Catch(TypeSig::class("System.Exception"));
        body.handlers.push(ExceptionHandler {
            kind: exception.clone(),
            try_start: inner_try,
            try_end: inner_catch,
            handler_start: inner_catch,
            handler_end: Some(after_inner),
        });
        body.handlers.push(ExceptionHandler {
            kind: exception,
            try_start: t0,
            try_end: outer_catch,
            handler_start: outer_catch,
            handler_end: Some(ret),
        });

        assert_eq!(outer_catch_handler(&body), Some(1));
        assert_eq!(last_leave_in_handler(&body.instructions, &body.handlers[1]), Some(leave));
        assert_eq!(last_leave_in_handler(&body.instructions, &body.handlers[0]), None);
        assert!(in_range(&body.instructions, leave, outer_catch, Some(ret)));
        assert!(!in_range(&body.instructions, t0, outer_catch, Some(ret)));
    }

    #[test]
    fn test_parameter_fields_follow_stub_copies() {
        let sm = TypeSig::class("App.<Run>d__0");
        let mut method = MethodDef::new(
            "Run",
            vec![ParamDef::new("a", TypeSig::Int32), ParamDef::new("b", TypeSig::String)],
            TypeSig::Void,
        );
        let mut body = MethodBody::new();
        let l = &mut body.instructions;
        l.push(Instruction::ldloc(0));
        l.push(Instruction::ldarg(2));
        l.push(Instruction::field(Op::Stfld, FieldRef::new(sm.clone(), "b", TypeSig::String)));
        l.push(Instruction::ldloc(0));
        l.push(Instruction::ldarg(0));
        l.push(Instruction::field(Op::Stfld, FieldRef::new(sm, "<>4__this", TypeSig::Object)));
        method.body = Some(body);

        let fields = parameter_fields(&method);
        assert!(fields[0].is_none());
        assert_eq!(fields[1].as_ref().map(|f| f.name.as_str()), Some("b"));
    }
}
