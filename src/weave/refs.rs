//! Member references into the runtime surface that woven code calls.

use crate::common::consts::{TYPE_EXCEPTION, TYPE_IMO, TYPE_METHOD_BASE, TYPE_METHOD_CONTEXT, TYPE_OBJECT_LIST, TYPE_SYSTEM_TYPE};
use crate::il::{MethodRef, TypeSig};
use crate::weave::binding::Hook;

pub fn context_type() -> TypeSig {
    TypeSig::class(TYPE_METHOD_CONTEXT)
}

pub fn imo_type() -> TypeSig {
    TypeSig::class(TYPE_IMO)
}

pub fn exception_type() -> TypeSig {
    TypeSig::class(TYPE_EXCEPTION)
}

pub fn object_array() -> TypeSig {
    TypeSig::array_of(TypeSig::Object)
}

pub fn imo_array() -> TypeSig {
    TypeSig::array_of(imo_type())
}

pub fn object_list_type() -> TypeSig {
    TypeSig::generic(TypeSig::class(TYPE_OBJECT_LIST), vec![TypeSig::Object])
}

/// `MethodContext(object target, Type, MethodBase, bool isAsync, bool isIterator,
/// bool mosNonEntryFIFO, IMo[] mos, object[] args)`
pub fn context_ctor() -> MethodRef {
    MethodRef::ctor(
        context_type(),
        vec![
            TypeSig::Object,
            TypeSig::class(TYPE_SYSTEM_TYPE),
            TypeSig::class(TYPE_METHOD_BASE),
            TypeSig::Bool,
            TypeSig::Bool,
            TypeSig::Bool,
            imo_array(),
            object_array(),
        ],
    )
}

fn context_getter(name: &str, ty: TypeSig) -> MethodRef {
    MethodRef::instance(context_type(), format!("get_{}", name), vec![], ty)
}

fn context_setter(name: &str, ty: TypeSig) -> MethodRef {
    MethodRef::instance(context_type(), format!("set_{}", name), vec![ty], TypeSig::Void)
}

pub fn get_arguments() -> MethodRef {
    context_getter("Arguments", object_array())
}

pub fn get_return_value() -> MethodRef {
    context_getter("ReturnValue", TypeSig::Object)
}

pub fn get_return_value_replaced() -> MethodRef {
    context_getter("ReturnValueReplaced", TypeSig::Bool)
}

/// Stores a produced result without marking it replaced.
pub fn capture_return_value() -> MethodRef {
    MethodRef::instance(context_type(), "CaptureReturnValue", vec![TypeSig::Object], TypeSig::Void)
}

pub fn set_exception() -> MethodRef {
    context_setter("Exception", exception_type())
}

pub fn get_exception_handled() -> MethodRef {
    context_getter("ExceptionHandled", TypeSig::Bool)
}

pub fn get_retry_count() -> MethodRef {
    context_getter("RetryCount", TypeSig::Int32)
}

pub fn set_retry_count() -> MethodRef {
    context_setter("RetryCount", TypeSig::Int32)
}

pub fn get_rewrite_arguments() -> MethodRef {
    context_getter("RewriteArguments", TypeSig::Bool)
}

pub fn hook(hook: Hook) -> MethodRef {
    MethodRef::instance(imo_type(), hook.method_name(), vec![context_type()], TypeSig::Void)
}

pub fn get_features() -> MethodRef {
    MethodRef::instance(imo_type(), "get_Features", vec![], TypeSig::Int32)
}

pub fn list_ctor() -> MethodRef {
    MethodRef::ctor(object_list_type(), vec![])
}

pub fn list_add() -> MethodRef {
    MethodRef::instance(object_list_type(), "Add", vec![TypeSig::Object], TypeSig::Void)
}

pub fn list_to_array() -> MethodRef {
    MethodRef::instance(object_list_type(), "ToArray", vec![], object_array())
}
