//! Runtime surface that woven and compiler-lowered code calls but the module does not define:
//! the method context, interceptor hooks, handle conversion, async builders, promises,
//! awaiters and `List<object>`.

use super::context::MethodContext;
use super::error::VmError;
use super::value::{shared, MoInstance, Shared, TaskState, Value};
use super::vm::{null_reference, Exec, Unwind, Vm};
use crate::common::consts::{
    ASYNC_BUILDER_PREFIXES, HOOK_ON_ENTRY, HOOK_ON_EXCEPTION, HOOK_ON_EXIT, HOOK_ON_SUCCESS, METHOD_CREATE,
    TYPE_ASYNC_ITERATOR_METHOD_BUILDER, TYPE_METHOD_BASE, TYPE_METHOD_CONTEXT, TYPE_OBJECT_LIST, TYPE_SYSTEM_TYPE,
    TYPE_TASK,
};
use crate::il::MethodRef;

/// Instance call on a runtime-surface receiver. `Ok(None)` when the receiver is not one.
pub(super) fn instance_call(
    vm: &mut Vm,
    receiver: &Value,
    method: &MethodRef,
    args: &[Value],
) -> Exec<Option<Option<Value>>> {
    let name = method.name.as_str();
    let result = match receiver {
        Value::Context(context) => context_call(context, name, args)?,
        Value::Mo(mo) => mo_call(mo, name, args)?,
        Value::Builder(task) => return builder_call(vm, task, name, args).map(Some),
        Value::Promise(state) => match name {
            "SetResult" => complete(state, TaskState::Completed(arg(args, 0)), "promise")?,
            "SetException" => complete(state, TaskState::Faulted(arg(args, 0)), "promise")?,
            "Reset" => {
                *state.borrow_mut() = TaskState::Pending;
                None
            }
            _ => return Err(VmError::unknown_member(method.full_name()).into()),
        },
        Value::Awaiter => match name {
            "GetAwaiter" => Some(Value::Awaiter),
            // always suspends, so every await goes through the scheduler
            "get_IsCompleted" => Some(Value::bool(false)),
            "GetResult" => None,
            _ => return Err(VmError::unknown_member(method.full_name()).into()),
        },
        Value::List(items) => match name {
            "Add" => {
                items.borrow_mut().push(arg(args, 0));
                None
            }
            "ToArray" => Some(Value::array(items.borrow().clone())),
            "get_Count" => Some(Value::I32(items.borrow().len() as i32)),
            _ => return Err(VmError::unknown_member(method.full_name()).into()),
        },
        Value::Null if !method.is_ctor() && !method.declaring.is_value_type() => {
            return Err(Unwind::Throw(null_reference()));
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

/// Static call into the runtime surface. `Ok(None)` when nothing implements it.
pub(super) fn static_call(method: &MethodRef, args: &[Value]) -> Exec<Option<Option<Value>>> {
    let declaring = method.declaring.full_name();
    let result = match (declaring.as_str(), method.name.as_str()) {
        (TYPE_SYSTEM_TYPE, "GetTypeFromHandle") | (TYPE_METHOD_BASE, "GetMethodFromHandle") => {
            Some(arg(args, 0))
        }
        (TYPE_TASK, "Yield") => Some(Value::Awaiter),
        (_, METHOD_CREATE) if is_builder(&declaring) => Some(Value::Builder(shared(TaskState::Pending))),
        // base constructors outside the module
        _ if method.is_ctor() => None,
        _ => return Ok(None),
    };
    Ok(Some(result))
}

/// `newobj` of a runtime-surface type.
pub(super) fn construct(vm: &mut Vm, type_name: &str, args: &[Value]) -> Exec<Option<Value>> {
    if type_name == TYPE_METHOD_CONTEXT {
        if args.len() != 8 {
            let message = format!("constructor takes 8 arguments, got {}", args.len());
            return Err(VmError::malformed(TYPE_METHOD_CONTEXT, message).into());
        }
        let mut context = MethodContext::new(
            args[0].clone(),
            handle_name(&args[1]),
            handle_name(&args[2]),
            args[7].clone(),
        );
        context.is_async = args[3].is_truthy();
        context.is_iterator = args[4].is_truthy();
        context.mos_non_entry_fifo = args[5].is_truthy();
        context.mos = args[6].clone();
        vm.stats.contexts_created += 1;
        return Ok(Some(Value::Context(shared(context))));
    }
    if type_name == TYPE_OBJECT_LIST {
        return Ok(Some(Value::List(shared(Vec::new()))));
    }
    if type_name.ends_with("Exception") {
        let message = args.first().and_then(Value::as_str).unwrap_or_default();
        return Ok(Some(Value::exception(type_name, message)));
    }
    Ok(None)
}

fn is_builder(type_name: &str) -> bool {
    ASYNC_BUILDER_PREFIXES
        .iter()
        .chain(std::iter::once(&TYPE_ASYNC_ITERATOR_METHOD_BUILDER))
        .any(|prefix| type_name.starts_with(prefix))
}

fn handle_name(value: &Value) -> String {
    match value {
        Value::Type(name) | Value::Method(name) => name.clone(),
        _ => String::new(),
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn complete(state: &Shared<TaskState>, outcome: TaskState, what: &str) -> Result<Option<Value>, VmError> {
    let mut state = state.borrow_mut();
    if *state != TaskState::Pending {
        return Err(VmError::AlreadyCompleted { what: what.to_string() });
    }
    *state = outcome;
    Ok(None)
}

fn context_call(context: &Shared<MethodContext>, name: &str, args: &[Value]) -> Result<Option<Value>, VmError> {
    let mut context = context.borrow_mut();
    let value = match name {
        "get_Target" => Some(context.target.clone()),
        "get_TargetType" => Some(Value::Type(context.target_type.clone())),
        "get_Method" => Some(Value::Method(context.method.clone())),
        "get_IsAsync" => Some(Value::bool(context.is_async)),
        "get_IsIterator" => Some(Value::bool(context.is_iterator)),
        "get_MosNonEntryFIFO" => Some(Value::bool(context.mos_non_entry_fifo)),
        "get_Mos" => Some(context.mos.clone()),
        "get_Arguments" => Some(context.arguments_value().clone()),
        "get_ReturnValue" => Some(context.return_value().clone()),
        "set_ReturnValue" => {
            context.set_return_value(arg(args, 0));
            None
        }
        "CaptureReturnValue" => {
            context.capture_return_value(arg(args, 0));
            None
        }
        "get_ReturnValueReplaced" => Some(Value::bool(context.return_value_replaced())),
        "get_Exception" => Some(context.exception.clone().unwrap_or_default()),
        "set_Exception" => {
            context.exception = Some(arg(args, 0)).filter(|e| !e.is_null());
            None
        }
        "get_ExceptionHandled" => Some(Value::bool(context.exception_handled)),
        "set_ExceptionHandled" => {
            context.exception_handled = arg(args, 0).is_truthy();
            None
        }
        "get_RetryCount" => Some(Value::I32(context.retry_count)),
        "set_RetryCount" => {
            context.retry_count = arg(args, 0).as_i32()?;
            None
        }
        "get_RewriteArguments" => Some(Value::bool(context.rewrite_arguments)),
        "set_RewriteArguments" => {
            context.rewrite_arguments = arg(args, 0).is_truthy();
            None
        }
        other => return Err(VmError::unknown_member(format!("{}::{}", TYPE_METHOD_CONTEXT, other))),
    };
    Ok(value)
}

fn mo_call(mo: &Shared<MoInstance>, name: &str, args: &[Value]) -> Result<Option<Value>, VmError> {
    let mut mo = mo.borrow_mut();
    if name == "get_Features" {
        return Ok(Some(Value::I32(mo.interceptor.features().bits() as i32)));
    }
    if let Some(property) = name.strip_prefix("set_") {
        if !mo.interceptor.set_property(property, arg(args, 0)) {
            return Err(VmError::unknown_member(format!("{}::{}", mo.type_name, name)));
        }
        return Ok(None);
    }

    let context = match args.first() {
        Some(Value::Context(context)) => context.clone(),
        other => return Err(VmError::type_mismatch(TYPE_METHOD_CONTEXT, other.unwrap_or(&Value::Null))),
    };
    let mut context = context.borrow_mut();
    match name {
        HOOK_ON_ENTRY => mo.interceptor.on_entry(&mut context),
        HOOK_ON_EXCEPTION => mo.interceptor.on_exception(&mut context),
        HOOK_ON_SUCCESS => mo.interceptor.on_success(&mut context),
        HOOK_ON_EXIT => mo.interceptor.on_exit(&mut context),
        other => return Err(VmError::unknown_member(format!("{}::{}", mo.type_name, other))),
    }
    Ok(None)
}

fn builder_call(vm: &mut Vm, task: &Shared<TaskState>, name: &str, args: &[Value]) -> Exec<Option<Value>> {
    match name {
        // Start(ref machine), and the async-iterator builder's MoveNext(ref machine)
        "Start" | "MoveNext" => {
            let machine = arg(args, 0).deref();
            vm.resume(&machine)?;
            Ok(None)
        }
        "AwaitUnsafeOnCompleted" | "AwaitOnCompleted" => {
            vm.schedule(arg(args, 1).deref());
            Ok(None)
        }
        "get_Task" => Ok(Some(Value::Task(task.clone()))),
        "SetResult" => Ok(complete(task, TaskState::Completed(arg(args, 0)), "task")?),
        "SetException" => Ok(complete(task, TaskState::Faulted(arg(args, 0)), "task")?),
        "SetStateMachine" | "Complete" => Ok(None),
        other => Err(VmError::unknown_member(format!("builder::{}", other)).into()),
    }
}
