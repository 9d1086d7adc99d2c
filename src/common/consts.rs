// Well-known names the weaver looks for in lowered code and references from generated code

pub const CTOR: &str = ".ctor";

// Compiler-synthesized state-machine markers
pub const ATTR_ASYNC_STATE_MACHINE: &str = "System.Runtime.CompilerServices.AsyncStateMachineAttribute";
pub const ATTR_ITERATOR_STATE_MACHINE: &str = "System.Runtime.CompilerServices.IteratorStateMachineAttribute";
pub const ATTR_ASYNC_ITERATOR_STATE_MACHINE: &str =
    "System.Runtime.CompilerServices.AsyncIteratorStateMachineAttribute";

// Compiler-generated state-machine fields
pub const FIELD_STATE: &str = "<>1__state";
pub const FIELD_BUILDER: &str = "<>t__builder";
pub const FIELD_CURRENT: &str = "<>2__current";
pub const FIELD_PROMISE: &str = "<>v__promiseOfValueOrEnd";
/// Captured `this` of an instance state machine.
pub const FIELD_THIS: &str = "<>4__this";
/// Enumerable machines keep each parameter in `<>3__name` and copy it into `name` per enumerator.
pub const PARAMETER_COPY_PREFIX: &str = "<>3__";

// Fields added by the weaver
pub const FIELD_MOS: &str = "<>w__mos";
pub const FIELD_CONTEXT: &str = "<>w__context";
pub const FIELD_ITEMS: &str = "<>w__items";

pub const METHOD_MOVE_NEXT: &str = "MoveNext";
pub const METHOD_CREATE: &str = "Create";
pub const METHOD_SET_RESULT: &str = "SetResult";
pub const METHOD_SET_EXCEPTION: &str = "SetException";

// Builder types whose Create/SetResult/SetException calls anchor async weaving
pub const TYPE_ASYNC_TASK_METHOD_BUILDER: &str = "System.Runtime.CompilerServices.AsyncTaskMethodBuilder";
pub const TYPE_ASYNC_VALUE_TASK_METHOD_BUILDER: &str =
    "System.Runtime.CompilerServices.AsyncValueTaskMethodBuilder";
pub const TYPE_ASYNC_VOID_METHOD_BUILDER: &str = "System.Runtime.CompilerServices.AsyncVoidMethodBuilder";
pub const TYPE_ASYNC_ITERATOR_METHOD_BUILDER: &str =
    "System.Runtime.CompilerServices.AsyncIteratorMethodBuilder";
pub const TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE: &str =
    "System.Threading.Tasks.Sources.ManualResetValueTaskSourceCore";

pub const ASYNC_BUILDER_PREFIXES: &[&str] = &[
    TYPE_ASYNC_TASK_METHOD_BUILDER,
    TYPE_ASYNC_VALUE_TASK_METHOD_BUILDER,
    TYPE_ASYNC_VOID_METHOD_BUILDER,
];

pub const TYPE_TASK: &str = "System.Threading.Tasks.Task";

// Runtime surface referenced by generated code
pub const TYPE_SYSTEM_TYPE: &str = "System.Type";
pub const TYPE_METHOD_BASE: &str = "System.Reflection.MethodBase";
pub const TYPE_EXCEPTION: &str = "System.Exception";
pub const TYPE_OBJECT_LIST: &str = "System.Collections.Generic.List`1";
pub const TYPE_IMO: &str = "Rougamo.IMo";
pub const TYPE_METHOD_CONTEXT: &str = "Rougamo.Context.MethodContext";

pub const HOOK_ON_ENTRY: &str = "OnEntry";
pub const HOOK_ON_EXCEPTION: &str = "OnException";
pub const HOOK_ON_SUCCESS: &str = "OnSuccess";
pub const HOOK_ON_EXIT: &str = "OnExit";

// Suffix of the private method holding a synchronous method's original logic
pub const SHADOW_SUFFIX: &str = "$Actual";
