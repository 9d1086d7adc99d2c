// Shared fixtures: a module holding one target of every shape, compiled the way a C#
// compiler lowers them, plus a recording interceptor for the interpreter.
#![allow(dead_code)]

use ilweave::common::consts::{
    ATTR_ASYNC_ITERATOR_STATE_MACHINE, ATTR_ASYNC_STATE_MACHINE, ATTR_ITERATOR_STATE_MACHINE, CTOR, FIELD_BUILDER,
    FIELD_CURRENT, FIELD_PROMISE, FIELD_STATE, HOOK_ON_ENTRY, HOOK_ON_EXCEPTION, HOOK_ON_EXIT, HOOK_ON_SUCCESS,
    TYPE_ASYNC_ITERATOR_METHOD_BUILDER, TYPE_ASYNC_TASK_METHOD_BUILDER, TYPE_EXCEPTION, TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE,
    PARAMETER_COPY_PREFIX, TYPE_METHOD_CONTEXT, TYPE_TASK,
};
use ilweave::consts::STATE_FINISHED;
use ilweave::il::{
    AttrArg, CustomAttribute, ExceptionHandler, FieldDef, FieldRef, HandlerKind, InstrId, Instruction, MethodBody,
    MethodDef, MethodRef, Module, Op, ParamDef, TypeDef, TypeSig,
};
use ilweave::rt::value::{shared, Object};
use ilweave::rt::{Interceptor, MethodContext, Value, Vm};
use ilweave::weave::{resolve_targets, weave_module, InterceptorSpec, TargetRequest, WeaveReport};
use ilweave::Config;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

pub const SERVICE: &str = "App.Service";
pub const HOST: &str = "App.Host";
/// Implements every hook.
pub const TRACE: &str = "App.TraceAttribute";
/// Implements `OnEntry` only.
pub const ENTRY_ONLY: &str = "App.EntryAttribute";

pub const FETCH_SM: &str = "App.Service+<FetchAsync>d__1";
pub const FIRE_SM: &str = "App.Service+<FireAsync>d__2";
pub const COUNT_SM: &str = "App.Service+<Count>d__3";
pub const STREAM_SM: &str = "App.Service+<StreamAsync>d__4";
pub const NUMBERS_SM: &str = "App.Service+<Numbers>d__5";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Appends instructions to a body; labels are unlinked nodes placed later.
pub struct Il {
    pub body: MethodBody,
}

impl Il {
    pub fn new(variables: Vec<TypeSig>) -> Self {
        let mut body = MethodBody::new();
        body.variables = variables;
        Self { body }
    }

    pub fn emit(&mut self, instr: Instruction) -> InstrId {
        self.body.instructions.push(instr)
    }

    pub fn op(&mut self, op: Op) -> InstrId {
        self.emit(Instruction::new(op))
    }

    /// An instruction to be placed later, usually a branch target.
    pub fn mark(&mut self, instr: Instruction) -> InstrId {
        self.body.instructions.alloc(instr)
    }

    pub fn label(&mut self) -> InstrId {
        self.mark(Instruction::nop())
    }

    pub fn place(&mut self, id: InstrId) -> InstrId {
        self.body.instructions.link_back(id);
        id
    }

    pub fn branch(&mut self, op: Op, target: InstrId) -> InstrId {
        self.emit(Instruction::branch(op, target))
    }

    pub fn catch(&mut self, try_start: InstrId, handler_start: InstrId, handler_end: InstrId) {
        self.body.handlers.push(ExceptionHandler {
            kind: HandlerKind::Catch(TypeSig::class(TYPE_EXCEPTION)),
            try_start,
            try_end: handler_start,
            handler_start,
            handler_end: Some(handler_end),
        });
    }

    pub fn finish(self) -> MethodBody {
        self.body
    }
}

fn method(name: &str, params: Vec<ParamDef>, ret: TypeSig, is_static: bool, body: MethodBody) -> MethodDef {
    let mut method = MethodDef::new(name, params, ret);
    method.is_static = is_static;
    method.body = Some(body);
    method
}

fn host(name: &str, params: Vec<TypeSig>, ret: TypeSig) -> MethodRef {
    MethodRef::static_method(TypeSig::class(HOST), name, params, ret)
}

fn field(declaring: &str, name: &str, ty: TypeSig) -> FieldRef {
    FieldRef::new(TypeSig::class(declaring), name, ty)
}

fn context_param() -> ParamDef {
    ParamDef::new("context", TypeSig::class(TYPE_METHOD_CONTEXT))
}

/// An interceptor type overriding `hooks`, with a default and a named constructor and a
/// `Name` property.
pub fn interceptor_type(name: &str, hooks: &[&str]) -> TypeDef {
    let mut ty = TypeDef::new(name, Some("Rougamo.MoAttribute"));
    ty.methods.push(MethodDef::new(CTOR, vec![], TypeSig::Void));
    ty.methods.push(MethodDef::new(CTOR, vec![ParamDef::new("name", TypeSig::String)], TypeSig::Void));
    ty.methods.push(MethodDef::new("set_Name", vec![ParamDef::new("value", TypeSig::String)], TypeSig::Void));
    for hook in hooks {
        ty.methods.push(MethodDef::new(*hook, vec![context_param()], TypeSig::Void));
    }
    ty
}

/// One target of every shape on `App.Service`, plus the interceptor types.
pub fn fixture() -> Module {
    let mut module = Module::new("App");
    module.types.push(interceptor_type(
        TRACE,
        &[HOOK_ON_ENTRY, HOOK_ON_EXCEPTION, HOOK_ON_SUCCESS, HOOK_ON_EXIT],
    ));
    module.types.push(interceptor_type(ENTRY_ONLY, &[HOOK_ON_ENTRY]));

    let mut service = TypeDef::new(SERVICE, Some("System.Object"));
    service.methods.push(add_method());
    service.methods.push(fill_method());
    service.methods.push(noop_method());
    service.methods.push(notify_method());
    module.types.push(service);

    add_async_task(&mut module, "FetchAsync", FETCH_SM, true);
    add_async_task(&mut module, "FireAsync", FIRE_SM, false);
    add_iterator(&mut module, "Count", COUNT_SM, false);
    add_iterator(&mut module, "Numbers", NUMBERS_SM, true);
    add_async_iterator(&mut module);
    module
}

/// `int Add(int a, int b) => Host.Add(a, b);`
fn add_method() -> MethodDef {
    let mut il = Il::new(vec![]);
    il.emit(Instruction::ldarg(1));
    il.emit(Instruction::ldarg(2));
    il.emit(Instruction::call(host("Add", vec![TypeSig::Int32, TypeSig::Int32], TypeSig::Int32)));
    il.op(Op::Ret);
    let params = vec![ParamDef::new("a", TypeSig::Int32), ParamDef::new("b", TypeSig::Int32)];
    method("Add", params, TypeSig::Int32, false, il.finish())
}

/// `void Fill(ref int value) { value = Host.Next(value); }`
fn fill_method() -> MethodDef {
    let mut il = Il::new(vec![]);
    il.emit(Instruction::ldarg(1));
    il.emit(Instruction::ldarg(1));
    il.emit(Instruction::typed(Op::Ldobj, TypeSig::Int32));
    il.emit(Instruction::call(host("Next", vec![TypeSig::Int32], TypeSig::Int32)));
    il.emit(Instruction::typed(Op::Stobj, TypeSig::Int32));
    il.op(Op::Ret);
    let params = vec![ParamDef::new("value", TypeSig::by_ref(TypeSig::Int32))];
    method("Fill", params, TypeSig::Void, false, il.finish())
}

/// `void Noop() { }`
fn noop_method() -> MethodDef {
    let mut il = Il::new(vec![]);
    il.op(Op::Nop);
    il.op(Op::Ret);
    method("Noop", vec![], TypeSig::Void, false, il.finish())
}

/// `static void Notify(string message) => Host.Notify(message);`
fn notify_method() -> MethodDef {
    let mut il = Il::new(vec![]);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::call(host("Notify", vec![TypeSig::String], TypeSig::Void)));
    il.op(Op::Ret);
    let params = vec![ParamDef::new("message", TypeSig::String)];
    method("Notify", params, TypeSig::Void, true, il.finish())
}

fn add_to_service(module: &mut Module, method: MethodDef) {
    if let Some(index) = module.find_type(SERVICE) {
        module.types[index].methods.push(method);
    }
}

/// `static async Task<int> FetchAsync(int x) { await Task.Yield(); return Host.Compute(x); }`
/// or, when not `valued`, `static async Task FireAsync(int x) { await Task.Yield(); Host.Compute(x); }`.
fn add_async_task(module: &mut Module, name: &str, sm: &str, valued: bool) {
    let builder_base = if valued {
        format!("{}`1", TYPE_ASYNC_TASK_METHOD_BUILDER)
    } else {
        TYPE_ASYNC_TASK_METHOD_BUILDER.to_string()
    };
    let builder = if valued {
        TypeSig::generic(TypeSig::value_type(builder_base), vec![TypeSig::Int32])
    } else {
        TypeSig::value_type(builder_base)
    };
    let task = if valued {
        TypeSig::generic(TypeSig::class(format!("{}`1", TYPE_TASK)), vec![TypeSig::Int32])
    } else {
        TypeSig::class(TYPE_TASK)
    };
    let sm_sig = TypeSig::class(sm);
    let awaitable = TypeSig::value_type("System.Runtime.CompilerServices.YieldAwaitable");
    let awaiter = TypeSig::value_type("System.Runtime.CompilerServices.YieldAwaitable/YieldAwaiter");

    let state = field(sm, FIELD_STATE, TypeSig::Int32);
    let builder_field = field(sm, FIELD_BUILDER, builder.clone());
    let x = field(sm, "x", TypeSig::Int32);
    let awaiter_field = field(sm, "<>u__1", awaiter.clone());

    // stub
    let mut il = Il::new(vec![sm_sig.clone()]);
    il.emit(Instruction::newobj(MethodRef::ctor(sm_sig.clone(), vec![])));
    il.emit(Instruction::stloc(0));
    il.emit(Instruction::ldloc(0));
    il.emit(Instruction::call(MethodRef::static_method(builder.clone(), "Create", vec![], builder.clone())));
    il.emit(Instruction::field(Op::Stfld, builder_field.clone()));
    il.emit(Instruction::ldloc(0));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Stfld, x.clone()));
    il.emit(Instruction::ldloc(0));
    il.emit(Instruction::ldc_i4(-1));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldloc(0));
    il.emit(Instruction::field(Op::Ldflda, builder_field.clone()));
    il.emit(Instruction::ldloca(0));
    il.emit(Instruction::call(MethodRef::instance(
        builder.clone(),
        "Start",
        vec![TypeSig::by_ref(sm_sig.clone())],
        TypeSig::Void,
    )));
    il.emit(Instruction::ldloc(0));
    il.emit(Instruction::field(Op::Ldflda, builder_field.clone()));
    il.emit(Instruction::call(MethodRef::instance(builder.clone(), "get_Task", vec![], task.clone())));
    il.op(Op::Ret);
    let mut stub = method(name, vec![ParamDef::new("x", TypeSig::Int32)], task, true, il.finish());
    stub.attributes.push(CustomAttribute::new(ATTR_ASYNC_STATE_MACHINE, vec![AttrArg::Type(sm.to_string())]));
    add_to_service(module, stub);

    // MoveNext; locals: num, result, awaitable, awaiter, exception
    let mut il = Il::new(vec![
        TypeSig::Int32,
        TypeSig::Int32,
        awaitable.clone(),
        awaiter.clone(),
        TypeSig::class(TYPE_EXCEPTION),
    ]);
    let resume = il.mark(Instruction::ldarg(0));
    let cont = il.mark(Instruction::ldloca(3));
    let handler = il.mark(Instruction::stloc(4));
    let completion = il.mark(Instruction::ldarg(0));
    let ret = il.mark(Instruction::new(Op::Ret));

    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, state.clone()));
    il.emit(Instruction::stloc(0));
    let try_start = il.emit(Instruction::ldloc(0));
    il.branch(Op::Brfalse, resume);
    il.emit(Instruction::call(MethodRef::static_method(
        TypeSig::class(TYPE_TASK),
        "Yield",
        vec![],
        awaitable.clone(),
    )));
    il.emit(Instruction::stloc(2));
    il.emit(Instruction::ldloca(2));
    il.emit(Instruction::call(MethodRef::instance(awaitable.clone(), "GetAwaiter", vec![], awaiter.clone())));
    il.emit(Instruction::stloc(3));
    il.emit(Instruction::ldloca(3));
    il.emit(Instruction::call(MethodRef::instance(awaiter.clone(), "get_IsCompleted", vec![], TypeSig::Bool)));
    il.branch(Op::Brtrue, cont);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(0));
    il.op(Op::Dup);
    il.emit(Instruction::stloc(0));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldloc(3));
    il.emit(Instruction::field(Op::Stfld, awaiter_field.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldflda, builder_field.clone()));
    il.emit(Instruction::ldloca(3));
    il.emit(Instruction::ldarga(0));
    il.emit(Instruction::call(MethodRef::instance(
        builder.clone(),
        "AwaitUnsafeOnCompleted",
        vec![TypeSig::by_ref(awaiter.clone()), TypeSig::by_ref(sm_sig.clone())],
        TypeSig::Void,
    )));
    il.branch(Op::Leave, ret);

    il.place(resume);
    il.emit(Instruction::field(Op::Ldfld, awaiter_field.clone()));
    il.emit(Instruction::stloc(3));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(-1));
    il.op(Op::Dup);
    il.emit(Instruction::stloc(0));
    il.emit(Instruction::field(Op::Stfld, state.clone()));

    il.place(cont);
    il.emit(Instruction::call(MethodRef::instance(awaiter, "GetResult", vec![], TypeSig::Void)));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, x.clone()));
    il.emit(Instruction::call(host("Compute", vec![TypeSig::Int32], TypeSig::Int32)));
    if valued {
        il.emit(Instruction::stloc(1));
    } else {
        il.op(Op::Pop);
    }
    il.branch(Op::Leave, completion);

    il.place(handler);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(-2));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldflda, builder_field.clone()));
    il.emit(Instruction::ldloc(4));
    il.emit(Instruction::call(MethodRef::instance(
        builder.clone(),
        "SetException",
        vec![TypeSig::class(TYPE_EXCEPTION)],
        TypeSig::Void,
    )));
    il.branch(Op::Leave, ret);

    il.place(completion);
    il.emit(Instruction::ldc_i4(-2));
    il.emit(Instruction::field(Op::Stfld, state));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldflda, builder_field.clone()));
    let set_result_params = if valued {
        il.emit(Instruction::ldloc(1));
        vec![TypeSig::generic_param("TResult")]
    } else {
        vec![]
    };
    il.emit(Instruction::call(MethodRef::instance(builder, "SetResult", set_result_params, TypeSig::Void)));
    il.place(ret);
    il.catch(try_start, handler, completion);

    let mut ty = TypeDef::new(sm, Some("System.Object"));
    ty.fields.push(FieldDef::new(FIELD_STATE, TypeSig::Int32));
    ty.fields.push(FieldDef::new(FIELD_BUILDER, builder_field.field_type));
    ty.fields.push(FieldDef::new("x", TypeSig::Int32));
    ty.fields.push(FieldDef::new("<>u__1", awaiter_field.field_type));
    ty.methods.push(MethodDef::new(CTOR, vec![], TypeSig::Void));
    ty.methods.push(method("MoveNext", vec![], TypeSig::Void, false, il.finish()));
    module.types.push(ty);
}

/// `static IEnumerator<int> Count(int n) { for (var i = 0; i < n; i++) yield return Host.Item(i); }`,
/// or with `enumerable` the same loop as `static IEnumerable<int> Numbers(int n)`, whose stub
/// keeps `n` in `<>3__n` and hands it to each enumerator from `GetEnumerator`.
fn add_iterator(module: &mut Module, name: &str, sm: &str, enumerable: bool) {
    let sm_sig = TypeSig::class(sm);
    let state = field(sm, FIELD_STATE, TypeSig::Int32);
    let current = field(sm, FIELD_CURRENT, TypeSig::Int32);
    let n = field(sm, "n", TypeSig::Int32);
    let n_copy = field(sm, &format!("{}n", PARAMETER_COPY_PREFIX), TypeSig::Int32);
    let i = field(sm, "<i>5__1", TypeSig::Int32);
    let ctor_ref = MethodRef::ctor(sm_sig.clone(), vec![TypeSig::Int32]);

    // stub
    let mut il = Il::new(vec![]);
    il.emit(Instruction::ldc_i4(if enumerable { STATE_FINISHED } else { 0 }));
    il.emit(Instruction::newobj(ctor_ref.clone()));
    il.op(Op::Dup);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Stfld, if enumerable { n_copy.clone() } else { n.clone() }));
    il.op(Op::Ret);
    let returned = TypeSig::generic(
        TypeSig::class(if enumerable {
            "System.Collections.Generic.IEnumerable`1"
        } else {
            "System.Collections.Generic.IEnumerator`1"
        }),
        vec![TypeSig::Int32],
    );
    let mut stub = method(name, vec![ParamDef::new("n", TypeSig::Int32)], returned, true, il.finish());
    stub.attributes.push(CustomAttribute::new(ATTR_ITERATOR_STATE_MACHINE, vec![AttrArg::Type(sm.to_string())]));
    add_to_service(module, stub);

    // .ctor(int state)
    let mut il = Il::new(vec![]);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldarg(1));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.op(Op::Ret);
    let ctor = method(CTOR, vec![ParamDef::new("state", TypeSig::Int32)], TypeSig::Void, false, il.finish());

    // MoveNext
    let mut il = Il::new(vec![TypeSig::Int32]);
    let start = il.mark(Instruction::ldarg(0));
    let body = il.mark(Instruction::ldarg(0));
    let resume = il.mark(Instruction::ldarg(0));
    let cond = il.mark(Instruction::ldarg(0));

    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, state.clone()));
    il.emit(Instruction::stloc(0));
    il.emit(Instruction::ldloc(0));
    il.branch(Op::Brfalse, start);
    il.emit(Instruction::ldloc(0));
    il.emit(Instruction::ldc_i4(1));
    il.branch(Op::Beq, resume);
    il.emit(Instruction::ldc_i4(0));
    il.op(Op::Ret);

    il.place(start);
    il.emit(Instruction::ldc_i4(-1));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(0));
    il.emit(Instruction::field(Op::Stfld, i.clone()));
    il.branch(Op::Br, cond);

    il.place(body);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, i.clone()));
    il.emit(Instruction::call(host("Item", vec![TypeSig::Int32], TypeSig::Int32)));
    il.emit(Instruction::field(Op::Stfld, current));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(1));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldc_i4(1));
    il.op(Op::Ret);

    il.place(resume);
    il.emit(Instruction::ldc_i4(-1));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, i.clone()));
    il.emit(Instruction::ldc_i4(1));
    il.op(Op::Add);
    il.emit(Instruction::field(Op::Stfld, i.clone()));

    il.place(cond);
    il.emit(Instruction::field(Op::Ldfld, i));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, n.clone()));
    il.branch(Op::Blt, body);
    il.emit(Instruction::ldc_i4(0));
    il.op(Op::Ret);

    let mut ty = TypeDef::new(sm, Some("System.Object"));
    ty.fields.push(FieldDef::new(FIELD_STATE, TypeSig::Int32));
    ty.fields.push(FieldDef::new(FIELD_CURRENT, TypeSig::Int32));
    ty.fields.push(FieldDef::new("n", TypeSig::Int32));
    ty.fields.push(FieldDef::new("<i>5__1", TypeSig::Int32));
    ty.methods.push(ctor);
    ty.methods.push(method("MoveNext", vec![], TypeSig::Bool, false, il.finish()));
    if enumerable {
        ty.fields.push(FieldDef::new(&n_copy.name, TypeSig::Int32));
        ty.methods.push(get_enumerator(sm, &state, &n, &n_copy, ctor_ref));
    }
    module.types.push(ty);
}

/// `GetEnumerator`: the first call takes over the instance the stub returned, later calls
/// get a fresh one. Both receive the parameter from its `<>3__` copy. The thread check
/// of real compiler output is left out.
fn get_enumerator(sm: &str, state: &FieldRef, n: &FieldRef, n_copy: &FieldRef, ctor: MethodRef) -> MethodDef {
    let mut il = Il::new(vec![TypeSig::class(sm)]);
    let fresh = il.mark(Instruction::ldc_i4(0));
    let copy = il.mark(Instruction::ldloc(0));

    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, state.clone()));
    il.emit(Instruction::ldc_i4(STATE_FINISHED));
    il.branch(Op::BneUn, fresh);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(0));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::stloc(0));
    il.branch(Op::Br, copy);

    il.place(fresh);
    il.emit(Instruction::newobj(ctor));
    il.emit(Instruction::stloc(0));

    il.place(copy);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, n_copy.clone()));
    il.emit(Instruction::field(Op::Stfld, n.clone()));
    il.emit(Instruction::ldloc(0));
    il.op(Op::Ret);

    let enumerator = TypeSig::generic(
        TypeSig::class("System.Collections.Generic.IEnumerator`1"),
        vec![TypeSig::Int32],
    );
    method("GetEnumerator", vec![], enumerator, false, il.finish())
}

/// `static async IAsyncEnumerable<int> StreamAsync(int n) { for (var i = 0; i < n; i++) yield return Host.Item(i); }`
fn add_async_iterator(module: &mut Module) {
    let sm = STREAM_SM;
    let sm_sig = TypeSig::class(sm);
    let promise_type = TypeSig::generic(
        TypeSig::value_type(format!("{}`1", TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE)),
        vec![TypeSig::Bool],
    );
    let builder = TypeSig::value_type(TYPE_ASYNC_ITERATOR_METHOD_BUILDER);
    let state = field(sm, FIELD_STATE, TypeSig::Int32);
    let current = field(sm, FIELD_CURRENT, TypeSig::Int32);
    let promise = field(sm, FIELD_PROMISE, promise_type.clone());
    let builder_field = field(sm, FIELD_BUILDER, builder.clone());
    let n = field(sm, "n", TypeSig::Int32);
    let i = field(sm, "<i>5__1", TypeSig::Int32);
    let set_result = MethodRef::instance(
        promise_type.clone(),
        "SetResult",
        vec![TypeSig::generic_param("TResult")],
        TypeSig::Void,
    );

    // stub
    let mut il = Il::new(vec![]);
    il.emit(Instruction::ldc_i4(-3));
    il.emit(Instruction::newobj(MethodRef::ctor(sm_sig.clone(), vec![TypeSig::Int32])));
    il.op(Op::Dup);
    il.emit(Instruction::call(MethodRef::static_method(builder.clone(), "Create", vec![], builder.clone())));
    il.emit(Instruction::field(Op::Stfld, builder_field));
    il.op(Op::Dup);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Stfld, n.clone()));
    il.op(Op::Ret);
    let enumerable = TypeSig::generic(
        TypeSig::class("System.Collections.Generic.IAsyncEnumerable`1"),
        vec![TypeSig::Int32],
    );
    let mut stub = method("StreamAsync", vec![ParamDef::new("n", TypeSig::Int32)], enumerable, true, il.finish());
    stub.attributes.push(CustomAttribute::new(
        ATTR_ASYNC_ITERATOR_STATE_MACHINE,
        vec![AttrArg::Type(sm.to_string())],
    ));
    add_to_service(module, stub);

    // .ctor(int state)
    let mut il = Il::new(vec![]);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldarg(1));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.op(Op::Ret);
    let ctor = method(CTOR, vec![ParamDef::new("state", TypeSig::Int32)], TypeSig::Void, false, il.finish());

    // MoveNext; locals: num, exception
    let mut il = Il::new(vec![TypeSig::Int32, TypeSig::class(TYPE_EXCEPTION)]);
    let resume = il.mark(Instruction::ldarg(0));
    let body = il.mark(Instruction::ldarg(0));
    let cond = il.mark(Instruction::ldarg(0));
    let handler = il.mark(Instruction::stloc(1));
    let end = il.mark(Instruction::ldarg(0));
    let yielded = il.mark(Instruction::ldarg(0));
    let ret = il.mark(Instruction::new(Op::Ret));

    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, state.clone()));
    il.emit(Instruction::stloc(0));
    let try_start = il.emit(Instruction::ldloc(0));
    il.emit(Instruction::ldc_i4(-4));
    il.branch(Op::Beq, resume);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(-1));
    il.op(Op::Dup);
    il.emit(Instruction::stloc(0));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(0));
    il.emit(Instruction::field(Op::Stfld, i.clone()));
    il.branch(Op::Br, cond);

    il.place(body);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, i.clone()));
    il.emit(Instruction::call(host("Item", vec![TypeSig::Int32], TypeSig::Int32)));
    il.emit(Instruction::field(Op::Stfld, current.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(-4));
    il.op(Op::Dup);
    il.emit(Instruction::stloc(0));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.branch(Op::Leave, yielded);

    il.place(resume);
    il.emit(Instruction::ldc_i4(-1));
    il.op(Op::Dup);
    il.emit(Instruction::stloc(0));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, i.clone()));
    il.emit(Instruction::ldc_i4(1));
    il.op(Op::Add);
    il.emit(Instruction::field(Op::Stfld, i.clone()));

    il.place(cond);
    il.emit(Instruction::field(Op::Ldfld, i));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldfld, n));
    il.branch(Op::Blt, body);
    il.branch(Op::Leave, end);

    il.place(handler);
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(-2));
    il.emit(Instruction::field(Op::Stfld, state.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(0));
    il.emit(Instruction::field(Op::Stfld, current.clone()));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldflda, promise.clone()));
    il.emit(Instruction::ldloc(1));
    il.emit(Instruction::call(MethodRef::instance(
        promise_type.clone(),
        "SetException",
        vec![TypeSig::class(TYPE_EXCEPTION)],
        TypeSig::Void,
    )));
    il.branch(Op::Leave, ret);

    il.place(end);
    il.emit(Instruction::ldc_i4(-2));
    il.emit(Instruction::field(Op::Stfld, state));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::ldc_i4(0));
    il.emit(Instruction::field(Op::Stfld, current));
    il.emit(Instruction::ldarg(0));
    il.emit(Instruction::field(Op::Ldflda, promise.clone()));
    il.emit(Instruction::ldc_i4(0));
    il.emit(Instruction::call(set_result.clone()));
    il.op(Op::Ret);

    il.place(yielded);
    il.emit(Instruction::field(Op::Ldflda, promise));
    il.emit(Instruction::ldc_i4(1));
    il.emit(Instruction::call(set_result));
    il.place(ret);
    il.catch(try_start, handler, end);

    let mut ty = TypeDef::new(sm, Some("System.Object"));
    ty.fields.push(FieldDef::new(FIELD_STATE, TypeSig::Int32));
    ty.fields.push(FieldDef::new(FIELD_CURRENT, TypeSig::Int32));
    ty.fields.push(FieldDef::new(FIELD_PROMISE, promise_type));
    ty.fields.push(FieldDef::new(FIELD_BUILDER, builder));
    ty.fields.push(FieldDef::new("n", TypeSig::Int32));
    ty.fields.push(FieldDef::new("<i>5__1", TypeSig::Int32));
    ty.methods.push(ctor);
    ty.methods.push(method("MoveNext", vec![], TypeSig::Void, false, il.finish()));
    module.types.push(ty);
}

/// Bind `specs` to `Service::method` and weave the module.
pub fn weave(
    module: &mut Module,
    method: &str,
    specs: Vec<InterceptorSpec>,
    config: &Config,
) -> ilweave::Result<WeaveReport> {
    let request = TargetRequest { type_name: SERVICE.to_string(), method: method.to_string(), interceptors: specs };
    let targets = resolve_targets(module, &[request])?;
    weave_module(module, &targets, config)
}

pub fn trace(name: &str) -> InterceptorSpec {
    InterceptorSpec::new(TRACE).with_ctor_args(vec![AttrArg::String(name.to_string())])
}

pub fn entry_only(name: &str) -> InterceptorSpec {
    InterceptorSpec::new(ENTRY_ONLY).with_ctor_args(vec![AttrArg::String(name.to_string())])
}

/// A fresh `App.Service` instance.
pub fn service() -> Value {
    Value::Object(shared(Object { class: SERVICE.to_string(), fields: HashMap::new() }))
}

pub type Log = Rc<RefCell<Vec<String>>>;

/// What a recording interceptor does besides logging.
#[derive(Clone, Default)]
pub struct Behaviour {
    /// Replace the return value in `OnEntry`.
    pub replace_on_entry: Option<Value>,
    /// Handle any exception with this value.
    pub handle_with: Option<Value>,
    /// Ask for this many retries from `OnException`.
    pub exception_retries: u32,
    /// Ask for this many retries from `OnSuccess`.
    pub success_retries: u32,
    /// Replace the return value in `OnSuccess`.
    pub replace_on_success: Option<Value>,
    /// Overwrite an argument in `OnEntry` and request a rewrite.
    pub rewrite: Option<(usize, Value)>,
    /// Mark the exception handled from `OnExit`, after the outcome is decided.
    pub handle_on_exit: bool,
}

pub struct Recorder {
    name: String,
    log: Log,
    behaviour: Behaviour,
    exception_retries: u32,
    success_retries: u32,
}

impl Recorder {
    fn record(&self, event: &str) {
        self.log.borrow_mut().push(format!("{}:{}", self.name, event));
    }
}

impl Interceptor for Recorder {
    fn on_entry(&mut self, context: &mut MethodContext) {
        self.record("entry");
        if let Some(value) = &self.behaviour.replace_on_entry {
            context.set_return_value(value.clone());
        }
        if let Some((index, value)) = &self.behaviour.rewrite {
            context.set_argument(*index, value.clone());
            context.rewrite_arguments = true;
        }
    }

    fn on_exception(&mut self, context: &mut MethodContext) {
        let message = context
            .exception
            .as_ref()
            .and_then(Value::exception_data)
            .map(|e| e.message.clone())
            .unwrap_or_default();
        self.record(&format!("exception({})", message));
        if self.exception_retries > 0 {
            self.exception_retries -= 1;
            context.retry_count = 1;
            return;
        }
        if let Some(value) = &self.behaviour.handle_with {
            context.handle_exception(value.clone());
        }
    }

    fn on_success(&mut self, context: &mut MethodContext) {
        self.record("success");
        if self.success_retries > 0 {
            self.success_retries -= 1;
            context.retry_count = 1;
            return;
        }
        if let Some(value) = &self.behaviour.replace_on_success {
            context.set_return_value(value.clone());
        }
    }

    fn on_exit(&mut self, context: &mut MethodContext) {
        self.record("exit");
        if self.behaviour.handle_on_exit {
            context.exception_handled = true;
        }
    }

    fn set_property(&mut self, name: &str, value: Value) -> bool {
        match (name, value.as_str()) {
            ("Name", Some(text)) => {
                self.name = text.to_string();
                true
            }
            _ => false,
        }
    }
}

/// Make `newobj type_name` build a recorder named by its constructor argument, or
/// `default_name` when constructed without one.
pub fn register(vm: &mut Vm, type_name: &str, default_name: &str, log: &Log, behaviour: Behaviour) {
    let log = log.clone();
    let default_name = default_name.to_string();
    vm.register_interceptor(type_name, move |args: &[Value]| {
        let name = args.first().and_then(Value::as_str).unwrap_or(default_name.as_str()).to_string();
        Box::new(Recorder {
            name,
            log: log.clone(),
            exception_retries: behaviour.exception_retries,
            success_retries: behaviour.success_retries,
            behaviour: behaviour.clone(),
        }) as Box<dyn Interceptor>
    });
}

/// Counts host calls; each call returns what `respond` makes of the call index and arguments.
pub fn register_host(
    vm: &mut Vm,
    name: &str,
    respond: impl Fn(u32, &[Value]) -> Result<Option<Value>, Value> + 'static,
) -> Rc<Cell<u32>> {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    vm.register_native(format!("{}::{}", HOST, name), move |args: &[Value]| {
        let index = counter.get();
        counter.set(index + 1);
        respond(index, args)
    });
    calls
}

pub fn boom(message: &str) -> Value {
    Value::exception("System.InvalidOperationException", message)
}

pub fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn events(log: &Log) -> Vec<String> {
    log.borrow().clone()
}
