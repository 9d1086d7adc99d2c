mod common;

use common::*;
use ilweave::common::consts::{FIELD_CURRENT, FIELD_ITEMS, FIELD_PROMISE};
use ilweave::rt::{Interceptor, MethodContext, Outcome, Value, Vm};
use ilweave::weave::MethodShape;
use ilweave::Config;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn woven(method: &str, behaviour: Behaviour, config: &Config) -> (Vm, Log) {
    init_logger();
    let mut module = fixture();
    weave(&mut module, method, vec![trace("a")], config).unwrap();
    let log = new_log();
    let mut vm = Vm::new(module);
    register(&mut vm, TRACE, "trace", &log, behaviour);
    (vm, log)
}

/// `Item(i) = i * 10`
fn tens(vm: &mut Vm) -> Rc<Cell<u32>> {
    register_host(vm, "Item", |_, args| Ok(Some(Value::I32(args[0].as_i32().unwrap() * 10))))
}

/// `Item(i) = i * 10`, failing on the listed call indexes.
fn tens_failing_at(vm: &mut Vm, failing: &'static [u32]) -> Rc<Cell<u32>> {
    register_host(vm, "Item", move |index, args| {
        if failing.contains(&index) {
            Err(boom("broken"))
        } else {
            Ok(Some(Value::I32(args[0].as_i32().unwrap() * 10)))
        }
    })
}

fn ints(values: &[i32]) -> Vec<Value> {
    values.iter().map(|v| Value::I32(*v)).collect()
}

fn start(vm: &mut Vm, method: &str, n: i32) -> Value {
    let outcome = vm.call(SERVICE, method, vec![Value::I32(n)]).unwrap();
    outcome.value().cloned().unwrap()
}

fn enumerator_of(vm: &mut Vm, enumerable: &Value) -> Value {
    let outcome = vm.call_virtual(enumerable, "GetEnumerator", vec![]).unwrap();
    outcome.value().cloned().unwrap()
}

/// `method` woven with an entry-only interceptor `e` ahead of a tracing interceptor `a`.
fn woven_behind_entry_only(method: &str, behaviour: Behaviour) -> (Vm, Log) {
    init_logger();
    let mut module = fixture();
    weave(&mut module, method, vec![entry_only("e"), trace("a")], &Config::default()).unwrap();
    let log = new_log();
    let mut vm = Vm::new(module);
    register(&mut vm, ENTRY_ONLY, "entry", &log, Behaviour::default());
    register(&mut vm, TRACE, "trace", &log, behaviour);
    (vm, log)
}

type Exits = Rc<RefCell<Vec<(bool, bool, Value, Vec<Value>)>>>;

/// Records what `OnExit` sees.
struct ExitWatcher(Exits);

impl Interceptor for ExitWatcher {
    fn on_exit(&mut self, context: &mut MethodContext) {
        self.0.borrow_mut().push((
            context.is_async,
            context.is_iterator,
            context.return_value().clone(),
            context.arguments(),
        ));
    }
}

fn watched(method: &str, config: &Config) -> (Vm, Exits) {
    init_logger();
    let mut module = fixture();
    weave(&mut module, method, vec![trace("a")], config).unwrap();
    let mut vm = Vm::new(module);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    vm.register_interceptor(TRACE, move |_: &[Value]| Box::new(ExitWatcher(sink.clone())) as Box<dyn Interceptor>);
    tens(&mut vm);
    (vm, seen)
}

#[test]
fn iterator_reports_once_per_enumeration() {
    let (mut vm, log) = woven("Count", Behaviour::default(), &Config::default());
    tens(&mut vm);

    let enumerator = start(&mut vm, "Count", 3);
    assert!(events(&log).is_empty());

    let (items, outcome) = vm.drain_enumerator(&enumerator).unwrap();
    assert_eq!(items, ints(&[0, 10, 20]));
    assert_eq!(outcome, Outcome::Returned(Some(Value::I32(0))));
    assert_eq!(events(&log), vec!["a:entry", "a:success", "a:exit"]);
    assert_eq!(vm.stats().contexts_created, 1);
}

#[test]
fn finished_iterator_does_not_report_again() {
    let (mut vm, log) = woven("Count", Behaviour::default(), &Config::default());
    tens(&mut vm);

    let enumerator = start(&mut vm, "Count", 1);
    vm.drain_enumerator(&enumerator).unwrap();
    let outcome = vm.call_virtual(&enumerator, "MoveNext", vec![]).unwrap();
    assert_eq!(outcome, Outcome::Returned(Some(Value::I32(0))));
    assert_eq!(events(&log), vec!["a:entry", "a:success", "a:exit"]);
    assert_eq!(vm.field(&enumerator, ilweave::common::consts::FIELD_CONTEXT), Some(Value::Null));
}

#[test]
fn empty_sequence_still_reports() {
    let (mut vm, log) = woven("Count", Behaviour::default(), &Config::default());
    let calls = tens(&mut vm);

    let enumerator = start(&mut vm, "Count", 0);
    let (items, _) = vm.drain_enumerator(&enumerator).unwrap();
    assert!(items.is_empty());
    assert_eq!(calls.get(), 0);
    assert_eq!(events(&log), vec!["a:entry", "a:success", "a:exit"]);
}

#[test]
fn iterator_exception_propagates_from_move_next() {
    let (mut vm, log) = woven("Count", Behaviour::default(), &Config::default());
    tens_failing_at(&mut vm, &[1]);

    let enumerator = start(&mut vm, "Count", 3);
    let (items, outcome) = vm.drain_enumerator(&enumerator).unwrap();
    assert_eq!(items, ints(&[0]));
    let message = outcome.exception().and_then(Value::exception_data).map(|e| e.message.clone());
    assert_eq!(message.as_deref(), Some("broken"));
    assert_eq!(events(&log), vec!["a:entry", "a:exception(broken)", "a:exit"]);
}

#[test]
fn handled_iterator_exception_ends_the_sequence() {
    let behaviour = Behaviour { handle_with: Some(Value::Null), ..Behaviour::default() };
    let (mut vm, log) = woven("Count", behaviour, &Config::default());
    tens_failing_at(&mut vm, &[2]);

    let enumerator = start(&mut vm, "Count", 5);
    let (items, outcome) = vm.drain_enumerator(&enumerator).unwrap();
    assert_eq!(items, ints(&[0, 10]));
    assert_eq!(outcome, Outcome::Returned(Some(Value::I32(0))));
    assert_eq!(events(&log), vec!["a:entry", "a:exception(broken)", "a:exit"]);
}

#[test]
fn iterator_retry_restarts_the_sequence() {
    let behaviour = Behaviour { exception_retries: 1, ..Behaviour::default() };
    let (mut vm, log) = woven("Count", behaviour, &Config::default());
    let calls = tens_failing_at(&mut vm, &[0]);

    let enumerator = start(&mut vm, "Count", 2);
    let (items, _) = vm.drain_enumerator(&enumerator).unwrap();
    assert_eq!(items, ints(&[0, 10]));
    assert_eq!(calls.get(), 3);
    assert_eq!(events(&log), vec!["a:entry", "a:exception(broken)", "a:success", "a:exit"]);
}

#[test]
fn iterator_exception_propagates_once_retries_run_out() {
    let behaviour = Behaviour { exception_retries: 1, ..Behaviour::default() };
    let (mut vm, log) = woven("Count", behaviour, &Config::default());
    let calls = tens_failing_at(&mut vm, &[0, 1]);

    let enumerator = start(&mut vm, "Count", 2);
    let (items, outcome) = vm.drain_enumerator(&enumerator).unwrap();
    assert!(items.is_empty());
    let message = outcome.exception().and_then(Value::exception_data).map(|e| e.message.clone());
    assert_eq!(message.as_deref(), Some("broken"));
    assert_eq!(calls.get(), 2);
    assert_eq!(
        events(&log),
        vec!["a:entry", "a:exception(broken)", "a:exception(broken)", "a:exit"]
    );
}

#[test]
fn entry_only_interceptor_fires_once_across_an_iterator_retry() {
    let behaviour = Behaviour { exception_retries: 1, ..Behaviour::default() };
    let (mut vm, log) = woven_behind_entry_only("Count", behaviour);
    let calls = tens_failing_at(&mut vm, &[0]);

    let enumerator = start(&mut vm, "Count", 2);
    assert!(events(&log).is_empty());
    let (items, _) = vm.drain_enumerator(&enumerator).unwrap();
    assert_eq!(items, ints(&[0, 10]));
    assert_eq!(calls.get(), 3);
    assert_eq!(
        events(&log),
        vec!["e:entry", "a:entry", "a:exception(broken)", "a:success", "a:exit"]
    );
}

#[test]
fn enumerable_reports_for_every_enumeration() {
    let (mut vm, log) = woven("Numbers", Behaviour::default(), &Config::default());
    tens(&mut vm);

    let numbers = start(&mut vm, "Numbers", 2);
    for _ in 0..2 {
        let enumerator = enumerator_of(&mut vm, &numbers);
        let (items, _) = vm.drain_enumerator(&enumerator).unwrap();
        assert_eq!(items, ints(&[0, 10]));
    }
    assert_eq!(
        events(&log),
        vec!["a:entry", "a:success", "a:exit", "a:entry", "a:success", "a:exit"]
    );
    assert_eq!(vm.stats().contexts_created, 2);
}

#[test]
fn enumerable_context_reads_the_enumerator_argument() {
    let (mut vm, seen) = watched("Numbers", &Config::default().with_enumerable_returns(true));
    let numbers = start(&mut vm, "Numbers", 3);
    let second = {
        let first = enumerator_of(&mut vm, &numbers);
        vm.drain_enumerator(&first).unwrap();
        enumerator_of(&mut vm, &numbers)
    };
    vm.drain_enumerator(&second).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    for (_, is_iterator, returned, arguments) in seen.iter() {
        assert!(is_iterator);
        assert_eq!(arguments, &ints(&[3]));
        assert_eq!(returned.items(), Some(ints(&[0, 10, 20])));
    }
}

#[test]
fn enumerable_rewrite_changes_what_is_enumerated() {
    let behaviour = Behaviour { rewrite: Some((0, Value::I32(1))), ..Behaviour::default() };
    let (mut vm, log) = woven("Numbers", behaviour, &Config::default());
    let calls = tens(&mut vm);

    let numbers = start(&mut vm, "Numbers", 4);
    let enumerator = enumerator_of(&mut vm, &numbers);
    let (items, _) = vm.drain_enumerator(&enumerator).unwrap();
    assert_eq!(items, ints(&[0]));
    assert_eq!(calls.get(), 1);
    assert_eq!(events(&log), vec!["a:entry", "a:success", "a:exit"]);
}

#[test]
fn iterator_records_yielded_values_when_enabled() {
    let (mut vm, seen) = watched("Count", &Config::default().with_enumerable_returns(true));
    let enumerator = start(&mut vm, "Count", 3);
    vm.drain_enumerator(&enumerator).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    let (is_async, is_iterator, returned, _) = &seen[0];
    assert!(!is_async);
    assert!(is_iterator);
    assert_eq!(returned.items(), Some(ints(&[0, 10, 20])));
}

#[test]
fn iterator_values_are_not_recorded_by_default() {
    let mut module = fixture();
    weave(&mut module, "Count", vec![trace("a")], &Config::default()).unwrap();
    let machine = module.type_def(COUNT_SM).unwrap();
    assert!(machine.find_field(FIELD_ITEMS).is_none());

    let (mut vm, seen) = watched("Count", &Config::default());
    let enumerator = start(&mut vm, "Count", 2);
    vm.drain_enumerator(&enumerator).unwrap();
    assert!(seen.borrow()[0].2.is_null());
}

#[test]
fn async_iterator_reports_once() {
    let mut module = fixture();
    let report = weave(&mut module, "StreamAsync", vec![trace("a")], &Config::default()).unwrap();
    assert_eq!(report.woven[0].shape, MethodShape::AsyncIterator);
    assert_eq!(report.woven[0].companion.as_deref(), Some(STREAM_SM));

    let (mut vm, log) = woven("StreamAsync", Behaviour::default(), &Config::default());
    tens(&mut vm);

    let enumerator = start(&mut vm, "StreamAsync", 3);
    let (items, outcome) = vm.drain_async_enumerator(&enumerator, FIELD_PROMISE).unwrap();
    assert_eq!(items, ints(&[0, 10, 20]));
    assert_eq!(outcome, Outcome::Returned(Some(Value::I32(0))));
    assert_eq!(events(&log), vec!["a:entry", "a:success", "a:exit"]);
    assert_eq!(vm.stats().contexts_created, 1);
}

#[test]
fn async_iterator_exception_faults_the_promise() {
    let (mut vm, log) = woven("StreamAsync", Behaviour::default(), &Config::default());
    tens_failing_at(&mut vm, &[1]);

    let enumerator = start(&mut vm, "StreamAsync", 3);
    let (items, outcome) = vm.drain_async_enumerator(&enumerator, FIELD_PROMISE).unwrap();
    assert_eq!(items, ints(&[0]));
    assert!(outcome.exception().is_some());
    assert_eq!(events(&log), vec!["a:entry", "a:exception(broken)", "a:exit"]);
}

#[test]
fn handled_async_iterator_exception_ends_the_sequence() {
    let behaviour = Behaviour { handle_with: Some(Value::Null), ..Behaviour::default() };
    let (mut vm, log) = woven("StreamAsync", behaviour, &Config::default());
    tens_failing_at(&mut vm, &[1]);

    let enumerator = start(&mut vm, "StreamAsync", 3);
    let (items, outcome) = vm.drain_async_enumerator(&enumerator, FIELD_PROMISE).unwrap();
    assert_eq!(items, ints(&[0]));
    assert_eq!(outcome, Outcome::Returned(Some(Value::I32(0))));
    assert_eq!(events(&log), vec!["a:entry", "a:exception(broken)", "a:exit"]);
}

#[test]
fn async_iterator_retry_restarts_the_sequence() {
    let behaviour = Behaviour { exception_retries: 1, ..Behaviour::default() };
    let (mut vm, log) = woven("StreamAsync", behaviour, &Config::default());
    let calls = tens_failing_at(&mut vm, &[0]);

    let enumerator = start(&mut vm, "StreamAsync", 2);
    let (items, _) = vm.drain_async_enumerator(&enumerator, FIELD_PROMISE).unwrap();
    assert_eq!(items, ints(&[0, 10]));
    assert_eq!(calls.get(), 3);
    assert_eq!(events(&log), vec!["a:entry", "a:exception(broken)", "a:success", "a:exit"]);
}

#[test]
fn async_iterator_records_only_yielded_values() {
    let (mut vm, seen) = watched("StreamAsync", &Config::default().with_enumerable_returns(true));
    let enumerator = start(&mut vm, "StreamAsync", 2);
    vm.drain_async_enumerator(&enumerator, FIELD_PROMISE).unwrap();

    let seen = seen.borrow();
    let (is_async, is_iterator, returned, _) = &seen[0];
    assert!(is_async);
    assert!(is_iterator);
    // the store clearing the current value on completion is not a yield
    assert_eq!(returned.items(), Some(ints(&[0, 10])));
    assert_eq!(vm.field(&enumerator, FIELD_CURRENT), Some(Value::I32(0)));
}
