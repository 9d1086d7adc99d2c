//! The per-call record woven code hands to interceptors, and the interceptor trait.

use super::value::Value;
use crate::weave::Feature;

/// Runtime state of one logical call.
///
/// Generated code reads the argument array back after `OnEntry` when
/// [`rewrite_arguments`](Self::rewrite_arguments) is set, so [`set_argument`](Self::set_argument)
/// writes into the very array the call was constructed with.
#[derive(Debug, Clone)]
pub struct MethodContext {
    pub target: Value,
    /// Declaring type, by full name.
    pub target_type: String,
    /// Method, by full name.
    pub method: String,
    pub is_async: bool,
    pub is_iterator: bool,
    pub mos_non_entry_fifo: bool,
    /// The interceptor array, or null when omitted.
    pub mos: Value,
    arguments: Value,
    return_value: Value,
    return_value_replaced: bool,
    pub exception: Option<Value>,
    pub exception_handled: bool,
    pub retry_count: i32,
    pub rewrite_arguments: bool,
}

impl MethodContext {
    pub fn new(target: Value, target_type: impl Into<String>, method: impl Into<String>, arguments: Value) -> Self {
        Self {
            target,
            target_type: target_type.into(),
            method: method.into(),
            is_async: false,
            is_iterator: false,
            mos_non_entry_fifo: true,
            mos: Value::Null,
            arguments,
            return_value: Value::Null,
            return_value_replaced: false,
            exception: None,
            exception_handled: false,
            retry_count: 0,
            rewrite_arguments: false,
        }
    }

    /// The argument array as generated code sees it.
    pub fn arguments_value(&self) -> &Value {
        &self.arguments
    }

    /// Snapshot of the arguments; empty when the array was omitted.
    pub fn arguments(&self) -> Vec<Value> {
        self.arguments.items().unwrap_or_default()
    }

    pub fn argument(&self, index: usize) -> Option<Value> {
        self.arguments().get(index).cloned()
    }

    /// Overwrite argument `index`. Returns false when there is no such argument.
    pub fn set_argument(&mut self, index: usize, value: Value) -> bool {
        match &self.arguments {
            Value::Array(items) => match items.borrow_mut().get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn return_value(&self) -> &Value {
        &self.return_value
    }

    /// Replace the method's result.
    pub fn set_return_value(&mut self, value: Value) {
        self.return_value = value;
        self.return_value_replaced = true;
    }

    /// Record the result the method produced; does not count as a replacement.
    pub fn capture_return_value(&mut self, value: Value) {
        self.return_value = value;
    }

    pub fn return_value_replaced(&self) -> bool {
        self.return_value_replaced
    }

    /// Swallow the current exception and complete with `value` instead.
    pub fn handle_exception(&mut self, value: Value) {
        self.exception_handled = true;
        self.set_return_value(value);
    }
}

/// Cross-cutting logic bound to a method. Every hook defaults to doing nothing.
pub trait Interceptor {
    fn on_entry(&mut self, _context: &mut MethodContext) {}

    fn on_exception(&mut self, _context: &mut MethodContext) {}

    fn on_success(&mut self, _context: &mut MethodContext) {}

    fn on_exit(&mut self, _context: &mut MethodContext) {}

    /// Runtime feature mask, consulted by the loop form of hook invocation on sets wider
    /// than a precomputed mask.
    fn features(&self) -> Feature {
        Feature::all()
    }

    /// Named-property assignment from the binding. Returns false for unknown properties.
    fn set_property(&mut self, _name: &str, _value: Value) -> bool {
        false
    }
}
