//! Method classifier.

use crate::common::consts::{
    ATTR_ASYNC_ITERATOR_STATE_MACHINE, ATTR_ASYNC_STATE_MACHINE, ATTR_ITERATOR_STATE_MACHINE,
};
use crate::il::{AttrArg, MethodDef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structural shape of a target method; selects the weaver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodShape {
    Empty,
    Sync,
    Iterator,
    AsyncIterator,
    AsyncTask,
}

impl MethodShape {
    /// Marker attribute naming the companion state machine, if the shape has one.
    pub fn marker(self) -> Option<&'static str> {
        match self {
            MethodShape::Iterator => Some(ATTR_ITERATOR_STATE_MACHINE),
            MethodShape::AsyncIterator => Some(ATTR_ASYNC_ITERATOR_STATE_MACHINE),
            MethodShape::AsyncTask => Some(ATTR_ASYNC_STATE_MACHINE),
            MethodShape::Empty | MethodShape::Sync => None,
        }
    }
}

impl fmt::Display for MethodShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodShape::Empty => "empty",
            MethodShape::Sync => "sync",
            MethodShape::Iterator => "iterator",
            MethodShape::AsyncIterator => "async-iterator",
            MethodShape::AsyncTask => "async-task",
        };
        f.write_str(name)
    }
}

/// Bucket a method. Never fails: anything unrecognised is `Sync`.
pub fn classify(method: &MethodDef) -> MethodShape {
    if method.body.as_ref().map_or(false, |b| b.is_trivial()) {
        return MethodShape::Empty;
    }
    if method.find_attribute(ATTR_ITERATOR_STATE_MACHINE).is_some() {
        MethodShape::Iterator
    } else if method.find_attribute(ATTR_ASYNC_ITERATOR_STATE_MACHINE).is_some() {
        MethodShape::AsyncIterator
    } else if method.find_attribute(ATTR_ASYNC_STATE_MACHINE).is_some() {
        MethodShape::AsyncTask
    } else {
        MethodShape::Sync
    }
}

/// Full name of the companion state-machine type named by the shape's marker.
pub fn state_machine_name(method: &MethodDef, shape: MethodShape) -> Option<&str> {
    let marker = method.find_attribute(shape.marker()?)?;
    marker.args.iter().find_map(|arg| match arg {
        AttrArg::Type(name) => Some(name.as_str()),
        _ => None,
    })
}
