use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;

use crate::error::MarshalError;
use crate::introspect;

/// Identifies one bridge session; opaque values remember where they came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

/// Anything that can cross the host/interpreter boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Text(String),
    Opaque(OpaqueRef),
}

/// The tag of a [`Value`], used when a caller asks for a specific kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Kind {
    Nil,
    Bool,
    Number,
    Text,
    Opaque,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Nil => "nil",
            Kind::Bool => "boolean",
            Kind::Number => "number",
            Kind::Text => "string",
            Kind::Opaque => "opaque",
        })
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Nil => Kind::Nil,
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::Text(_) => Kind::Text,
            Value::Opaque(_) => Kind::Opaque,
        }
    }

    /// Interpreter-assigned type name (`"number"`, `"table"`, ...).
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Opaque(o) => o.type_name(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Fails with `TypeMismatch` unless the value carries the `expected` tag.
    pub fn expect(&self, expected: Kind) -> Result<&Value, MarshalError> {
        if self.kind() == expected {
            Ok(self)
        } else {
            Err(MarshalError::TypeMismatch {
                expected,
                found: self.kind(),
            })
        }
    }

    pub fn as_str(&self) -> Result<&str, MarshalError> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(MarshalError::TypeMismatch {
                expected: Kind::Text,
                found: other.kind(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&introspect::display(self))
    }
}

/// A boundary value with no native equivalent (table, function, thread,
/// userdata). Only meaningful while its session is alive; once the session
/// is closed the handle still clones, compares and renders, but refuses to
/// reach into the interpreter.
#[derive(Clone)]
pub struct OpaqueRef {
    pub(crate) session: SessionId,
    pub(crate) id: u64,
    pub(crate) type_name: &'static str,
    // Shared so cloning never touches the interpreter.
    pub(crate) inner: Rc<mlua::Value>,
    pub(crate) alive: Weak<()>,
}

impl OpaqueRef {
    /// Per-session identity token; the same interpreter object always maps
    /// to the same token.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// False once the owning session has been closed or dropped.
    pub fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }

    /// Borrow a host object previously wrapped with `Bridge::wrap_opaque`.
    pub fn downcast<T: 'static>(&self) -> Result<mlua::UserDataRef<T>, MarshalError> {
        if !self.is_alive() {
            return Err(MarshalError::SessionClosed);
        }
        match self.inner.as_ref() {
            mlua::Value::UserData(ud) => ud
                .borrow::<T>()
                .map_err(|_| MarshalError::WrongUserData(std::any::type_name::<T>())),
            _ => Err(MarshalError::WrongUserData(std::any::type_name::<T>())),
        }
    }
}

impl PartialEq for OpaqueRef {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session && self.id == other.id
    }
}

impl fmt::Debug for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueRef")
            .field("type", &self.type_name)
            .field("id", &self.id)
            .finish()
    }
}
