//! Conversions between host types, boundary values and Lua values.

use std::cell::Cell;
use std::rc::Rc;

use mlua::{Lua, Table};

use crate::error::MarshalError;
use crate::value::{Kind, OpaqueRef, SessionId, Value};

/* ---------- host side ---------- */

/// Host types that become a [`Value`] without loss.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Host types that can be read back out of a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, MarshalError>;
}

pub fn to_value(native: impl IntoValue) -> Value {
    native.into_value()
}

pub fn from_value<T: FromValue>(value: &Value) -> Result<T, MarshalError> {
    T::from_value(value)
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Nil
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Number(self)
    }
}

impl IntoValue for f32 {
    fn into_value(self) -> Value {
        Value::Number(self.into())
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::Number(self.into())
    }
}

impl IntoValue for u32 {
    fn into_value(self) -> Value {
        Value::Number(self.into())
    }
}

// i64/usize beyond 2^53 round the way f64 does.
impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoValue for usize {
    fn into_value(self) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Text(self.to_owned())
    }
}

impl IntoValue for OpaqueRef {
    fn into_value(self) -> Value {
        Value::Opaque(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map_or(Value::Nil, IntoValue::into_value)
    }
}

fn mismatch(expected: Kind, found: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        expected,
        found: found.kind(),
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, MarshalError> {
        Ok(value.clone())
    }
}

impl FromValue for () {
    fn from_value(value: &Value) -> Result<Self, MarshalError> {
        value.expect(Kind::Nil).map(drop)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch(Kind::Bool, other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Number(n) => Ok(*n),
            other => Err(mismatch(Kind::Number, other)),
        }
    }
}

fn integral(value: &Value, target: &'static str) -> Result<i64, MarshalError> {
    let n = f64::from_value(value)?;
    // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Ok(n as i64)
    } else {
        Err(MarshalError::NotRepresentable { value: n, target })
    }
}

macro_rules! from_value_int {
    ($($ty:ty),*) => {$(
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self, MarshalError> {
                let target = stringify!($ty);
                let n = integral(value, target)?;
                <$ty>::try_from(n).map_err(|_| MarshalError::NotRepresentable {
                    value: n as f64,
                    target,
                })
            }
        }
    )*};
}

from_value_int!(i64, i32, u32, usize);

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, MarshalError> {
        value.as_str().map(str::to_owned)
    }
}

impl FromValue for OpaqueRef {
    fn from_value(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Opaque(o) => Ok(o.clone()),
            other => Err(mismatch(Kind::Opaque, other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/* ---------- interpreter side ---------- */

/// Lua's name for the type of `value`, integers reported as `number`.
pub(crate) fn lua_type_name(value: &mlua::Value) -> &'static str {
    match value {
        mlua::Value::Nil => "nil",
        mlua::Value::Boolean(_) => "boolean",
        mlua::Value::Integer(_) | mlua::Value::Number(_) => "number",
        mlua::Value::String(_) => "string",
        mlua::Value::Table(_) => "table",
        mlua::Value::Function(_) => "function",
        mlua::Value::Thread(_) => "thread",
        _ => "userdata",
    }
}

/// Per-session converter between [`Value`] and Lua values. Opaque identity
/// tokens live in a weak-keyed Lua table so collected objects drop out and
/// tokens are never reused.
pub(crate) struct Marshaler {
    session: SessionId,
    identities: Table,
    next_id: Cell<u64>,
    // Opaque values hold a weak handle; dropped with the session.
    alive: Rc<()>,
}

impl Marshaler {
    pub(crate) fn new(lua: &Lua, session: SessionId) -> mlua::Result<Self> {
        let identities = lua
            .load("return setmetatable({}, { __mode = 'k' })")
            .set_name("=hostcall.identities")
            .eval::<Table>()?;
        Ok(Self {
            session,
            identities,
            next_id: Cell::new(1),
            alive: Rc::new(()),
        })
    }

    fn identify(&self, value: &mlua::Value) -> Result<u64, MarshalError> {
        let known: Option<u64> = self
            .identities
            .raw_get(value.clone())
            .map_err(|e| MarshalError::Interpreter(e.to_string()))?;
        if let Some(id) = known {
            return Ok(id);
        }
        let id = self.next_id.get();
        self.identities
            .raw_set(value.clone(), id)
            .map_err(|e| MarshalError::Interpreter(e.to_string()))?;
        self.next_id.set(id + 1);
        Ok(id)
    }

    pub(crate) fn from_lua(&self, value: mlua::Value) -> Result<Value, MarshalError> {
        Ok(match value {
            mlua::Value::Nil => Value::Nil,
            mlua::Value::Boolean(b) => Value::Bool(b),
            mlua::Value::Integer(i) => Value::Number(i as f64),
            mlua::Value::Number(n) => Value::Number(n),
            mlua::Value::String(s) => Value::Text(String::from_utf8_lossy(&s.as_bytes()).into_owned()),
            other => {
                let id = self.identify(&other)?;
                Value::Opaque(OpaqueRef {
                    session: self.session,
                    id,
                    type_name: lua_type_name(&other),
                    inner: Rc::new(other),
                    alive: Rc::downgrade(&self.alive),
                })
            }
        })
    }

    pub(crate) fn to_lua(&self, lua: &Lua, value: &Value) -> Result<mlua::Value, MarshalError> {
        Ok(match value {
            Value::Nil => mlua::Value::Nil,
            Value::Bool(b) => mlua::Value::Boolean(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 {
                    mlua::Value::Integer(*n as i64)
                } else {
                    mlua::Value::Number(*n)
                }
            }
            Value::Text(s) => mlua::Value::String(
                lua.create_string(s)
                    .map_err(|e| MarshalError::Interpreter(e.to_string()))?,
            ),
            Value::Opaque(o) => {
                if o.session != self.session {
                    return Err(MarshalError::ForeignSession);
                }
                if !o.is_alive() {
                    return Err(MarshalError::SessionClosed);
                }
                o.inner.as_ref().clone()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn native_round_trip() {
        assert_eq!(from_value::<bool>(&to_value(true)), Ok(true));
        assert_eq!(from_value::<f64>(&to_value(-0.25)), Ok(-0.25));
        assert_eq!(from_value::<String>(&to_value("héllo")), Ok("héllo".to_string()));
        assert_eq!(from_value::<i32>(&to_value(42)), Ok(42));
        assert_eq!(from_value::<Option<f64>>(&to_value(())), Ok(None));
    }

    #[test]
    fn wrong_kind_is_a_type_mismatch() {
        assert_eq!(
            from_value::<f64>(&to_value("3")),
            Err(MarshalError::TypeMismatch {
                expected: Kind::Number,
                found: Kind::Text
            })
        );
        assert_eq!(
            from_value::<String>(&Value::Nil),
            Err(MarshalError::TypeMismatch {
                expected: Kind::Text,
                found: Kind::Nil
            })
        );
    }

    #[test]
    fn integers_are_not_rounded() {
        assert_eq!(
            from_value::<i64>(&Value::Number(2.5)),
            Err(MarshalError::NotRepresentable {
                value: 2.5,
                target: "i64"
            })
        );
        assert!(from_value::<u32>(&Value::Number(-1.0)).is_err());
        assert!(from_value::<i64>(&Value::Number(f64::INFINITY)).is_err());
        assert_eq!(from_value::<usize>(&Value::Number(7.0)), Ok(7));
    }

    #[test]
    fn lua_round_trip_keeps_numbers_and_text() {
        let lua = Lua::new();
        let m = Marshaler::new(&lua, SessionId(1)).unwrap();
        for v in [
            Value::Nil,
            Value::Bool(false),
            Value::Number(5.0),
            Value::Number(3.5),
            Value::Number(-1e300),
            Value::Text("tab\tand\0nul".into()),
        ] {
            let back = m.from_lua(m.to_lua(&lua, &v).unwrap()).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn integral_numbers_cross_as_lua_integers() {
        let lua = Lua::new();
        let m = Marshaler::new(&lua, SessionId(1)).unwrap();
        assert!(matches!(
            m.to_lua(&lua, &Value::Number(5.0)).unwrap(),
            mlua::Value::Integer(5)
        ));
        assert!(matches!(
            m.to_lua(&lua, &Value::Number(0.5)).unwrap(),
            mlua::Value::Number(_)
        ));
    }

    #[test]
    fn opaque_identity_is_stable() {
        let lua = Lua::new();
        let m = Marshaler::new(&lua, SessionId(7)).unwrap();
        let t1 = mlua::Value::Table(lua.create_table().unwrap());
        let t2 = mlua::Value::Table(lua.create_table().unwrap());

        let a = m.from_lua(t1.clone()).unwrap();
        let b = m.from_lua(t2).unwrap();
        let again = m.from_lua(t1).unwrap();

        let (Value::Opaque(a), Value::Opaque(b), Value::Opaque(again)) = (a, b, again) else {
            panic!("tables must marshal as opaque values");
        };
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(again.id(), 1);
        assert_eq!(a.type_name(), "table");
    }

    #[test]
    fn foreign_opaque_is_rejected() {
        let lua = Lua::new();
        let ours = Marshaler::new(&lua, SessionId(1)).unwrap();
        let theirs = Marshaler::new(&lua, SessionId(2)).unwrap();
        let t = theirs
            .from_lua(mlua::Value::Table(lua.create_table().unwrap()))
            .unwrap();
        assert_eq!(ours.to_lua(&lua, &t).unwrap_err(), MarshalError::ForeignSession);
    }
}
