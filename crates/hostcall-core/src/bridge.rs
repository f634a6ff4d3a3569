//! The bridge session: one Lua interpreter, its boundary stack, and the
//! registry of host functions installed as Lua globals.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use mlua::{Lua, LuaOptions, MultiValue};
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, EvalError, EvalErrorKind, HostError, MarshalError, StackError};
use crate::introspect::{self, SlotEntry};
use crate::marshal::{lua_type_name, FromValue, IntoValue, Marshaler};
use crate::stack::Stack;
use crate::value::{SessionId, Value};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// A native function callable from scripts.
///
/// On entry the call's arguments occupy slots `1..=n` of a fresh frame. The
/// function pushes its results and returns how many of the top slots are
/// results; everything else in the frame is discarded on return.
pub trait HostFunction: 'static {
    fn call(&self, cx: &mut CallContext<'_>) -> Result<usize, HostError>;
}

impl<F> HostFunction for F
where
    F: Fn(&mut CallContext<'_>) -> Result<usize, HostError> + 'static,
{
    fn call(&self, cx: &mut CallContext<'_>) -> Result<usize, HostError> {
        self(cx)
    }
}

/// Owned session around a single interpreter instance. Dropping it (or
/// calling [`Bridge::close`]) releases the interpreter.
pub struct Bridge {
    session: Rc<Session>,
}

// Field order matters: values referencing the interpreter drop before `lua`.
struct Session {
    id: SessionId,
    config: BridgeConfig,
    stack: RefCell<Stack>,
    // Lua-side wrappers by name. Scripts can overwrite the global, so an
    // entry only counts while the global still holds its function.
    registry: RefCell<HashMap<String, mlua::Function>>,
    marshal: Marshaler,
    lua: Lua,
}

/// Leaves the host frame even if the host function panics.
struct FrameGuard<'a>(&'a RefCell<Stack>);

impl<'a> FrameGuard<'a> {
    fn enter(stack: &'a RefCell<Stack>) -> Self {
        stack.borrow_mut().enter_frame();
        FrameGuard(stack)
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut stack) = self.0.try_borrow_mut() {
            stack.leave_frame();
        }
    }
}

/// Raise a host-side failure inside the interpreter.
fn raise(err: impl Into<HostError>) -> mlua::Error {
    mlua::Error::external(err.into())
}

fn runtime(message: String) -> EvalError {
    EvalError::new(EvalErrorKind::Runtime, message)
}

impl Bridge {
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Result<Self, BridgeError> {
        let libs = config.std_lib_flags()?;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(BridgeError::lua)?;
        let id = SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        let marshal = Marshaler::new(&lua, id).map_err(BridgeError::lua)?;
        debug!(session = id.0, libs = ?config.std_libs, "bridge session created");
        Ok(Self {
            session: Rc::new(Session {
                id,
                config,
                stack: RefCell::new(Stack::new()),
                registry: RefCell::new(HashMap::new()),
                marshal,
                lua,
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.session.config
    }

    /// Parse and run `source`. The chunk's results are pushed onto the
    /// stack; on failure the stack is restored to its depth before the call.
    pub fn evaluate(&mut self, source: &str) -> Result<(), EvalError> {
        self.session.evaluate(source)
    }

    /// Call the global function `name` with `args`; results are pushed onto
    /// the stack and their count returned.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<usize, EvalError> {
        self.session.call(name, args)
    }

    /// Like [`Bridge::call`], for a function held as an opaque value.
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<usize, EvalError> {
        self.session.call_value(callee, args)
    }

    /// Install `f` as the global `name`, replacing any previous binding.
    pub fn register_function<F>(&mut self, name: &str, f: F) -> Result<(), BridgeError>
    where
        F: Fn(&mut CallContext<'_>) -> Result<usize, HostError> + 'static,
    {
        self.register(name, f)
    }

    pub fn register<H: HostFunction>(&mut self, name: &str, host: H) -> Result<(), BridgeError> {
        self.session.register(name, Rc::new(host))
    }

    /// Remove a binding; the global becomes nil. Returns whether the global
    /// still held the host function. A global the script has since
    /// reassigned is left alone.
    pub fn unregister_function(&mut self, name: &str) -> Result<bool, BridgeError> {
        let s = &self.session;
        let bound = s.is_bound(name);
        if bound {
            s.lua
                .globals()
                .set(name, mlua::Value::Nil)
                .map_err(BridgeError::lua)?;
        }
        if s.registry.borrow_mut().remove(name).is_some() {
            debug!(session = s.id.0, name, bound, "host function unregistered");
        }
        Ok(bound)
    }

    /// Names whose globals still hold their host function, sorted.
    pub fn functions(&self) -> Vec<String> {
        let s = &self.session;
        let mut names: Vec<String> = s
            .registry
            .borrow()
            .keys()
            .filter(|name| s.is_bound(name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Assign a global. Overwriting a registered host function drops its
    /// registry entry.
    pub fn set_global(&mut self, name: &str, value: impl IntoValue) -> Result<(), MarshalError> {
        let s = &self.session;
        let v = s.marshal.to_lua(&s.lua, &value.into_value())?;
        s.lua
            .globals()
            .set(name, v)
            .map_err(|e| MarshalError::Interpreter(e.to_string()))?;
        if !s.is_bound(name) && s.registry.borrow_mut().remove(name).is_some() {
            debug!(session = s.id.0, name, "host function replaced by a global");
        }
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Result<Value, MarshalError> {
        let s = &self.session;
        let v: mlua::Value = s
            .lua
            .globals()
            .get(name)
            .map_err(|e| MarshalError::Interpreter(e.to_string()))?;
        s.marshal.from_lua(v)
    }

    /// Hand a host object to the interpreter as userdata.
    pub fn wrap_opaque<T: 'static>(&self, data: T) -> Result<Value, MarshalError> {
        self.session.wrap_opaque(data)
    }

    /* ----- stack accessors ----- */

    /// Borrow the stack for reads. The borrow must end before the next call
    /// that mutates the session, which the `&mut self` receivers enforce.
    pub fn stack(&self) -> Ref<'_, Stack> {
        self.session.stack.borrow()
    }

    pub fn size(&self) -> usize {
        self.session.stack.borrow().size()
    }

    pub fn peek(&self, index: usize) -> Result<Value, StackError> {
        self.session.stack.borrow().peek(index).cloned()
    }

    pub fn push(&mut self, value: impl IntoValue) {
        self.session.stack.borrow_mut().push(value.into_value());
    }

    pub fn pop(&mut self, n: usize) -> Result<(), StackError> {
        self.session.stack.borrow_mut().pop(n)
    }

    /* ----- introspection ----- */

    pub fn render(&self) -> Vec<SlotEntry> {
        introspect::render(&self.stack())
    }

    pub fn render_to<W: io::Write>(&self, out: W) -> io::Result<()> {
        introspect::render_to(&self.stack(), out)
    }

    pub fn render_json(&self) -> serde_json::Result<String> {
        introspect::render_json(&self.stack())
    }

    pub fn trace(&self) {
        introspect::trace(&self.stack())
    }

    /// Bytes currently allocated by the interpreter.
    pub fn memory_used(&self) -> usize {
        self.session.lua.used_memory()
    }

    /// Release the interpreter. Equivalent to dropping the session.
    pub fn close(self) {
        debug!(session = self.session.id.0, "bridge session closed");
    }
}

impl Session {
    fn restore(&self, depth: usize) {
        self.stack.borrow_mut().truncate(depth);
    }

    fn push_results(&self, results: MultiValue) -> Result<usize, MarshalError> {
        let values = results
            .into_iter()
            .map(|v| self.marshal.from_lua(v))
            .collect::<Result<Vec<_>, _>>()?;
        let count = values.len();
        let mut stack = self.stack.borrow_mut();
        for v in values {
            stack.push(v);
        }
        Ok(count)
    }

    fn evaluate(&self, source: &str) -> Result<(), EvalError> {
        let depth = self.stack.borrow().size();
        debug!(session = self.id.0, bytes = source.len(), "evaluate");
        let outcome = self
            .lua
            .load(source)
            .set_name(self.config.chunk_name.as_str())
            .eval::<MultiValue>()
            .map_err(|e| EvalError::from_lua(&e))
            .and_then(|results| {
                self.push_results(results)
                    .map_err(|e| EvalError::new(EvalErrorKind::Runtime, e.to_string()))
            });
        match outcome {
            Ok(count) => {
                debug!(session = self.id.0, results = count, "evaluate finished");
                Ok(())
            }
            Err(e) => {
                self.restore(depth);
                debug!(session = self.id.0, kind = %e.kind, "evaluate failed: {}", e.message);
                Err(e)
            }
        }
    }

    /// Whether the global `name` still holds the function registered under it.
    fn is_bound(&self, name: &str) -> bool {
        let registry = self.registry.borrow();
        let Some(func) = registry.get(name) else {
            return false;
        };
        match self.lua.globals().raw_get::<mlua::Value>(name) {
            Ok(mlua::Value::Function(f)) => f == *func,
            _ => false,
        }
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<usize, EvalError> {
        let callee: mlua::Value = self
            .lua
            .globals()
            .get(name)
            .map_err(|e| EvalError::from_lua(&e))?;
        match callee {
            mlua::Value::Function(f) => self.call_function(&f, args),
            other => Err(runtime(format!(
                "global `{name}` is a {} value, not a function",
                lua_type_name(&other)
            ))),
        }
    }

    fn call_value(&self, callee: &Value, args: &[Value]) -> Result<usize, EvalError> {
        match self.marshal.to_lua(&self.lua, callee) {
            Ok(mlua::Value::Function(f)) => self.call_function(&f, args),
            Ok(other) => Err(runtime(format!(
                "cannot call a {} value",
                lua_type_name(&other)
            ))),
            Err(e) => Err(runtime(e.to_string())),
        }
    }

    fn call_function(&self, func: &mlua::Function, args: &[Value]) -> Result<usize, EvalError> {
        let depth = self.stack.borrow().size();
        let args = args
            .iter()
            .map(|v| self.marshal.to_lua(&self.lua, v))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| runtime(e.to_string()))?;

        let outcome = func
            .call::<MultiValue>(MultiValue::from_vec(args))
            .map_err(|e| EvalError::from_lua(&e))
            .and_then(|results| self.push_results(results).map_err(|e| runtime(e.to_string())));
        if outcome.is_err() {
            self.restore(depth);
        }
        outcome
    }

    fn register(self: &Rc<Self>, name: &str, host: Rc<dyn HostFunction>) -> Result<(), BridgeError> {
        let weak: Weak<Session> = Rc::downgrade(self);
        let fname = name.to_owned();
        let func = self
            .lua
            .create_function(move |_, args: MultiValue| {
                // Fails only while the session is being dropped, when
                // finalizers still run on the closing interpreter.
                let session = weak
                    .upgrade()
                    .ok_or_else(|| raise(HostError::Closed))?;
                session.invoke(&fname, host.as_ref(), args)
            })
            .map_err(BridgeError::lua)?;
        // Swap the global first so a failure leaves the old binding in place.
        self.lua
            .globals()
            .set(name, func.clone())
            .map_err(BridgeError::lua)?;
        let replaced = self
            .registry
            .borrow_mut()
            .insert(name.to_owned(), func)
            .is_some();
        debug!(session = self.id.0, name, replaced, "host function registered");
        Ok(())
    }

    fn invoke(&self, name: &str, host: &dyn HostFunction, args: MultiValue) -> mlua::Result<MultiValue> {
        let values = args
            .into_iter()
            .map(|v| self.marshal.from_lua(v))
            .collect::<Result<Vec<_>, _>>()
            .map_err(raise)?;
        if self.config.trace_host_calls {
            debug!(session = self.id.0, name, args = values.len(), "host call");
        }

        let frame = FrameGuard::enter(&self.stack);
        {
            let mut stack = self.stack.borrow_mut();
            for v in values {
                stack.push(v);
            }
        }
        let mut cx = CallContext {
            session: self,
            name,
        };
        let returned = host.call(&mut cx).map_err(raise)?;
        let results = {
            let mut stack = self.stack.borrow_mut();
            let available = stack.size();
            if returned > available {
                return Err(raise(HostError::ResultCount {
                    name: name.to_owned(),
                    returned,
                    available,
                }));
            }
            stack.pop_values(returned).map_err(raise)?
        };
        drop(frame);

        let out = results
            .iter()
            .map(|v| self.marshal.to_lua(&self.lua, v))
            .collect::<Result<Vec<_>, _>>()
            .map_err(raise)?;
        Ok(MultiValue::from_vec(out))
    }

    fn wrap_opaque<T: 'static>(&self, data: T) -> Result<Value, MarshalError> {
        let ud = self
            .lua
            .create_any_userdata(data)
            .map_err(|e| MarshalError::Interpreter(e.to_string()))?;
        self.marshal.from_lua(mlua::Value::UserData(ud))
    }
}

/// What a host function sees while it runs: its own stack frame plus entry
/// points for nested evaluation.
pub struct CallContext<'a> {
    session: &'a Session,
    name: &'a str,
}

impl CallContext<'_> {
    /// Name the function was registered under.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.session.stack.borrow().size()
    }

    pub fn peek(&self, index: usize) -> Result<Value, StackError> {
        self.session.stack.borrow().peek(index).cloned()
    }

    /// Typed read of argument `index`. A missing argument is an error, not nil.
    pub fn arg<T: FromValue>(&self, index: usize) -> Result<T, HostError> {
        Ok(self.session.stack.borrow().get(index)?)
    }

    pub fn push(&mut self, value: impl IntoValue) {
        self.session.stack.borrow_mut().push(value.into_value());
    }

    pub fn pop(&mut self, n: usize) -> Result<(), StackError> {
        self.session.stack.borrow_mut().pop(n)
    }

    /// Run `f` against the frame, e.g. to read a string without copying it.
    pub fn with_stack<R>(&self, f: impl FnOnce(&Stack) -> R) -> R {
        f(&self.session.stack.borrow())
    }

    /// Nested evaluation; results land on this frame.
    pub fn evaluate(&mut self, source: &str) -> Result<(), EvalError> {
        self.session.evaluate(source)
    }

    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<usize, EvalError> {
        self.session.call(name, args)
    }

    /// Call a function received as an argument, e.g. a script callback.
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<usize, EvalError> {
        self.session.call_value(callee, args)
    }

    pub fn render(&self) -> Vec<SlotEntry> {
        introspect::render(&self.session.stack.borrow())
    }

    pub fn wrap_opaque<T: 'static>(&self, data: T) -> Result<Value, MarshalError> {
        self.session.wrap_opaque(data)
    }
}
