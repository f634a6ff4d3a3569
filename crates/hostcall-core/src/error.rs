//! Error taxonomy for the bridge.

use std::fmt;

use thiserror::Error;

use crate::value::Kind;

/// Misuse of the stack accessors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("stack underflow: cannot pop {requested} value(s) from a frame holding {size}")]
    Underflow { requested: usize, size: usize },
    #[error("stack index {index} out of range (frame holds {size})")]
    IndexOutOfRange { index: usize, size: usize },
}

/// Conversion between host types and boundary values failed.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum MarshalError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: Kind, found: Kind },
    #[error("number {value} is not representable as {target}")]
    NotRepresentable { value: f64, target: &'static str },
    #[error("opaque value belongs to another bridge session")]
    ForeignSession,
    #[error("opaque value outlived its bridge session")]
    SessionClosed,
    #[error("opaque value does not hold a `{0}`")]
    WrongUserData(&'static str),
    #[error("interpreter rejected value: {0}")]
    Interpreter(String),
}

/// A typed stack read: either the slot is missing or it holds the wrong kind.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum AccessError {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EvalErrorKind {
    /// Source failed to parse.
    Syntax,
    /// Script raised an error while running.
    Runtime,
    /// Interpreter ran out of memory.
    Memory,
    /// A host function returned an error.
    Host,
    /// A host function unwound the script on request.
    Cancelled,
}

impl fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvalErrorKind::Syntax => "syntax",
            EvalErrorKind::Runtime => "runtime",
            EvalErrorKind::Memory => "memory",
            EvalErrorKind::Host => "host",
            EvalErrorKind::Cancelled => "cancelled",
        })
    }
}

/// Evaluation failed; `message` carries the interpreter diagnostic or the
/// host-supplied text.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: String,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn from_lua(err: &mlua::Error) -> Self {
        use mlua::Error as E;
        match err {
            E::CallbackError { cause, .. } | E::WithContext { cause, .. } => Self::from_lua(cause),
            E::SyntaxError { message, .. } => Self::new(EvalErrorKind::Syntax, message.clone()),
            E::RuntimeError(message) => Self::new(EvalErrorKind::Runtime, strip_traceback(message)),
            E::MemoryError(message) => Self::new(EvalErrorKind::Memory, message.clone()),
            E::ExternalError(inner) => match (**inner).downcast_ref::<HostError>() {
                Some(host) => Self::from_host(host),
                None => Self::new(EvalErrorKind::Host, inner.to_string()),
            },
            other => Self::new(EvalErrorKind::Runtime, other.to_string()),
        }
    }

    fn from_host(err: &HostError) -> Self {
        match err {
            HostError::Eval(inner) => inner.clone(),
            HostError::Cancelled => Self::new(EvalErrorKind::Cancelled, err.to_string()),
            other => Self::new(EvalErrorKind::Host, other.to_string()),
        }
    }
}

// mlua appends a traceback to script errors; keep only the diagnostic line(s).
fn strip_traceback(message: &str) -> &str {
    message
        .split_once("\nstack traceback:")
        .map_or(message, |(head, _)| head)
}

/// What a host function returns on failure. The bridge raises it inside the
/// interpreter and it comes back out of the enclosing `evaluate`.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("{0}")]
    Message(String),
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("host function `{name}` reported {returned} result(s) but its frame holds {available}")]
    ResultCount {
        name: String,
        returned: usize,
        available: usize,
    },
    /// Raised when the interpreter runs a host function after its session
    /// started tearing down, e.g. from a `__gc` finalizer during close.
    #[error("bridge session closed")]
    Closed,
}

impl HostError {
    pub fn msg(message: impl Into<String>) -> Self {
        HostError::Message(message.into())
    }
}

impl From<AccessError> for HostError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Stack(e) => HostError::Stack(e),
            AccessError::Marshal(e) => HostError::Marshal(e),
        }
    }
}

/// Session setup and registration failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("unknown standard library `{0}`")]
    UnknownLibrary(String),
    #[error("interpreter error: {0}")]
    Interpreter(String),
}

impl BridgeError {
    pub(crate) fn lua(err: mlua::Error) -> Self {
        BridgeError::Interpreter(err.to_string())
    }
}
