//! Host-call bridge over an embedded Lua interpreter: boundary values, the
//! exchange stack, marshaling, host function registration and stack dumps.

pub mod bridge;
pub use bridge::{Bridge, CallContext, HostFunction};

pub mod config;
pub use config::{default_config_path, load_config_from_user, load_config_or_default, BridgeConfig};

pub mod error;
pub use error::{AccessError, BridgeError, EvalError, EvalErrorKind, HostError, MarshalError, StackError};

pub mod introspect;
pub use introspect::SlotEntry;

pub mod marshal;
pub use marshal::{from_value, to_value, FromValue, IntoValue};

pub mod stack;
pub use stack::Stack;

pub mod value;
pub use value::{Kind, OpaqueRef, SessionId, Value};
