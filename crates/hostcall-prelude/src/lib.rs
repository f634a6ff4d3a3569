//! Ready-made host functions for a bridge session
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use hostcall_core::{
    introspect, load_config_from_user, Bridge, BridgeError, CallContext, HostError,
};
use tracing::info;

/// Session from the user's config with the prelude installed.
pub fn init_bridge() -> Result<Bridge> {
    let mut bridge = Bridge::with_config(load_config_from_user()).context("creating bridge session")?;
    install(&mut bridge).context("installing prelude")?;
    Ok(bridge)
}

/// `print_host(...)` and `dump_stack(...)`.
pub fn install(bridge: &mut Bridge) -> Result<(), BridgeError> {
    bridge.register_function("print_host", print_host)?;
    bridge.register_function("dump_stack", dump_stack)?;
    Ok(())
}

/// Logs its arguments tab-separated, like Lua's `print`.
fn print_host(cx: &mut CallContext<'_>) -> Result<usize, HostError> {
    let line = cx.with_stack(|s| {
        s.iter()
            .map(introspect::display)
            .collect::<Vec<_>>()
            .join("\t")
    });
    info!(target: "hostcall::script", "{line}");
    Ok(0)
}

/// Returns its own arguments rendered one slot per line.
fn dump_stack(cx: &mut CallContext<'_>) -> Result<usize, HostError> {
    let mut out = Vec::new();
    cx.with_stack(|s| {
        introspect::trace(s);
        introspect::render_to(s, &mut out)
    })
    .map_err(|e| HostError::msg(e.to_string()))?;
    cx.push(String::from_utf8_lossy(&out).into_owned());
    Ok(1)
}

/// `checkpoint()` unwinds the running script with a cancellation error once
/// `flag` is set. Scripts call it from long loops; the flag can be raised
/// from any thread.
pub fn install_checkpoint(bridge: &mut Bridge, flag: Arc<AtomicBool>) -> Result<(), BridgeError> {
    bridge.register_function("checkpoint", move |_| {
        if flag.load(Ordering::Relaxed) {
            Err(HostError::Cancelled)
        } else {
            Ok(0)
        }
    })
}
