//! Read-only rendering of the stack for diagnostics.

use std::io;

use serde::Serialize;
use tracing::debug;

use crate::stack::Stack;
use crate::value::Value;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotEntry {
    pub index: usize,
    pub type_name: &'static str,
    pub display: String,
}

/// Shortest round-trippable form; exponent notation only at the extremes.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".into()
    } else if n.is_infinite() {
        String::from(if n > 0.0 { "inf" } else { "-inf" })
    } else if n != 0.0 && (n.abs() >= 1e16 || n.abs() < 1e-5) {
        format!("{n:e}")
    } else {
        format!("{n}")
    }
}

/// Human-readable rendering of a single value. Opaque values render as
/// `<type>#<token>`, never as an address.
pub fn display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Text(s) => s.clone(),
        Value::Opaque(o) => format!("{}#{}", o.type_name(), o.id()),
    }
}

pub fn render(stack: &Stack) -> Vec<SlotEntry> {
    stack
        .iter()
        .enumerate()
        .map(|(i, v)| SlotEntry {
            index: i + 1,
            type_name: v.type_name(),
            display: display(v),
        })
        .collect()
}

/// One `index<TAB>type<TAB>display` line per slot.
pub fn render_to<W: io::Write>(stack: &Stack, mut out: W) -> io::Result<()> {
    for e in render(stack) {
        writeln!(out, "{}\t{}\t{}", e.index, e.type_name, e.display)?;
    }
    Ok(())
}

pub fn render_json(stack: &Stack) -> serde_json::Result<String> {
    serde_json::to_string(&render(stack))
}

/// Emit every slot as a debug event.
pub fn trace(stack: &Stack) {
    for e in render(stack) {
        debug!(index = e.index, type_name = e.type_name, value = %e.display, "stack slot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numbers_use_general_format() {
        assert_eq!(format_number(3.5), "3.5");
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-0.1), "-0.1");
        assert_eq!(format_number(1e300), "1e300");
        assert_eq!(format_number(2.5e-7), "2.5e-7");
        assert_eq!(format_number(f64::NAN), "nan");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn render_to_writes_tab_separated_lines() {
        let mut s = Stack::new();
        s.push(Value::Number(1.0));
        s.push(Value::Text("two words".into()));
        let mut out = Vec::new();
        render_to(&s, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1\tnumber\t1\n2\tstring\ttwo words\n"
        );
    }

    #[test]
    fn render_json_lists_entries() {
        let mut s = Stack::new();
        s.push(Value::Bool(false));
        assert_eq!(
            render_json(&s).unwrap(),
            r#"[{"index":1,"type_name":"boolean","display":"false"}]"#
        );
    }
}
