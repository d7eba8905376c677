//! `console.log|info|warn|error` capture (spec §4.2).
//!
//! Grounded on the teacher's `add_global_functions_static`, which installs
//! a `console` object with a native `log` function; here every level is
//! bound, non-string arguments are JSON-stringified, and each captured
//! line is both stored on the sandbox state and forwarded to the sink in
//! real time.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::{Ctx, Function, Object};

use crate::event_bus::ConsoleLevel;
use crate::Result;

use super::quest_api::SandboxState;

fn stringify_arg(value: &rquickjs::Value) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    if let Some(n) = value.as_number() {
        return format_number(n);
    }
    if let Some(b) = value.as_bool() {
        return b.to_string();
    }
    if value.is_null() || value.is_undefined() {
        return "null".to_string();
    }
    js_object_to_json_string(value)
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Objects and arrays are stringified via the JS-native `JSON.stringify`
/// rather than a hand-rolled `rquickjs::Value` walker.
fn js_object_to_json_string(value: &rquickjs::Value) -> String {
    if let Some(ctx) = value.ctx() {
        let global = ctx.globals();
        if let Ok(json_obj) = global.get::<_, Object>("JSON") {
            if let Ok(stringify) = json_obj.get::<_, Function>("stringify") {
                if let Ok(s) = stringify.call::<_, rquickjs::String>((value.clone(),)) {
                    return s.to_string().unwrap_or_else(|_| "null".to_string());
                }
            }
        }
    }
    "[object]".to_string()
}

fn join_args(args: rquickjs::function::Rest<rquickjs::Value>) -> String {
    args.0.iter().map(stringify_arg).collect::<Vec<_>>().join(" ")
}

fn record(state: &Rc<RefCell<SandboxState>>, level: ConsoleLevel, line: String) {
    let prefixed = match level {
        ConsoleLevel::Log => line,
        ConsoleLevel::Info => format!("[INFO] {line}"),
        ConsoleLevel::Warn => format!("[WARN] {line}"),
        ConsoleLevel::Error => format!("[ERROR] {line}"),
    };
    state.borrow_mut().record_console(level, prefixed);
}

/// Install the `console` global.
pub(super) fn install<'js>(ctx: Ctx<'js>, state: Rc<RefCell<SandboxState>>) -> Result<()> {
    let console = Object::new(ctx.clone())?;

    for (name, level) in [
        ("log", ConsoleLevel::Log),
        ("info", ConsoleLevel::Info),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
    ] {
        let state = state.clone();
        let func = Function::new(ctx.clone(), move |args: rquickjs::function::Rest<rquickjs::Value>| {
            record(&state, level, join_args(args));
        })?;
        console.set(name, func)?;
    }

    ctx.globals().set("console", console)?;
    Ok(())
}
