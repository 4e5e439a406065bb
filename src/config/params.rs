//! Attribute and parameter interpretation helpers.

use crate::config::schema::ParamDecl;
use anyhow::{anyhow, Result};

/// Interpret a boolean-ish attribute. Accepts `1`/`0` and `true`/`false`,
/// which is what hand-written stream files actually contain.
pub fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value.map(str::trim) {
        Some("1") | Some("true") => true,
        Some("0") | Some("false") => false,
        Some(other) => {
            tracing::warn!(value = other, "unrecognised flag attribute, using default");
            default
        }
        None => default,
    }
}

pub fn parse_port(value: Option<&str>, default: u16) -> Result<u16> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid port attribute '{}'", raw)),
    }
}

pub fn parse_buffer_size(value: Option<&str>, default: usize) -> usize {
    match value {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(size) => size,
            Err(_) => {
                tracing::warn!(value = raw, "invalid bufferSize attribute, ignored");
                default
            }
        },
    }
}

pub fn parse_priority(value: Option<&str>) -> Result<Option<i32>> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("invalid priority attribute '{}'", raw)),
    }
}

pub const SCHEDULERS: [&str; 4] = ["SCHED_INHERIT", "SCHED_FIFO", "SCHED_RR", "SCHED_OTHER"];

pub fn parse_scheduler(value: Option<&str>) -> Result<Option<String>> {
    match value {
        None => Ok(None),
        Some(raw) if SCHEDULERS.contains(&raw) => Ok(Some(raw.to_string())),
        Some(raw) => Err(anyhow!("invalid scheduler '{}'", raw)),
    }
}

/// Convert a `<param>` declaration into the generic value shape carried by
/// parameters-change messages.
pub fn param_value(decl: &ParamDecl) -> Result<serde_json::Value> {
    let raw = decl.value.as_str();
    Ok(match decl.type_name.as_str() {
        "int" | "i4" => serde_json::Value::from(
            raw.parse::<i64>()
                .map_err(|_| anyhow!("parameter '{}': '{}' is not an int", decl.name, raw))?,
        ),
        "double" => serde_json::Value::from(
            raw.parse::<f64>()
                .map_err(|_| anyhow!("parameter '{}': '{}' is not a double", decl.name, raw))?,
        ),
        "bool" | "boolean" => serde_json::Value::Bool(parse_flag(Some(raw), false)),
        "string" | "path" | "enum" => serde_json::Value::String(raw.to_string()),
        other => {
            return Err(anyhow!(
                "parameter '{}': unknown type '{}'",
                decl.name,
                other
            ))
        }
    })
}
