//! Positional argument schemas
//!
//! Every RPC method declares its arguments as an ordered list of
//! `(name, kind)`. Validation stops at the first violation.

use crate::common::{Error, Result};
use crate::shard::client::{BatchOp, BatchRequest};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Number,
    Object,
    Array,
    Boolean,
}

impl ArgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Number => "number",
            ArgKind::Object => "object",
            ArgKind::Array => "array",
            ArgKind::Boolean => "boolean",
        }
    }

    /// `Object` also accepts arrays (sharks lists are declared as objects);
    /// `Array` accepts nothing else.
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Number => value.is_number(),
            ArgKind::Object => value.is_object() || value.is_array(),
            ArgKind::Array => value.is_array(),
            ArgKind::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
}

pub const fn arg(name: &'static str, kind: ArgKind) -> ArgSpec {
    ArgSpec { name, kind }
}

/// Kind reported back to callers. Arrays and null report as "object",
/// which is what clients of this protocol have always been shown.
pub fn observed_kind(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}

pub fn validate(method: &str, schema: &[ArgSpec], args: &[Value]) -> Result<()> {
    let len = schema.len();
    if args.len() != len {
        return Err(Error::InvalidArgument(format!(
            "{} expects {} argument{}",
            method,
            len,
            if len == 1 { "" } else { "s" }
        )));
    }

    for (i, (spec, value)) in schema.iter().zip(args).enumerate() {
        if spec.kind == ArgKind::Object && value.is_null() {
            return Err(Error::InvalidArgument(format!(
                "{} expects \"{}\" (args[{}]) to be an object but received the value \"null\"",
                method, spec.name, i
            )));
        }
        if !spec.kind.accepts(value) {
            return Err(Error::InvalidArgument(format!(
                "{} expects \"{}\" (args[{}]) to be of type {} but received type {} instead",
                method,
                spec.name,
                i,
                spec.kind,
                observed_kind(value)
            )));
        }
    }
    Ok(())
}

/// Check and decode the elements of a batch
pub fn batch_requests(method: &str, requests: &Value) -> Result<Vec<BatchRequest>> {
    let items = match requests.as_array() {
        Some(items) if !items.is_empty() => items,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "{} expects \"requests\" (args[0]) to be an array with at least one request \
                 but received an empty array",
                method
            )))
        }
    };

    items
        .iter()
        .map(|item| -> Result<BatchRequest> {
            let operation = match item.get("operation") {
                None | Some(Value::Null) => BatchOp::Put,
                Some(op) => op.as_str().and_then(BatchOp::parse).ok_or_else(|| {
                    Error::InvalidArgument(format!("{} is not an allowed batch operation", op))
                })?,
            };
            let key = item.get("key").and_then(Value::as_str).ok_or_else(|| {
                Error::InvalidArgument("all batch requests must have a \"key\"".into())
            })?;
            let bucket = item.get("bucket").and_then(Value::as_str).ok_or_else(|| {
                Error::InvalidArgument("all batch requests must have a \"bucket\"".into())
            })?;
            Ok(BatchRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
                operation,
                value: item.get("value").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}
