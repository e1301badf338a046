//! Error types for ringproxy

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// One shard's contribution to a fan-out failure.
#[derive(Debug)]
pub struct ShardFailure {
    pub pnode: String,
    pub error: Error,
}

#[derive(Error, Debug)]
pub enum Error {
    // === Caller Errors ===
    #[error("{0}")]
    InvalidArgument(String),

    #[error("unsupported RPC method: \"{0}\"")]
    UnsupportedMethod(String),

    #[error("{0}")]
    Unsupported(String),

    // === Placement Errors ===
    #[error("some vnodes are in read-only mode: {}", .pnodes.join(", "))]
    ReadOnly { pnodes: Vec<String> },

    #[error("routing invariant violated: {0}")]
    RoutingInvariant(String),

    #[error("unable to initialize data director ({stage}): {source}")]
    Topology {
        stage: &'static str,
        source: Box<Error>,
    },

    // === Shard Errors ===
    /// Error reported by a shard; name and message are forwarded untouched.
    #[error("{message}")]
    Backend { name: String, message: String },

    #[error("{}", describe_failures(.0))]
    Multi(Vec<ShardFailure>),

    // === Transport Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_failures(failures: &[ShardFailure]) -> String {
    let detail: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.pnode, f.error))
        .collect();
    format!(
        "{} shard{} failed: {}",
        failures.len(),
        if failures.len() == 1 { "" } else { "s" },
        detail.join("; ")
    )
}

impl Error {
    /// Stable error name sent to callers.
    pub fn name(&self) -> &str {
        match self {
            Error::InvalidArgument(_) => "InvocationError",
            Error::UnsupportedMethod(_) => "UnsupportedMethodError",
            Error::Unsupported(_) => "NotSupportedError",
            Error::ReadOnly { .. } => "ReadOnlyError",
            Error::RoutingInvariant(_) | Error::Internal(_) => "InternalError",
            Error::Topology { .. } => "TopologyError",
            Error::Backend { name, .. } => name,
            Error::Multi(_) => "MultiError",
            Error::Io(_) | Error::Http(_) => "TransportError",
            Error::Json(_) => "SerializationError",
            Error::InvalidConfig(_) => "ConfigError",
        }
    }

    pub fn backend(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True if this error, or any shard failure inside it, carries `name`.
    pub fn has_cause_named(&self, name: &str) -> bool {
        if self.name() == name {
            return true;
        }
        match self {
            Error::Multi(failures) => failures.iter().any(|f| f.error.has_cause_named(name)),
            Error::Topology { source, .. } => source.has_cause_named(name),
            _ => false,
        }
    }

    /// Convert to the JSON error representation
    pub fn to_wire(&self) -> WireError {
        let mut wire = WireError {
            name: self.name().to_string(),
            message: self.to_string(),
            pnode: None,
            pnodes: Vec::new(),
            causes: Vec::new(),
        };
        match self {
            Error::ReadOnly { pnodes } => wire.pnodes = pnodes.clone(),
            Error::Multi(failures) => {
                wire.causes = failures
                    .iter()
                    .map(|f| {
                        let mut cause = f.error.to_wire();
                        cause.pnode = Some(f.pnode.clone());
                        cause
                    })
                    .collect();
            }
            _ => {}
        }
        wire
    }
}

/// Error as carried in an RPC error event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pnodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<WireError>,
}

impl WireError {
    /// Errors received from a shard are never reinterpreted, whatever their name.
    pub fn into_error(self) -> Error {
        Error::Backend {
            name: self.name,
            message: self.message,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_names_pnodes() {
        let err = Error::ReadOnly {
            pnodes: vec!["tcp://a:2020".into(), "tcp://b:2020".into()],
        };
        assert_eq!(err.name(), "ReadOnlyError");
        assert_eq!(
            err.to_string(),
            "some vnodes are in read-only mode: tcp://a:2020, tcp://b:2020"
        );
        assert_eq!(err.to_wire().pnodes.len(), 2);
    }

    #[test]
    fn test_backend_name_is_preserved() {
        let err = Error::backend("ObjectNotFoundError", "o1/b1/x does not exist");
        assert_eq!(err.name(), "ObjectNotFoundError");

        let back = err.to_wire().into_error();
        assert_eq!(back.name(), "ObjectNotFoundError");
        assert_eq!(back.to_string(), "o1/b1/x does not exist");
    }

    #[test]
    fn test_multi_keeps_every_cause() {
        let err = Error::Multi(vec![
            ShardFailure {
                pnode: "tcp://a:2020".into(),
                error: Error::backend("BucketNotFoundError", "a"),
            },
            ShardFailure {
                pnode: "tcp://c:2020".into(),
                error: Error::backend("EtagConflictError", "c"),
            },
        ]);

        assert_eq!(err.name(), "MultiError");
        assert!(err.has_cause_named("BucketNotFoundError"));
        assert!(err.has_cause_named("EtagConflictError"));
        assert!(!err.has_cause_named("ObjectNotFoundError"));

        let wire = err.to_wire();
        assert_eq!(wire.causes.len(), 2);
        assert_eq!(wire.causes[1].pnode.as_deref(), Some("tcp://c:2020"));
        assert!(err.to_string().starts_with("2 shards failed"));
    }
}
