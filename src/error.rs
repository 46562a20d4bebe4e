use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    Conflict(String),

    #[error("Failed to render {chart}: {message}")]
    Render { chart: String, message: String },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Watch for {identity} did not sync within {timeout:?}")]
    SyncTimeout { identity: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to fetch template source: {0}")]
    Fetch(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn render(chart: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Render {
            chart: chart.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409 && e.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube(_) | Error::Watch(_) | Error::Transport(_) | Error::Http(_) => "transport",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Render { .. } | Error::Yaml(_) => "render",
            Error::Configuration(_) | Error::MissingField(_) => "configuration",
            Error::SyncTimeout { .. } => "sync_timeout",
            Error::Fetch(_) | Error::Io(_) => "fetch",
            Error::Serialization(_) | Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
