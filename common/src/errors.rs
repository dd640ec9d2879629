use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Tipo de error guardado en una tarea terminada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Una dependencia referenciada no existe.
    DependencyResolution,
    /// Una dependencia terminó en un estado distinto de success.
    DependencyFailed,
    /// No se pudo resolver el pattern (o la función) de la tarea.
    PatternMissing,
    /// El pattern retornó sin marcar success ni error.
    PatternIncomplete,
    /// Error levantado por el cuerpo de la tarea; guarda el nombre del tipo.
    Raised(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::DependencyResolution => f.write_str("DependencyResolutionError"),
            FailureKind::DependencyFailed => f.write_str("DependencyFailedError"),
            FailureKind::PatternMissing => f.write_str("PatternMissingError"),
            FailureKind::PatternIncomplete => f.write_str("PatternIncompleteError"),
            FailureKind::Raised(name) => f.write_str(name),
        }
    }
}

/// Error terminal de una tarea. Se serializa tal cual en el broker y el
/// future lo devuelve con el mismo tipo y mensaje.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn raised(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Raised(type_name.into()), message)
    }

    pub fn dependency_resolution(missing: TaskId) -> Self {
        Self::new(
            FailureKind::DependencyResolution,
            format!("task {} does not exist", missing),
        )
    }

    pub fn dependency_failed(dep: TaskId, status: TaskStatus) -> Self {
        Self::new(
            FailureKind::DependencyFailed,
            format!("task {} has status {}", dep, status),
        )
    }

    pub fn pattern_missing(name: &str) -> Self {
        Self::new(
            FailureKind::PatternMissing,
            format!("cannot resolve pattern {:?}", name),
        )
    }

    pub fn pattern_incomplete(status: TaskStatus) -> Self {
        Self::new(
            FailureKind::PatternIncomplete,
            format!("pattern returned while task was still {}", status),
        )
    }

    /// Convierte un error de un handler en el error que se guarda.
    /// Si ya es un `TaskFailure` se respeta su tipo.
    pub fn from_handler_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<TaskFailure>() {
            Some(failure) => failure.clone(),
            None => Self::raised("Error", format!("{:#}", err)),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no broker for scheme {0:?}")]
    UnknownScheme(String),

    #[error("invalid broker url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("broker state lock poisoned")]
    Poisoned,

    #[error("broker was dropped")]
    Closed,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote broker returned status {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for BrokerError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        BrokerError::Poisoned
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("dependency cycle through prototype {0}")]
    DependencyCycle(usize),

    #[error("could not resolve {remaining} prototypes (unresolvable dependency)")]
    Unresolvable { remaining: usize },

    #[error("unknown prototype {0}")]
    UnknownPrototype(usize),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum FutureError {
    /// La tarea todavía no termina (pending, creating, paused).
    #[error("task {id} is incomplete (status {status})")]
    Incomplete { id: TaskId, status: TaskStatus },

    #[error("task {id} failed: {failure}")]
    Failed { id: TaskId, failure: TaskFailure },

    #[error("task {0} was killed")]
    Killed(TaskId),

    #[error("timed out waiting for task {0}")]
    Timeout(TaskId),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl FutureError {
    /// El error guardado por la tarea, si lo hay.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            FutureError::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}
