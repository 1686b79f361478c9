use std::time::Duration;

/// Every fallible operation in the crate returns one of these kinds.
///
/// Backend errors from [bollard] and [kube] convert through `From`, keeping
/// daemon 404s and API 404s on the `NotFound` kind so callers can
/// distinguish "gone" from "broken".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected at the configuration boundary, before any backend call.
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    /// A Kubernetes access review denied a verb before the operation ran.
    #[error("permission denied: cannot {verb} {resource} in namespace {namespace}")]
    Permission {
        verb: String,
        resource: String,
        namespace: String,
    },

    /// The daemon or the cluster rejected an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// A blocking wait exceeded its budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    /// An illegal transition was requested, or an operation requires a
    /// state the container does not hold.
    #[error("container state error: {0}")]
    State(String),

    /// Exec-based file transfer exited non-zero or wrote to stderr.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// A Kaniko or daemon image build failed.
    #[error("image build failed: {0}")]
    Build(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Whether this error is the timeout kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message),
            other => Self::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
