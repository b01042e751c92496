use std::fmt;

use rolegate_core::sync::EngineError;

#[derive(Debug)]
pub enum ClientError {
    Connection(String),
    InvalidArgument(String),
    PermissionDenied(String),
    Unauthenticated(String),
    Internal(String),
    Rejected(&'static str),
    Timeout,
    Status(tonic::Status),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connection(msg) => write!(f, "connection error: {msg}"),
            ClientError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ClientError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            ClientError::Unauthenticated(msg) => write!(f, "unauthenticated: {msg}"),
            ClientError::Internal(msg) => write!(f, "internal error: {msg}"),
            ClientError::Rejected(rpc) => write!(f, "{rpc} returned false"),
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::Status(status) => write!(f, "grpc status: {status}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::PermissionDenied => {
                ClientError::PermissionDenied(status.message().to_string())
            }
            tonic::Code::Unauthenticated => {
                ClientError::Unauthenticated(status.message().to_string())
            }
            tonic::Code::InvalidArgument => {
                ClientError::InvalidArgument(status.message().to_string())
            }
            tonic::Code::DeadlineExceeded => ClientError::Timeout,
            tonic::Code::Internal => ClientError::Internal(status.message().to_string()),
            tonic::Code::Unavailable => ClientError::Connection(status.message().to_string()),
            _ => ClientError::Status(status),
        }
    }
}

impl From<ClientError> for EngineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Connection(_) | ClientError::Timeout => {
                EngineError::Unavailable(err.to_string())
            }
            other => EngineError::Rejected(other.to_string()),
        }
    }
}
