use fusion::{FusionError, ResultCode};
use thiserror::Error;

pub type VoodooResult<T> = Result<T, VoodooError>;

/// Failures of the network layer. Everything that crosses the wire is a
/// [`ResultCode`]; this type adds what only the local side can see.
#[derive(Debug, Error)]
pub enum VoodooError {
    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl VoodooError {
    pub fn code(&self) -> ResultCode {
        match self {
            VoodooError::Fusion(err) => err.code(),
            VoodooError::Io(_) | VoodooError::ConnectionLost(_) => ResultCode::Fusion,
            VoodooError::Closed => ResultCode::Destroyed,
            VoodooError::Malformed(_) => ResultCode::InvArg,
        }
    }

    /// Whether the connection cannot be used after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoodooError::Fusion(_))
    }
}

impl From<VoodooError> for FusionError {
    fn from(err: VoodooError) -> Self {
        match err {
            VoodooError::Fusion(err) => err,
            VoodooError::Closed => FusionError::Destroyed,
            VoodooError::Malformed(what) => FusionError::InvArg(what),
            other => FusionError::fusion(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_fusion_taxonomy() {
        assert_eq!(
            VoodooError::from(FusionError::NoSuchMethod(4)).code(),
            ResultCode::NoSuchMethod
        );
        assert_eq!(VoodooError::Closed.code(), ResultCode::Destroyed);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(VoodooError::from(io).code(), ResultCode::Fusion);
    }

    #[test]
    fn only_protocol_errors_are_fatal() {
        assert!(!VoodooError::Fusion(FusionError::Busy).is_fatal());
        assert!(VoodooError::Closed.is_fatal());
        assert_eq!(FusionError::from(VoodooError::Closed), FusionError::Destroyed);
    }
}
