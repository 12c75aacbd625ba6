//! Result taxonomy shared by every fusion primitive.
//!
//! [`FusionError`] is what Rust callers see; [`ResultCode`] is its stable
//! numeric form, the only error channel that crosses a process or network
//! boundary.

use thiserror::Error;

pub type FusionResult<T> = Result<T, FusionError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FusionError {
    #[error("operation failed")]
    Failure,

    #[error("subsystem not initialised")]
    Init,

    #[error("internal invariant violated: {0}")]
    Bug(&'static str),

    #[error("reference count already reached zero")]
    Dead,

    #[error("permission denied")]
    AccessDenied,

    #[error("invalid argument: {0}")]
    InvArg(&'static str),

    #[error("out of local memory")]
    NoLocalMemory,

    #[error("out of shared memory (requested {requested} bytes)")]
    NoSharedMemory { requested: usize },

    #[error("resource is locked")]
    Locked,

    #[error("resource is busy")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("object or owning participant is gone")]
    Destroyed,

    #[error("shared memory or ipc failure: {0}")]
    Fusion(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("no such method {0}")]
    NoSuchMethod(u32),

    #[error("no such instance {0}")]
    NoSuchInstance(u32),

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("end of stream")]
    Eof,

    #[error("limit exceeded: {0}")]
    Limit(&'static str),
}

impl FusionError {
    pub fn fusion(msg: impl Into<String>) -> Self {
        FusionError::Fusion(msg.into())
    }

    /// Numeric code transmitted in replies and response packets.
    pub fn code(&self) -> ResultCode {
        match self {
            FusionError::Failure => ResultCode::Failure,
            FusionError::Init => ResultCode::Init,
            FusionError::Bug(_) => ResultCode::Bug,
            FusionError::Dead => ResultCode::Dead,
            FusionError::AccessDenied => ResultCode::AccessDenied,
            FusionError::InvArg(_) => ResultCode::InvArg,
            FusionError::NoLocalMemory => ResultCode::NoLocalMemory,
            FusionError::NoSharedMemory { .. } => ResultCode::NoSharedMemory,
            FusionError::Locked => ResultCode::Locked,
            FusionError::Busy => ResultCode::Busy,
            FusionError::Timeout => ResultCode::Timeout,
            FusionError::Destroyed => ResultCode::Destroyed,
            FusionError::Fusion(_) => ResultCode::Fusion,
            FusionError::Interrupted => ResultCode::Interrupted,
            FusionError::NoSuchMethod(_) => ResultCode::NoSuchMethod,
            FusionError::NoSuchInstance(_) => ResultCode::NoSuchInstance,
            FusionError::VersionMismatch { .. } => ResultCode::VersionMismatch,
            FusionError::Eof => ResultCode::Eof,
            FusionError::Limit(_) => ResultCode::Limit,
        }
    }
}

impl From<std::io::Error> for FusionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => FusionError::Eof,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => FusionError::Timeout,
            std::io::ErrorKind::Interrupted => FusionError::Interrupted,
            std::io::ErrorKind::PermissionDenied => FusionError::AccessDenied,
            std::io::ErrorKind::OutOfMemory => FusionError::NoLocalMemory,
            _ => FusionError::Fusion(err.to_string()),
        }
    }
}

/// Wire form of [`FusionError`]; `Ok` is zero.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok = 0,
    Failure = 1,
    Init = 2,
    Bug = 3,
    Dead = 4,
    AccessDenied = 5,
    InvArg = 6,
    NoLocalMemory = 7,
    NoSharedMemory = 8,
    Locked = 9,
    Busy = 10,
    Timeout = 11,
    Destroyed = 12,
    Fusion = 13,
    Interrupted = 14,
    NoSuchMethod = 15,
    NoSuchInstance = 16,
    VersionMismatch = 17,
    Eof = 18,
    Limit = 19,
}

impl ResultCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => ResultCode::Ok,
            1 => ResultCode::Failure,
            2 => ResultCode::Init,
            3 => ResultCode::Bug,
            4 => ResultCode::Dead,
            5 => ResultCode::AccessDenied,
            6 => ResultCode::InvArg,
            7 => ResultCode::NoLocalMemory,
            8 => ResultCode::NoSharedMemory,
            9 => ResultCode::Locked,
            10 => ResultCode::Busy,
            11 => ResultCode::Timeout,
            12 => ResultCode::Destroyed,
            13 => ResultCode::Fusion,
            14 => ResultCode::Interrupted,
            15 => ResultCode::NoSuchMethod,
            16 => ResultCode::NoSuchInstance,
            17 => ResultCode::VersionMismatch,
            18 => ResultCode::Eof,
            19 => ResultCode::Limit,
            _ => return None,
        })
    }

    /// Decodes a received code; unknown values degrade to `Failure`.
    pub fn from_wire(value: i32) -> Self {
        Self::from_i32(value).unwrap_or(ResultCode::Failure)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }

    /// Lifts a received code back into a Rust result. Context carried by the
    /// sending side (messages, sizes) does not survive the trip.
    pub fn into_result(self) -> FusionResult<()> {
        let err = match self {
            ResultCode::Ok => return Ok(()),
            ResultCode::Failure => FusionError::Failure,
            ResultCode::Init => FusionError::Init,
            ResultCode::Bug => FusionError::Bug("reported by peer"),
            ResultCode::Dead => FusionError::Dead,
            ResultCode::AccessDenied => FusionError::AccessDenied,
            ResultCode::InvArg => FusionError::InvArg("reported by peer"),
            ResultCode::NoLocalMemory => FusionError::NoLocalMemory,
            ResultCode::NoSharedMemory => FusionError::NoSharedMemory { requested: 0 },
            ResultCode::Locked => FusionError::Locked,
            ResultCode::Busy => FusionError::Busy,
            ResultCode::Timeout => FusionError::Timeout,
            ResultCode::Destroyed => FusionError::Destroyed,
            ResultCode::Fusion => FusionError::fusion("reported by peer"),
            ResultCode::Interrupted => FusionError::Interrupted,
            ResultCode::NoSuchMethod => FusionError::NoSuchMethod(0),
            ResultCode::NoSuchInstance => FusionError::NoSuchInstance(0),
            ResultCode::VersionMismatch => FusionError::VersionMismatch {
                expected: 0,
                found: 0,
            },
            ResultCode::Eof => FusionError::Eof,
            ResultCode::Limit => FusionError::Limit("reported by peer"),
        };
        Err(err)
    }
}

impl<T> From<&FusionResult<T>> for ResultCode {
    fn from(result: &FusionResult<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Ok,
            Err(err) => err.code(),
        }
    }
}

/// Reports a violated internal invariant.
///
/// Debug builds abort through `panic!`; release builds log and return
/// `Err(FusionError::Bug)` from the enclosing function.
#[macro_export]
macro_rules! fusion_bug {
    ($msg:literal) => {{
        if cfg!(debug_assertions) {
            panic!(concat!("fusion bug: ", $msg));
        }
        $crate::__tracing::error!(concat!("fusion bug: ", $msg));
        return Err($crate::FusionError::Bug($msg));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_survive_the_wire() {
        for raw in 0..=19 {
            let code = ResultCode::from_i32(raw).expect("known code");
            assert_eq!(code.as_i32(), raw);
        }
        assert_eq!(ResultCode::from_wire(-7), ResultCode::Failure);
    }

    #[test]
    fn error_maps_to_code_and_back() {
        let err = FusionError::NoSuchMethod(9);
        assert_eq!(err.code(), ResultCode::NoSuchMethod);
        assert_eq!(
            err.code().into_result(),
            Err(FusionError::NoSuchMethod(0))
        );
        assert!(ResultCode::Ok.into_result().is_ok());
    }

    #[test]
    fn io_errors_fold_into_taxonomy() {
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(FusionError::from(eof), FusionError::Eof);
        let other = std::io::Error::other("boom");
        assert_eq!(FusionError::from(other).code(), ResultCode::Fusion);
    }
}
