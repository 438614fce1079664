use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fault classification attached to generic B-tree and filer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    GenericError,
    GenericCritical,
    CannotCreate,
    CannotRead,
    CannotWrite,
    KeyTooLarge,
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultCode::GenericError => "generic-error",
            FaultCode::GenericCritical => "generic-critical",
            FaultCode::CannotCreate => "cannot-create",
            FaultCode::CannotRead => "cannot-read",
            FaultCode::CannotWrite => "cannot-write",
            FaultCode::KeyTooLarge => "key-too-large",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("value not found: {value:?}")]
    NotFound { value: String },

    #[error("data corruption in {component}: page={page_num}, {details}")]
    Corruption {
        component: String,
        page_num: u64,
        details: String,
    },

    #[error("data corruption: {details}")]
    DataCorruption { details: String },

    #[error("btree error ({fault}): {message}")]
    BTree { fault: FaultCode, message: String },

    #[error("filer error ({fault}): {message}")]
    Filer { fault: FaultCode, message: String },

    #[error("value of {len} bytes exceeds the maximum key size of {max} bytes")]
    KeyTooLarge { len: usize, max: usize },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("page file is not open")]
    FileClosed,

    #[error("timed out waiting for a free file descriptor")]
    DescriptorTimeout,

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. } | Error::DataCorruption { .. })
    }

    pub(crate) fn not_found(value: &[u8]) -> Self {
        Error::NotFound {
            value: String::from_utf8_lossy(value).into_owned(),
        }
    }

    pub(crate) fn corrupt(component: &str, page_num: u64, details: impl Into<String>) -> Self {
        Error::Corruption {
            component: component.to_string(),
            page_num,
            details: details.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned {
            lock_name: "unknown".to_string(),
        }
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Error::DataCorruption {
            details: "failed to parse binary data".to_string(),
        }
    }
}

/// Lock acquisition that keeps going after another thread panicked.
///
/// Page and node state is rewritten as a whole under its lock, so the data
/// behind a poisoned lock is still structurally valid.
pub trait PoisonedLockExt<T> {
    fn recover_poison(self) -> T;
}

impl<T> PoisonedLockExt<T> for std::sync::LockResult<T> {
    fn recover_poison(self) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
