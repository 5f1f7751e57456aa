use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("delta cursor rejected: {0}")]
    CursorInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("database integrity error: {0}")]
    Integrity(String),

    #[error("schema migration failed: {0}")]
    Schema(String),

    #[error("blocked by security screen: {0}")]
    Security(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Auth(_) => "auth",
            Self::Network(_) => "network",
            Self::Throttled(_) => "throttled",
            Self::CursorInvalid(_) => "cursor_invalid",
            Self::NotFound(_) => "not_found",
            Self::Filesystem(_) => "filesystem",
            Self::Integrity(_) => "integrity",
            Self::Schema(_) => "schema",
            Self::Security(_) => "security",
            Self::Cancelled => "cancelled",
            Self::Fatal(_) => "fatal",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Auth(_) => 3,
            Self::Network(_) | Self::Throttled(_) | Self::CursorInvalid(_) => 4,
            Self::Filesystem(_) | Self::NotFound(_) => 5,
            Self::Integrity(_) | Self::Schema(_) => 6,
            Self::Cancelled => 130,
            Self::Security(_) | Self::Fatal(_) => 1,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Filesystem(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Integrity(err.to_string())
            }
            _ => Self::Fatal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(Error::Config("bad yaml".into()).exit_code(), 2);
        assert_eq!(Error::Auth("no token".into()).exit_code(), 3);
        assert_eq!(Error::Network("refused".into()).exit_code(), 4);
        assert_eq!(Error::Filesystem("denied".into()).exit_code(), 5);
        assert_eq!(Error::Integrity("unique".into()).exit_code(), 6);
        assert_eq!(Error::Cancelled.exit_code(), 130);
        assert_eq!(Error::Fatal("boom".into()).exit_code(), 1);
    }

    #[test]
    fn io_errors_become_filesystem() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, Error::Filesystem(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn constraint_violations_become_integrity() {
        let sqlite = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed".into()),
        );
        let err: Error = sqlite.into();
        assert!(matches!(err, Error::Integrity(_)));
    }
}
