use std::borrow::Cow;

#[derive(thiserror::Error, Debug)]
pub enum SystemError {
    #[error("Invalid Argument: {0}")]
    InvalidArgument(Cow<'static, str>),
    #[error("Not Found: {0}")]
    NotFound(Cow<'static, str>),
    #[error("Max number of members is exceeded")]
    MaxMembersExceeded,
    #[error("Cannot remove chat owner")]
    CannotRemoveOwner,
    #[error("ID Generation Failed: {0}")]
    IdGenerationFailed(Cow<'static, str>),
    #[error("Nested transactions are not supported")]
    NestedTransactionNotSupported,
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    // sqlx errors
    #[error("Database Conflict: {0:?}")]
    Conflict(Option<DbErrorMeta>),
    #[error("Storage Failure in {op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    // environment
    #[error("Configuration Error: {0}")]
    Config(Cow<'static, str>),
    #[error("Internal System Error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug)]
pub struct DbErrorMeta {
    pub code: Option<String>,
    pub constraint: Option<String>,
    pub message: String,
}

impl SystemError {
    pub fn invalid_argument(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn id_generation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::IdGenerationFailed(msg.into())
    }

    pub fn config(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::InternalError(err.into())
    }

    /// Wraps a backend fault with the name of the operation that hit it.
    pub fn storage(op: &'static str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some("23505") => {
                    log::error!("{op}: unique violation: {:?}", db_err);
                    return SystemError::Conflict(Some(DbErrorMeta {
                        code: db_err.code().map(|s| s.to_string()),
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }));
                }
                Some("23503") => {
                    log::error!("{op}: foreign key violation: {:?}", db_err);
                    return SystemError::not_found(format!("Chat not found ({op})"));
                }
                _ => {}
            }
        }
        log::error!("{op}: {:?}", err);
        SystemError::Storage { op, source: err }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SystemError::NotFound(_))
    }
}

pub trait StorageResultExt<T> {
    fn op(self, op: &'static str) -> Result<T, SystemError>;
}

impl<T> StorageResultExt<T> for Result<T, sqlx::Error> {
    fn op(self, op: &'static str) -> Result<T, SystemError> {
        self.map_err(|err| SystemError::storage(op, err))
    }
}
