use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

impl DatabaseError {
    /// Pool exhaustion and dropped connections clear up on their own; query
    /// and schema errors do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DatabaseError::Connection(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }
}
