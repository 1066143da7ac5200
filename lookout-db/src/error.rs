use thiserror::Error;
use tokio_rusqlite::rusqlite;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("database is closed")]
    Closed,

    #[error("server not found")]
    ServerNotFound,

    #[error("player not found")]
    PlayerNotFound,
}

impl DbError {
    /// Whether this error means the gateway is unavailable rather than the request being wrong.
    /// Statement failures reported through the connection (constraint violations and the
    /// like) are about the request and do not count.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            DbError::Closed | DbError::Connection(tokio_rusqlite::Error::ConnectionClosed)
        )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
