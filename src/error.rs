use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid window: `{0}`")]
    InvalidWindow(String),
    #[error("invalid table name: `{0}`")]
    InvalidTableName(String),
    #[error("malformed bucket key: `{0}`")]
    MalformedKey(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] Box<dyn std::error::Error + Sync + Send + 'static>),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Anyhow(anyhow::Error),
}

impl Error {
    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    /// Wraps a backend/transport failure without altering it.
    #[inline]
    pub fn store<E>(e: E) -> Self
    where
        E: std::error::Error + Sync + Send + 'static,
    {
        Self::StoreUnavailable(Box::new(e))
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Self::Msg(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Self::Msg(e.to_owned())
    }
}

impl From<anyhow::Error> for Error {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        Error::Anyhow(e)
    }
}
