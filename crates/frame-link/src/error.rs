use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The publisher could not listen on the requested address.
    #[error("failed to bind broadcast listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode channel message")]
    Encode(#[source] serde_json::Error),

    #[error("malformed channel message")]
    Decode(#[source] serde_json::Error),
}
