//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadht crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Id is not 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id is not a 40 characters hex string.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Compact nodes info is not a multiple of 26 bytes.
    #[error("Invalid nodes size: {0}")]
    InvalidNodesSize(usize),

    /// Indicates that the message transaction_id is not two bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),
}
