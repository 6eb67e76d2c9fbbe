//! Error types for Kadmesh

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Random source failure: {0}")]
    Random(String),
}

pub type Result<T> = std::result::Result<T, Error>;
