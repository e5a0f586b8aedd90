use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Server {server} is unreachable")]
    Unreachable { server: String },

    #[error("Server {server} rejected the stored credentials")]
    Unauthorized { server: String },

    #[error("Not signed in to server {server}")]
    NotSignedIn { server: String },

    #[error("Credentials file error: {0}")]
    Credentials(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
