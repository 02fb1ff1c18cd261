//! Plugin-side client errors.
//!
//! The host's error taxonomy (component C1, spec §7) lives in `meshplane-core::error`;
//! this is the smaller, client-facing counterpart raised by [`crate::client::PluginClient`]
//! when talking to the host.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("handshake rejected: {message}")]
    HandshakeRejected { message: String },

    #[error("not registered with host yet")]
    NotRegistered,

    #[error("host returned unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}
