//! Relay errors. Every variant is fatal to a run; per-event problems are logged instead.

use crate::providers::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("error sending message: {0}")]
    Send(#[source] ProviderError),
    #[error("error adding watch marker to message {id}: {source}")]
    Marker {
        id: String,
        #[source]
        source: ProviderError,
    },
    #[error("message {0} is already being tracked")]
    DuplicateId(String),
    #[error("reading input: {0}")]
    Input(#[source] std::io::Error),
    #[error("writing output: {0}")]
    Output(#[source] std::io::Error),
}
