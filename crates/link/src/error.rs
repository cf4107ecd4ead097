use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no transport endpoint known for peer {0}")]
    UnknownPeer(String),
    /// The operation was interrupted by a local close or cancel request.
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LinkError {
    pub(crate) fn spawn(name: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| LinkError::Spawn { name, source }
    }
}
