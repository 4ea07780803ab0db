use relonar_nar::NarError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchNarError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Nar(#[from] NarError),

    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker pool failure: {0}")]
    Worker(String),
}

impl PatchNarError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}
