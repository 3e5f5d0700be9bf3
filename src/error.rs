use std::io;

use thiserror::Error;

use crate::{buffer::BufferError, config::ConfigError, nvm::NvmError};

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("buffer `{name}`: {source}")]
    Buffer {
        name: String,
        #[source]
        source: BufferError<u64, NvmError>,
    },

    #[error(transparent)]
    Nvm(#[from] NvmError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot write stats: {0}")]
    Stats(#[from] serde_json::Error),

    #[error("bad arguments: {0}")]
    Args(#[from] pico_args::Error),

    #[error("{0}")]
    Usage(&'static str),
}
