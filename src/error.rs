use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{message}: {source}")]
    StateDir {
        message: String,
        #[source]
        source: io::Error,
    },
    #[error("{message}: {source}")]
    SeqNum {
        message: String,
        #[source]
        source: io::Error,
    },
    #[error("state directory could not be migrated: {0}")]
    Migration(String),
    #[error("failed to download file[{index}]: {message}")]
    Download { index: usize, message: String },
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to write status: {0}")]
    Status(String),
    #[error("unrecognized command: {0}")]
    UnknownCommand(String),
    #[error("{context}: {source}")]
    Stage {
        context: String,
        #[source]
        source: Box<HandlerError>,
    },
}

impl HandlerError {
    pub fn state_dir(message: impl Into<String>, source: io::Error) -> Self {
        Self::StateDir {
            message: message.into(),
            source,
        }
    }

    pub fn seqnum(message: impl Into<String>, source: io::Error) -> Self {
        Self::SeqNum {
            message: message.into(),
            source,
        }
    }

    /// Prefixes the error with the stage that produced it.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Stage {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_context_prefixes_message() {
        let err = HandlerError::Download {
            index: 2,
            message: "HTTP 404".to_string(),
        }
        .context("processing file downloads failed");
        assert_eq!(
            err.to_string(),
            "processing file downloads failed: failed to download file[2]: HTTP 404"
        );
    }
}
