use crate::error::HandlerError;
use crate::fsutil::write_atomic;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    Transitioning,
    Success,
    Error,
}

/// Surfaces an operation's progress to the host.
pub trait StatusReporter {
    fn report(
        &self,
        seq: u64,
        operation: &str,
        status: StatusType,
        message: &str,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport<'a> {
    version: f64,
    #[serde(rename = "timestampUTC")]
    timestamp_utc: String,
    status: StatusBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    name: &'a str,
    operation: &'a str,
    status: StatusType,
    formatted_message: FormattedMessage<'a>,
}

#[derive(Debug, Serialize)]
struct FormattedMessage<'a> {
    lang: &'a str,
    message: &'a str,
}

/// Writes `<status_folder>/<seq>.status` files the host agent polls.
pub struct FileStatusReporter {
    status_folder: PathBuf,
    name: String,
}

impl FileStatusReporter {
    pub fn new(status_folder: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            status_folder: status_folder.into(),
            name: name.into(),
        }
    }

    pub fn status_path(&self, seq: u64) -> PathBuf {
        self.status_folder.join(format!("{seq}.status"))
    }
}

impl StatusReporter for FileStatusReporter {
    fn report(
        &self,
        seq: u64,
        operation: &str,
        status: StatusType,
        message: &str,
    ) -> Result<(), HandlerError> {
        let report = [StatusReport {
            version: 1.0,
            timestamp_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            status: StatusBody {
                name: &self.name,
                operation,
                status,
                formatted_message: FormattedMessage {
                    lang: "en",
                    message,
                },
            },
        }];
        let content = serde_json::to_string(&report)?;
        write_atomic(&self.status_path(seq), &content)
            .map_err(|err| HandlerError::Status(err.to_string()))
    }
}
