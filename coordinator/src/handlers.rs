//! Business handlers the hub routes MESSAGE envelopes to

use log::info;
use shared::envelope::UNKNOWN;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Message type carrying a freshly filed report
pub const NEW_REPORT: &str = "NEW_REPORT";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid integer: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Processes the payload of one message type
pub trait MessageHandler: Send + Sync {
    fn handle(&self, data: &HashMap<String, String>) -> Result<(), HandlerError>;
}

/// A report filed on one instance, as announced to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportNotice {
    pub id: i64,
    pub reporter_uuid: String,
    pub reporter_name: String,
    pub reported_uuid: String,
    pub reported_name: String,
    pub reason: String,
    pub server_name: String,
    pub status: String,
}

impl ReportNotice {
    pub fn from_fields(data: &HashMap<String, String>) -> Result<Self, HandlerError> {
        let required = |field: &'static str| {
            data.get(field)
                .cloned()
                .ok_or(HandlerError::MissingField(field))
        };
        let optional = |field: &str| {
            data.get(field)
                .cloned()
                .unwrap_or_else(|| UNKNOWN.to_string())
        };

        let id_text = required("id")?;
        let id = id_text
            .trim()
            .parse()
            .map_err(|_| HandlerError::InvalidNumber {
                field: "id",
                value: id_text.clone(),
            })?;

        Ok(Self {
            id,
            reporter_uuid: optional("reporter_uuid"),
            reporter_name: required("reporter_name")?,
            reported_uuid: optional("reported_uuid"),
            reported_name: required("reported_name")?,
            reason: required("reason")?,
            server_name: optional("server_name"),
            status: optional("status"),
        })
    }

    /// One-line announcement shown to observers
    pub fn summary(&self) -> String {
        format!(
            "[Reports] {} has reported {} for: {} on server: {}",
            self.reporter_name, self.reported_name, self.reason, self.server_name
        )
    }
}

/// Destination for report announcements
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: &ReportNotice) -> Result<(), HandlerError>;
}

/// Announces reports through the log
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notice: &ReportNotice) -> Result<(), HandlerError> {
        info!("{}", notice.summary());
        Ok(())
    }
}

/// Keeps every notice it receives
#[derive(Debug, Default)]
pub struct CollectingSink {
    notices: Mutex<Vec<ReportNotice>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<ReportNotice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, notice: &ReportNotice) -> Result<(), HandlerError> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice.clone());
        Ok(())
    }
}

impl<S: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<S> {
    fn notify(&self, notice: &ReportNotice) -> Result<(), HandlerError> {
        (**self).notify(notice)
    }
}

/// Handles NEW_REPORT by forwarding the parsed notice to a sink
pub struct ReportBroadcaster<S> {
    sink: S,
}

impl<S: NotificationSink> ReportBroadcaster<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S: NotificationSink> MessageHandler for ReportBroadcaster<S> {
    fn handle(&self, data: &HashMap<String, String>) -> Result<(), HandlerError> {
        let notice = ReportNotice::from_fields(data)?;
        info!(
            "Processing report #{} from server {}",
            notice.id, notice.server_name
        );
        self.sink.notify(&notice)
    }
}
