//! Wire types between the daemon and its worker.
//!
//! Both directions are newline-delimited JSON over the worker's stdio:
//! capture requests on stdin, lifecycle events on stdout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const SAVE_POINT_CLOUD: &str = "save_point_cloud";

/// Stand-in for a missing request field, in logs and capture paths.
pub const PLACEHOLDER: &str = "X";

/// A capture command. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_number: Option<i64>,
}

impl CaptureRequest {
    pub fn save_point_cloud(line_name: &str, row_number: i64, capture_number: i64) -> Self {
        Self {
            action: Some(SAVE_POINT_CLOUD.to_string()),
            line_name: Some(line_name.to_string()),
            row_number: Some(row_number),
            capture_number: Some(capture_number),
        }
    }

    pub fn line_label(&self) -> String {
        self.line_name
            .as_deref()
            .map(path_segment)
            .unwrap_or_else(|| PLACEHOLDER.to_string())
    }

    pub fn row_label(&self) -> String {
        label(self.row_number)
    }

    pub fn capture_label(&self) -> String {
        label(self.capture_number)
    }

    /// `<root>/<line_name>/row_<row_number>/capture_<capture_number>`
    pub fn capture_dir(&self, root: &Path) -> PathBuf {
        root.join(self.line_label())
            .join(format!("row_{}", self.row_label()))
            .join(format!("capture_{}", self.capture_label()))
    }
}

impl fmt::Display for CaptureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} line={} row={} capture={}",
            self.action.as_deref().unwrap_or(PLACEHOLDER),
            self.line_label(),
            self.row_label(),
            self.capture_label()
        )
    }
}

fn label(value: Option<i64>) -> String {
    value.map_or_else(|| PLACEHOLDER.to_string(), |v| v.to_string())
}

/// A line name as a single path component: separators are replaced and
/// names that would step out of the capture root collapse to the placeholder.
fn path_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => PLACEHOLDER.to_string(),
        _ => cleaned,
    }
}

/// Worker lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Discovery finished; `cameras` are the identities that came up, in
    /// capture index order.
    Ready { cameras: Vec<String> },
    /// Every camera has been shut down.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_request_path() {
        let req: CaptureRequest = serde_json::from_str(
            r#"{"action":"save_point_cloud","line_name":"rowA","row_number":2,"capture_number":0}"#,
        )
        .unwrap();
        assert_eq!(req, CaptureRequest::save_point_cloud("rowA", 2, 0));
        assert_eq!(
            req.capture_dir(Path::new("/pc")),
            PathBuf::from("/pc/rowA/row_2/capture_0")
        );
    }

    #[test]
    fn test_missing_fields_use_placeholder() {
        let req: CaptureRequest = serde_json::from_str(r#"{"action":"save_point_cloud"}"#).unwrap();
        assert_eq!(
            req.capture_dir(Path::new("/pc")),
            PathBuf::from("/pc/X/row_X/capture_X")
        );
        assert_eq!(req.to_string(), "save_point_cloud line=X row=X capture=X");
    }

    #[test]
    fn test_line_name_cannot_escape_root() {
        let mut req = CaptureRequest::save_point_cloud("../etc", 1, 1);
        assert_eq!(req.line_label(), ".._etc");
        req.line_name = Some("..".to_string());
        assert_eq!(req.line_label(), PLACEHOLDER);
    }

    #[test]
    fn test_event_wire_format() {
        let ready = WorkerEvent::Ready {
            cameras: vec!["10.95.76.11".to_string()],
        };
        assert_eq!(
            serde_json::to_string(&ready).unwrap(),
            r#"{"event":"ready","cameras":["10.95.76.11"]}"#
        );
        assert_eq!(
            serde_json::to_string(&WorkerEvent::Stopped).unwrap(),
            r#"{"event":"stopped"}"#
        );
    }
}
