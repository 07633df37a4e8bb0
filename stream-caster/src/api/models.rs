//! API request and response bodies.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::caster::{
    ActiveStreamInfo, BandwidthTable, BranchReport, SourceSelector, StartStreamRequest,
    StartStreamResponse, StreamId, StreamStatus,
};

/// How the `file` field of a start request is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    /// Object name in the media store; omitted picks a random object.
    #[default]
    File,
    /// HTTP(S) URL downloaded before streaming.
    Url,
}

/// Body of `POST /start-stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartStreamBody {
    #[serde(default)]
    pub input_type: InputType,
    #[serde(default)]
    pub file: Option<String>,
    /// Seconds to stream.
    pub duration: u64,
    pub destination: Vec<String>,
    /// Seconds to wait before acquiring the source.
    #[serde(default)]
    pub start_offset: u64,
    #[serde(default)]
    pub redundant: bool,
}

impl StartStreamBody {
    pub fn into_request(self) -> StartStreamRequest {
        let file = self.file.filter(|f| !f.trim().is_empty());
        let source = match (self.input_type, file) {
            (InputType::Url, Some(url)) => SourceSelector::Url(url),
            (InputType::Url, None) => SourceSelector::Url(String::new()),
            (InputType::File, Some(name)) => SourceSelector::File(name),
            (InputType::File, None) => SourceSelector::Any,
        };
        StartStreamRequest {
            source,
            duration_secs: self.duration,
            destinations: self.destination,
            start_offset_secs: self.start_offset,
            redundant: self.redundant,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StartStreamResponseBody {
    pub status: &'static str,
    #[serde(flatten)]
    pub stream: StartStreamResponse,
}

#[derive(Debug, Serialize)]
pub struct StopStreamResponse {
    pub status: &'static str,
    pub stream_id: StreamId,
}

#[derive(Debug, Serialize)]
pub struct BranchResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub branch: BranchReport,
}

#[derive(Debug, Serialize)]
pub struct StreamStatusResponse {
    pub stream_id: StreamId,
    pub status: StreamStatus,
}

#[derive(Debug, Serialize)]
pub struct BandwidthResponse {
    pub stream_id: StreamId,
    pub bandwidth: BandwidthTable,
}

#[derive(Debug, Serialize)]
pub struct ActiveStreamsResponse {
    pub active_streams: Vec<ActiveStreamInfo>,
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub files: Vec<String>,
    /// Pending deletion time of uploads stored with an expiry.
    pub expiry: HashMap<String, DateTime<Utc>>,
}

/// Query string of `POST /upload`.
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    /// Minutes until the upload is deleted.
    pub expire_time: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub filename: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub message: &'static str,
    /// Key expiry as a Unix timestamp in seconds.
    pub expiration: i64,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub active_streams: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: serde_json::Value) -> StartStreamBody {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_start_body_source_selection() {
        let any = body(serde_json::json!({"duration": 10, "destination": ["srt://a:1"]}));
        assert_eq!(any.into_request().source, SourceSelector::Any);

        let file = body(serde_json::json!({
            "input_type": "file", "file": "clip.mp4", "duration": 10, "destination": ["srt://a:1"]
        }));
        assert_eq!(
            file.into_request().source,
            SourceSelector::File("clip.mp4".into())
        );

        let url = body(serde_json::json!({
            "input_type": "url", "file": "https://cdn/x.mp4", "duration": 10,
            "destination": ["srt://a:1"], "start_offset": 5, "redundant": false
        }));
        let request = url.into_request();
        assert_eq!(request.source, SourceSelector::Url("https://cdn/x.mp4".into()));
        assert_eq!(request.start_offset_secs, 5);
    }

    #[test]
    fn test_unknown_input_type_is_rejected() {
        let result: Result<StartStreamBody, _> = serde_json::from_value(serde_json::json!({
            "input_type": "ftp", "duration": 10, "destination": []
        }));
        assert!(result.is_err());
    }
}
