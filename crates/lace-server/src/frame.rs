//! SSE wire framing.
//!
//! Event frames look like
//!
//! ```text
//! id: 1735689600000-42
//! data: {"id":"1735689600000-42","eventType":"session","scope":{...},"data":{...},"timestamp":"..."}
//!
//! ```
//!
//! The id is `<unix millis>-<sequence>`. Only the sequence is used for ordering
//! and `Last-Event-ID` resumption; the millisecond half keeps ids from a
//! restarted process distinguishable in logs.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lace_core::events::{EventCategory, EventData, EventScope, StreamEvent};
use lace_core::ids::ConnectionId;
use serde::Serialize;

use crate::error::StreamError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId {
    pub millis: i64,
    pub seq: u64,
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidFrameId;

impl FromStr for FrameId {
    type Err = InvalidFrameId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s.trim().split_once('-').ok_or(InvalidFrameId)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| InvalidFrameId)?,
            seq: seq.parse().map_err(|_| InvalidFrameId)?,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent<'a> {
    id: String,
    event_type: EventCategory,
    scope: &'a EventScope,
    data: &'a EventData,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionConfirmed<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    connection_id: &'a ConnectionId,
    timestamp: DateTime<Utc>,
}

pub fn event_frame(id: FrameId, event: &StreamEvent) -> Result<Bytes, StreamError> {
    let wire = WireEvent {
        id: id.to_string(),
        event_type: event.event_type,
        scope: &event.scope,
        data: &event.data,
        timestamp: Utc::now(),
    };
    let json = serde_json::to_string(&wire)?;
    Ok(Bytes::from(format!("id: {id}\ndata: {json}\n\n")))
}

/// First frame on every connection. Carries no `id:` line so it never moves
/// the client's `Last-Event-ID`.
pub fn connection_frame(connection_id: &ConnectionId, retry_ms: u64) -> Result<Bytes, StreamError> {
    let json = serde_json::to_string(&ConnectionConfirmed {
        kind: "connection",
        connection_id,
        timestamp: Utc::now(),
    })?;
    Ok(Bytes::from(format!("retry: {retry_ms}\ndata: {json}\n\n")))
}

pub fn keepalive_frame() -> Bytes {
    Bytes::from_static(b": keepalive\n\n")
}
