//! WebSocket link to the voice agent and the framed JSON wire protocol.
//!
//! Every frame is a JSON text message tagged by an `event` field.
//! Gateway → agent: connected, start, media, stop.
//! Agent → gateway: media, clear, stop, dtmf.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Receiving half of an agent connection, consumed by the session's
/// agent pump.
pub type AgentStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

type AgentSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent handshake timed out")]
    HandshakeTimeout,

    #[error("agent not connected")]
    NotConnected,

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Audio chunk carried inside a media event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub chunk: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Base64-encoded PCMU audio
    pub payload: String,
}

/// Wire union exchanged with the agent, discriminated by `event`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum AgentMessage {
    Connected,
    Start {
        stream_sid: String,
        call_id: String,
        account_id: String,
        from: String,
        to: String,
        custom_data: serde_json::Value,
    },
    Media {
        #[serde(default)]
        stream_sid: String,
        media: MediaPayload,
    },
    Clear {
        #[serde(default)]
        stream_sid: String,
    },
    Stop {
        #[serde(default)]
        stream_sid: String,
    },
    Dtmf {
        #[serde(default)]
        stream_sid: String,
        digit: String,
    },
}

impl AgentMessage {
    /// Media event carrying one audio chunk, base64-encoded
    pub fn media(stream_sid: &str, chunk: u64, timestamp: i64, audio: &[u8]) -> Self {
        AgentMessage::Media {
            stream_sid: stream_sid.to_string(),
            media: MediaPayload {
                chunk,
                timestamp,
                payload: BASE64.encode(audio),
            },
        }
    }

    /// Parse a received text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl MediaPayload {
    /// Decode the base64 audio body
    pub fn decode_audio(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.payload)
    }
}

/// Outbound WebSocket connection to a voice agent.
///
/// All sends go through one mutex so concurrent producers (the RTP pump,
/// SIP event notifications, shutdown) cannot interleave frames.
pub struct AgentLink {
    sink: Mutex<Option<AgentSink>>,
}

impl AgentLink {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Dial the agent with a bounded handshake and hand back the receiving
    /// half for the caller's receive loop.
    pub async fn connect(
        &self,
        url: &str,
        handshake_timeout: Duration,
    ) -> Result<AgentStream, AgentError> {
        let (ws, _response) = tokio::time::timeout(handshake_timeout, connect_async(url))
            .await
            .map_err(|_| AgentError::HandshakeTimeout)??;

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        Ok(stream)
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Serialize and send one frame
    pub async fn send(&self, msg: &AgentMessage) -> Result<(), AgentError> {
        let text = serde_json::to_string(msg)?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(AgentError::NotConnected)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Best-effort close of the write half
    pub async fn shutdown(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}

impl Default for AgentLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_frame_shape() {
        let json = serde_json::to_string(&AgentMessage::Connected).unwrap();
        assert_eq!(json, r#"{"event":"connected"}"#);
    }

    #[test]
    fn start_frame_round_trip() {
        let msg = AgentMessage::Start {
            stream_sid: "s1".to_string(),
            call_id: "c1".to_string(),
            account_id: "a1".to_string(),
            from: "alice".to_string(),
            to: "1000".to_string(),
            custom_data: serde_json::json!({"tier": "vip"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""event":"start""#));
        assert_eq!(AgentMessage::parse(&json).unwrap(), msg);
    }

    #[test]
    fn media_payload_encodes_base64() {
        let msg = AgentMessage::media("s1", 1, 1234, &[0xAA, 0xBB]);
        let AgentMessage::Media { media, .. } = &msg else {
            panic!("expected media event");
        };
        assert_eq!(media.payload, BASE64.encode([0xAA, 0xBB]));
        assert_eq!(media.chunk, 1);
        assert_eq!(media.decode_audio().unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn stop_frame_parses_without_stream_sid() {
        let msg = AgentMessage::parse(r#"{"event":"stop"}"#).unwrap();
        assert_eq!(
            msg,
            AgentMessage::Stop {
                stream_sid: String::new()
            }
        );
    }

    #[test]
    fn dtmf_frame_parses() {
        let msg = AgentMessage::parse(r#"{"event":"dtmf","stream_sid":"s1","digit":"5"}"#).unwrap();
        assert_eq!(
            msg,
            AgentMessage::Dtmf {
                stream_sid: "s1".to_string(),
                digit: "5".to_string()
            }
        );
    }

    #[test]
    fn unknown_event_rejected() {
        assert!(AgentMessage::parse(r#"{"event":"reboot"}"#).is_err());
        assert!(AgentMessage::parse("not json").is_err());
    }

    #[test]
    fn malformed_media_rejected() {
        assert!(AgentMessage::parse(r#"{"event":"media","media":{"chunk":"x"}}"#).is_err());
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let link = AgentLink::new();
        assert!(!link.is_connected().await);
        let err = link.send(&AgentMessage::Connected).await.unwrap_err();
        assert!(matches!(err, AgentError::NotConnected));
    }
}
