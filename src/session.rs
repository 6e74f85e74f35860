//! Active call session: the glue between a SIP server transaction, the RTP
//! endpoint, and the agent WebSocket link.
//!
//! Lifecycle discipline: each session runs at most three tasks (the agent
//! dial one-shot, the RTP pump, the agent pump). A single cancellation
//! token, cancelled exactly once by the idempotent `close`, releases every
//! loop; terminal bookkeeping happens once via the registry's removal path
//! regardless of which task observed termination first.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, AgentLink, AgentMessage, AgentStream};
use crate::db::CallStore;
use crate::models::{CallStatus, Route};
use crate::registry::SessionRegistry;
use crate::rtp::{RtpEndpoint, RTP_HEADER_LEN};
use crate::sip::{local_ip, sdp_answer, ServerTransaction, SipError};

/// Read deadline for the RTP pump; bounds how long shutdown waits for a
/// loop iteration to notice cancellation.
const RTP_READ_DEADLINE: Duration = Duration::from_millis(100);

/// Caller/callee identity extracted from the INVITE
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub call_id: String,
    pub from_uri: String,
    pub to_uri: String,
    pub from_user: String,
    pub to_user: String,
}

/// One active inbound call
pub struct CallSession {
    pub call_id: String,
    /// Opaque stream handle carried in every agent frame
    pub stream_sid: String,
    pub from_uri: String,
    pub to_uri: String,
    pub from_user: String,
    pub to_user: String,
    pub route: Route,

    rtp: RtpEndpoint,
    agent: AgentLink,
    tx: ServerTransaction,

    chunk_count: AtomicU64,
    stop: CancellationToken,
    closed: AtomicBool,

    store: Arc<dyn CallStore>,
    registry: Weak<SessionRegistry>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("stream_sid", &self.stream_sid)
            .field("from_uri", &self.from_uri)
            .field("to_uri", &self.to_uri)
            .field("from_user", &self.from_user)
            .field("to_user", &self.to_user)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    pub(crate) fn new(
        info: CallInfo,
        stream_sid: String,
        route: Route,
        rtp: RtpEndpoint,
        tx: ServerTransaction,
        store: Arc<dyn CallStore>,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        Self {
            call_id: info.call_id,
            stream_sid,
            from_uri: info.from_uri,
            to_uri: info.to_uri,
            from_user: info.from_user,
            to_user: info.to_user,
            route,
            rtp,
            agent: AgentLink::new(),
            tx,
            chunk_count: AtomicU64::new(0),
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
            store,
            registry,
        }
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp.port()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Dial the agent, run the handshake (connected + start), and spawn the
    /// agent receive pump.
    pub async fn connect_agent(
        self: &Arc<Self>,
        handshake_timeout: Duration,
    ) -> Result<(), AgentError> {
        if self.is_closed() {
            // The caller hung up while the dial was queued.
            return Err(AgentError::NotConnected);
        }

        info!("connecting to agent: {}", self.route.websocket_url);
        let stream = self
            .agent
            .connect(&self.route.websocket_url, handshake_timeout)
            .await?;

        self.agent.send(&AgentMessage::Connected).await?;

        let account_id = if self.route.account_id.is_nil() {
            String::new()
        } else {
            self.route.account_id.to_string()
        };
        self.agent
            .send(&AgentMessage::Start {
                stream_sid: self.stream_sid.clone(),
                call_id: self.call_id.clone(),
                account_id,
                from: self.from_user.clone(),
                to: self.to_user.clone(),
                custom_data: self.route.custom_data.clone(),
            })
            .await?;

        info!("agent connected for call {}", self.call_id);

        let session = Arc::clone(self);
        tokio::spawn(async move { session.pump_agent(stream).await });

        Ok(())
    }

    /// Answer the INVITE: 200 OK carrying the SDP for our RTP leg.
    /// A session that already closed sends nothing.
    pub async fn answer(&self) -> Result<(), SipError> {
        if self.is_closed() {
            return Ok(());
        }
        let sdp = sdp_answer(&local_ip(), self.rtp.port());
        self.tx
            .reply_with(
                200,
                vec![rsip::Header::ContentType(
                    rsip::headers::ContentType::from("application/sdp".to_string()),
                )],
                sdp.into_bytes(),
            )
            .await
    }

    /// Reject the INVITE (503 when the agent is unreachable)
    pub async fn reject(&self, status: u16) -> Result<(), SipError> {
        if self.is_closed() {
            return Ok(());
        }
        self.tx.reply(status).await
    }

    /// Called on ACK: mark the call answered and start the RTP pump
    pub fn start_media(self: &Arc<Self>) {
        info!("starting media for call {}", self.call_id);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session
                .store
                .update_call_status(&session.call_id, CallStatus::Answered)
                .await
            {
                warn!("failed to update call status: {e}");
            }
            session.pump_rtp().await;
        });
    }

    /// RTP receive loop: strip the header and forward audio to the agent.
    /// The read deadline keeps cancellation observable between packets.
    async fn pump_rtp(self: Arc<Self>) {
        let mut buf = vec![0u8; 1500];

        loop {
            if self.stop.is_cancelled() {
                return;
            }

            let received = match tokio::time::timeout(RTP_READ_DEADLINE, self.rtp.recv(&mut buf))
                .await
            {
                Err(_) => continue, // deadline: re-check the stop signal
                Ok(Err(e)) => {
                    if self.stop.is_cancelled() {
                        return;
                    }
                    warn!("RTP read error: {e}");
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            let (len, addr) = received;
            self.rtp.learn_remote(addr);

            if len < RTP_HEADER_LEN {
                continue;
            }
            let payload = &buf[RTP_HEADER_LEN..len];

            let chunk = self.chunk_count.fetch_add(1, Ordering::SeqCst) + 1;
            let msg = AgentMessage::media(
                &self.stream_sid,
                chunk,
                Utc::now().timestamp_millis(),
                payload,
            );

            if let Err(e) = self.agent.send(&msg).await {
                warn!("failed to forward media to agent: {e}");
            }
        }
    }

    /// Agent receive loop: decode frames and dispatch by event. Transport
    /// failure or an agent stop terminates the session.
    async fn pump_agent(self: Arc<Self>, mut stream: AgentStream) {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => return,
                frame = stream.next() => frame,
            };

            let text = match frame {
                None => {
                    info!("agent closed the connection for call {}", self.call_id);
                    break;
                }
                Some(Err(e)) => {
                    if self.stop.is_cancelled() {
                        return;
                    }
                    warn!("agent read error: {e}");
                    break;
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => {
                    info!("agent sent close for call {}", self.call_id);
                    break;
                }
                Some(Ok(_)) => continue, // ping/pong/binary are not part of the protocol
            };

            match AgentMessage::parse(&text) {
                Ok(AgentMessage::Media { media, .. }) => match media.decode_audio() {
                    Ok(audio) => {
                        let sequence = self.chunk_count.load(Ordering::SeqCst) as u16;
                        if let Err(e) = self.rtp.send_payload(&audio, sequence).await {
                            warn!("RTP write error: {e}");
                        }
                    }
                    Err(e) => warn!("failed to decode agent audio: {e}"),
                },
                Ok(AgentMessage::Clear { .. }) => {
                    // No playout buffer exists in this gateway; observed only.
                    debug!("agent requested buffer clear for call {}", self.call_id);
                }
                Ok(AgentMessage::Stop { .. }) => {
                    info!("agent requested stop for call {}", self.call_id);
                    let session = Arc::clone(&self);
                    tokio::spawn(async move { session.terminate(CallStatus::Completed).await });
                    return;
                }
                Ok(AgentMessage::Dtmf { digit, .. }) => {
                    info!("agent DTMF for call {}: {digit}", self.call_id);
                }
                Ok(_) => {} // connected/start are never expected inbound
                Err(e) => {
                    warn!("dropping malformed agent frame: {e}");
                }
            }
        }

        // Transport-level termination observed by the reader itself.
        self.terminate(CallStatus::Completed).await;
    }

    /// Route terminal cleanup through the registry so status update, cache
    /// invalidation, and map removal happen exactly once.
    async fn terminate(self: Arc<Self>, status: CallStatus) {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.call_id, status).await,
            None => self.close().await,
        }
    }

    /// Idempotent, single-shot resource teardown. The first entrant cancels
    /// the stop token (releasing both pumps), sends a best-effort stop frame,
    /// and closes the WebSocket; the RTP socket closes when the last pump
    /// exits its current iteration.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("closing session: {}", self.call_id);
        self.stop.cancel();

        if self.agent.is_connected().await {
            let stop = AgentMessage::Stop {
                stream_sid: self.stream_sid.clone(),
            };
            if let Err(e) = self.agent.send(&stop).await {
                debug!("best-effort stop frame failed: {e}");
            }
            self.agent.shutdown().await;
        }
    }
}
