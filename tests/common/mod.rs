//! Shared test fixtures: an in-memory call store, a scriptable fake agent
//! endpoint, a UDP SIP client, and SIP message builders.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use voicebridge::agent::AgentMessage;
use voicebridge::config::Config;
use voicebridge::db::CallStore;
use voicebridge::models::{CallLog, CallStatus, NewCallLog, Route};
use voicebridge::registry::SessionRegistry;
use voicebridge::routing::Router;
use voicebridge::rtp::PortPool;
use voicebridge::sip::SipServer;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ===== In-memory store =====

#[derive(Default)]
pub struct MemoryStore {
    pub routes: Mutex<Vec<Route>>,
    pub logs: Mutex<Vec<CallLog>>,
    pub status_history: Mutex<Vec<(String, CallStatus)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_routes(routes: Vec<Route>) -> Arc<Self> {
        let store = Self::new();
        *store.routes.lock().unwrap() = routes;
        store
    }

    pub fn statuses_for(&self, call_id: &str) -> Vec<CallStatus> {
        self.status_history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn log_for(&self, call_id: &str) -> Option<CallLog> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .find(|log| log.call_id == call_id)
            .cloned()
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn find_matching_routes(
        &self,
        to_user: &str,
        from_user: &str,
    ) -> Result<Vec<Route>, sqlx::Error> {
        let mut routes: Vec<Route> = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.active
                    && r.match_to_user
                        .as_deref()
                        .map(|m| m.is_empty() || m == to_user)
                        .unwrap_or(true)
                    && r.match_from_user
                        .as_deref()
                        .map(|m| m.is_empty() || m == from_user)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        Ok(routes)
    }

    async fn create_call_log(&self, log: NewCallLog) -> Result<CallLog, sqlx::Error> {
        let row = CallLog {
            id: Uuid::new_v4(),
            account_id: log.account_id,
            call_id: log.call_id.clone(),
            direction: log.direction,
            from_uri: log.from_uri,
            to_uri: log.to_uri,
            from_user: log.from_user,
            to_user: log.to_user,
            route_id: log.route_id,
            trunk_id: None,
            websocket_url: log.websocket_url,
            status: CallStatus::Initiated,
            initiated_at: Utc::now(),
            ringing_at: None,
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
            hangup_cause: None,
            hangup_party: None,
            custom_data: log.custom_data,
            created_at: Utc::now(),
        };
        self.status_history
            .lock()
            .unwrap()
            .push((log.call_id, CallStatus::Initiated));
        self.logs.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<(), sqlx::Error> {
        let mut logs = self.logs.lock().unwrap();
        if let Some(log) = logs.iter_mut().rev().find(|l| l.call_id == call_id) {
            log.status = status;
            let now = Utc::now();
            match status {
                CallStatus::Ringing => log.ringing_at = Some(now),
                CallStatus::Answered => log.answered_at = Some(now),
                CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled => {
                    log.ended_at = Some(now);
                    let answered = log.answered_at.unwrap_or(log.initiated_at);
                    log.duration_seconds = Some((now - answered).num_seconds() as i32);
                }
                CallStatus::Initiated => {}
            }
        }
        self.status_history
            .lock()
            .unwrap()
            .push((call_id.to_string(), status));
        Ok(())
    }
}

// ===== Route builder =====

pub fn test_route(name: &str, priority: i32, websocket_url: &str) -> Route {
    Route {
        name: name.to_string(),
        priority,
        websocket_url: websocket_url.to_string(),
        ..Route::fallback(websocket_url)
    }
}

// ===== Fake agent endpoint =====

type AgentSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// In-process WebSocket server standing in for a voice agent. Records every
/// frame the gateway sends and can push scripted frames back on the most
/// recent connection.
pub struct FakeAgent {
    pub url: String,
    events: mpsc::UnboundedReceiver<AgentMessage>,
    sink: Arc<tokio::sync::Mutex<Option<AgentSink>>>,
}

impl FakeAgent {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, events) = mpsc::unbounded_channel();
        let sink: Arc<tokio::sync::Mutex<Option<AgentSink>>> =
            Arc::new(tokio::sync::Mutex::new(None));

        let slot = Arc::clone(&sink);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (write, mut read) = ws.split();
                *slot.lock().await = Some(write);

                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(Ok(msg)) = read.next().await {
                        if let Message::Text(text) = msg {
                            if let Ok(parsed) = AgentMessage::parse(&text) {
                                let _ = tx.send(parsed);
                            }
                        }
                    }
                });
            }
        });

        Self { url, events, sink }
    }

    /// Next frame received from the gateway, or None on timeout
    pub async fn next_event(&mut self) -> Option<AgentMessage> {
        tokio::time::timeout(RECV_TIMEOUT, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Push a frame to the gateway on the current connection
    pub async fn send(&self, msg: &AgentMessage) {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().expect("no gateway connection");
        sink.send(Message::Text(serde_json::to_string(msg).unwrap()))
            .await
            .unwrap();
    }
}

// ===== Gateway under test =====

pub struct TestGateway {
    pub sip_addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
}

pub async fn start_gateway(
    store: Arc<MemoryStore>,
    default_websocket_url: &str,
    rtp_port_min: u16,
    rtp_port_max: u16,
) -> TestGateway {
    let config = Config {
        sip_host: "127.0.0.1".to_string(),
        sip_port: 0,
        rtp_port_min,
        rtp_port_max,
        default_websocket_url: default_websocket_url.to_string(),
        ws_handshake_timeout: Duration::from_secs(2),
        ..Config::default()
    };

    let call_store: Arc<dyn CallStore> = store;
    let registry = SessionRegistry::new(
        Arc::clone(&call_store),
        None,
        PortPool::new(rtp_port_min, rtp_port_max),
    );
    let router = Router::new(
        Arc::clone(&call_store),
        None,
        config.default_websocket_url.clone(),
    );

    let server = SipServer::bind(&config, router, Arc::clone(&registry), call_store)
        .await
        .unwrap();
    let sip_addr = server.udp_addr().unwrap();
    tokio::spawn(server.run());

    TestGateway { sip_addr, registry }
}

// ===== SIP client =====

pub struct SipClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl SipClient {
    pub async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self { socket, server }
    }

    pub async fn send(&self, message: &str) {
        self.socket
            .send_to(message.as_bytes(), self.server)
            .await
            .unwrap();
    }

    /// Next response, or None on timeout
    pub async fn recv(&self) -> Option<String> {
        let mut buf = vec![0u8; 65535];
        match tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(String::from_utf8_lossy(&buf[..len]).to_string()),
            _ => None,
        }
    }

    /// Receive and assert the status line
    pub async fn expect_status(&self, code: u16) -> String {
        let response = self
            .recv()
            .await
            .unwrap_or_else(|| panic!("timed out waiting for SIP {code}"));
        let prefix = format!("SIP/2.0 {code} ");
        assert!(
            response.starts_with(&prefix),
            "expected SIP {code}, got: {}",
            response.lines().next().unwrap_or("")
        );
        response
    }
}

// ===== SIP message builders =====

pub fn invite(call_id: &str, to_user: &str, from_user: &str, extra_headers: &str) -> String {
    format!(
        "INVITE sip:{to_user}@gateway.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{call_id}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{from_user}@client.test>;tag=t{call_id}\r\n\
         To: <sip:{to_user}@gateway.test>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:{from_user}@127.0.0.1:5060>\r\n\
         {extra_headers}\
         Content-Length: 0\r\n\r\n"
    )
}

pub fn ack(call_id: &str, to_user: &str, from_user: &str) -> String {
    format!(
        "ACK sip:{to_user}@gateway.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{call_id}ack\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{from_user}@client.test>;tag=t{call_id}\r\n\
         To: <sip:{to_user}@gateway.test>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

pub fn bye(call_id: &str, to_user: &str, from_user: &str) -> String {
    format!(
        "BYE sip:{to_user}@gateway.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{call_id}bye\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{from_user}@client.test>;tag=t{call_id}\r\n\
         To: <sip:{to_user}@gateway.test>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

pub fn options(call_id: &str) -> String {
    format!(
        "OPTIONS sip:gateway.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{call_id}opt\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:probe@client.test>;tag=t{call_id}\r\n\
         To: <sip:gateway.test>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

/// RTP port advertised in an SDP body
pub fn rtp_port_from_sdp(sdp: &str) -> u16 {
    sdp.lines()
        .find(|line| line.starts_with("m=audio "))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|port| port.parse().ok())
        .expect("no m=audio line in SDP")
}

/// Poll until the registry is empty or the deadline passes
pub async fn wait_for_empty_registry(registry: &Arc<SessionRegistry>) -> bool {
    for _ in 0..50 {
        if registry.active_count().await == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
