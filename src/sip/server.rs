//! SIP listener and method dispatch.
//!
//! Accepts INVITE, ACK, BYE, CANCEL, and OPTIONS on UDP and/or TCP. The
//! INVITE handler answers 100 and 180 synchronously, then dials the agent
//! and sends the final 200/503 off the handler so a slow agent cannot block
//! dispatch.

use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::message::HeadersExt;
use rsip::{Header, Method, Request, SipMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::transaction::{ServerTransaction, TransportHandle};
use super::SipError;
use crate::config::Config;
use crate::db::CallStore;
use crate::models::CallStatus;
use crate::registry::SessionRegistry;
use crate::routing::{Router, RoutingError};
use crate::session::CallInfo;

/// SIP server bound to the configured transports
pub struct SipServer {
    dispatcher: Arc<Dispatcher>,
    udp: Option<Arc<UdpSocket>>,
    tcp: Option<TcpListener>,
}

impl SipServer {
    /// Bind the configured listeners. With port 0 the OS picks; the bound
    /// addresses are available before `run`.
    pub async fn bind(
        config: &Config,
        router: Router,
        registry: Arc<SessionRegistry>,
        store: Arc<dyn CallStore>,
    ) -> Result<Self, SipError> {
        let addr = format!("{}:{}", config.sip_host, config.sip_port);

        let udp = if config.sip_transport.wants_udp() {
            let socket = UdpSocket::bind(&addr).await?;
            info!("SIP UDP listener on {}", socket.local_addr()?);
            Some(Arc::new(socket))
        } else {
            None
        };

        let tcp = if config.sip_transport.wants_tcp() {
            let listener = TcpListener::bind(&addr).await?;
            info!("SIP TCP listener on {}", listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        let dispatcher = Arc::new(Dispatcher {
            router,
            registry,
            store,
            handshake_timeout: config.ws_handshake_timeout,
        });

        Ok(Self {
            dispatcher,
            udp,
            tcp,
        })
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until the task is aborted
    pub async fn run(self) -> Result<(), SipError> {
        let mut listeners = Vec::new();

        if let Some(udp) = self.udp {
            let dispatcher = Arc::clone(&self.dispatcher);
            listeners.push(tokio::spawn(run_udp(udp, dispatcher)));
        }

        if let Some(tcp) = self.tcp {
            let dispatcher = Arc::clone(&self.dispatcher);
            listeners.push(tokio::spawn(run_tcp(tcp, dispatcher)));
        }

        for listener in listeners {
            let _ = listener.await;
        }
        Ok(())
    }
}

async fn run_udp(socket: Arc<UdpSocket>, dispatcher: Arc<Dispatcher>) {
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("SIP UDP receive error: {e}");
                continue;
            }
        };

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            debug!("dropping non-UTF8 SIP datagram from {peer}");
            continue;
        };
        if text.trim().is_empty() {
            continue; // keep-alive
        }

        match SipMessage::try_from(text) {
            Ok(SipMessage::Request(request)) => {
                let tx = ServerTransaction::new(
                    TransportHandle::Udp(Arc::clone(&socket)),
                    peer,
                    request,
                );
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.handle(tx).await });
            }
            Ok(SipMessage::Response(response)) => {
                debug!("ignoring SIP response {} from {peer}", response.status_code());
            }
            Err(e) => {
                warn!("failed to parse SIP message from {peer}: {e}");
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("SIP TCP accept error: {e}");
                continue;
            }
        };

        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let (mut reader, writer) = stream.into_split();
            let writer = Arc::new(Mutex::new(writer));
            let mut buf = vec![0u8; 65535];

            loop {
                let len = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(len) => len,
                };

                // One SIP message per read; this gateway does not reassemble
                // messages split across TCP segments.
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    continue;
                };
                if text.trim().is_empty() {
                    continue;
                }

                match SipMessage::try_from(text) {
                    Ok(SipMessage::Request(request)) => {
                        let tx = ServerTransaction::new(
                            TransportHandle::Tcp(Arc::clone(&writer)),
                            peer,
                            request,
                        );
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move { dispatcher.handle(tx).await });
                    }
                    Ok(SipMessage::Response(response)) => {
                        debug!("ignoring SIP response {} from {peer}", response.status_code());
                    }
                    Err(e) => {
                        warn!("failed to parse SIP message from {peer}: {e}");
                    }
                }
            }
        });
    }
}

/// Shared handler state for inbound requests
struct Dispatcher {
    router: Router,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn CallStore>,
    handshake_timeout: Duration,
}

impl Dispatcher {
    async fn handle(self: Arc<Self>, tx: ServerTransaction) {
        let method = tx.request().method().clone();
        let result = match method {
            Method::Invite => self.handle_invite(tx).await,
            Method::Ack => self.handle_ack(tx).await,
            Method::Bye => self.handle_bye(tx).await,
            Method::Cancel => self.handle_cancel(tx).await,
            Method::Options => self.handle_options(tx).await,
            other => {
                debug!("unhandled SIP request method: {other}");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("SIP handler error: {e}");
        }
    }

    async fn handle_invite(self: Arc<Self>, tx: ServerTransaction) -> Result<(), SipError> {
        let info = match call_info(tx.request()) {
            Ok(info) => info,
            Err(e) => {
                warn!("INVITE with unusable headers: {e}");
                return Ok(());
            }
        };
        info!(
            "INVITE received: Call-ID={} From={} To={}",
            info.call_id, info.from_uri, info.to_uri
        );

        let headers = extension_headers(tx.request());

        let route = match self
            .router
            .find_route(&info.to_user, &info.from_user, &headers)
            .await
        {
            Ok(route) => route,
            Err(RoutingError::NoMatch { .. }) => {
                info!("no route found for call {}", info.call_id);
                return tx.reply(404).await;
            }
            Err(RoutingError::Store(e)) => {
                error!("route lookup failed for call {}: {e}", info.call_id);
                return tx.reply(500).await;
            }
        };

        if let Err(e) = tx.reply(100).await {
            warn!("failed to send 100 Trying: {e}");
        }

        let call_id = info.call_id.clone();
        let session = match self
            .registry
            .create_session(info, route, tx.clone())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!("failed to create session for call {call_id}: {e}");
                let _ = tx.reply(500).await;
                return Ok(());
            }
        };

        if let Err(e) = tx.reply(180).await {
            warn!("failed to send 180 Ringing: {e}");
        }
        if let Err(e) = self
            .store
            .update_call_status(&call_id, CallStatus::Ringing)
            .await
        {
            warn!("failed to update call status: {e}");
        }

        // Dial the agent and send the final response off the handler.
        let dispatcher = Arc::clone(&self);
        tokio::spawn(async move {
            match session.connect_agent(dispatcher.handshake_timeout).await {
                Err(e) => {
                    warn!("failed to connect to agent for call {call_id}: {e}");
                    if let Err(e) = session.reject(503).await {
                        warn!("failed to send 503: {e}");
                    }
                    dispatcher.registry.remove(&call_id, CallStatus::Failed).await;
                }
                Ok(()) => {
                    if let Err(e) = session.answer().await {
                        warn!("failed to send 200 OK: {e}");
                        dispatcher.registry.remove(&call_id, CallStatus::Failed).await;
                        return;
                    }
                    info!("call {call_id} answered");
                }
            }
        });

        Ok(())
    }

    async fn handle_ack(&self, tx: ServerTransaction) -> Result<(), SipError> {
        let call_id = tx.request().call_id_header()?.value().to_string();
        debug!("ACK received: Call-ID={call_id}");

        match self.registry.get(&call_id).await {
            Some(session) => session.start_media(),
            None => debug!("no session found for ACK: {call_id}"),
        }
        Ok(())
    }

    async fn handle_bye(&self, tx: ServerTransaction) -> Result<(), SipError> {
        let call_id = tx.request().call_id_header()?.value().to_string();
        info!("BYE received: Call-ID={call_id}");

        self.registry.remove(&call_id, CallStatus::Completed).await;
        tx.reply(200).await
    }

    async fn handle_cancel(&self, tx: ServerTransaction) -> Result<(), SipError> {
        let call_id = tx.request().call_id_header()?.value().to_string();
        info!("CANCEL received: Call-ID={call_id}");

        self.registry.remove(&call_id, CallStatus::Cancelled).await;
        tx.reply(200).await
    }

    async fn handle_options(&self, tx: ServerTransaction) -> Result<(), SipError> {
        tx.reply_with(
            200,
            vec![
                Header::Other("Allow".to_string(), "INVITE, ACK, BYE, CANCEL, OPTIONS".to_string()),
                Header::Other("Accept".to_string(), "application/sdp".to_string()),
            ],
            Vec::new(),
        )
        .await
    }
}

/// Extract the dialog identity from an INVITE
fn call_info(request: &Request) -> Result<CallInfo, SipError> {
    let call_id = request.call_id_header()?.value().to_string();
    let from = request.from_header()?.typed()?;
    let to = request.to_header()?.typed()?;

    Ok(CallInfo {
        call_id,
        from_uri: from.uri.to_string(),
        to_uri: to.uri.to_string(),
        from_user: from.uri.user().map(|u| u.to_string()).unwrap_or_default(),
        to_user: to.uri.user().map(|u| u.to_string()).unwrap_or_default(),
    })
}

/// Collect extension headers used for routing; only the first value of each
/// `X-` header is kept.
fn extension_headers(request: &Request) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for header in request.headers.iter() {
        if let Header::Other(name, value) = header {
            if name.starts_with("X-") {
                headers
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:1000@gateway.example SIP/2.0\r\n\
        Via: SIP/2.0/UDP 198.51.100.7:5060;branch=z9hG4bKabc\r\n\
        From: <sip:alice@example.com>;tag=xyz\r\n\
        To: <sip:1000@gateway.example>\r\n\
        Call-ID: parse-test\r\n\
        CSeq: 1 INVITE\r\n\
        X-Customer-Tier: vip\r\n\
        X-Customer-Tier: gold\r\n\
        X-Env: prod\r\n\
        User-Agent: test\r\n\
        Content-Length: 0\r\n\r\n";

    fn parse_invite() -> Request {
        match SipMessage::try_from(INVITE).unwrap() {
            SipMessage::Request(req) => req,
            SipMessage::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn call_info_extracts_users_and_uris() {
        let info = call_info(&parse_invite()).unwrap();
        assert_eq!(info.call_id, "parse-test");
        assert_eq!(info.from_user, "alice");
        assert_eq!(info.to_user, "1000");
        assert!(info.from_uri.contains("alice@example.com"));
        assert!(info.to_uri.contains("1000@gateway.example"));
    }

    #[test]
    fn only_x_headers_collected_first_value_wins() {
        let headers = extension_headers(&parse_invite());
        assert_eq!(headers.get("X-Customer-Tier").map(String::as_str), Some("vip"));
        assert_eq!(headers.get("X-Env").map(String::as_str), Some("prod"));
        assert!(!headers.contains_key("User-Agent"));
    }
}
