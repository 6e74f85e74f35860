//! Server transactions: the reply path for one inbound request.
//!
//! Responses echo the request's Via, From, To, Call-ID, and CSeq headers;
//! dialog-establishing responses (>= 180) get a local To tag.
//! Retransmission is left to the peer's transport layer.

use rsip::headers::UntypedHeader;
use rsip::message::HeadersExt;
use rsip::{Header, Headers, Request, Response, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::SipError;

/// Write side of the transport an inbound request arrived on
#[derive(Clone)]
pub enum TransportHandle {
    Udp(Arc<UdpSocket>),
    Tcp(Arc<Mutex<OwnedWriteHalf>>),
}

impl TransportHandle {
    async fn send(&self, data: &[u8], peer: SocketAddr) -> std::io::Result<()> {
        match self {
            TransportHandle::Udp(socket) => {
                socket.send_to(data, peer).await?;
            }
            TransportHandle::Tcp(writer) => {
                writer.lock().await.write_all(data).await?;
            }
        }
        Ok(())
    }
}

/// Handle for responding to a single inbound request
#[derive(Clone)]
pub struct ServerTransaction {
    transport: TransportHandle,
    peer: SocketAddr,
    request: Request,
    to_tag: String,
}

impl ServerTransaction {
    pub fn new(transport: TransportHandle, peer: SocketAddr, request: Request) -> Self {
        Self {
            transport,
            peer,
            request,
            to_tag: format!("{:08x}", rand::random::<u32>()),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send a bodyless response
    pub async fn reply(&self, status: u16) -> Result<(), SipError> {
        self.reply_with(status, Vec::new(), Vec::new()).await
    }

    /// Send a response with extra headers and an optional body
    pub async fn reply_with(
        &self,
        status: u16,
        extra_headers: Vec<Header>,
        body: Vec<u8>,
    ) -> Result<(), SipError> {
        let to_tag = (status >= 180).then_some(self.to_tag.as_str());
        let response = build_response(&self.request, status, to_tag, extra_headers, body)?;
        self.transport
            .send(response.to_string().as_bytes(), self.peer)
            .await?;
        Ok(())
    }
}

/// Build a response for a request, copying the dialog-identifying headers
pub fn build_response(
    request: &Request,
    status: u16,
    to_tag: Option<&str>,
    extra_headers: Vec<Header>,
    body: Vec<u8>,
) -> Result<Response, SipError> {
    let mut headers = Headers::default();

    for header in request.headers.iter() {
        if matches!(header, Header::Via(_) | Header::RecordRoute(_)) {
            headers.push(header.clone());
        }
    }

    headers.push(request.from_header()?.clone().into());

    let mut to_value = request.to_header()?.value().to_string();
    if let Some(tag) = to_tag {
        if !to_value.to_ascii_lowercase().contains("tag=") {
            to_value = format!("{to_value};tag={tag}");
        }
    }
    headers.push(Header::To(rsip::headers::To::from(to_value)));

    headers.push(request.call_id_header()?.clone().into());
    headers.push(request.cseq_header()?.clone().into());

    for header in extra_headers {
        headers.push(header);
    }

    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(
        body.len().to_string(),
    )));

    Ok(Response {
        status_code: status.into(),
        version: Version::V2,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::SipMessage;

    const INVITE: &str = "INVITE sip:1000@gateway.example SIP/2.0\r\n\
        Via: SIP/2.0/UDP 198.51.100.7:5060;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:alice@example.com>;tag=1928301774\r\n\
        To: <sip:1000@gateway.example>\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Length: 0\r\n\r\n";

    fn parse_invite() -> Request {
        match SipMessage::try_from(INVITE).unwrap() {
            SipMessage::Request(req) => req,
            SipMessage::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn response_echoes_dialog_headers() {
        let request = parse_invite();
        let response = build_response(&request, 200, Some("abcd1234"), Vec::new(), Vec::new())
            .unwrap()
            .to_string();

        assert!(response.starts_with("SIP/2.0 200 "));
        assert!(response.contains("branch=z9hG4bK776asdhds"));
        assert!(response.contains("sip:alice@example.com"));
        assert!(response.contains("Call-ID: a84b4c76e66710"));
        assert!(response.contains("314159 INVITE"));
    }

    #[test]
    fn to_tag_added_once() {
        let request = parse_invite();
        let response = build_response(&request, 180, Some("abcd1234"), Vec::new(), Vec::new())
            .unwrap()
            .to_string();
        assert!(response.contains("tag=abcd1234"));

        // A To header that already carries a tag is left alone.
        let tagged = INVITE.replace(
            "To: <sip:1000@gateway.example>",
            "To: <sip:1000@gateway.example>;tag=existing",
        );
        let request = match SipMessage::try_from(tagged.as_str()).unwrap() {
            SipMessage::Request(req) => req,
            SipMessage::Response(_) => panic!("expected request"),
        };
        let response = build_response(&request, 200, Some("abcd1234"), Vec::new(), Vec::new())
            .unwrap()
            .to_string();
        assert!(response.contains("tag=existing"));
        assert!(!response.contains("tag=abcd1234"));
    }

    #[test]
    fn provisional_100_has_no_to_tag() {
        let request = parse_invite();
        let response = build_response(&request, 100, None, Vec::new(), Vec::new())
            .unwrap()
            .to_string();
        assert!(response.starts_with("SIP/2.0 100 "));
        let to_line = response
            .lines()
            .find(|l| l.starts_with("To:"))
            .unwrap()
            .to_string();
        assert!(!to_line.contains("tag="));
    }

    #[test]
    fn body_sets_content_length() {
        let request = parse_invite();
        let body = b"v=0\r\n".to_vec();
        let response = build_response(
            &request,
            200,
            Some("t"),
            vec![Header::ContentType(rsip::headers::ContentType::from(
                "application/sdp".to_string(),
            ))],
            body,
        )
        .unwrap()
        .to_string();
        assert!(response.contains("application/sdp"));
        assert!(response.contains("Content-Length: 5"));
        assert!(response.ends_with("v=0\r\n"));
    }
}
