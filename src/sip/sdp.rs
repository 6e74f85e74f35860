//! SDP answer generation for the G.711 µ-law audio leg.

use chrono::Utc;
use get_if_addrs::IfAddr;

/// First non-loopback IPv4 address, falling back to loopback when interface
/// enumeration fails or finds nothing usable.
pub fn local_ip() -> String {
    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(ref addr) = iface.addr {
                return addr.ip.to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}

/// SDP answer advertising PCMU/8000 with 20 ms packetization on the given
/// RTP port.
pub fn sdp_answer(local_ip: &str, rtp_port: u16) -> String {
    let session_id = Utc::now().timestamp();
    format!(
        "v=0\r\n\
         o=voicebridge {session_id} {session_id} IN IP4 {local_ip}\r\n\
         s=voicebridge\r\n\
         c=IN IP4 {local_ip}\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP 0\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n"
    )
}
