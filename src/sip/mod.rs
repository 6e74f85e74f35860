//! SIP signaling: inbound request dispatch, server transactions, and SDP
//! answer generation.

mod sdp;
mod server;
mod transaction;

pub use sdp::{local_ip, sdp_answer};
pub use server::SipServer;
pub use transaction::{ServerTransaction, TransportHandle};

use thiserror::Error;

/// SIP-level errors
#[derive(Error, Debug)]
pub enum SipError {
    #[error("malformed SIP message: {0}")]
    Parse(#[from] rsip::Error),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
