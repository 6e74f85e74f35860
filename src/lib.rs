//! voicebridge: a SIP-to-WebSocket gateway bridging inbound calls to
//! external voice agents.
//!
//! Inbound INVITEs are matched against configured routes, answered with a
//! G.711 µ-law RTP leg, and bridged frame-by-frame to the route's agent
//! endpoint over a framed JSON WebSocket protocol.

pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod registry;
pub mod routing;
pub mod rtp;
pub mod session;
pub mod sip;
