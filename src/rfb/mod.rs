//! RFB (VNC) wire-format primitives shared by both sides of the relay.

pub mod auth;
pub mod wire;
