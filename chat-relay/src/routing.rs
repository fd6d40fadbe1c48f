//! Chat routing by target nickname.
//!
//! Whether a session may send as a given `sender` is decided by a
//! [`SenderPolicy`]. The default trusts whatever the client claims; a
//! verifying policy can be swapped in without touching the relay loop.

use std::fmt;

use crate::{
    message::{ChatRecord, Frame},
    registry::Registry,
};

pub trait SenderPolicy: fmt::Debug + Send + Sync {
    /// `session` is the nickname the connection logged in with.
    fn permits(&self, session: &str, chat: &ChatRecord) -> bool;
}

/// Accepts the `sender` field at face value.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustClaimedSender;

impl SenderPolicy for TrustClaimedSender {
    fn permits(&self, _session: &str, _chat: &ChatRecord) -> bool {
        true
    }
}

/// Only routes records whose `sender` matches the session's own nickname.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerifiedSender;

impl SenderPolicy for VerifiedSender {
    fn permits(&self, session: &str, chat: &ChatRecord) -> bool {
        chat.sender == session
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Target is not online, or its connection closed before delivery.
    Miss,
    /// The sender policy refused the record.
    Refused,
}

/// Queues `frame`, the record exactly as it arrived, on the target's
/// connection. Misses are silent; the sender is never told.
pub fn route(
    registry: &Registry,
    policy: &dyn SenderPolicy,
    session: &str,
    chat: &ChatRecord,
    frame: Frame,
) -> RouteOutcome {
    if !policy.permits(session, chat) {
        return RouteOutcome::Refused;
    }

    match registry.lookup(&chat.target) {
        Some(handle) if handle.deliver(frame) => RouteOutcome::Delivered,
        _ => RouteOutcome::Miss,
    }
}
