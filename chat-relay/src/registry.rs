//! Nickname → session mapping; the single source of truth for who is online.
//!
//! The registry itself is a plain data structure. The relay keeps it behind
//! one mutex and performs every register, unregister, lookup and snapshot
//! while holding that lock, so no caller can observe a half-applied change.

use std::collections::BTreeMap;

use clap::ValueEnum;
use tokio::sync::mpsc;

use crate::message::{Frame, Outbound};

pub type SessionId = u64;

/// The transport handle of a session: a queue drained by the task that owns
/// the socket's write half. Closing it ends that connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    pub fn new(id: SessionId, outbox: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, outbox }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues a frame for delivery. Returns `false` if the connection task is
    /// already gone.
    pub fn deliver(&self, frame: Frame) -> bool {
        self.outbox.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.outbox.send(Outbound::Close);
    }
}

/// What to do when a login names a nickname that is already online.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DuplicatePolicy {
    /// Refuse the new login; the existing session keeps the name.
    #[default]
    Reject,
    /// Replace the existing session; its handle is returned to be closed.
    Evict,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("nickname '{0}' is already in use")]
    DuplicateName(String),
    #[error("relay is shutting down")]
    Closed,
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: BTreeMap<String, SessionHandle>,
    policy: DuplicatePolicy,
    closed: bool,
}

impl Registry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            sessions: BTreeMap::new(),
            policy,
            closed: false,
        }
    }

    /// Binds `nickname` to `handle`.
    ///
    /// Under [`DuplicatePolicy::Evict`] the displaced handle is returned so the
    /// caller can close it; the swap happens in one step, so there is never a
    /// moment with two routable sessions under one name.
    pub fn register(
        &mut self,
        nickname: String,
        handle: SessionHandle,
    ) -> Result<Option<SessionHandle>, RegisterError> {
        if self.closed {
            return Err(RegisterError::Closed);
        }
        if self.policy == DuplicatePolicy::Reject && self.sessions.contains_key(&nickname) {
            return Err(RegisterError::DuplicateName(nickname));
        }
        Ok(self.sessions.insert(nickname, handle))
    }

    /// Removes `nickname` only if it is still bound to session `id`. A stale
    /// disconnect racing a fresh login under the same name is a no-op.
    pub fn unregister(&mut self, nickname: &str, id: SessionId) -> bool {
        match self.sessions.get(nickname) {
            Some(handle) if handle.id() == id => {
                self.sessions.remove(nickname);
                true
            }
            _ => false,
        }
    }

    /// Online nicknames in lexical order.
    pub fn snapshot(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn lookup(&self, nickname: &str) -> Option<&SessionHandle> {
        self.sessions.get(nickname)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&str, &SessionHandle)> {
        self.sessions
            .iter()
            .map(|(nickname, handle)| (nickname.as_str(), handle))
    }

    /// Empties the registry for good, handing back every handle. Later
    /// registrations fail with [`RegisterError::Closed`].
    pub fn close(&mut self) -> Vec<SessionHandle> {
        self.closed = true;
        std::mem::take(&mut self.sessions).into_values().collect()
    }
}
