//! Presence-and-relay chat server.
//!
//! Clients connect over TCP, log in with a nickname, and then exchange
//! one-to-one messages (text or base64-encoded files) that the relay routes by
//! target nickname. Every login and disconnect pushes the new list of online
//! nicknames to everyone.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`message`] defines the JSON records and the newline framing used on the wire.
//! - [`registry`] maps nicknames to live sessions.
//! - [`presence`] broadcasts the online list after every registry change.
//! - [`routing`] forwards chat records to their target and holds the
//!   sender-identity policy.
//! - [`relay`] accepts connections and runs the per-connection state machine.
//! - [`client`] is a terminal client for the same protocol.

pub mod cli;
pub mod client;
pub mod message;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod routing;
