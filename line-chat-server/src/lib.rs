//! Multi-client chat server speaking plain newline-delimited text over TCP.
//!
//! Clients connect, answer the username prompt, and every line they send is
//! relayed to all other connected clients as `> name: text`. `/users` lists the
//! participants and `/quit` leaves. Modules:
//!
//! - [`server`] binds the listener and spawns one task per connection.
//! - [`session`] runs the per-connection protocol: prompt, registration,
//!   command loop, and cleanup.
//! - [`registry`] holds the shared name → session map behind a reader-writer
//!   lock and fans messages out to sessions.
//! - [`line`] reads bounded, newline-delimited lines from a stream.
//! - [`cli`] and [`client`] provide the command line and a terminal client.
//! - [`error`] defines the typed registration and bind failures.

pub mod cli;
pub mod client;
pub mod error;
pub mod line;
pub mod registry;
pub mod server;
pub mod session;
