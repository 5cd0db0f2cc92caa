//! trane: a reverse TCP tunnel broker.
//!
//! A server behind NAT runs the [`client`] role and keeps a control channel
//! open to a publicly reachable [`server`] role. When an administrator wants
//! in, the server binds a fresh relay port pair and asks the client to dial
//! out, splicing the admin's connection to the hidden target.

pub mod app;
pub mod channel;
pub mod client;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod session;
