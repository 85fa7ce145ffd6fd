//! # Service discovery
//!
//! An implementation of the Bluetooth Service Discovery Protocol (SDP), found
//! in the [`communication::discovery`](crate::communication::discovery)
//! module. It covers both sides of the protocol:
//! [`Server`](crate::communication::discovery::Server) publishes a database of
//! service records, and [`Client`](crate::communication::discovery::Client)
//! searches the records of a peer.
//!
//! # Communication
//!
//! SDP runs over L2CAP. This library does not open L2CAP channels itself;
//! instead it works on [`Channel`](crate::communication::Channel)s, which
//! carry whole SDUs as [`bytes::Bytes`]. Bridge your transport into a channel
//! and hand it to a client or server, and implement
//! [`ChannelAcceptor`](crate::communication::ChannelAcceptor) so the server can
//! listen on the PSMs its services use.
//!
//! Everything asynchronous runs on Tokio.

#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate thiserror;

pub use address::*;

pub mod communication;

mod address;
mod util;
