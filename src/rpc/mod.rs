//! TCP transport between the master, its workers and the command line.
//!
//! Each call opens a connection, sends one framed [`crate::proto::Request`] and reads one
//! [`crate::proto::Response`].

pub mod client;
pub mod codec;
pub mod server;

pub use client::{MasterClient, RemoteWorker};
pub use server::{serve_master, serve_worker};
