//! Credit flow-controlled messaging over RDMA reliable connected queue
//! pairs.
//!
//! A [`context::Context`] binds a device, a registered memory region and a
//! poller thread. Connections created through [`cm::Acceptor`] and
//! [`cm::Connector`] exchange typed messages with SEND, pull large messages
//! with RDMA READ and write into buffers the peer registered as direct
//! sinks. Received data is delivered to the application's
//! [`dispatcher::Dispatcher`].

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::as_conversions)]
#![allow(clippy::module_name_repetitions)]

pub mod cm;
pub mod completion;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod flow_control;
pub mod mem;
pub mod poller;
pub mod protocol;
pub mod verbs;

pub use cm::{Acceptor, Connector};
pub use config::{Config, ConfigLoader};
pub use connection::{Connection, ConnectionStats};
pub use context::Context;
pub use dispatcher::{ConnectionEvent, Dispatcher};
pub use error::{RdmaError, Result};
pub use mem::{buffer::Buffer, pool::BufferPool, resource::ResourceManager, GlobalMemory};
