use std::sync::Arc;

use crate::{connection::Connection, mem::buffer::Buffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Receives everything a connection delivers to the application.
///
/// Both methods run on the poller thread of the connection's context and
/// must not block on that connection's synchronous operations.
pub trait Dispatcher: Send + Sync {
    /// A general message of type `ty` arrived, either by SEND or by a
    /// completed large-buffer pull or direct write.
    fn dispatch_data_event(&self, ty: u32, buffer: Buffer, conn: &Arc<Connection>);

    fn dispatch_connection_event(&self, event: ConnectionEvent, conn: &Arc<Connection>);
}
