//! Connection establishment over the loopback fabric.

use std::{fmt, sync::Arc};

use log::{info, warn};

use crate::{
    connection::{Connection, Transport},
    context::Context,
    error::{RdmaError, Result},
    poller::Token,
    verbs::loopback::{ConnectRequest, LoopbackCq, LoopbackListener, LoopbackQp},
};

/// Creates a queue pair with its own send and receive completion queues.
fn create_transport(ctx: &Context) -> Result<(Arc<LoopbackQp>, Transport)> {
    let send_cq = LoopbackCq::new();
    let recv_cq = LoopbackCq::new();
    let qp = Arc::new(LoopbackQp::new(
        ctx.device(),
        Arc::clone(&send_cq),
        Arc::clone(&recv_cq),
    )?);
    let transport = Transport {
        qp: Arc::clone(&qp) as _,
        send_cq,
        recv_cq,
        cm: qp.cm_channel(),
    };
    Ok((qp, transport))
}

fn establish(ctx: &Arc<Context>, transport: Transport) -> Result<Arc<Connection>> {
    let conn = Connection::new(ctx, transport)?;
    if let Err(err) = conn.establish() {
        conn.close();
        return Err(err);
    }
    Ok(conn)
}

/// Accepts connection requests on an address, on the poller thread.
pub struct Acceptor {
    ctx: Arc<Context>,
    listener: Arc<LoopbackListener>,
    token: Token,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Listens on `addr`. `on_accept` runs on the poller thread for every
    /// incoming request with the established connection or the error that
    /// prevented it.
    pub fn bind<F>(ctx: &Arc<Context>, addr: &str, mut on_accept: F) -> Result<Self>
    where
        F: FnMut(Result<Arc<Connection>>) + Send + 'static,
    {
        let listener = ctx.device().fabric().listen(addr)?;
        let weak_ctx = Arc::downgrade(ctx);
        let listener_c = Arc::clone(&listener);
        let (token, notifier) = ctx.poller().start_io(move || {
            let Some(ctx) = weak_ctx.upgrade() else {
                return;
            };
            while let Some(req) = listener_c.try_accept() {
                on_accept(accept(&ctx, req));
            }
        });
        listener.set_notifier(notifier);
        Ok(Self {
            ctx: Arc::clone(ctx),
            listener,
            token,
        })
    }

    pub fn addr(&self) -> &str {
        self.listener.addr()
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.ctx.poller().stop(self.token);
        self.ctx.device().fabric().unlisten(self.listener.addr());
    }
}

fn accept(ctx: &Arc<Context>, req: ConnectRequest) -> Result<Arc<Connection>> {
    let (qp, transport) = match create_transport(ctx) {
        Ok(x) => x,
        Err(err) => {
            warn!("rejecting connection from qp {}: {err}", req.peer().qpn());
            req.reject(RdmaError::ConnectionError(format!("acceptor failed: {err}")));
            return Err(err);
        }
    };
    qp.link(req.peer())?;
    info!("accepting qp {} with qp {}", req.peer().qpn(), qp.endpoint().qpn());
    let conn = establish(ctx, transport)?;
    if let Err(err) = req.accept(qp.endpoint()) {
        conn.close();
        return Err(err);
    }
    Ok(conn)
}

/// Actively opens a connection.
#[derive(Debug, Clone, Copy)]
pub struct Connector;

impl Connector {
    /// Connects to the acceptor on `addr` and waits up to
    /// `connect_timeout_ms` for it to answer. Must not be called on the
    /// context's poller thread, which runs the acceptor.
    pub fn connect(ctx: &Arc<Context>, addr: &str) -> Result<Arc<Connection>> {
        if ctx.poller().is_poller_thread() {
            return Err(RdmaError::InvalidInput(
                "connect on the poller thread".into(),
            ));
        }
        let (qp, transport) = create_transport(ctx)?;
        let reply = ctx.device().fabric().connect(addr, qp.endpoint())?;
        let peer = reply
            .recv_timeout(ctx.config().connection.connect_timeout())
            .map_err(|_err| RdmaError::Timeout(format!("connecting to {addr}")))??;
        qp.link(&peer)?;
        info!("qp {} connected to {addr}, peer qp {}", qp.endpoint().qpn(), peer.qpn());
        establish(ctx, transport)
    }
}
