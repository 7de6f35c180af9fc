//! Listener and per-socket service loop.
//!
//! One listener binds one endpoint. Every accepted socket gets exactly one
//! task that owns it for its whole life:
//!
//! ```text
//! refresh deadline -> read -> stream -> handler -> write -> (loop)
//! ```
//!
//! Any transport error, exhausted stream pool, or unresolved first contact
//! closes the socket and ends the task. Other tasks are unaffected, and a
//! panicking handler only takes down its own task.

use crate::dispatch::ActiveNetwork;
use crate::error::{ResourceError, ServerError, SocketError};
use crate::server::ServerContext;
use crate::session::{Connection, Stream};
use crate::transport::{Link, Socket};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const LISTEN_BACKLOG: i32 = 1024;

/// Delay after the first failed accept; doubles per consecutive failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause between failed accepts, so a persistent error such as running out
/// of file descriptors does not spin the loop.
#[derive(Debug, Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    /// Delay to wait after another failure.
    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => ACCEPT_BACKOFF_MIN,
            Some(previous) => (previous * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Why a socket task ended.
#[derive(Debug)]
pub enum Disconnect {
    /// Read or write failed, timed out, or the peer closed.
    Transport(SocketError),
    /// The connection's stream pool was full.
    Resource(ResourceError),
    /// The handler left a first-contact stream without a connection.
    Unresolved,
    /// The dispatch entry for the port disappeared.
    NoHandler,
}

/// A running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    key: usize,
    port: u16,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Key in the server's network table.
    pub fn key(&self) -> usize {
        self.key
    }

    /// Dispatch port this listener serves.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to exit.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!(port = self.port, error = %e, "Accept loop failed");
        }
    }
}

/// Bind `addr` and start accepting sockets dispatched through `port`.
///
/// Fails before binding if no handler is registered for `port`.
pub async fn bind(
    ctx: &Arc<ServerContext>,
    port: u16,
    addr: SocketAddr,
) -> Result<ListenerHandle, ServerError> {
    if ctx.dispatch.get_protocol_handler(port).is_none() {
        return Err(ServerError::ProtocolHandler(port));
    }

    let listener = create_listener(addr).map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    let local_addr = listener.local_addr()?;

    let (network, shutdown) = ActiveNetwork::new(port, local_addr);
    let key = ctx.networks.register(network);
    info!(port, address = %local_addr, "Listening");

    let task = tokio::spawn(accept_loop(Arc::clone(ctx), key, port, listener, shutdown));

    Ok(ListenerHandle {
        key,
        port,
        local_addr,
        task,
    })
}

/// Create a non-blocking listener with address reuse.
fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    ctx: Arc<ServerContext>,
    key: usize,
    port: u16,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = AcceptBackoff::default();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    let local = stream.local_addr().unwrap_or_else(|_| {
                        listener.local_addr().unwrap_or(peer)
                    });
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    trace!(peer = %peer, port, "Accepted");

                    let socket = Socket::accepted(local, peer, stream, ctx.sockets.receive_buffer_size);
                    spawn_supervised(peer, serve_socket(Arc::clone(&ctx), port, socket));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(port, error = %e, backoff_ms = delay.as_millis() as u64, "Accept failed");
                    tokio::time::sleep(delay).await;
                }
            },
        }
    }

    ctx.networks.deregister(key);
    info!(port, "Listener stopped");
}

/// Run a socket task behind a boundary that turns a panic into a log line.
fn spawn_supervised<F>(peer: SocketAddr, task: F)
where
    F: Future<Output = Disconnect> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::spawn(task).await {
            Ok(reason) => debug!(peer = %peer, reason = ?reason, "Connection task finished"),
            Err(e) if e.is_panic() => error!(peer = %peer, "Connection task panicked"),
            Err(e) => warn!(peer = %peer, error = %e, "Connection task cancelled"),
        }
    });
}

/// Serve one socket until it closes.
///
/// The first stream on a socket has no connection; the handler must bind
/// one. Later streams come from that connection's pool.
pub async fn serve_socket<L: Link>(
    ctx: Arc<ServerContext>,
    port: u16,
    mut socket: Socket<L>,
) -> Disconnect {
    let peer = socket.remote_addr();
    let settings = ctx.sockets;
    let mut buf = vec![0u8; settings.receive_buffer_size];
    let mut connection: Option<Arc<Connection>> = None;

    let reason = loop {
        if let Err(e) = socket.set_deadline(settings.idle_timeout) {
            break Disconnect::Transport(e);
        }
        if let Some(timeout) = settings.write_timeout {
            if let Err(e) = socket.set_write_timeout(timeout) {
                break Disconnect::Transport(e);
            }
        }

        let n = match socket.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => break Disconnect::Transport(e),
        };

        let mut stream = match &connection {
            None => Stream::new_unbound(),
            Some(conn) => match conn.make_income_stream(0) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(peer = %peer, connection = %conn.id(), error = %e, "Stream pool exhausted");
                    break Disconnect::Resource(e);
                }
            },
        };
        stream.set_income_payload(Bytes::copy_from_slice(&buf[..n]));

        let Some(handler) = ctx.dispatch.get_protocol_handler(port) else {
            error!(port, "No handler for port");
            finish_stream(connection.as_ref(), stream);
            break Disconnect::NoHandler;
        };
        stream.set_handler(Arc::clone(&handler));
        handler.handle(&ctx, &mut stream);

        let Some(bound) = stream.connection() else {
            debug!(peer = %peer, handler = handler.name(), "Handler did not resolve a connection");
            finish_stream(connection.as_ref(), stream);
            break Disconnect::Unresolved;
        };

        bound.add_bytes_received(n as u64);
        bound.touch();
        if connection.is_none() {
            bound.set_peer_addr(peer);
            debug!(peer = %peer, connection = %bound.id(), "Connection resolved");
            connection = Some(Arc::clone(&bound));
        }

        stream.mark_processed();
        stream.record_outcome();
        if let Some(e) = stream.error() {
            debug!(peer = %peer, connection = %bound.id(), error = %e, "Handler reported an error");
        }

        let written = socket.write(stream.outcome_payload()).await;
        finish_stream(connection.as_ref(), stream);
        match written {
            Ok(sent) => bound.add_bytes_sent(sent as u64),
            Err(e) => break Disconnect::Transport(e),
        }
    };

    socket.close().await;
    reason
}

/// Close `stream` and return it to the pool it was taken from.
fn finish_stream(owner: Option<&Arc<Connection>>, mut stream: Stream) {
    match owner {
        Some(conn) => conn.close_stream(stream),
        None => stream.close(),
    }
}
