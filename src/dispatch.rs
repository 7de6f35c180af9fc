//! Protocol dispatch.
//!
//! The [`DispatchTable`] maps a listening port to the application handler
//! that serves every stream arriving on it. It is filled before the server
//! starts and only read afterwards.
//!
//! The [`NetworkTable`] tracks running listeners so they can all be stopped
//! from one place. It has no effect on how connections are served.

use crate::server::ServerContext;
use crate::session::Stream;
use slab::Slab;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Application handler for one protocol.
///
/// Given a stream with its inbound payload set, a handler fills the outbound
/// payload and may set an error on the stream. On first contact the stream
/// has no connection, and the handler must bind one (usually through
/// `ctx.registry`) before returning; otherwise the socket is closed without
/// a response.
pub trait StreamHandler: Send + Sync {
    fn handle(&self, ctx: &ServerContext, stream: &mut Stream);

    /// Name used in logs.
    fn name(&self) -> &str {
        "anonymous"
    }
}

impl<F> StreamHandler for F
where
    F: Fn(&ServerContext, &mut Stream) + Send + Sync,
{
    fn handle(&self, ctx: &ServerContext, stream: &mut Stream) {
        self(ctx, stream)
    }
}

/// Port → handler table.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<u16, Arc<dyn StreamHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `port`, returning the handler it replaced.
    pub fn register(
        &mut self,
        port: u16,
        handler: Arc<dyn StreamHandler>,
    ) -> Option<Arc<dyn StreamHandler>> {
        self.handlers.insert(port, handler)
    }

    pub fn get_protocol_handler(&self, port: u16) -> Option<Arc<dyn StreamHandler>> {
        self.handlers.get(&port).cloned()
    }

    /// Ports with a registered handler, in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.handlers.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.handlers.iter().map(|(port, h)| (port, h.name())))
            .finish()
    }
}

/// A running listener as seen by the network table.
#[derive(Debug)]
pub struct ActiveNetwork {
    pub port: u16,
    pub local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl ActiveNetwork {
    /// Create the table entry and the receiver the accept loop watches.
    pub fn new(port: u16, local_addr: SocketAddr) -> (Self, watch::Receiver<bool>) {
        let (shutdown, rx) = watch::channel(false);
        (
            Self {
                port,
                local_addr,
                shutdown,
            },
            rx,
        )
    }

    fn stop(&self) {
        // The accept loop may already be gone.
        let _ = self.shutdown.send(true);
    }
}

/// Registry of running listeners.
#[derive(Debug, Default)]
pub struct NetworkTable {
    networks: Mutex<Slab<ActiveNetwork>>,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; the returned key identifies it for removal.
    pub fn register(&self, network: ActiveNetwork) -> usize {
        debug!(port = network.port, address = %network.local_addr, "Network registered");
        self.lock().insert(network)
    }

    pub fn deregister(&self, key: usize) -> Option<ActiveNetwork> {
        self.lock().try_remove(key)
    }

    /// Stop one listener.
    pub fn shutdown(&self, key: usize) -> bool {
        match self.lock().get(key) {
            Some(network) => {
                network.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every listener. Returns how many were signalled.
    pub fn shutdown_all(&self) -> usize {
        let networks = self.lock();
        for (_, network) in networks.iter() {
            network.stop();
        }
        networks.len()
    }

    /// Addresses of running listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.lock().iter().map(|(_, n)| n.local_addr).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Slab<ActiveNetwork>> {
        self.networks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
