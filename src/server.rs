//! Server context and lifecycle.
//!
//! [`ServerContext`] is the state every connection task shares: the dispatch
//! table, the connection registry, the running networks, and socket
//! settings. [`Server`] owns a context, starts one listener per configured
//! port, runs the idle-eviction sweep, and stops every listener on shutdown.

use crate::config::Config;
use crate::dispatch::{DispatchTable, NetworkTable};
use crate::error::ServerError;
use crate::listener::{self, ListenerHandle};
use crate::protocols;
use crate::session::{ConnectionRegistry, RegistryLimits};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-socket settings applied by every connection task.
#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    /// Receive buffer capacity in bytes.
    pub receive_buffer_size: usize,
    /// Deadline refreshed before every read; expiry closes the socket.
    pub idle_timeout: Duration,
    /// Optional tighter bound on writes.
    pub write_timeout: Option<Duration>,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            receive_buffer_size: 4096,
            idle_timeout: Duration::from_secs(60),
            write_timeout: None,
        }
    }
}

/// State shared by the listeners and every connection task.
pub struct ServerContext {
    pub dispatch: DispatchTable,
    pub registry: ConnectionRegistry,
    pub networks: NetworkTable,
    pub sockets: SocketSettings,
}

impl ServerContext {
    pub fn new(dispatch: DispatchTable, limits: RegistryLimits, sockets: SocketSettings) -> Self {
        Self {
            dispatch,
            registry: ConnectionRegistry::new(limits),
            networks: NetworkTable::new(),
            sockets,
        }
    }
}

/// Server instance
pub struct Server {
    ctx: Arc<ServerContext>,
    host: IpAddr,
    connection_idle: Duration,
    cleanup_interval: Duration,
}

impl Server {
    /// Build a server whose dispatch table comes from the configured
    /// listeners.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let mut dispatch = DispatchTable::new();
        for listener in &config.listeners {
            let handler = protocols::handler_for(&listener.protocol)
                .ok_or_else(|| ServerError::UnknownProtocol(listener.protocol.clone()))?;
            dispatch.register(listener.port, handler);
        }

        let host: IpAddr = config.host.parse().map_err(|e| ServerError::Bind {
            addr: config.host.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let ctx = ServerContext::new(
            dispatch,
            RegistryLimits {
                max_connections: config.max_connections,
                max_streams_per_connection: config.max_streams_per_connection,
            },
            SocketSettings {
                receive_buffer_size: config.receive_buffer_size,
                idle_timeout: config.idle_timeout,
                write_timeout: config.write_timeout,
            },
        );

        Ok(Self {
            ctx: Arc::new(ctx),
            host,
            connection_idle: config.connection_idle,
            cleanup_interval: config.cleanup_interval,
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bind a listener for every port in the dispatch table.
    pub async fn start(&self) -> Result<Vec<ListenerHandle>, ServerError> {
        let mut handles = Vec::new();
        for port in self.ctx.dispatch.ports() {
            let addr = SocketAddr::new(self.host, port);
            match listener::bind(&self.ctx, port, addr).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Start listeners and the eviction sweep, then serve until ctrl-c.
    pub async fn run(&self) -> Result<(), ServerError> {
        let handles = self.start().await?;

        let ctx = Arc::clone(&self.ctx);
        let (interval, max_idle) = (self.cleanup_interval, self.connection_idle);
        let cleanup = tokio::spawn(async move {
            cleanup_task(ctx, interval, max_idle).await;
        });

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");

        self.shutdown();
        cleanup.abort();
        for handle in handles {
            handle.stopped().await;
        }
        info!("All listeners stopped");
        Ok(())
    }

    /// Stop accepting on every listener. Running connections drain on
    /// their own.
    pub fn shutdown(&self) -> usize {
        self.ctx.networks.shutdown_all()
    }
}

/// Background task that evicts idle connections from the registry.
async fn cleanup_task(ctx: Arc<ServerContext>, interval: Duration, max_idle: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;
        let count = ctx.registry.evict_idle(max_idle);
        if count > 0 {
            debug!(count, remaining = ctx.registry.len(), "Evicted idle connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;

    fn config(listeners: Vec<ListenerConfig>) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            listeners,
            max_connections: 16,
            max_streams_per_connection: 2,
            receive_buffer_size: 1024,
            idle_timeout: Duration::from_secs(5),
            write_timeout: None,
            connection_idle: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            log_level: "info".to_string(),
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::from_config(&config(vec![
            ListenerConfig {
                port: 7000,
                protocol: "ping".to_string(),
            },
            ListenerConfig {
                port: 7001,
                protocol: "echo".to_string(),
            },
        ]))
        .unwrap();

        let ctx = server.context();
        assert_eq!(ctx.dispatch.ports(), vec![7000, 7001]);
        assert_eq!(ctx.registry.limits().max_streams_per_connection, 2);
        assert_eq!(ctx.sockets.receive_buffer_size, 1024);
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let result = Server::from_config(&config(vec![ListenerConfig {
            port: 7000,
            protocol: "gopher".to_string(),
        }]));
        assert!(matches!(result, Err(ServerError::UnknownProtocol(p)) if p == "gopher"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let server = Server::from_config(&config(vec![ListenerConfig {
            port: 0,
            protocol: "ping".to_string(),
        }]))
        .unwrap();

        let handles = server.start().await.unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(server.context().networks.len(), 1);

        assert_eq!(server.shutdown(), 1);
        for handle in handles {
            handle.stopped().await;
        }
        assert!(server.context().networks.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_task_evicts() {
        let ctx = Arc::new(ServerContext::new(
            DispatchTable::new(),
            RegistryLimits::default(),
            SocketSettings::default(),
        ));
        let conn = ctx.registry.make_new_guest_connection().unwrap();
        ctx.registry.register_connection(conn);

        let task = tokio::spawn(cleanup_task(
            Arc::clone(&ctx),
            Duration::from_millis(10),
            Duration::ZERO,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert!(ctx.registry.is_empty());
    }
}
