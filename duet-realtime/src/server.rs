//! WebSocket server: one task per connection around a shared [`Hub`].
//!
//! ```text
//! TcpListener ──accept──► task(conn) ──select!──┬─ inbound frame ──► Hub::handle_text
//!                                               ├─ outbound queue ─► ws.send(text)
//!                                               └─ heartbeat tick ─► ws.send(ping)
//!
//! reaper task ── every reap_interval ──► Hub::reap_idle_sessions
//! ```

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};
use crate::transport::Hub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Roster cap per whiteboard session
    pub max_participants: usize,
    /// Per-connection outbound queue depth; overflow is dropped
    pub outbound_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Inactivity after which an abandoned session is evicted
    pub session_idle_timeout_secs: u64,
    /// How often the reaper looks for idle sessions
    pub reap_interval_secs: u64,
    /// RocksDB path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants: 16,
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            session_idle_timeout_secs: 1800,
            reap_interval_secs: 60,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `DUET_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("DUET_BIND_ADDR") {
            config.bind_addr = addr;
        }
        overlay(&lookup, "DUET_MAX_PARTICIPANTS", &mut config.max_participants);
        overlay(&lookup, "DUET_OUTBOUND_CAPACITY", &mut config.outbound_capacity);
        overlay(&lookup, "DUET_HEARTBEAT_SECS", &mut config.heartbeat_interval_secs);
        overlay(&lookup, "DUET_SESSION_IDLE_SECS", &mut config.session_idle_timeout_secs);
        overlay(&lookup, "DUET_REAP_SECS", &mut config.reap_interval_secs);
        if let Some(path) = lookup("DUET_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        config
    }
}

fn overlay<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => log::warn!("Ignoring {key}={raw:?}: not a valid value"),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub dropped_deliveries: u64,
    pub online_users: usize,
    pub active_sessions: usize,
    pub evicted_sessions: u64,
    pub strokes_appended: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to open snapshot store: {0}")]
    Store(#[from] StoreError),
}

pub struct RealtimeServer {
    config: ServerConfig,
    hub: Arc<Hub>,
}

impl RealtimeServer {
    /// Build a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::at(path))?;
                log::info!("Snapshot store opened at {}", path.display());
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let hub = Arc::new(Hub::new(config.clone(), store));
        Self { config, hub }
    }

    /// Default configuration, in-memory store.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Realtime server listening on {}", listener.local_addr()?);
        let _reaper = ReaperGuard(self.spawn_reaper());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let period = Duration::from_secs(self.config.reap_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = hub.reap_idle_sessions().await;
                if evicted > 0 {
                    log::info!("Reaper evicted {evicted} idle whiteboard sessions");
                }
            }
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        heartbeat: Duration,
    ) -> Result<(), tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (mut ctx, mut outbound) = hub.connect();
        log::info!("WebSocket connection {} established from {addr}", ctx.id());

        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            hub.handle_text(&mut ctx, text.as_str()).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed from {addr}", ctx.id());
                            break Ok(());
                        }
                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Ignoring binary frame from {addr}");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                    }
                }

                Some(event) = outbound.recv() => {
                    let text = match event.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("Dropping unencodable event for {addr}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        break Err(e);
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        break Err(e);
                    }
                }
            }
        };

        hub.disconnect(ctx).await;
        result
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.stats().await
    }
}

/// Stops the reaper when `serve` returns.
struct ReaperGuard(JoinHandle<()>);

impl Drop for ReaperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_participants, 16);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.session_idle_timeout_secs, 1800);
        assert_eq!(config.reap_interval_secs, 60);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_env_overlay() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DUET_BIND_ADDR", "0.0.0.0:8080"),
            ("DUET_MAX_PARTICIPANTS", "4"),
            ("DUET_HEARTBEAT_SECS", "not-a-number"),
            ("DUET_STORAGE_PATH", "/var/lib/duet"),
        ]);
        let config = ServerConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_participants, 4);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/duet")));
    }

    #[test]
    fn test_server_creation() {
        let server = RealtimeServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = RealtimeServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert!(server.hub().store().list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RealtimeServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = RealtimeServer::with_store(
            ServerConfig {
                bind_addr: taken.local_addr().unwrap().to_string(),
                ..ServerConfig::default()
            },
            Arc::new(MemoryStore::new()),
        );
        assert!(matches!(server.run().await, Err(ServerError::Bind { .. })));
    }
}
