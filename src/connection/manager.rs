use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::until_stopped;
use crate::config::ReconnectSettings;
use crate::topology::TopologyDeclarator;
use crate::transport::{Channel, Connection, LinkState, Transport, redact_url};
use crate::utils::error::BusError;

/// Coarse lifecycle of the manager, exposed for readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A fatal error stopped the reconnect loop.
    Failed,
    Closed,
}

/// One connection and its channel. Never patched in place: a reconnect
/// builds a new `Link` with a higher generation.
pub struct Link {
    pub generation: u64,
    pub connection: Arc<dyn Connection>,
    pub channel: Arc<dyn Channel>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Re-run after every successful connection, once the exchange exists.
#[async_trait]
pub trait LinkListener: Send + Sync {
    async fn on_connected(&self, link: Arc<Link>) -> Result<(), BusError>;
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    url: String,
    connect_timeout: Duration,
    reconnect: ReconnectSettings,
    topology: Arc<TopologyDeclarator>,
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Arc<Link>>>,
    listeners: Mutex<Vec<Weak<dyn LinkListener>>>,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: &str,
        connect_timeout: Duration,
        reconnect: ReconnectSettings,
        topology: Arc<TopologyDeclarator>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            url: url.to_string(),
            connect_timeout,
            reconnect,
            topology,
            state,
            link: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            shutdown,
            supervisor: Mutex::new(None),
        })
    }

    /// Register a listener. The manager only keeps a weak reference.
    pub fn add_listener(&self, listener: &Arc<dyn LinkListener>) {
        guard(&self.listeners).push(Arc::downgrade(listener));
    }

    pub fn topology(&self) -> &TopologyDeclarator {
        &self.topology
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The live link, if any.
    pub fn current(&self) -> Option<Arc<Link>> {
        self.link
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.current().map(|link| link.channel.clone())
    }

    /// Make the first connection attempt inline and hand the rest to a
    /// background supervisor.
    ///
    /// Returns `Ok` once the supervisor runs, even if the broker is not
    /// reachable yet. Returns `Err` only for fatal errors, such as a
    /// conflicting topology declaration.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BusError> {
        if guard(&self.supervisor).is_some() {
            return Ok(());
        }
        self.shutdown.send_replace(false);

        match self.establish().await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!(error = %e, "fatal error while connecting to the broker");
                self.state.send_replace(ConnectionState::Failed);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    url = %redact_url(&self.url),
                    error = %e,
                    "broker unavailable, retrying in the background"
                );
            }
        }

        let handle = tokio::spawn(self.clone().supervise());
        *guard(&self.supervisor) = Some(handle);
        Ok(())
    }

    /// Stop reconnecting, then close the channel and the connection.
    /// Errors during close are logged and swallowed.
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);
        let supervisor = guard(&self.supervisor).take();
        if let Some(handle) = supervisor {
            handle.abort();
            let _ = handle.await;
        }

        let link = self
            .link
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.state.send_replace(ConnectionState::Closed);

        if let Some(link) = link {
            if let Err(e) = link.channel.close().await {
                debug!(error = %e, "error closing channel");
            }
            if let Err(e) = link.connection.close().await {
                debug!(error = %e, "error closing connection");
            }
            info!(generation = link.generation, "disconnected from broker");
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::from_settings(&self.reconnect);

        loop {
            if let Some(link) = self.current() {
                let mut connection_state = link.connection.state();
                let mut channel_state = link.channel.state();
                tokio::select! {
                    reason = wait_closed(&mut connection_state) => self.mark_lost(&link, &reason),
                    reason = wait_closed(&mut channel_state) => {
                        self.mark_lost(&link, &reason);
                        let _ = link.connection.close().await;
                    }
                    _ = until_stopped(&mut shutdown) => return,
                }
            }
            if *shutdown.borrow() {
                return;
            }

            let delay = backoff.next_delay();
            info!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting to broker"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = until_stopped(&mut shutdown) => return,
            }

            match self.establish().await {
                Ok(()) => {
                    info!(attempts = backoff.attempt(), "reconnected to broker");
                    backoff.reset();
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal error while reconnecting, giving up");
                    self.state.send_replace(ConnectionState::Failed);
                    return;
                }
                Err(e) => warn!(error = %e, "reconnect attempt failed"),
            }
        }
    }

    /// Called by users of a link that found it unusable without the transport
    /// noticing, such as a consumer the broker cancelled. Closes the link's
    /// channel so the supervisor rebuilds it. Stale links are ignored.
    pub async fn report_lost(&self, link: &Arc<Link>, reason: &str) {
        self.mark_lost(link, reason);
        if let Err(e) = link.channel.close().await {
            debug!(generation = link.generation, error = %e, "error closing lost channel");
        }
    }

    fn mark_lost(&self, link: &Arc<Link>, reason: &str) {
        let mut current = self
            .link
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current
            .as_ref()
            .is_some_and(|live| live.generation == link.generation)
        {
            *current = None;
            self.state.send_replace(ConnectionState::Disconnected);
            warn!(generation = link.generation, reason, "broker connection lost");
        }
    }

    /// Open a link, publish it, then run every listener against it. A
    /// listener failure tears the link down again.
    async fn establish(&self) -> Result<(), BusError> {
        self.state.send_replace(ConnectionState::Connecting);

        let link = match self.open_link().await {
            Ok(link) => link,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self
            .link
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(link.clone());
        self.state.send_replace(ConnectionState::Connected);
        info!(
            url = %redact_url(&self.url),
            generation = link.generation,
            "connected to broker"
        );

        let listeners: Vec<Arc<dyn LinkListener>> = {
            let mut listeners = guard(&self.listeners);
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            if let Err(e) = listener.on_connected(link.clone()).await {
                self.mark_lost(&link, "listener setup failed");
                let _ = link.channel.close().await;
                let _ = link.connection.close().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Connect, open the channel and declare the exchanges, all within
    /// `connect_timeout`.
    async fn open_link(&self) -> Result<Arc<Link>, BusError> {
        tokio::time::timeout(self.connect_timeout, self.build_link())
            .await
            .map_err(|_| BusError::Timeout(self.connect_timeout))?
    }

    async fn build_link(&self) -> Result<Arc<Link>, BusError> {
        let connection = self.transport.connect(&self.url).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.topology.declare_exchange(channel.as_ref()).await {
            let _ = channel.close().await;
            let _ = connection.close().await;
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(Link {
            generation,
            connection,
            channel,
        }))
    }
}

async fn wait_closed(state: &mut watch::Receiver<LinkState>) -> String {
    loop {
        let current = state.borrow_and_update().clone();
        if let LinkState::Closed(reason) = current {
            return reason;
        }
        if state.changed().await.is_err() {
            return "connection dropped".to_string();
        }
    }
}
