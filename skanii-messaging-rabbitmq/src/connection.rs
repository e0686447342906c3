use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use skanii_messaging_core::MessagingError;
use tokio::{
    sync::{mpsc, watch, RwLock},
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    options::RabbitMqOptions,
    registry::SubscriptionRegistry,
    transport::{Transport, TransportChannel, TransportConnection, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnState {
    conn: Arc<dyn TransportConnection>,
    ch: Arc<dyn TransportChannel>,
    generation: u64,
}

/// Owns the single connection/channel pair of a client.
///
/// The first caller of [`connect`](Self::connect) opens the connection;
/// concurrent callers wait for that attempt instead of opening their own.
/// A drop reported by the transport discards the handles and schedules a
/// bounded number of delayed reconnects.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    opts: Arc<RabbitMqOptions>,
    transport: Arc<dyn Transport>,
    prefetch: Option<u16>,
    registry: Option<Arc<SubscriptionRegistry>>,
    state: RwLock<Option<ConnState>>,
    status: watch::Sender<ConnectionState>,
    reconnects: AtomicU32,
    generation: AtomicU64,
    // bumped by close(); attempts and timers started before it stand down
    close_epoch: AtomicU64,
}

impl ConnectionManager {
    pub fn new(opts: Arc<RabbitMqOptions>, transport: Arc<dyn Transport>) -> Self {
        Self::build(opts, transport, None, None)
    }

    /// Consumer flavour: applies prefetch on connect and clears `registry`
    /// when the connection drops.
    pub(crate) fn for_consumer(
        opts: Arc<RabbitMqOptions>,
        transport: Arc<dyn Transport>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let prefetch = Some(opts.prefetch);
        Self::build(opts, transport, prefetch, Some(registry))
    }

    fn build(
        opts: Arc<RabbitMqOptions>,
        transport: Arc<dyn Transport>,
        prefetch: Option<u16>,
        registry: Option<Arc<SubscriptionRegistry>>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                opts,
                transport,
                prefetch,
                registry,
                state: RwLock::new(None),
                status,
                reconnects: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                close_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &RabbitMqOptions {
        &self.inner.opts
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    /// Reconnects scheduled since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// True while both handles are held. Liveness is not probed.
    pub async fn is_connected(&self) -> bool {
        self.inner.state.read().await.is_some()
    }

    pub async fn connect(&self) -> Result<(), MessagingError> {
        // read before claiming so a close() racing this call always wins
        let epoch = self.inner.close_epoch.load(Ordering::SeqCst);
        self.connect_since(epoch).await
    }

    /// Connects unless `close()` has run since `epoch` was read.
    async fn connect_since(&self, epoch: u64) -> Result<(), MessagingError> {
        loop {
            let mut previous = ConnectionState::Disconnected;
            let claimed = self.inner.status.send_if_modified(|s| {
                previous = *s;
                if *s == ConnectionState::Disconnected {
                    *s = ConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });

            if claimed {
                break;
            }
            if previous != ConnectionState::Connected {
                return self.wait_for_connection().await;
            }
            // a drop or close updates state and status under the same
            // write lock, so this read sees both or neither
            if self.is_connected().await {
                info!("RabbitMQ already connected");
                return Ok(());
            }
        }

        match self.establish(epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.status.send_replace(ConnectionState::Disconnected);
                error!(error = %e, exchange = %self.inner.opts.exchange, "Failed to connect to RabbitMQ");
                Err(e)
            }
        }
    }

    async fn wait_for_connection(&self) -> Result<(), MessagingError> {
        debug!("Connection attempt in flight, waiting for it");
        let mut rx = self.inner.status.subscribe();
        let outcome = rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s)
            .map_err(|_| MessagingError::Connection("connection manager dropped".into()))?;

        if outcome == ConnectionState::Connected {
            Ok(())
        } else {
            Err(MessagingError::Connection(
                "connection attempt failed".into(),
            ))
        }
    }

    async fn establish(&self, epoch: u64) -> Result<(), MessagingError> {
        let opts = &self.inner.opts;
        opts.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = self.inner.transport.connect(&opts.uri, events_tx).await?;

        let ch = match self.open_channel(conn.as_ref()).await {
            Ok(ch) => ch,
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    debug!(error = %close_err, "Closing half-open connection failed");
                }
                return Err(e);
            }
        };

        let generation = {
            let mut state = self.inner.state.write().await;
            if self.inner.close_epoch.load(Ordering::SeqCst) == epoch {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *state = Some(ConnState {
                    conn: Arc::clone(&conn),
                    ch: Arc::clone(&ch),
                    generation,
                });
                self.inner.reconnects.store(0, Ordering::SeqCst);
                self.inner.status.send_replace(ConnectionState::Connected);
                Some(generation)
            } else {
                None
            }
        };

        let Some(generation) = generation else {
            warn!("Client closed while connecting, discarding new connection");
            if let Err(e) = ch.close().await {
                debug!(error = %e, "Closing discarded channel failed");
            }
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Closing discarded connection failed");
            }
            return Err(MessagingError::Connection(
                "client closed while connecting".into(),
            ));
        };
        self.supervise(generation, events_rx);

        info!(
            "RabbitMQ connected. exchange={} type={}",
            opts.exchange, opts.exchange_type
        );
        Ok(())
    }

    async fn open_channel(
        &self,
        conn: &dyn TransportConnection,
    ) -> Result<Arc<dyn TransportChannel>, MessagingError> {
        let opts = &self.inner.opts;
        let ch = conn.create_channel().await?;

        ch.declare_exchange(&opts.exchange, opts.exchange_type, opts.durable)
            .await?;

        if let Some(prefetch) = self.inner.prefetch {
            ch.set_prefetch(prefetch).await?;
            debug!(prefetch, "Prefetch configured");
        }
        Ok(ch)
    }

    fn supervise(&self, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            // sender gone: the connection was closed on purpose
            let Some(event) = events.recv().await else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }
                    .handle_transport_event(generation, event)
                    .await;
            }
        });
    }

    pub(crate) async fn handle_transport_event(&self, generation: u64, event: TransportEvent) {
        let dropped = {
            let mut state = self.inner.state.write().await;
            let current = state.as_ref().map(|s| s.generation);
            if current == Some(generation) {
                self.inner.status.send_replace(ConnectionState::Disconnected);
                state.take()
            } else {
                None
            }
        };

        if dropped.is_none() {
            debug!(generation, ?event, "Ignoring event for a superseded connection");
            return;
        }

        match &event {
            TransportEvent::Error(reason) => error!(%reason, "RabbitMQ connection error"),
            TransportEvent::Closed(reason) => warn!(%reason, "RabbitMQ connection closed"),
        }

        if let Some(registry) = &self.inner.registry {
            let cleared = registry.clear();
            if cleared > 0 {
                warn!(cleared, "Discarded subscription bookkeeping after connection loss");
            }
        }

        self.schedule_reconnect();
    }

    /// Arms one delayed reconnect unless the attempt budget is spent.
    ///
    /// A failed timer-driven attempt is logged and not retried; only the
    /// next drop of a live connection arms another one.
    pub(crate) fn schedule_reconnect(&self) {
        let max = self.inner.opts.reconnect_attempts;
        let attempt = match self.inner.reconnects.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| (n < max).then_some(n + 1),
        ) {
            Ok(prev) => prev + 1,
            Err(_) => {
                error!(
                    max_attempts = max,
                    "Max reconnection attempts reached, giving up on RabbitMQ"
                );
                return;
            }
        };

        let delay = self.inner.opts.reconnect_delay();
        info!(
            attempt,
            max_attempts = max,
            delay_ms = self.inner.opts.reconnect_delay_ms,
            "Scheduling RabbitMQ reconnection attempt {}/{}",
            attempt,
            max
        );

        let weak = Arc::downgrade(&self.inner);
        let epoch = self.inner.close_epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.close_epoch.load(Ordering::SeqCst) != epoch {
                debug!(attempt, "Client closed, skipping reconnection attempt");
                return;
            }
            if let Err(e) = (ConnectionManager { inner }).connect_since(epoch).await {
                error!(attempt, error = %e, "Reconnection attempt failed");
            }
        });
    }

    /// Channel of the live connection, connecting first if needed.
    pub(crate) async fn channel(&self) -> Result<Arc<dyn TransportChannel>, MessagingError> {
        if let Some(ch) = self.current_channel().await {
            return Ok(ch);
        }
        self.connect().await?;
        self.current_channel()
            .await
            .ok_or_else(|| MessagingError::Connection("no channel after connect".into()))
    }

    pub(crate) async fn current_channel(&self) -> Option<Arc<dyn TransportChannel>> {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.ch))
    }

    /// Closes the channel then the connection. Handles are discarded first,
    /// so the close never triggers a reconnect. An attempt still in
    /// `Connecting` is left to finish; it fails and discards its connection.
    pub async fn close(&self) -> Result<(), MessagingError> {
        let taken = {
            let mut state = self.inner.state.write().await;
            self.inner.close_epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.status.send_if_modified(|s| {
                if *s == ConnectionState::Connected {
                    *s = ConnectionState::Disconnected;
                    true
                } else {
                    false
                }
            });
            state.take()
        };

        let Some(ConnState { conn, ch, .. }) = taken else {
            debug!("close() without a live connection");
            return Ok(());
        };

        if let Err(e) = ch.close().await {
            error!(error = %e, "Failed to close RabbitMQ channel");
            return Err(e);
        }
        if let Err(e) = conn.close().await {
            error!(error = %e, "Failed to close RabbitMQ connection");
            return Err(e);
        }

        info!("RabbitMQ connection closed");
        Ok(())
    }
}
