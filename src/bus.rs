//! Cross-instance invalidation over pub/sub
//!
//! Every replica runs one listener task. It subscribes to the invalidation
//! channel of each registered namespace and applies received versions to the
//! local segments. The same task re-reads the authoritative versions every
//! reconciliation interval, so a lost message delays an invalidation but
//! never drops it.
//!
//! ```text
//! Replica A: evict("permissions", "user-42")
//!   ↓ INCR cache:version:permissions → 8
//!   ↓ PUBLISH cache:invalidate:permissions {"namespace":"permissions","version":8,"key_hint":"user-42"}
//! Replica B: listener receives version 8 (last seen 7) → drops user-42 entries
//! Replica C: listener receives version 8 (last seen 6) → gap, clears the namespace
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::namespace::Namespace;
use crate::registry::{Advance, NamespaceTable, Segment};
use crate::store::{DistributedStore, MessageStream, StoreMessage};

/// Payload broadcast on a namespace's invalidation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub namespace: Namespace,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hint: Option<String>,
}

/// Settings for the listener task
#[derive(Debug, Clone)]
pub(crate) struct ListenerSettings {
    pub enable_pubsub: bool,
    pub reconciliation_interval: Duration,
    pub max_backoff: Duration,
}

/// Background listener applying remote invalidations to local segments
pub(crate) struct InvalidationListener {
    store: Arc<dyn DistributedStore>,
    segments: Vec<Arc<Segment>>,
    by_channel: HashMap<String, Arc<Segment>>,
    settings: ListenerSettings,
}

/// Handle to a running listener
pub(crate) struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    subscribed_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Wait until the first subscription is in place, up to `timeout`
    pub(crate) async fn wait_subscribed(&mut self, timeout: Duration) -> bool {
        let subscribed = self.subscribed_rx.wait_for(|subscribed| *subscribed);
        matches!(tokio::time::timeout(timeout, subscribed).await, Ok(Ok(_)))
    }

    /// Signal the task to stop and wait for it
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Invalidation listener task failed: {}", e);
        }
    }
}

impl InvalidationListener {
    pub(crate) fn new(
        store: Arc<dyn DistributedStore>,
        table: &NamespaceTable,
        settings: ListenerSettings,
    ) -> Self {
        let segments = table.all();
        let by_channel = segments
            .iter()
            .map(|segment| {
                let channel = segment
                    .versions()
                    .keys()
                    .invalidation_channel(segment.namespace());
                (channel, Arc::clone(segment))
            })
            .collect();
        Self {
            store,
            segments,
            by_channel,
            settings,
        }
    }

    /// Spawn the listener task
    pub(crate) fn spawn(self) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (subscribed_tx, subscribed_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx, subscribed_tx));
        ListenerHandle {
            shutdown_tx,
            subscribed_rx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, subscribed: watch::Sender<bool>) {
        if !self.settings.enable_pubsub {
            let _ = subscribed.send(true);
            self.reconcile_only(&mut shutdown).await;
            return;
        }

        let mut channels: Vec<String> = self.by_channel.keys().cloned().collect();
        channels.sort();
        let initial_backoff = Duration::from_secs(1);
        let mut backoff = initial_backoff;

        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.store.subscribe(&channels).await {
                Ok(stream) => {
                    info!("Subscribed to {} invalidation channels", channels.len());
                    backoff = initial_backoff;
                    let _ = subscribed.send(true);
                    // Anything published while we were not subscribed is lost
                    self.reconcile_all().await;
                    if self.consume(stream, &mut shutdown).await {
                        return;
                    }
                    let _ = subscribed.send(false);
                    warn!("Invalidation subscription closed, reconnecting");
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Invalidation listener error, reconnecting..."
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff = (backoff * 2).min(self.settings.max_backoff);
                }
            }
        }
    }

    /// Process messages until the stream ends (false) or shutdown (true)
    async fn consume(&self, mut stream: MessageStream, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return true,
                _ = ticker.tick() => self.reconcile_all().await,
                msg = stream.next() => match msg {
                    Some(msg) => self.dispatch(&msg),
                    None => return false,
                },
            }
        }
    }

    async fn reconcile_only(&self, shutdown: &mut watch::Receiver<bool>) {
        self.reconcile_all().await;
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.reconcile_all().await,
            }
        }
    }

    fn ticker(&self) -> tokio::time::Interval {
        let period = self.settings.reconciliation_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn reconcile_all(&self) {
        for segment in &self.segments {
            if let Err(e) = segment.reconcile().await {
                warn!(
                    namespace = %segment.namespace(),
                    error = %e,
                    "Version reconciliation failed; serving local entries"
                );
            }
        }
    }

    fn dispatch(&self, msg: &StoreMessage) {
        let message = match serde_json::from_str::<InvalidationMessage>(&msg.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Failed to decode invalidation payload on {}: {}",
                    msg.channel, e
                );
                return;
            }
        };

        let Some(segment) = self.by_channel.get(&msg.channel) else {
            debug!("No namespace registered for channel {}", msg.channel);
            return;
        };
        if segment.namespace() != &message.namespace {
            warn!(
                "Invalidation for namespace {} arrived on channel {}; ignoring",
                message.namespace, msg.channel
            );
            return;
        }

        let advance = segment.apply(message.version, message.key_hint.as_deref());
        match advance {
            Advance::Stale => debug!(
                namespace = %message.namespace,
                version = message.version,
                "Ignoring already observed version"
            ),
            Advance::Targeted | Advance::Cleared => debug!(
                namespace = %message.namespace,
                version = message.version,
                key_hint = ?message.key_hint,
                ?advance,
                "L1 cache invalidated"
            ),
        }
    }
}
