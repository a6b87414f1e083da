//! Cross-node signalling over Postgres `LISTEN`/`NOTIFY`.
//!
//! One long-lived listener connection watches every channel and fans
//! incoming payloads out to broadcast subscribers. Delivery is best-effort
//! by contract: every consumer of these events also polls on a bounded
//! timer, so a missed notification only costs latency, never correctness.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Ident that matches every producer in a queue.
pub const IDENT_ANY: &str = "any";

/// Notification channels the runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A job was enqueued; payload names the queue.
    Insert,
    /// Control signals targeting producers.
    Signal,
    /// Leadership changes.
    Leader,
}

impl Channel {
    const ALL: [Channel; 3] = [Channel::Insert, Channel::Signal, Channel::Leader];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Insert => "stoker_insert",
            Channel::Signal => "stoker_signal",
            Channel::Leader => "stoker_leader",
        }
    }

    fn from_name(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|channel| channel.as_str() == name)
    }
}

/// Payload for the `insert` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertPayload {
    pub queue: String,
}

/// Actions a signal can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Pause,
    Resume,
    Cancel,
}

/// Payload for the `signal` channel.
///
/// `ident` is either [`IDENT_ANY`] or a concrete `"{name}.{node}"` producer
/// identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    pub queue: String,
    pub ident: String,
    pub action: SignalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
}

impl SignalPayload {
    /// Whether this signal addresses the producer for `queue` with `ident`.
    pub fn matches(&self, queue: &str, ident: &str) -> bool {
        self.queue == queue && (self.ident == IDENT_ANY || self.ident == ident)
    }
}

/// The listener half plus typed broadcast fan-out.
pub struct Notifier {
    pool: PgPool,
    insert_tx: broadcast::Sender<InsertPayload>,
    signal_tx: broadcast::Sender<SignalPayload>,
    leader_tx: broadcast::Sender<Value>,
}

impl Notifier {
    pub fn new(pool: PgPool) -> Self {
        let (insert_tx, _) = broadcast::channel(256);
        let (signal_tx, _) = broadcast::channel(64);
        let (leader_tx, _) = broadcast::channel(16);

        Self {
            pool,
            insert_tx,
            signal_tx,
            leader_tx,
        }
    }

    pub fn subscribe_inserts(&self) -> broadcast::Receiver<InsertPayload> {
        self.insert_tx.subscribe()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SignalPayload> {
        self.signal_tx.subscribe()
    }

    pub fn subscribe_leader(&self) -> broadcast::Receiver<Value> {
        self.leader_tx.subscribe()
    }

    /// Publish a payload to a channel. Best-effort; callers treat failures
    /// as lost wakeups, not errors.
    pub async fn notify(&self, channel: Channel, payload: &impl Serialize) -> Result<()> {
        notify(&self.pool, channel, payload).await
    }

    /// Run the listen loop until shutdown.
    ///
    /// Connection failures are logged and retried on a short delay; the
    /// components downstream keep working off their poll timers meanwhile.
    pub async fn run(self: std::sync::Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let mut listener = match self.connect().await {
                Ok(listener) => listener,
                Err(error) => {
                    warn!(error = ?error, "notifier failed to connect, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = shutdown_rx.recv() => return,
                    }
                }
            };

            debug!("notifier listening");

            loop {
                tokio::select! {
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            self.dispatch(notification.channel(), notification.payload());
                        }
                        Err(error) => {
                            warn!(error = ?error, "notifier connection lost, reconnecting");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => return,
                }
            }
        }
    }

    async fn connect(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;

        for channel in Channel::ALL {
            listener.listen(channel.as_str()).await?;
        }

        Ok(listener)
    }

    fn dispatch(&self, channel: &str, payload: &str) {
        let Some(channel) = Channel::from_name(channel) else {
            trace!(channel, "notification on unknown channel");
            return;
        };

        // Send failures mean nobody is subscribed, which is fine.
        let delivered = match channel {
            Channel::Insert => match serde_json::from_str::<InsertPayload>(payload) {
                Ok(parsed) => self.insert_tx.send(parsed).is_ok(),
                Err(error) => {
                    warn!(payload, error = ?error, "malformed insert notification");
                    return;
                }
            },
            Channel::Signal => match serde_json::from_str::<SignalPayload>(payload) {
                Ok(parsed) => self.signal_tx.send(parsed).is_ok(),
                Err(error) => {
                    warn!(payload, error = ?error, "malformed signal notification");
                    return;
                }
            },
            Channel::Leader => match serde_json::from_str::<Value>(payload) {
                Ok(parsed) => self.leader_tx.send(parsed).is_ok(),
                Err(_) => return,
            },
        };

        trace!(channel = channel.as_str(), delivered, "notification dispatched");
    }
}

/// Publish a payload without holding a [`Notifier`], e.g. from the enqueue
/// path.
pub async fn notify(pool: &PgPool, channel: Channel, payload: &impl Serialize) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel.as_str())
        .bind(serde_json::to_string(payload)?)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_matching_honors_queue_and_ident() {
        let signal = SignalPayload {
            queue: "default".into(),
            ident: IDENT_ANY.into(),
            action: SignalAction::Pause,
            job_id: None,
        };

        assert!(signal.matches("default", "stoker.node-a"));
        assert!(!signal.matches("mailers", "stoker.node-a"));

        let targeted = SignalPayload {
            ident: "stoker.node-a".into(),
            ..signal
        };

        assert!(targeted.matches("default", "stoker.node-a"));
        assert!(!targeted.matches("default", "stoker.node-b"));
    }

    #[test]
    fn signal_payload_round_trips() {
        let json = r#"{"queue":"default","ident":"any","action":"cancel","job_id":42}"#;
        let parsed: SignalPayload = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.action, SignalAction::Cancel);
        assert_eq!(parsed.job_id, Some(42));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }
}
