//! The fleet registry: the process-wide map of live connections, indexed
//! both by connection id and by bound IMEI, plus the stale-connection
//! sweeper. This is the only cross-task mutable state in the server beyond
//! the store; everything else (codec buffer, parser, reducer output) is
//! local to a single connection's task.

use crate::reducer::CommandKind;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// How long an in-flight command marker is honored before a retry is
/// permitted on the same pending intent.
pub const STALE_COMMAND_WINDOW: Duration = Duration::from_secs(60);

/// Bounded FIFO depth for commands queued behind one already in flight.
/// Oldest entry is dropped on overflow.
pub const PENDING_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct InFlightCommand {
    pub kind: CommandKind,
    pub sent_at: Instant,
}

/// Everything the registry tracks about one live TCP connection.
pub struct ConnSlot {
    pub conn_id: u64,
    pub client_ip: String,
    pub imei: Option<String>,
    pub last_activity: Instant,
    pub cancel: CancellationToken,
    pub in_flight: Option<InFlightCommand>,
    pub pending_queue: VecDeque<CommandKind>,
}

impl ConnSlot {
    fn new(conn_id: u64, client_ip: String) -> Self {
        ConnSlot {
            conn_id,
            client_ip,
            imei: None,
            last_activity: Instant::now(),
            cancel: CancellationToken::new(),
            in_flight: None,
            pending_queue: VecDeque::new(),
        }
    }
}

#[derive(Default)]
pub struct Registry {
    by_conn_id: Mutex<HashMap<u64, Arc<Mutex<ConnSlot>>>>,
    by_imei: Mutex<HashMap<String, Arc<Mutex<ConnSlot>>>>,
    next_conn_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connection_count(&self) -> usize {
        self.by_conn_id.lock().await.len()
    }

    /// Register a freshly accepted connection before its IMEI is known.
    pub async fn register(&self, client_ip: String) -> Arc<Mutex<ConnSlot>> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(ConnSlot::new(conn_id, client_ip)));
        self.by_conn_id
            .lock()
            .await
            .insert(conn_id, Arc::clone(&slot));
        slot
    }

    /// Bind an IMEI to a connection, displacing any previous connection
    /// bound to the same IMEI. Returns the displaced connection's
    /// cancellation token so the caller can tear it down; at most one
    /// connection is ever bound to an IMEI at a time.
    pub async fn bind_imei(&self, slot: &Arc<Mutex<ConnSlot>>, imei: &str) -> Option<CancellationToken> {
        let mut by_imei = self.by_imei.lock().await;
        let displaced = by_imei.insert(imei.to_string(), Arc::clone(slot));
        slot.lock().await.imei = Some(imei.to_string());
        match displaced {
            Some(old) if !Arc::ptr_eq(&old, slot) => Some(old.lock().await.cancel.clone()),
            _ => None,
        }
    }

    pub async fn touch(&self, slot: &Arc<Mutex<ConnSlot>>) {
        slot.lock().await.last_activity = Instant::now();
    }

    /// Remove a connection's bookkeeping on close. Only removes the IMEI
    /// binding if it still points at this exact connection — a connection
    /// that was displaced must not clobber its successor's binding.
    pub async fn unregister(&self, slot: &Arc<Mutex<ConnSlot>>) {
        let (conn_id, imei) = {
            let guard = slot.lock().await;
            (guard.conn_id, guard.imei.clone())
        };
        self.by_conn_id.lock().await.remove(&conn_id);
        if let Some(imei) = imei {
            let mut by_imei = self.by_imei.lock().await;
            if let Some(current) = by_imei.get(&imei) {
                if Arc::ptr_eq(current, slot) {
                    by_imei.remove(&imei);
                }
            }
        }
    }

    /// Snapshot `(conn_id, last_activity)` without holding the registry
    /// lock across any I/O, then return the cancellation tokens of
    /// connections idle longer than `timeout`. The caller cancels them
    /// outside any lock this function holds.
    pub async fn sweep(&self, timeout: Duration) -> Vec<CancellationToken> {
        let slots: Vec<Arc<Mutex<ConnSlot>>> =
            self.by_conn_id.lock().await.values().cloned().collect();
        let now = Instant::now();
        let mut stale = Vec::new();
        for slot in slots {
            let guard = slot.lock().await;
            if now.duration_since(guard.last_activity) >= timeout {
                stale.push(guard.cancel.clone());
            }
        }
        stale
    }

    /// Cancel every live connection's task. Used once, at graceful shutdown;
    /// the accept loop stops handing out new slots before this is called, so
    /// there's no race against fresh registrations.
    pub async fn cancel_all(&self) {
        let slots: Vec<Arc<Mutex<ConnSlot>>> =
            self.by_conn_id.lock().await.values().cloned().collect();
        for slot in slots {
            slot.lock().await.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binding_the_same_imei_twice_displaces_the_first_connection() {
        let registry = Registry::new();
        let first = registry.register("1.2.3.4".to_string()).await;
        let second = registry.register("5.6.7.8".to_string()).await;

        let displaced = registry.bind_imei(&first, "865083030049613").await;
        assert!(displaced.is_none());

        let displaced = registry.bind_imei(&second, "865083030049613").await;
        assert!(displaced.is_some());
        assert!(!displaced.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn unregister_after_displacement_does_not_remove_successor_binding() {
        let registry = Registry::new();
        let first = registry.register("1.2.3.4".to_string()).await;
        let second = registry.register("5.6.7.8".to_string()).await;
        registry.bind_imei(&first, "865083030049613").await;
        registry.bind_imei(&second, "865083030049613").await;

        registry.unregister(&first).await;

        let by_imei = registry.by_imei.lock().await;
        let bound = by_imei.get("865083030049613").unwrap();
        assert!(Arc::ptr_eq(bound, &second));
    }

    #[tokio::test]
    async fn sweep_finds_only_connections_past_the_timeout() {
        let registry = Registry::new();
        let slot = registry.register("1.2.3.4".to_string()).await;
        {
            let mut guard = slot.lock().await;
            guard.last_activity = Instant::now() - Duration::from_secs(120);
        }
        let stale = registry.sweep(Duration::from_secs(60)).await;
        assert_eq!(stale.len(), 1);
    }
}
