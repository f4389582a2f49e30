//! The command dispatcher: synthesises the outbound AT frame for a
//! [`crate::reducer::CommandIntent`], gates it against the per-IMEI
//! in-flight marker, and clears that marker on a matching ACK.
//!
//! The wire push only ever happens inside the reply slot of an inbound
//! frame — there is no unsolicited server-initiated frame (SPEC_FULL.md
//! §4.5). This module owns the IDLE → PENDING → IN_FLIGHT state machine
//! described there; the reducer only ever decides *what* command a device
//! ought to receive, never whether now is a safe time to send it.

use crate::codec::{encode_gtout, encode_gtsri, OutputBit};
use crate::config::Config;
use crate::reducer::CommandKind;
use crate::registry::{ConnSlot, InFlightCommand, PENDING_QUEUE_DEPTH, STALE_COMMAND_WINDOW};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Synthesises and gates outbound commands for one server instance. Stateless
/// beyond the protocol constants every outbound frame needs; the actual
/// in-flight bookkeeping lives on the [`ConnSlot`] the caller passes in.
pub struct Dispatcher {
    device_password: String,
    primary_server_ip: String,
    primary_server_port: u16,
    backup_server_ip: String,
    backup_server_port: u16,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Self {
        Dispatcher {
            device_password: config.device_password.clone(),
            primary_server_ip: config.primary_server_ip.clone(),
            primary_server_port: config.primary_server_port,
            backup_server_ip: config.backup_server_ip.clone(),
            backup_server_port: config.backup_server_port,
        }
    }

    fn synthesize(&self, kind: CommandKind) -> String {
        match kind {
            CommandKind::Block => encode_gtout(&self.device_password, OutputBit::Block),
            CommandKind::Unblock => encode_gtout(&self.device_password, OutputBit::Unblock),
            CommandKind::IpChange => encode_gtsri(
                &self.device_password,
                &self.primary_server_ip,
                self.primary_server_port,
                &self.backup_server_ip,
                self.backup_server_port,
            ),
        }
    }

    /// Offer this frame's reducer-decided command intent (if any) to the
    /// connection's queue, then decide whether the reply slot may actually
    /// carry a command onto the wire right now.
    ///
    /// A fresh intent is enqueued (deduped against the queue's tail so a
    /// pending flag that's still set every frame doesn't pile up duplicate
    /// entries) before the in-flight check runs, so a command whose marker
    /// just went stale is resent from the queue rather than from the fresh
    /// intent directly — this is what makes a lost ACK self-heal on the next
    /// command-dispatch opportunity (SPEC_FULL.md §4.5, scenario 2).
    pub async fn dispatch(
        &self,
        slot: &Arc<Mutex<ConnSlot>>,
        intent: Option<CommandKind>,
    ) -> Option<String> {
        let mut guard = slot.lock().await;
        if let Some(kind) = intent {
            if guard.pending_queue.back().copied() != Some(kind) {
                if guard.pending_queue.len() >= PENDING_QUEUE_DEPTH {
                    guard.pending_queue.pop_front();
                }
                guard.pending_queue.push_back(kind);
            }
        }

        let now = Instant::now();
        let can_send = match guard.in_flight {
            None => true,
            Some(InFlightCommand { sent_at, .. }) => now.duration_since(sent_at) >= STALE_COMMAND_WINDOW,
        };
        if !can_send {
            return None;
        }
        let kind = guard.pending_queue.pop_front()?;
        let frame = self.synthesize(kind);
        guard.in_flight = Some(InFlightCommand { kind, sent_at: now });
        Some(frame)
    }

    /// Clear the in-flight marker when an inbound ACK confirms it, but only
    /// if the marker's kind matches what this ACK is actually confirming —
    /// a mismatched ACK leaves the marker in place (state diagram:
    /// `IN_FLIGHT --(mismatched ACK)--> PENDING`, modeled here as simply not
    /// clearing, since the next stale check will trigger the same resend
    /// path as a lost ACK).
    pub async fn clear_in_flight(&self, slot: &Arc<Mutex<ConnSlot>>, matches: impl Fn(CommandKind) -> bool) {
        let mut guard = slot.lock().await;
        if guard.in_flight.map(|c| matches(c.kind)) == Some(true) {
            guard.in_flight = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&Config {
            device_password: "gv50".to_string(),
            primary_server_ip: "1.2.3.4".to_string(),
            primary_server_port: 8000,
            backup_server_ip: "5.6.7.8".to_string(),
            backup_server_port: 8001,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn emits_command_when_no_marker_present() {
        let registry = Registry::new();
        let slot = registry.register("1.2.3.4".to_string()).await;
        let d = dispatcher();

        let frame = d.dispatch(&slot, Some(CommandKind::Block)).await;
        assert_eq!(frame.as_deref(), Some("AT+GTOUT=gv50,1,,,,,,0,,,,,,,0001$"));
        assert!(slot.lock().await.in_flight.is_some());
    }

    #[tokio::test]
    async fn refuses_second_command_while_marker_is_fresh() {
        let registry = Registry::new();
        let slot = registry.register("1.2.3.4".to_string()).await;
        let d = dispatcher();

        d.dispatch(&slot, Some(CommandKind::Block)).await;
        let second = d.dispatch(&slot, Some(CommandKind::Block)).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn resends_once_marker_goes_stale() {
        let registry = Registry::new();
        let slot = registry.register("1.2.3.4".to_string()).await;
        let d = dispatcher();

        d.dispatch(&slot, Some(CommandKind::Block)).await;
        {
            let mut guard = slot.lock().await;
            let marker = guard.in_flight.as_mut().unwrap();
            marker.sent_at = Instant::now() - STALE_COMMAND_WINDOW;
        }
        let resend = d.dispatch(&slot, Some(CommandKind::Block)).await;
        assert_eq!(resend.as_deref(), Some("AT+GTOUT=gv50,1,,,,,,0,,,,,,,0001$"));
    }

    #[tokio::test]
    async fn clear_in_flight_ignores_mismatched_kind() {
        let registry = Registry::new();
        let slot = registry.register("1.2.3.4".to_string()).await;
        let d = dispatcher();

        d.dispatch(&slot, Some(CommandKind::IpChange)).await;
        d.clear_in_flight(&slot, |k| matches!(k, CommandKind::Block | CommandKind::Unblock))
            .await;
        assert!(slot.lock().await.in_flight.is_some());

        d.clear_in_flight(&slot, |k| matches!(k, CommandKind::IpChange)).await;
        assert!(slot.lock().await.in_flight.is_none());
    }
}
