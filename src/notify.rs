//! The push-notification gateway contract (SPEC_FULL.md §6.3) plus two
//! in-process implementations.
//!
//! Best-effort by design: the core never awaits delivery success inline
//! with frame processing (see [`crate::connection`], which spawns delivery
//! as a detached task), and a failure is swallowed rather than propagated.

use async_trait::async_trait;
use std::collections::HashMap;

/// The contract the core depends on for push delivery. The production
/// Firebase-backed gateway is out of scope for the core (SPEC_FULL.md §1);
/// [`LoggingGateway`] stands in for it here.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    fn enabled(&self) -> bool;
    async fn send_to_token(
        &self,
        token: &str,
        title: &str,
        body: &str,
        data: &HashMap<String, String>,
    ) -> bool;
    async fn send_to_topic(
        &self,
        topic: &str,
        title: &str,
        body: &str,
        data: &HashMap<String, String>,
    ) -> bool;
}

/// Logs the notification at info level and reports success. Used when
/// `notifications_enabled = true` but no real gateway is wired in.
pub struct LoggingGateway;

#[async_trait]
impl NotificationGateway for LoggingGateway {
    fn enabled(&self) -> bool {
        true
    }

    async fn send_to_token(
        &self,
        token: &str,
        title: &str,
        body: &str,
        data: &HashMap<String, String>,
    ) -> bool {
        log::info!("notify token={token} title={title:?} body={body:?} data={data:?}");
        true
    }

    async fn send_to_topic(
        &self,
        topic: &str,
        title: &str,
        body: &str,
        data: &HashMap<String, String>,
    ) -> bool {
        log::info!("notify topic={topic} title={title:?} body={body:?} data={data:?}");
        true
    }
}

/// Disables notifications entirely (`notifications_enabled = false`).
pub struct NullGateway;

#[async_trait]
impl NotificationGateway for NullGateway {
    fn enabled(&self) -> bool {
        false
    }

    async fn send_to_token(&self, _: &str, _: &str, _: &str, _: &HashMap<String, String>) -> bool {
        false
    }

    async fn send_to_topic(&self, _: &str, _: &str, _: &str, _: &HashMap<String, String>) -> bool {
        false
    }
}
