//! The per-connection task: one spawned per accepted TCP socket, tying
//! together the frame codec, parser, reducer and dispatcher for the
//! lifetime of one device's long connection (SPEC_FULL.md §4.4).
//!
//! This is deliberately the only module that performs socket I/O. The
//! reducer never reaches back into the connection (SPEC_FULL.md §9: the
//! source's handler/reducer cyclic reference is inverted here — the reducer
//! returns intents, this module owns the writer that acts on them).

use crate::codec::{encode_ack, FrameCodec, FramingError};
use crate::dispatcher::Dispatcher;
use crate::model::{Device, PartialDeviceUpdate};
use crate::notify::NotificationGateway;
use crate::parser::{self, ParseError, ParsedMessage, ReportPayload};
use crate::reducer::{self, CommandKind, NotificationIntent, ReducerConfig};
use crate::registry::{ConnSlot, Registry};
use crate::store::Store;
use chrono::Utc;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// The components every connection task needs, wired once at startup and
/// shared (behind `Arc`) by every spawned connection.
pub struct ConnectionContext {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn NotificationGateway>,
    pub dispatcher: Arc<Dispatcher>,
    pub reducer_config: ReducerConfig,
    pub connection_timeout: Duration,
    pub default_topic: String,
}

/// Apply the platform's closest available TCP keepalive pair (SPEC_FULL.md
/// §4.4: idle 60s / interval 10s / 6 probes on Linux, closest pair
/// elsewhere) and disable Nagle.
fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let keepalive = keepalive.with_retries(6);
    sock.set_tcp_keepalive(&keepalive)
}

/// Drive one accepted TCP connection to completion.
pub async fn handle_connection(ctx: Arc<ConnectionContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = configure_socket(&stream) {
        log::warn!("{peer}: failed to configure socket options: {e}");
    }
    run_connection(ctx, stream, peer).await;
}

/// Read frames until the socket closes, the peer errors out, or the
/// connection is cancelled (displaced by a reconnect, swept for inactivity,
/// or torn down for shutdown). Generic over the transport so tests can drive
/// it with an in-memory duplex pipe instead of a real socket.
async fn run_connection<S>(ctx: Arc<ConnectionContext>, mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_ip = peer.ip().to_string();
    let slot = ctx.registry.register(client_ip.clone()).await;
    let cancel = slot.lock().await.cancel.clone();
    log::info!("{peer}: connection accepted");

    let mut codec = FrameCodec::new();
    let mut buf = [0u8; 4096];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("{peer}: connection cancelled");
                break;
            }
            result = tokio::time::timeout(ctx.connection_timeout, stream.read(&mut buf)) => result,
        };

        let n = match read {
            Err(_elapsed) => {
                // A receive timeout is not a disconnect for this protocol
                // family (devices can go hours between heartbeats); the
                // sweeper, not this loop, owns liveness decisions.
                continue;
            }
            Ok(Ok(0)) => {
                log::info!("{peer}: closed cleanly");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                log::debug!("{peer}: socket read error: {e}");
                break;
            }
        };

        ctx.registry.touch(&slot).await;
        if let Err(FramingError::BufferOverflow) = codec.push(&buf[..n]) {
            log::warn!("{peer}: frame buffer overflowed without a terminator, buffer dropped");
            continue;
        }

        while let Some(frame) = codec.next_frame() {
            if let Err(e) = process_frame(&ctx, &slot, &client_ip, &frame, &mut stream).await {
                log::debug!("{peer}: write error, tearing down connection: {e}");
                ctx.registry.unregister(&slot).await;
                return;
            }
        }
    }

    ctx.registry.unregister(&slot).await;
}

/// Parse, reduce and act on one complete frame: persist, notify, ACK, and
/// possibly dispatch a command, in that order (SPEC_FULL.md §2's control
/// flow). Returns `Err` only for a socket write failure, which the caller
/// treats as connection teardown; parse/reduce/store failures are all
/// handled internally per §7 and never propagate.
async fn process_frame<S>(
    ctx: &Arc<ConnectionContext>,
    slot: &Arc<Mutex<ConnSlot>>,
    client_ip: &str,
    raw: &str,
    stream: &mut S,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let msg = match parser::parse_frame(raw) {
        Ok(msg) => msg,
        Err(ParseError::UnknownCategory(cat)) => {
            log::debug!("unrecognized frame category {cat:?}: {raw:?}");
            return Ok(());
        }
        Err(e) => {
            log::warn!("parse error on {raw:?}: {e}");
            return Ok(());
        }
    };

    if slot.lock().await.imei.is_none() {
        if let Some(displaced) = ctx.registry.bind_imei(slot, &msg.imei).await {
            log::info!("{} reconnected; displacing previous connection", msg.imei);
            displaced.cancel();
        }
    }

    let device = ctx
        .store
        .load_device(&msg.imei)
        .await
        .unwrap_or_else(|| Device::new(&msg.imei));
    let now = Utc::now();
    let outcome = reducer::reduce(&msg, client_ip, &device, &ctx.reducer_config, now);

    if let Some(sample) = outcome.telemetry {
        ctx.store.append_telemetry(sample).await;
    }
    if let Some(update) = outcome.device_update {
        ctx.store.upsert_device(&msg.imei, update.clone()).await;
        clear_in_flight_markers(ctx, slot, &msg, &update).await;
    }
    dispatch_notifications(ctx, outcome.notifications);

    let ack = encode_ack(
        &msg.report_type,
        msg.protocol_version.as_deref(),
        &msg.imei,
        msg.count,
        now,
    );
    stream.write_all(ack.as_bytes()).await?;

    let command_kind = outcome.command_intent.map(|intent| intent.kind);
    if let Some(frame) = ctx.dispatcher.dispatch(slot, command_kind).await {
        stream.write_all(frame.as_bytes()).await?;
    }

    Ok(())
}

/// Release the dispatcher's in-flight marker when this frame's update just
/// confirmed the intent it was waiting on (SPEC_FULL.md §4.3/§4.5: a `GTOUT`
/// ack clears the block/unblock marker, a `GTSRI` ack clears the IP-change
/// marker).
async fn clear_in_flight_markers(
    ctx: &Arc<ConnectionContext>,
    slot: &Arc<Mutex<ConnSlot>>,
    msg: &ParsedMessage,
    update: &PartialDeviceUpdate,
) {
    match &msg.payload {
        ReportPayload::Output { .. } if update.block_cmd_pending == Some(None) => {
            ctx.dispatcher
                .clear_in_flight(slot, |k| matches!(k, CommandKind::Block | CommandKind::Unblock))
                .await;
        }
        ReportPayload::Migration { .. } if update.ip_change_pending == Some(false) => {
            ctx.dispatcher
                .clear_in_flight(slot, |k| matches!(k, CommandKind::IpChange))
                .await;
        }
        _ => {}
    }
}

/// Hand notification intents off to detached tasks so a slow or hanging
/// gateway can never stall this connection's frame loop (SPEC_FULL.md §6.3:
/// the core never awaits delivery success inline with frame processing).
fn dispatch_notifications(ctx: &Arc<ConnectionContext>, intents: Vec<NotificationIntent>) {
    if intents.is_empty() || !ctx.notifier.enabled() {
        return;
    }
    for intent in intents {
        let notifier = Arc::clone(&ctx.notifier);
        let store = Arc::clone(&ctx.store);
        let default_topic = ctx.default_topic.clone();
        tokio::spawn(async move {
            let mut data = intent.data.clone();
            data.insert("event_type".to_string(), intent.event_type.to_string());
            data.insert("imei".to_string(), intent.imei.clone());
            if let Some(plate) = &intent.plate {
                data.insert("plate".to_string(), plate.clone());
            }
            let title = title_for(intent.event_type);
            let body = format!("{} ({})", title, intent.imei);

            if let Some(customer_id) = &intent.customer_ref {
                if let Some(customer) = store.load_customer(customer_id).await {
                    if let Some(token) = customer.fcm_token {
                        notifier.send_to_token(&token, title, &body, &data).await;
                        return;
                    }
                }
            }
            notifier.send_to_topic(&default_topic, title, &body, &data).await;
        });
    }
}

fn title_for(event_type: &str) -> &'static str {
    match event_type {
        "ignition_on" => "Ignition on",
        "ignition_off" => "Ignition off",
        "low_battery" => "Low battery",
        "blocked" => "Vehicle blocked",
        "unblocked" => "Vehicle unblocked",
        "ip_changed" => "Device reconnected from a new address",
        _ => "Device event",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::notify::LoggingGateway;
    use crate::store::MemoryStore;
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};

    fn test_context() -> Arc<ConnectionContext> {
        let config = Config::default();
        Arc::new(ConnectionContext {
            registry: Arc::new(Registry::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(LoggingGateway),
            dispatcher: Arc::new(Dispatcher::new(&config)),
            reducer_config: ReducerConfig {
                low_battery_volts: config.low_battery_volts,
            },
            connection_timeout: Duration::from_secs(config.connection_timeout_s),
            default_topic: config.default_topic.clone(),
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:55555".parse().unwrap()
    }

    #[tokio::test]
    async fn happy_block_round_trip_over_a_duplex_socket() {
        let ctx = test_context();
        let imei = "865083030049613";
        ctx.store.request_block(imei, true).await;

        let (mut client, server) = duplex(4096);
        let handle = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { run_connection(ctx, server, peer()).await })
        };

        let frame = format!(
            "+RESP:GTFRI,090200,{imei},gv50,0,0,0,0,0,0,50.0,100.0,20.0,20250727122605,0,0,0,20250727122605,0001$"
        );
        client.write_all(frame.as_bytes()).await.unwrap();

        let mut response = vec![0u8; 256];
        let n = client.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.starts_with("+ACK:GTFRI"));
        assert!(text.contains("AT+GTOUT=gv50,1,"));

        let device = ctx.store.load_device(imei).await.unwrap();
        assert_eq!(device.block_cmd_pending, Some(true));
        assert!(!device.blocked);

        drop(client);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ack_gtout_clears_block_marker_and_pending_flag() {
        let ctx = test_context();
        let imei = "865083030049613";
        ctx.store.request_block(imei, true).await;

        let (mut client, server) = duplex(4096);
        let handle = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { run_connection(ctx, server, peer()).await })
        };

        let fri = format!(
            "+RESP:GTFRI,090200,{imei},gv50,0,0,0,0,0,0,50.0,100.0,20.0,20250727122605,0,0,0,20250727122605,0001$"
        );
        client.write_all(fri.as_bytes()).await.unwrap();
        let mut drain = vec![0u8; 256];
        client.read(&mut drain).await.unwrap();

        let ack = format!("+ACK:GTOUT,090200,{imei},gv50,0000,20250727122700,0001$");
        client.write_all(ack.as_bytes()).await.unwrap();
        let mut drain2 = vec![0u8; 256];
        let n = client.read(&mut drain2).await.unwrap();
        assert!(String::from_utf8_lossy(&drain2[..n]).starts_with("+ACK:GTOUT"));

        let device = ctx.store.load_device(imei).await.unwrap();
        assert!(device.blocked);
        assert_eq!(device.block_cmd_pending, None);

        drop(client);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ip_allowlist_style_unrecognized_frame_gets_no_ack() {
        let ctx = test_context();
        let (mut client, server) = duplex(4096);
        let handle = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { run_connection(ctx, server, peer()).await })
        };

        client.write_all(b"+WAT:GTFRI,1,2,3$").await.unwrap();
        // Nothing recognizable was sent; follow with a well-formed frame and
        // confirm exactly one ACK arrives (proving the first got none).
        let imei = "865083030049613";
        let fri = format!(
            "+RESP:GTFRI,090200,{imei},gv50,0,0,0,0,0,0,50.0,100.0,20.0,20250727122605,0,0,0,20250727122605,0001$"
        );
        client.write_all(fri.as_bytes()).await.unwrap();

        let mut response = vec![0u8; 256];
        let n = client.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert_eq!(text.matches("+ACK").count(), 1);

        drop(client);
        handle.await.unwrap();
    }
}
