//! Broker I/O worker.
//!
//! Single owner of the MQTT client, the Sparkplug session (and with it the
//! `seq` counter, alias store and birth cache). All publish calls funnel
//! through its command channel, which guarantees strict publish ordering.
//! While the broker is down the channel is not drained, so the bounded
//! queues backpressure the pipeline up to ingress.
//!
//! Each broker session recreates the client: the last-will NDEATH must
//! carry the next session's `bdSeq`, and a will is fixed at connect time.

use crate::config::AgentConfig;
use crate::observability::{record_error, record_retained_publish, record_sparkplug_message, HealthState};
use crate::retained::RetainedPublish;
use crate::sparkplug::{Outbound, SparkplugSession};
use aas_uplink_core::LeafRecord;
use aas_uplink_proto::payload::{decode_payload, is_rebirth_command};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Work for the broker worker.
#[derive(Debug)]
pub enum BrokerCommand {
    /// Retained-plane publish (retain true, configured QoS)
    Retained(RetainedPublish),
    /// Clear retained state on a topic (empty payload, retain true)
    ClearRetained {
        /// Topic to clear
        topic: String,
    },
    /// System topic publish (alerts, lifecycle events, contexts, acks)
    System {
        /// Topic
        topic: String,
        /// Payload
        payload: Vec<u8>,
        /// Retain flag (context dictionary topics are retained)
        retain: bool,
    },
    /// Data for one Sparkplug device
    DeviceData {
        /// Device identifier
        device_id: String,
        /// Complete metric set of the device
        all: Vec<LeafRecord>,
        /// Metrics that changed in this pass
        changed: Vec<LeafRecord>,
    },
    /// A device went offline (stale timeout)
    DeviceOffline {
        /// Device identifier
        device_id: String,
    },
    /// Graceful shutdown: deaths, disconnect, exit
    Shutdown,
}

/// A message received on a subscribed command topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Full topic
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// The broker refused the connection outright (bad credentials, banned
/// client id). Retrying cannot help; the daemon exits with an I/O-fatal
/// code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("broker refused connection: {0}")]
pub struct BrokerRefused(pub String);

enum SessionEnd {
    Lost,
    Shutdown,
}

/// Run the broker worker until shutdown.
///
/// Reconnects with exponential backoff between the configured bounds; every
/// established session gets a fresh `bdSeq` and a matching last-will.
///
/// # Errors
///
/// Returns error on unrecoverable store failures.
pub async fn run_broker_worker(
    config: AgentConfig,
    mut session: SparkplugSession,
    mut command_rx: mpsc::Receiver<BrokerCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    command_filter: String,
    health: Arc<HealthState>,
) -> anyhow::Result<()> {
    let (min_delay, max_delay) = config.reconnect_delays();
    let mut delay = min_delay;

    loop {
        let (will_topic, will_payload) = session.will(now_ms())?;

        let mut options =
            MqttOptions::new(&config.mqtt.client_id, &config.mqtt.host, config.mqtt.port);
        options.set_keep_alive(Duration::from_secs(config.mqtt.keepalive_seconds));
        options.set_last_will(LastWill::new(will_topic, will_payload, QoS::AtMostOnce, false));
        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 256);

        let end = drive_session(
            &config,
            &mut session,
            &mut command_rx,
            &inbound_tx,
            &command_filter,
            &health,
            &client,
            eventloop,
        )
        .await?;

        match end {
            SessionEnd::Shutdown => return Ok(()),
            SessionEnd::Lost => {
                health.set_connected(false);
                session.on_disconnect();
                tracing::warn!(delay_seconds = delay.as_secs(), "Broker lost, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_session(
    config: &AgentConfig,
    session: &mut SparkplugSession,
    command_rx: &mut mpsc::Receiver<BrokerCommand>,
    inbound_tx: &mpsc::Sender<InboundMessage>,
    command_filter: &str,
    health: &Arc<HealthState>,
    client: &AsyncClient,
    mut eventloop: EventLoop,
) -> anyhow::Result<SessionEnd> {
    let mut connected = false;

    let end = loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected = true;
                    health.set_connected(true);
                    tracing::info!(
                        host = %config.mqtt.host,
                        port = config.mqtt.port,
                        "Connected to broker"
                    );

                    if config.sparkplug.enabled {
                        // Persistence faults are retried once, then fatal.
                        let births = match session.on_connect(now_ms()) {
                            Ok(births) => births,
                            Err(first) => {
                                tracing::error!(error = %first, "Session store failed, retrying");
                                record_error("persistence");
                                session.on_connect(now_ms())?
                            }
                        };
                        for message in births {
                            publish_sparkplug(client, message).await;
                        }
                        if let Err(e) =
                            client.subscribe(session.command_topic(), QoS::AtMostOnce).await
                        {
                            tracing::error!(error = %e, "NCMD subscribe failed");
                        }
                    }
                    if config.sync.enabled {
                        if let Err(e) = client.subscribe(command_filter, QoS::AtLeastOnce).await {
                            tracing::error!(error = %e, "Command subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(config, session, inbound_tx, client, &publish.topic, &publish.payload)
                        .await;
                }
                Ok(_) => {}
                Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                    return Err(BrokerRefused(format!("{code:?}")).into());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Broker connection error");
                    break SessionEnd::Lost;
                }
            },

            // Commands are only drained while the broker is up; the bounded
            // channel backpressures the pipeline otherwise.
            command = command_rx.recv(), if connected => {
                match command {
                    None | Some(BrokerCommand::Shutdown) => break SessionEnd::Shutdown,
                    Some(command) => handle_command(config, session, client, command).await,
                }
            }
        }
    };

    if let SessionEnd::Shutdown = end {
        graceful_shutdown(config, session, health, client, &mut eventloop).await;
    }
    Ok(end)
}

async fn handle_publish(
    config: &AgentConfig,
    session: &mut SparkplugSession,
    inbound_tx: &mpsc::Sender<InboundMessage>,
    client: &AsyncClient,
    topic: &str,
    payload: &[u8],
) {
    if config.sparkplug.enabled && topic == session.command_topic() {
        let rebirth = decode_payload(payload)
            .map(|decoded| is_rebirth_command(&decoded))
            .unwrap_or(false);
        if rebirth {
            tracing::info!("Rebirth command received");
            match session.on_rebirth(now_ms()) {
                Ok(messages) => {
                    for message in messages {
                        publish_sparkplug(client, message).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Rebirth failed");
                    record_error("sparkplug_rebirth");
                }
            }
        }
        return;
    }

    if topic.ends_with("/cmd") {
        let inbound = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        if inbound_tx.try_send(inbound).is_err() {
            tracing::warn!(topic, "Command queue full, dropping command");
            record_error("command_overflow");
        }
    }
}

async fn handle_command(
    config: &AgentConfig,
    session: &mut SparkplugSession,
    client: &AsyncClient,
    command: BrokerCommand,
) {
    match command {
        BrokerCommand::Retained(publish) => {
            let qos = qos_from(config.uns.qos);
            if let Err(e) = client.publish(&publish.topic, qos, true, publish.payload).await {
                tracing::error!(topic = %publish.topic, error = %e, "Retained publish failed");
                record_error("broker_publish");
            } else {
                record_retained_publish();
            }
        }
        BrokerCommand::ClearRetained { topic } => {
            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, true, Vec::new()).await {
                tracing::error!(topic, error = %e, "Retained clear failed");
            }
        }
        BrokerCommand::System { topic, payload, retain } => {
            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, retain, payload).await {
                tracing::error!(topic, error = %e, "System publish failed");
                record_error("broker_publish");
            }
        }
        BrokerCommand::DeviceData { device_id, all, changed } => {
            if !config.sparkplug.enabled {
                return;
            }
            match session.on_device_data(&device_id, &all, &changed, now_ms()) {
                Ok(messages) => {
                    for message in messages {
                        publish_sparkplug(client, message).await;
                    }
                }
                Err(e) => {
                    tracing::error!(device_id, error = %e, "Device data failed");
                    record_error("sparkplug_data");
                }
            }
        }
        BrokerCommand::DeviceOffline { device_id } => {
            if !config.sparkplug.enabled {
                return;
            }
            match session.on_device_offline(&device_id, now_ms()) {
                Ok(Some(message)) => publish_sparkplug(client, message).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(device_id, error = %e, "Device death failed");
                    record_error("sparkplug_death");
                }
            }
        }
        BrokerCommand::Shutdown => {}
    }
}

async fn publish_sparkplug(client: &AsyncClient, message: Outbound) {
    // Sparkplug traffic is QoS 0, retain false throughout.
    let message_type = message.topic.split('/').nth(2).unwrap_or("unknown").to_string();
    match client
        .publish(&message.topic, QoS::AtMostOnce, false, message.payload)
        .await
    {
        Ok(()) => record_sparkplug_message(&message_type),
        Err(e) => {
            tracing::error!(topic = %message.topic, error = %e, "Sparkplug publish failed");
            record_error("broker_publish");
        }
    }
}

/// Publish the death messages, disconnect, and drain the event loop so the
/// queued messages reach the wire.
async fn graceful_shutdown(
    config: &AgentConfig,
    session: &mut SparkplugSession,
    health: &Arc<HealthState>,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
) {
    tracing::info!("Broker worker shutting down");

    if config.sparkplug.enabled {
        match session.on_shutdown(now_ms()) {
            Ok(messages) => {
                for message in messages {
                    publish_sparkplug(client, message).await;
                }
            }
            Err(e) => tracing::error!(error = %e, "Shutdown deaths failed"),
        }
    }
    let _ = client.disconnect().await;

    let drain = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
    let _ = drain.await;
    health.set_connected(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtLeastOnce);
    }
}
