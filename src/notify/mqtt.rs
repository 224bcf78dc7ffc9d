//! MQTT publisher for traffic alerts.
//!
//! Alerts go to `<prefix>/<channel>/<site>` with QoS 1. The payload is a JSON
//! envelope carrying subject, body, group and dedup keys and the full report
//! record. `<prefix>/status` carries a retained `online`/`offline` marker,
//! with `offline` registered as the last will.
//!
//! An alert counts as delivered only once the broker's PubAck arrives. A
//! full request queue, a dropped link or a missing ack within `ACK_TIMEOUT`
//! is a publish error; the caller is never blocked past that timeout.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::{Outgoing, Transport};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{PublishRequest, PublishTransport};
use crate::config::MqttSettings;
use crate::frame::site_slug;
use crate::report::DensityReport;

const AVAILABILITY_TOPIC_SUFFIX: &str = "status";
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 10;
/// Longest a publish waits for the broker's PubAck.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
const ACK_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

#[derive(Serialize)]
struct AlertEnvelope<'a> {
    channel: &'a str,
    subject: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup_key: Option<&'a str>,
    report: &'a DensityReport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Up,
    Down(String),
}

/// Packet-level progress reported by the connection thread.
#[derive(Debug)]
enum LinkEvent {
    Sent(u16),
    Acked(u16),
}

struct MqttRuntime {
    client: Client,
    link: Arc<Mutex<LinkState>>,
    events: Receiver<LinkEvent>,
    closing: Arc<AtomicBool>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection) -> Self {
        let closing = Arc::new(AtomicBool::new(false));
        let link = Arc::new(Mutex::new(LinkState::Connecting));
        let (tx, events) = mpsc::channel();
        let stop = closing.clone();
        let thread_link = link.clone();
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        set_link(&thread_link, LinkState::Up);
                    }
                    Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                        let _ = tx.send(LinkEvent::Acked(ack.pkid));
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        let _ = tx.send(LinkEvent::Sent(pkid));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}", e);
                        set_link(&thread_link, LinkState::Down(e.to_string()));
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
        });

        Self {
            client,
            link,
            events,
            closing,
            connection_handle: Some(handle),
        }
    }

    fn link(&self) -> LinkState {
        read_link(&self.link)
    }

    /// Queue a QoS 1 publish without waiting for the broker.
    fn enqueue(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|e| anyhow!("MQTT request queue rejected publish: {}", e))
    }

    /// Publish and wait for the broker's PubAck.
    fn publish_confirmed(&self, topic: &str, payload: &[u8], timeout: Duration) -> Result<()> {
        if let LinkState::Down(reason) = self.link() {
            return Err(anyhow!("MQTT broker unreachable: {}", reason));
        }
        while self.events.try_recv().is_ok() {}
        self.enqueue(topic, payload, false)?;
        wait_for_ack(&self.events, &self.link, timeout)
    }

    fn disconnect(&mut self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client
            .try_disconnect()
            .map_err(|e| anyhow!("MQTT disconnect not queued: {}", e))?;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn read_link(link: &Mutex<LinkState>) -> LinkState {
    link.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn set_link(link: &Mutex<LinkState>, state: LinkState) {
    *link.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
}

/// Wait for the next outgoing publish and its PubAck.
///
/// Fails on timeout, when the link drops, or when the connection thread is
/// gone.
fn wait_for_ack(
    events: &Receiver<LinkEvent>,
    link: &Mutex<LinkState>,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut pkid = None;
    loop {
        if let LinkState::Down(reason) = read_link(link) {
            return Err(anyhow!(
                "MQTT connection lost before acknowledgement: {}",
                reason
            ));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(anyhow!(
                "no PubAck from MQTT broker within {}ms",
                timeout.as_millis()
            ));
        }
        match events.recv_timeout((deadline - now).min(ACK_POLL)) {
            Ok(LinkEvent::Sent(id)) if pkid.is_none() => pkid = Some(id),
            Ok(LinkEvent::Acked(id)) if pkid == Some(id) => return Ok(()),
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("MQTT connection thread stopped"));
            }
        }
    }
}

pub struct MqttTransport {
    runtime: MqttRuntime,
    topic_prefix: String,
    availability_topic: String,
}

impl MqttTransport {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker_addr)?;
        let topic_prefix = settings.topic_prefix.trim_end_matches('/').to_string();
        let availability_topic = format!("{}/{}", topic_prefix, AVAILABILITY_TOPIC_SUFFIX);

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &availability_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        options.set_transport(build_transport(&endpoint, settings)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        log::info!(
            "Connecting to MQTT broker {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        let runtime = MqttRuntime::new(client, connection);
        runtime.enqueue(&availability_topic, PAYLOAD_ONLINE.as_bytes(), true)?;

        Ok(Self {
            runtime,
            topic_prefix,
            availability_topic,
        })
    }

    fn alert_topic(&self, channel: &str, site: &str) -> String {
        alert_topic(&self.topic_prefix, channel, site)
    }
}

impl PublishTransport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn requires_ordering(&self) -> bool {
        true
    }

    fn publish(&mut self, request: &PublishRequest<'_>) -> Result<()> {
        let payload = render_envelope(request)?;
        let topic = self.alert_topic(request.channel, &request.report.site_name);
        self.runtime
            .publish_confirmed(&topic, &payload, ACK_TIMEOUT)
            .with_context(|| format!("failed to publish alert to {}", topic))
    }

    fn close(&mut self) {
        if let Err(e) =
            self.runtime
                .enqueue(&self.availability_topic, PAYLOAD_OFFLINE.as_bytes(), true)
        {
            log::warn!("MQTT offline marker not sent: {:#}", e);
        }
        if let Err(e) = self.runtime.disconnect() {
            log::warn!("MQTT disconnect failed: {:#}", e);
        }
    }
}

fn alert_topic(prefix: &str, channel: &str, site: &str) -> String {
    format!("{}/{}/{}", prefix, channel, site_slug(site))
}

fn render_envelope(request: &PublishRequest<'_>) -> Result<Vec<u8>> {
    let envelope = AlertEnvelope {
        channel: request.channel,
        subject: request.subject,
        body: &request.body,
        group_key: request.group_key.as_deref(),
        dedup_key: request.dedup_key.as_deref(),
        report: request.report,
    };
    serde_json::to_vec(&envelope).context("failed to serialize alert payload")
}

pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

fn build_transport(endpoint: &MqttEndpoint, settings: &MqttSettings) -> Result<Transport> {
    if !endpoint.use_tls {
        if settings.tls_ca_path.is_some() {
            return Err(anyhow!(
                "MQTT TLS CA provided but TLS is disabled (use an mqtts:// broker address)"
            ));
        }
        return Ok(Transport::tcp());
    }
    match &settings.tls_ca_path {
        Some(path) => {
            let ca = std::fs::read(path)
                .with_context(|| format!("failed to read MQTT TLS CA {}", path.display()))?;
            Ok(Transport::tls(ca, None, None))
        }
        None => Ok(Transport::tls_with_default_config()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::TrafficCondition;
    use crate::report::format_report;
    use crate::notify::{AuditLog, DeliveryOutcome, Notifier};
    use chrono::{TimeZone, Utc};
    use std::time::Instant;

    fn link(state: LinkState) -> Mutex<LinkState> {
        Mutex::new(state)
    }

    #[test]
    fn ack_must_match_the_sent_packet() {
        let (tx, rx) = mpsc::channel();
        tx.send(LinkEvent::Acked(2)).unwrap();
        tx.send(LinkEvent::Sent(3)).unwrap();
        tx.send(LinkEvent::Acked(2)).unwrap();
        tx.send(LinkEvent::Acked(3)).unwrap();
        let state = link(LinkState::Up);
        assert!(wait_for_ack(&rx, &state, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn missing_ack_times_out() {
        let (tx, rx) = mpsc::channel();
        tx.send(LinkEvent::Sent(7)).unwrap();
        let state = link(LinkState::Connecting);
        let started = Instant::now();
        let err = wait_for_ack(&rx, &state, Duration::from_millis(200)).unwrap_err();
        assert!(format!("{err}").contains("no PubAck"));
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(tx);
    }

    #[test]
    fn dropped_link_fails_the_wait() {
        let (_tx, rx) = mpsc::channel::<LinkEvent>();
        let state = link(LinkState::Down("connection refused".to_string()));
        let err = wait_for_ack(&rx, &state, Duration::from_secs(5)).unwrap_err();
        assert!(format!("{err}").contains("connection refused"));
    }

    #[test]
    fn unreachable_broker_yields_failed_deliveries_without_blocking() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = MqttSettings {
            broker_addr: format!("mqtt://127.0.0.1:{port}"),
            client_id: "traffic-sentinel-test".to_string(),
            username: None,
            password: None,
            topic_prefix: "traffic".to_string(),
            tls_ca_path: None,
        };
        let transport = MqttTransport::connect(&settings).unwrap();
        let waited = Instant::now();
        while !matches!(transport.runtime.link(), LinkState::Down(_))
            && waited.elapsed() < Duration::from_secs(5)
        {
            std::thread::sleep(Duration::from_millis(20));
        }

        let dir = tempfile::tempdir().unwrap();
        let mut notifier = Notifier::new(
            "traffic-alerts",
            Box::new(transport),
            AuditLog::new(dir.path().join("audit.log")),
        );
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let report = format_report(4, 0.05, TrafficCondition::Heavy, "Main St", at);
        for _ in 0..(REQUEST_CAPACITY + 5) {
            let started = Instant::now();
            let outcome = notifier.deliver(&report, at);
            assert!(matches!(outcome, DeliveryOutcome::Failed(_)), "{outcome}");
            assert!(started.elapsed() < ACK_TIMEOUT + Duration::from_secs(1));
        }
        notifier.close();
    }

    #[test]
    fn endpoint_scheme_selects_tls() {
        let plain = parse_mqtt_endpoint("broker.local:1883").unwrap();
        assert_eq!(plain.host, "broker.local");
        assert_eq!(plain.port, 1883);
        assert!(!plain.use_tls);

        let tls = parse_mqtt_endpoint("mqtts://broker.local:8883").unwrap();
        assert!(tls.use_tls);
        assert_eq!(tls.port, 8883);

        let v6 = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(v6.host, "::1");
    }

    #[test]
    fn endpoint_rejects_bad_input() {
        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
    }

    #[test]
    fn alert_topic_uses_site_slug() {
        assert_eq!(
            alert_topic("traffic", "traffic-alerts", "Avenida dos Estados"),
            "traffic/traffic-alerts/avenida_dos_estados"
        );
    }

    #[test]
    fn envelope_carries_keys_and_record() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let report = format_report(9, 0.025, TrafficCondition::Heavy, "Main St", at);
        let request = PublishRequest {
            channel: "traffic-alerts",
            subject: "Heavy Traffic Alert",
            body: "body".to_string(),
            group_key: Some("traffic-alerts".to_string()),
            dedup_key: Some("Main-St-1700000000".to_string()),
            report: &report,
        };
        let value: serde_json::Value =
            serde_json::from_slice(&render_envelope(&request).unwrap()).unwrap();
        assert_eq!(value["subject"], "Heavy Traffic Alert");
        assert_eq!(value["dedup_key"], "Main-St-1700000000");
        assert_eq!(value["report"]["vehicles_detected"], 9);
        assert_eq!(value["report"]["condition_traffic"], "Heavy traffic");
    }

    #[test]
    fn envelope_omits_absent_keys() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let report = format_report(1, 0.001, TrafficCondition::Light, "Main St", at);
        let request = PublishRequest {
            channel: "traffic-alerts",
            subject: "Traffic Update",
            body: String::new(),
            group_key: None,
            dedup_key: None,
            report: &report,
        };
        let value: serde_json::Value =
            serde_json::from_slice(&render_envelope(&request).unwrap()).unwrap();
        assert!(value.get("group_key").is_none());
        assert!(value.get("dedup_key").is_none());
    }
}
