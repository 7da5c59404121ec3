//! MQTT publisher over mutual TLS.
//!
//! `rumqttc` splits a connection into a request handle ([`AsyncClient`]) and
//! an [`EventLoop`] that must be polled for anything to happen. The event loop
//! runs in its own task, reconnects after errors and forwards packet ids of
//! outgoing publishes and incoming PUBACKs, which `publish` matches up to
//! confirm delivery.
//!
//! Publishes are queued with `try_publish`, so a full request queue fails
//! the publish instead of blocking it. A payload whose earlier copy is still
//! queued or in flight is not queued again; the retry waits on that copy.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fixrelay_core::config::MqttSettings;

use crate::publisher::Publisher;
use crate::PublishError;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 16;
/// How long `close` waits for the disconnect to be flushed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Packet ids observed by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckEvent {
    /// A publish left with this packet id.
    Sent(u16),
    /// The broker acknowledged this packet id.
    Acked(u16),
}

#[derive(Debug)]
struct Request {
    seq: u64,
    topic: String,
    payload: Vec<u8>,
    pkid: Option<u16>,
    acked: bool,
}

/// Publishes handed to the client, in the order they were queued.
///
/// The event loop sends queued publishes in order, so each `Sent` id belongs
/// to the oldest request without one. A `Sent` for an id that is still
/// waiting for its ack is a retransmit after reconnect.
#[derive(Debug, Default)]
struct AckTracker {
    requests: VecDeque<Request>,
    next_seq: u64,
}

impl AckTracker {
    /// Pending request with this content, acknowledged or not.
    fn find(&self, topic: &str, payload: &[u8]) -> Option<u64> {
        self.requests
            .iter()
            .find(|r| r.topic == topic && r.payload == payload)
            .map(|r| r.seq)
    }

    /// Record a publish just handed to the client.
    fn track(&mut self, topic: &str, payload: Vec<u8>) -> u64 {
        // Acknowledged but never claimed again; nobody is waiting on them.
        self.requests.retain(|r| !r.acked);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.requests.push_back(Request {
            seq,
            topic: topic.to_string(),
            payload,
            pkid: None,
            acked: false,
        });
        seq
    }

    fn observe(&mut self, event: AckEvent) {
        match event {
            AckEvent::Sent(id) => {
                if self.requests.iter().any(|r| !r.acked && r.pkid == Some(id)) {
                    debug!("Publish {} retransmitted", id);
                } else if let Some(request) = self.requests.iter_mut().find(|r| r.pkid.is_none()) {
                    request.pkid = Some(id);
                } else {
                    debug!("Untracked publish {}", id);
                }
            }
            AckEvent::Acked(id) => {
                match self.requests.iter_mut().find(|r| !r.acked && r.pkid == Some(id)) {
                    Some(request) => request.acked = true,
                    None => debug!("Untracked acknowledgement {}", id),
                }
            }
        }
    }

    /// Forget the request if the broker acknowledged it.
    fn claim(&mut self, seq: u64) -> bool {
        match self.requests.iter().position(|r| r.seq == seq && r.acked) {
            Some(index) => {
                self.requests.remove(index);
                true
            }
            None => false,
        }
    }
}

struct PublishState {
    events: mpsc::UnboundedReceiver<AckEvent>,
    tracker: AckTracker,
}

/// Client certificate material, PEM encoded.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl TlsMaterial {
    /// Read the CA certificate, client certificate and key named in `settings`.
    pub async fn load(settings: &MqttSettings) -> Result<Self, PublishError> {
        Ok(Self {
            ca_cert: read_pem(&settings.ca_cert).await?,
            client_cert: read_pem(&settings.client_cert).await?,
            client_key: read_pem(&settings.client_key).await?,
        })
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, PublishError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| PublishError::Tls(format!("{}: {}", path.display(), e)))
}

/// Connection options for the broker in `settings`.
pub fn mqtt_options(settings: &MqttSettings, client_id: &str, tls: TlsMaterial) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
    options.set_keep_alive(settings.keep_alive());
    options.set_transport(Transport::tls(
        tls.ca_cert,
        Some((tls.client_cert, tls.client_key)),
        None,
    ));
    options
}

/// [`Publisher`] backed by a persistent MQTT connection.
pub struct MqttPublisher {
    client: AsyncClient,
    state: Mutex<PublishState>,
    driver: Mutex<Option<JoinHandle<()>>>,
    ack_timeout: Duration,
}

impl MqttPublisher {
    /// Load TLS material and start the connection.
    ///
    /// The connection itself is established in the background; publishes
    /// wait for it.
    pub async fn connect(settings: &MqttSettings, client_id: &str) -> Result<Self, PublishError> {
        let tls = TlsMaterial::load(settings).await?;
        let options = mqtt_options(settings, client_id, tls);
        info!(
            "Connecting to MQTT broker {}:{} as {}",
            settings.host, settings.port, client_id
        );
        Ok(Self::start(options, settings.ack_timeout(), settings.reconnect_delay()))
    }

    /// Start the event loop task for `options`.
    pub fn start(options: MqttOptions, ack_timeout: Duration, reconnect_delay: Duration) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, ack_tx, reconnect_delay));

        Self {
            client,
            state: Mutex::new(PublishState {
                events: ack_rx,
                tracker: AckTracker::default(),
            }),
            driver: Mutex::new(Some(driver)),
            ack_timeout,
        }
    }
}

impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        let PublishState { events, tracker } = &mut *state;
        while let Ok(event) = events.try_recv() {
            tracker.observe(event);
        }

        let seq = match tracker.find(topic, &payload) {
            Some(seq) => {
                debug!("Earlier publish to {} still pending, waiting on it", topic);
                seq
            }
            None => {
                self.client
                    .try_publish(topic, QoS::AtLeastOnce, false, payload.clone())
                    .map_err(|e| PublishError::Client(e.to_string()))?;
                tracker.track(topic, payload)
            }
        };

        let confirm = async {
            while !tracker.claim(seq) {
                match events.recv().await {
                    Some(event) => tracker.observe(event),
                    None => return Err(PublishError::Closed),
                }
            }
            Ok(())
        };

        tokio::time::timeout(self.ack_timeout, confirm)
            .await
            .map_err(|_| PublishError::AckTimeout(self.ack_timeout))?
    }

    async fn close(&self) -> Result<(), PublishError> {
        let Some(driver) = self.driver.lock().await.take() else {
            return Ok(());
        };
        let requested = self.client.try_disconnect();

        let abort = driver.abort_handle();
        if requested.is_err() || tokio::time::timeout(CLOSE_TIMEOUT, driver).await.is_err() {
            warn!("MQTT disconnect not confirmed, dropping connection");
            abort.abort();
        } else {
            info!("Disconnected from MQTT broker");
        }
        requested.map_err(|e| PublishError::Client(e.to_string()))
    }
}

/// Poll the event loop until a disconnect goes out.
async fn drive(mut eventloop: EventLoop, acks: mpsc::UnboundedSender<AckEvent>, reconnect_delay: Duration) {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if let Some(ack) = ack_event(&event) {
                    // Nobody listening just means no publish is waiting.
                    let _ = acks.send(ack);
                }
                match event {
                    Event::Incoming(Packet::ConnAck(_)) => info!("Connected to MQTT broker"),
                    Event::Outgoing(Outgoing::Disconnect) => break,
                    _ => {}
                }
            }
            Err(e) => {
                warn!("MQTT connection error: {}; reconnecting in {:?}", e, reconnect_delay);
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    debug!("MQTT event loop stopped");
}

fn ack_event(event: &Event) -> Option<AckEvent> {
    match event {
        Event::Outgoing(Outgoing::Publish(pkid)) => Some(AckEvent::Sent(*pkid)),
        Event::Incoming(Packet::PubAck(ack)) => Some(AckEvent::Acked(ack.pkid)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{PubAck, Publish};

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "broker.example.com".to_string(),
            ..MqttSettings::default()
        }
    }

    fn tls() -> TlsMaterial {
        TlsMaterial {
            ca_cert: b"ca".to_vec(),
            client_cert: b"cert".to_vec(),
            client_key: b"key".to_vec(),
        }
    }

    #[test]
    fn test_mqtt_options() {
        let options = mqtt_options(&settings(), "edge-01", tls());

        assert_eq!(
            options.broker_address(),
            ("broker.example.com".to_string(), 8883)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
        assert_eq!(options.client_id(), "edge-01");
        assert!(matches!(options.transport(), Transport::Tls(_)));
    }

    #[test]
    fn test_ack_bound_to_oldest_unsent_request() {
        let mut tracker = AckTracker::default();
        let first = tracker.track("gps-data/edge-01", b"a".to_vec());

        // Second request queued before the first one left
        let second = tracker.track("gps-data/edge-01", b"b".to_vec());
        tracker.observe(AckEvent::Sent(1));
        tracker.observe(AckEvent::Acked(1));
        assert!(!tracker.claim(second));

        tracker.observe(AckEvent::Sent(2));
        assert!(!tracker.claim(second));
        tracker.observe(AckEvent::Acked(2));
        assert!(tracker.claim(second));
        assert!(tracker.claim(first));
        assert!(tracker.requests.is_empty());
    }

    #[test]
    fn test_retransmit_keeps_binding() {
        let mut tracker = AckTracker::default();
        let first = tracker.track("t", b"a".to_vec());
        let second = tracker.track("t", b"b".to_vec());

        tracker.observe(AckEvent::Sent(1));
        // Reconnect resends packet 1 before packet 2 goes out
        tracker.observe(AckEvent::Sent(1));
        tracker.observe(AckEvent::Sent(2));
        tracker.observe(AckEvent::Acked(2));

        assert!(!tracker.claim(first));
        assert!(tracker.claim(second));
    }

    #[test]
    fn test_find_pending_copy() {
        let mut tracker = AckTracker::default();
        let seq = tracker.track("t", b"a".to_vec());

        assert_eq!(tracker.find("t", b"a"), Some(seq));
        assert_eq!(tracker.find("t", b"b"), None);
        assert_eq!(tracker.find("other", b"a"), None);

        // Acknowledged after its publish gave up; still claimable
        tracker.observe(AckEvent::Sent(9));
        tracker.observe(AckEvent::Acked(9));
        assert_eq!(tracker.find("t", b"a"), Some(seq));
        assert!(tracker.claim(seq));
        assert_eq!(tracker.find("t", b"a"), None);
    }

    #[test]
    fn test_track_drops_unclaimed_acks() {
        let mut tracker = AckTracker::default();
        tracker.track("t", b"a".to_vec());
        tracker.observe(AckEvent::Sent(1));
        tracker.observe(AckEvent::Acked(1));

        tracker.track("t", b"b".to_vec());
        assert_eq!(tracker.requests.len(), 1);
        assert_eq!(tracker.find("t", b"a"), None);
    }

    #[test]
    fn test_untracked_events_ignored() {
        let mut tracker = AckTracker::default();
        tracker.observe(AckEvent::Acked(3));
        tracker.observe(AckEvent::Sent(3));

        let seq = tracker.track("t", b"a".to_vec());
        tracker.observe(AckEvent::Acked(3));
        assert!(!tracker.claim(seq));
    }

    #[test]
    fn test_ack_events() {
        assert_eq!(
            ack_event(&Event::Outgoing(Outgoing::Publish(7))),
            Some(AckEvent::Sent(7))
        );
        assert_eq!(
            ack_event(&Event::Incoming(Packet::PubAck(PubAck::new(7)))),
            Some(AckEvent::Acked(7))
        );
        assert_eq!(ack_event(&Event::Outgoing(Outgoing::PingReq)), None);
        assert_eq!(
            ack_event(&Event::Incoming(Packet::Publish(Publish::new(
                "gps-data/edge-01",
                QoS::AtLeastOnce,
                "{}"
            )))),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_tls_material() {
        let settings = MqttSettings {
            ca_cert: "/nonexistent/root-ca.pem".into(),
            ..settings()
        };
        assert!(matches!(
            TlsMaterial::load(&settings).await,
            Err(PublishError::Tls(_))
        ));
    }
}
