//! [`BrokerAdapter`] – the bus contract bridged onto a broker connection.
//!
//! The adapter owns a [`MemoryBus`] that does all local fan-out.  Messages
//! published through the adapter go to the broker; messages the broker
//! delivers re-enter the owned bus, so a subscriber cannot tell a remote
//! publish from a local one.
//!
//! # Request flow
//!
//! | Call | On the wire | Completes when |
//! |---|---|---|
//! | `subscribe` | SUBSCRIBE (`*` → `#`), QoS 0 | the SUBACK with the same packet id arrives |
//! | `unsubscribe` | UNSUBSCRIBE (`*` → `#`) | the UNSUBACK with the same packet id arrives |
//! | `publish` | PUBLISH, QoS 0 | immediately after sending |
//! | `close` | DISCONNECT | the transport reports the close |
//!
//! Every pending acknowledgement is bounded by
//! [`BrokerConfig::ack_timeout_ms`]; on expiry the call fails with
//! [`BusError::AckTimeout`].
//!
//! With [`BrokerConfig::optimistic_local_attach`] set (the default) a
//! subscriber joins the owned bus as soon as `subscribe` is called, so
//! messages already flowing locally reach it before the broker has
//! acknowledged.  Otherwise it joins when the SUBACK arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hearken_types::{
    AckKind, BrokerConfig, BusError, BusNotification, LifecycleState, Message, QoS,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::{BrokerConnection, BrokerConnector, BrokerLink, ConnectOptions, InboundPacket};
use super::correlation::{AckContinuation, CorrelationTable, Ticket, random_packet_id};
use crate::backend::{Backend, Completion, CompletionHandle, Subscriber};
use crate::codec;
use crate::memory::MemoryBus;
use crate::notify::Lifecycle;
use crate::pattern::{from_broker_topic, to_broker_filter};

/// Longest client identifier every MQTT 3.1.1 broker must accept.
const MAX_CLIENT_ID_LEN: usize = 23;

/// Random hex characters kept at the end of every generated client id.
const CLIENT_ID_SUFFIX_LEN: usize = 12;

struct Shared {
    config: BrokerConfig,
    connector: Arc<dyn BrokerConnector>,
    local: Arc<MemoryBus>,
    link: Mutex<Option<Arc<dyn BrokerConnection>>>,
    runtime: Mutex<Option<Handle>>,
    pending: Arc<CorrelationTable>,
    lifecycle: Lifecycle,
    closing: AtomicBool,
    close_waiter: Mutex<Option<CompletionHandle>>,
}

/// Publish/subscribe backend that talks to an external broker.
///
/// Clone it cheaply – all clones share the same connection and local bus.
#[derive(Clone)]
pub struct BrokerAdapter {
    shared: Arc<Shared>,
}

impl BrokerAdapter {
    /// Build an adapter.  No connection is opened until
    /// [`start_connection`][Self::start_connection] runs.
    pub fn new(config: BrokerConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let lifecycle = Lifecycle::new();
        let local = Arc::new(MemoryBus::new());
        let forward = lifecycle.clone();
        local.on_new_topic(move |topic| {
            forward.emit(BusNotification::NewTopic(topic.to_string()));
        });
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                local,
                link: Mutex::new(None),
                runtime: Mutex::new(None),
                pending: Arc::new(CorrelationTable::new()),
                lifecycle,
                closing: AtomicBool::new(false),
                close_waiter: Mutex::new(None),
            }),
        }
    }

    /// Build an adapter and bring its connection up.
    ///
    /// The adapter becomes ready when the broker accepts the CONNECT; use
    /// [`Backend::wait_ready`] to wait for that.
    pub async fn connect(
        config: BrokerConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, BusError> {
        let adapter = Self::new(config, connector);
        adapter.start_connection().await?;
        Ok(adapter)
    }

    /// Open the broker connection unless one is already live.
    ///
    /// A failed attempt is reported as an `Error` notification and leaves no
    /// connection behind; call this again to retry.
    pub async fn start_connection(&self) -> Result<(), BusError> {
        let shared = &self.shared;
        if shared.closing.load(Ordering::SeqCst) {
            return Err(BusError::UseAfterClose);
        }
        if shared.link.lock().is_some() {
            return Ok(());
        }

        let BrokerLink {
            connection,
            inbound,
        } = match shared
            .connector
            .open(&shared.config.host, shared.config.port)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                error!(host = %shared.config.host, port = shared.config.port, error = %e, "broker connection failed");
                shared.lifecycle.emit(BusNotification::Error(e.clone()));
                return Err(e);
            }
        };

        {
            let mut link = shared.link.lock();
            if link.is_some() {
                return Ok(());
            }
            *link = Some(Arc::clone(&connection));
        }
        let runtime = Handle::current();
        *shared.runtime.lock() = Some(runtime.clone());
        runtime.spawn(pump_inbound(
            Arc::clone(shared),
            Arc::clone(&connection),
            inbound,
        ));

        // close() may have run while the connection was opening.  The pump
        // finishes the close once the transport confirms the disconnect.
        if shared.closing.load(Ordering::SeqCst) {
            debug!("adapter closed during bring-up; dropping the new connection");
            shared.drop_link(&connection);
            if let Err(e) = connection.disconnect() {
                debug!(error = %e, "disconnect of late connection failed");
            }
            return Err(BusError::UseAfterClose);
        }

        let options = ConnectOptions {
            client_id: build_client_id(&shared.config.client_id_prefix),
            keepalive_secs: shared.config.keepalive_secs,
            clean_session: true,
        };
        debug!(client_id = %options.client_id, keepalive = options.keepalive_secs, "sending connect");
        if let Err(e) = connection.connect(&options) {
            error!(error = %e, "connect request failed");
            shared.drop_link(&connection);
            shared.lifecycle.emit(BusNotification::Error(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Whether a connection handle is currently held.
    pub fn is_connected(&self) -> bool {
        self.shared.link.lock().is_some()
    }

    /// Number of subscribe/unsubscribe calls still waiting for the broker.
    pub fn pending_acks(&self) -> usize {
        self.shared.pending.len()
    }

    fn raise_if_closed(&self) -> Result<(), BusError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            Err(BusError::UseAfterClose)
        } else {
            Ok(())
        }
    }

    fn connection(&self) -> Result<Arc<dyn BrokerConnection>, BusError> {
        self.shared
            .link
            .lock()
            .clone()
            .ok_or(BusError::NotConnected)
    }

    /// Reserve a packet id, send the request, and arm its timeout.
    fn request(
        &self,
        kind: AckKind,
        on_ack: AckContinuation,
        send: impl FnOnce(u16) -> Result<(), BusError>,
    ) -> Result<Completion, BusError> {
        let (ticket, completion) = self.shared.pending.reserve(kind, on_ack)?;
        if let Err(e) = send(ticket.packet_id) {
            self.shared.pending.discard(ticket);
            return Err(e);
        }
        self.arm_timeout(ticket);
        Ok(completion)
    }

    fn arm_timeout(&self, ticket: Ticket) {
        let Some(runtime) = self.shared.runtime.lock().clone() else {
            return;
        };
        let pending = Arc::clone(&self.shared.pending);
        let timeout = Duration::from_millis(self.shared.config.ack_timeout_ms);
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            pending.expire(ticket);
        });
    }
}

impl Shared {
    /// Forget `connection` if it is still the live one.
    fn drop_link(&self, connection: &Arc<dyn BrokerConnection>) -> bool {
        let mut link = self.link.lock();
        let current = link
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, connection));
        if current {
            *link = None;
        }
        current
    }

    fn finish_close(&self) {
        if let Some(waiter) = self.close_waiter.lock().take() {
            waiter.complete(Ok(()));
        }
        if self.lifecycle.advance(LifecycleState::Closed) {
            self.lifecycle.emit(BusNotification::Closed);
            info!("broker adapter closed");
        }
    }

    fn handle_packet(&self, connection: &Arc<dyn BrokerConnection>, packet: InboundPacket) -> bool {
        match packet {
            InboundPacket::ConnAck { return_code: 0 } => {
                if self.closing.load(Ordering::SeqCst) {
                    return true;
                }
                // The state only moves forward, but every accepted handshake
                // is announced so reconnections are observable.
                self.lifecycle.advance(LifecycleState::Ready);
                info!(host = %self.config.host, port = self.config.port, "broker connection ready");
                self.lifecycle.emit(BusNotification::Ready);
            }
            InboundPacket::ConnAck { return_code } => {
                warn!(return_code, "broker refused connection");
                self.drop_link(connection);
                self.lifecycle
                    .emit(BusNotification::Error(BusError::ConnectionRefused {
                        code: return_code,
                    }));
            }
            InboundPacket::Publish { topic, payload, .. } => {
                let topic = from_broker_topic(&topic);
                match codec::decode(&payload) {
                    Ok(message) => {
                        if let Err(e) = self.local.publish(&topic, message) {
                            debug!(topic = %topic, error = %e, "dropping inbound message");
                        }
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "undecodable inbound payload");
                        self.lifecycle.emit(BusNotification::Error(e));
                    }
                }
            }
            InboundPacket::SubAck { packet_id } => {
                self.pending.resolve(packet_id, AckKind::SubAck);
            }
            InboundPacket::UnsubAck { packet_id } => {
                self.pending.resolve(packet_id, AckKind::UnsubAck);
            }
            InboundPacket::Error(reason) => {
                warn!(reason = %reason, "broker transport error");
                self.drop_link(connection);
                self.lifecycle
                    .emit(BusNotification::Error(BusError::Transport(reason)));
            }
            InboundPacket::Close => return false,
        }
        true
    }

    fn handle_close(&self, connection: &Arc<dyn BrokerConnection>) {
        let was_live = self.drop_link(connection);
        if self.closing.load(Ordering::SeqCst) {
            self.finish_close();
        } else if was_live {
            warn!("broker closed the connection");
            self.lifecycle.emit(BusNotification::Error(BusError::Transport(
                "connection closed by broker".to_string(),
            )));
        }
    }
}

async fn pump_inbound(
    shared: Arc<Shared>,
    connection: Arc<dyn BrokerConnection>,
    mut inbound: mpsc::UnboundedReceiver<InboundPacket>,
) {
    while let Some(packet) = inbound.recv().await {
        if !shared.handle_packet(&connection, packet) {
            break;
        }
    }
    shared.handle_close(&connection);
}

fn build_client_id(prefix: &str) -> String {
    let mut end = prefix.len().min(MAX_CLIENT_ID_LEN - CLIENT_ID_SUFFIX_LEN - 1);
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", &prefix[..end], &suffix[..CLIENT_ID_SUFFIX_LEN])
}

#[async_trait]
impl Backend for BrokerAdapter {
    fn subscribe(&self, pattern: &str, subscriber: Subscriber) -> Result<Completion, BusError> {
        self.raise_if_closed()?;
        let connection = self.connection()?;
        let filter = to_broker_filter(pattern);
        let optimistic = self.shared.config.optimistic_local_attach;

        let on_ack: AckContinuation = if optimistic {
            Box::new(|| Ok(()))
        } else {
            let local = Arc::clone(&self.shared.local);
            let pattern = pattern.to_string();
            let subscriber = subscriber.clone();
            Box::new(move || local.subscribe(&pattern, subscriber).map(|_| ()))
        };
        let completion = self.request(AckKind::SubAck, on_ack, |packet_id| {
            debug!(pattern = %pattern, filter = %filter, packet_id, "subscribing");
            connection.subscribe(&filter, packet_id, QoS::AtMostOnce)
        })?;

        if optimistic {
            let _ = self.shared.local.subscribe(pattern, subscriber)?;
        }
        Ok(completion)
    }

    fn publish(&self, topic: &str, message: Message) -> Result<Completion, BusError> {
        self.raise_if_closed()?;
        let connection = self.connection()?;
        let payload = codec::encode(&message)?;
        connection.publish(topic, random_packet_id(), payload, QoS::AtMostOnce)?;
        Ok(Completion::done())
    }

    fn unsubscribe(
        &self,
        pattern: &str,
        subscriber: &Subscriber,
    ) -> Result<Completion, BusError> {
        self.raise_if_closed()?;
        let connection = self.connection()?;
        let filter = to_broker_filter(pattern);
        let completion = self.request(AckKind::UnsubAck, Box::new(|| Ok(())), |packet_id| {
            debug!(pattern = %pattern, filter = %filter, packet_id, "unsubscribing");
            connection.unsubscribe(&filter, packet_id)
        })?;
        let _ = self.shared.local.unsubscribe(pattern, subscriber)?;
        Ok(completion)
    }

    fn close(&self) -> Completion {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::SeqCst) {
            return Completion::done();
        }
        let _ = shared.local.close();

        let Some(connection) = shared.link.lock().clone() else {
            shared.finish_close();
            return Completion::done();
        };
        let (waiter, completion) = Completion::pending();
        *shared.close_waiter.lock() = Some(waiter);
        if let Err(e) = connection.disconnect() {
            warn!(error = %e, "disconnect failed; closing without confirmation");
            shared.drop_link(&connection);
            shared.finish_close();
        }
        completion
    }

    fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.watch()
    }

    fn notifications(&self) -> broadcast::Receiver<BusNotification> {
        self.shared.lifecycle.subscribe()
    }

    fn known_topics(&self) -> Vec<String> {
        self.shared.local.known_topics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::{LoopbackBroker, OutboundPacket};
    use futures_util::FutureExt;
    use serde_json::json;

    type Inbox = Arc<Mutex<Vec<(String, Message)>>>;

    fn recorder() -> (Subscriber, Inbox) {
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let subscriber = Subscriber::new(move |topic, message| {
            sink.lock().push((topic.to_string(), message.clone()));
        });
        (subscriber, inbox)
    }

    fn config() -> BrokerConfig {
        BrokerConfig {
            ack_timeout_ms: 5_000,
            ..BrokerConfig::default()
        }
    }

    async fn ready_adapter(broker: &LoopbackBroker, config: BrokerConfig) -> BrokerAdapter {
        let adapter = BrokerAdapter::connect(config, Arc::new(broker.clone()))
            .await
            .expect("connect");
        tokio::time::timeout(Duration::from_secs(1), adapter.wait_ready())
            .await
            .expect("ready in time")
            .expect("ready");
        adapter
    }

    /// Let the inbound pump drain what the loopback broker queued.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn subscribe_ids(broker: &LoopbackBroker) -> Vec<(String, u16)> {
        broker
            .sent()
            .into_iter()
            .filter_map(|packet| match packet {
                OutboundPacket::Subscribe {
                    filter, packet_id, ..
                } => Some((filter, packet_id)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connects_with_keepalive_and_bounded_client_id() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        assert_eq!(adapter.state(), LifecycleState::Ready);

        let connect = broker
            .sent()
            .into_iter()
            .find_map(|packet| match packet {
                OutboundPacket::Connect(options) => Some(options),
                _ => None,
            })
            .expect("connect sent");
        assert_eq!(connect.keepalive_secs, 3000);
        assert!(connect.client_id.starts_with("hearken_"));
        assert!(connect.client_id.len() <= MAX_CLIENT_ID_LEN);
    }

    #[tokio::test]
    async fn subscribe_translates_wildcard_and_completes_on_suback() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let (sub, _) = recorder();

        let done = adapter.subscribe("sensors/*", sub).unwrap();
        tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .expect("suback in time")
            .unwrap();

        let subscribes = subscribe_ids(&broker);
        assert_eq!(subscribes.len(), 1);
        assert_eq!(subscribes[0].0, "sensors/#");
        assert_ne!(subscribes[0].1, 0);
        assert_eq!(adapter.pending_acks(), 0);
    }

    #[tokio::test]
    async fn published_messages_come_back_through_the_local_bus() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let (sub, inbox) = recorder();
        adapter.subscribe("hello", sub).unwrap().await.unwrap();

        adapter.publish("hello", json!({"n": 1})).unwrap().await.unwrap();
        adapter.publish("elsewhere", json!({"n": 2})).unwrap().await.unwrap();
        settle().await;

        assert_eq!(inbox.lock().clone(), vec![("hello".to_string(), json!({"n": 1}))]);
        let published = broker
            .sent()
            .into_iter()
            .filter(|p| matches!(p, OutboundPacket::Publish { qos: QoS::AtMostOnce, .. }))
            .count();
        assert_eq!(published, 2);
    }

    #[tokio::test]
    async fn remote_publishes_reach_wildcard_subscribers() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let mut notifications = adapter.notifications();
        let (sub, inbox) = recorder();
        adapter.subscribe("room*", sub).unwrap().await.unwrap();

        assert!(broker.inject_publish("room42", br#""lights on""#.to_vec()));
        settle().await;

        assert_eq!(inbox.lock().clone(), vec![("room42".to_string(), json!("lights on"))]);
        assert_eq!(adapter.known_topics(), vec!["room42"]);
        assert_eq!(
            notifications.try_recv().unwrap(),
            BusNotification::NewTopic("room42".to_string())
        );
    }

    #[tokio::test]
    async fn null_messages_travel_as_true() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let (sub, inbox) = recorder();
        adapter.subscribe("flag", sub).unwrap().await.unwrap();

        adapter.publish("flag", Message::Null).unwrap().await.unwrap();
        settle().await;
        assert_eq!(inbox.lock().clone(), vec![("flag".to_string(), json!(true))]);
    }

    #[tokio::test]
    async fn undecodable_payload_is_reported_not_delivered() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let (sub, inbox) = recorder();
        adapter.subscribe("raw", sub).unwrap().await.unwrap();
        let mut notifications = adapter.notifications();

        broker.inject_publish("raw", b"{broken".to_vec());
        settle().await;

        assert!(inbox.lock().is_empty());
        assert!(matches!(
            notifications.try_recv(),
            Ok(BusNotification::Error(BusError::Codec(_)))
        ));
    }

    #[tokio::test]
    async fn acknowledgements_complete_only_their_own_call() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        broker.hold_acks(true);

        let (sub_a, _) = recorder();
        let (sub_b, _) = recorder();
        let mut done_a = adapter.subscribe("a", sub_a).unwrap();
        let mut done_b = adapter.subscribe("b", sub_b).unwrap();
        let ids = subscribe_ids(&broker);
        let (id_a, id_b) = (ids[0].1, ids[1].1);
        assert_ne!(id_a, id_b);
        assert_eq!(adapter.pending_acks(), 2);

        assert!(broker.release_ack(id_b));
        tokio::time::timeout(Duration::from_secs(1), &mut done_b)
            .await
            .expect("b completes")
            .unwrap();
        settle().await;
        assert!((&mut done_a).now_or_never().is_none(), "a must still be pending");

        assert!(broker.release_ack(id_a));
        tokio::time::timeout(Duration::from_secs(1), done_a)
            .await
            .expect("a completes")
            .unwrap();
        assert_eq!(adapter.pending_acks(), 0);
    }

    #[tokio::test]
    async fn unsolicited_and_mismatched_acks_are_ignored() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        broker.hold_acks(true);
        let (sub, _) = recorder();
        let mut done = adapter.subscribe("a", sub).unwrap();
        let id = subscribe_ids(&broker)[0].1;

        broker.inject(InboundPacket::UnsubAck { packet_id: id });
        broker.inject(InboundPacket::SubAck {
            packet_id: id.wrapping_add(1).max(1),
        });
        settle().await;
        assert!((&mut done).now_or_never().is_none());
        assert_eq!(adapter.pending_acks(), 1);

        broker.release_all();
        tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .expect("completes")
            .unwrap();
    }

    #[tokio::test]
    async fn optimistic_attach_delivers_before_the_suback() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let (early, _) = recorder();
        adapter.subscribe("t", early).unwrap().await.unwrap();

        broker.hold_acks(true);
        let (late, inbox) = recorder();
        let mut done = adapter.subscribe("t", late).unwrap();
        adapter.publish("t", json!(1)).unwrap().await.unwrap();
        settle().await;

        assert!((&mut done).now_or_never().is_none());
        assert_eq!(inbox.lock().len(), 1);
    }

    #[tokio::test]
    async fn deferred_attach_waits_for_the_suback() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(
            &broker,
            BrokerConfig {
                optimistic_local_attach: false,
                ..config()
            },
        )
        .await;
        let (early, _) = recorder();
        adapter.subscribe("t", early).unwrap().await.unwrap();

        broker.hold_acks(true);
        let (late, inbox) = recorder();
        let done = adapter.subscribe("t", late).unwrap();
        adapter.publish("t", json!(1)).unwrap().await.unwrap();
        settle().await;
        assert!(inbox.lock().is_empty());

        broker.release_all();
        done.await.unwrap();
        adapter.publish("t", json!(2)).unwrap().await.unwrap();
        settle().await;
        assert_eq!(inbox.lock().clone(), vec![("t".to_string(), json!(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_suback_times_out() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(
            &broker,
            BrokerConfig {
                ack_timeout_ms: 250,
                ..config()
            },
        )
        .await;
        broker.hold_acks(true);
        let (sub, _) = recorder();
        let done = adapter.subscribe("never", sub).unwrap();
        let id = subscribe_ids(&broker)[0].1;

        assert_eq!(
            done.await,
            Err(BusError::AckTimeout {
                kind: AckKind::SubAck,
                packet_id: id
            })
        );
        assert_eq!(adapter.pending_acks(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_local_delivery_after_unsuback() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let (sub, inbox) = recorder();
        adapter.subscribe("s/*", sub.clone()).unwrap().await.unwrap();
        broker.inject_publish("s/1", b"1".to_vec());
        settle().await;
        assert_eq!(inbox.lock().len(), 1);

        adapter.unsubscribe("s/*", &sub).unwrap().await.unwrap();
        assert!(broker.filters().is_empty());
        assert!(broker.sent().iter().any(|p| matches!(
            p,
            OutboundPacket::Unsubscribe { filter, .. } if filter == "s/#"
        )));
        adapter.publish("s/1", json!(2)).unwrap().await.unwrap();
        settle().await;
        assert_eq!(inbox.lock().len(), 1);
    }

    #[tokio::test]
    async fn closed_is_emitted_after_the_transport_confirms() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let mut notifications = adapter.notifications();

        let done = adapter.close();
        assert!(notifications.try_recv().is_err(), "nothing before confirmation");
        tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .expect("close confirmed")
            .unwrap();

        assert_eq!(notifications.try_recv().unwrap(), BusNotification::Closed);
        assert_eq!(adapter.state(), LifecycleState::Closed);
        assert!(!adapter.is_connected());
        assert_eq!(broker.sent().last(), Some(&OutboundPacket::Disconnect));
    }

    #[tokio::test]
    async fn every_call_after_close_fails() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let (sub, _) = recorder();
        adapter.close().await.unwrap();

        assert_eq!(adapter.subscribe("a", sub.clone()).unwrap_err(), BusError::UseAfterClose);
        assert_eq!(adapter.publish("a", json!(1)).unwrap_err(), BusError::UseAfterClose);
        assert_eq!(adapter.unsubscribe("a", &sub).unwrap_err(), BusError::UseAfterClose);
        assert_eq!(adapter.start_connection().await, Err(BusError::UseAfterClose));
        // A second close is harmless.
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_without_connection_completes_at_once() {
        let adapter = BrokerAdapter::new(config(), Arc::new(LoopbackBroker::new()));
        let mut notifications = adapter.notifications();
        adapter.close().await.unwrap();
        assert_eq!(notifications.try_recv().unwrap(), BusNotification::Closed);
    }

    #[tokio::test]
    async fn calls_before_connecting_fail_with_not_connected() {
        let adapter = BrokerAdapter::new(config(), Arc::new(LoopbackBroker::new()));
        let (sub, _) = recorder();
        assert_eq!(adapter.subscribe("a", sub).unwrap_err(), BusError::NotConnected);
        assert_eq!(adapter.publish("a", json!(1)).unwrap_err(), BusError::NotConnected);
        assert_eq!(adapter.state(), LifecycleState::Starting);
    }

    #[tokio::test]
    async fn refused_connack_reports_error_and_allows_retry() {
        let broker = LoopbackBroker::new().with_connack_code(5);
        let adapter = BrokerAdapter::new(config(), Arc::new(broker.clone()));
        let mut notifications = adapter.notifications();

        adapter.start_connection().await.unwrap();
        settle().await;
        assert_eq!(
            notifications.try_recv().unwrap(),
            BusNotification::Error(BusError::ConnectionRefused { code: 5 })
        );
        assert!(!adapter.is_connected());
        assert_eq!(adapter.state(), LifecycleState::Starting);

        let broker = broker.with_connack_code(0);
        adapter.start_connection().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), adapter.wait_ready())
            .await
            .expect("ready in time")
            .unwrap();
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn failed_open_is_reported_and_leaves_no_handle() {
        let broker = LoopbackBroker::new();
        broker.refuse_connections(Some("no route to host".into()));
        let adapter = BrokerAdapter::new(config(), Arc::new(broker.clone()));
        let mut notifications = adapter.notifications();

        assert!(matches!(
            adapter.start_connection().await,
            Err(BusError::Transport(_))
        ));
        assert!(matches!(
            notifications.try_recv(),
            Ok(BusNotification::Error(BusError::Transport(_)))
        ));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn dropped_connection_is_reported_and_handle_released() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        let mut notifications = adapter.notifications();

        broker.drop_connection("reset by peer");
        settle().await;

        assert_eq!(
            notifications.try_recv().unwrap(),
            BusNotification::Error(BusError::Transport("reset by peer".to_string()))
        );
        assert!(!adapter.is_connected());
        let (sub, _) = recorder();
        assert_eq!(adapter.subscribe("a", sub).unwrap_err(), BusError::NotConnected);
    }

    #[tokio::test]
    async fn adapter_is_usable_through_the_backend_trait() {
        let broker = LoopbackBroker::new();
        let backend: Arc<dyn Backend> = Arc::new(ready_adapter(&broker, config()).await);
        let (sub, inbox) = recorder();
        backend.subscribe("dyn", sub).unwrap().await.unwrap();
        backend.publish("dyn", json!("x")).unwrap().await.unwrap();
        settle().await;
        assert_eq!(inbox.lock().len(), 1);
        backend.close().await.unwrap();
    }

    #[test]
    fn client_ids_fit_the_protocol_limit() {
        let id = build_client_id("a-rather-long-client-prefix");
        assert_eq!(id.len(), MAX_CLIENT_ID_LEN);
        assert_ne!(build_client_id("x"), build_client_id("x"));
    }

    #[test]
    fn long_prefixes_keep_a_random_suffix() {
        let first = build_client_id("greenhouse-controller-01");
        let second = build_client_id("greenhouse-controller-01");
        assert_ne!(first, second);
        assert!(first.len() <= MAX_CLIENT_ID_LEN);
        assert!(first.starts_with("greenhouse_"));

        let accented = build_client_id("contrôleur-serre-nord");
        assert!(accented.len() <= MAX_CLIENT_ID_LEN);
        assert!(accented.starts_with("contrôle"));
    }

    #[tokio::test]
    async fn reconnection_announces_ready_again() {
        let broker = LoopbackBroker::new();
        let adapter = ready_adapter(&broker, config()).await;
        broker.drop_connection("reset by peer");
        settle().await;
        assert!(!adapter.is_connected());

        let mut notifications = adapter.notifications();
        adapter.start_connection().await.unwrap();
        settle().await;

        assert_eq!(notifications.try_recv().unwrap(), BusNotification::Ready);
        assert!(adapter.is_connected());
        assert_eq!(adapter.state(), LifecycleState::Ready);
    }

    /// Connector whose `open` waits until the gate is opened.
    struct GatedConnector {
        broker: LoopbackBroker,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl BrokerConnector for GatedConnector {
        async fn open(&self, host: &str, port: u16) -> Result<BrokerLink, BusError> {
            self.gate.notified().await;
            self.broker.open(host, port).await
        }
    }

    #[tokio::test]
    async fn close_during_bring_up_drops_the_late_connection() {
        let broker = LoopbackBroker::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let adapter = BrokerAdapter::new(
            config(),
            Arc::new(GatedConnector {
                broker: broker.clone(),
                gate: Arc::clone(&gate),
            }),
        );

        let start = adapter.start_connection();
        tokio::pin!(start);
        assert!(start.as_mut().now_or_never().is_none(), "open is still pending");

        adapter.close().await.unwrap();
        gate.notify_one();
        assert_eq!(start.await, Err(BusError::UseAfterClose));
        settle().await;

        assert!(!adapter.is_connected());
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(broker.sent(), vec![OutboundPacket::Disconnect]);
        assert_eq!(adapter.state(), LifecycleState::Closed);
    }
}
