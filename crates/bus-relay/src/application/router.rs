//! Broadcast router: decides where every message goes.
//!
//! Three delivery paths:
//!
//! - **Relay** – ordinary client traffic is forwarded verbatim to every other
//!   live connection.  The router does not look inside it.
//! - **Targeted broadcast** – an HTTP command for `all` is encoded once and
//!   queued on every live connection from a single registry snapshot.
//! - **Webhook diversion** – an HTTP command for `discord` goes to the
//!   [`Notifier`] and never touches the registry.
//!
//! The router also answers the two system messages the server consumes
//! itself (`HELLO`, `LIST_CLIENTS`) and announces `JOIN` / `LEAVE`.
//!
//! Every method except [`BroadcastRouter::dispatch`] is synchronous: routing
//! never suspends between taking a snapshot and finishing the enqueue walk.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bus_core::protocol::{encode_message_with_limit, names};
use bus_core::{Message, ProtocolError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::notifier::{DispatchError, Notifier};
use crate::application::registry::{
    BusDelivery, ConnectionId, ConnectionInfo, ConnectionRegistry, DeliveryError,
    DisconnectReason, Frame, IdentifyError,
};
use crate::domain::{BroadcastRequest, TargetSelector, ValidationError};

/// User agent recorded for a `HELLO` that does not name one.
pub const DEFAULT_USER_AGENT: &str = "Unknown";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("connection {0} sent HELLO twice")]
    DuplicateHello(ConnectionId),
}

impl RouterError {
    /// How the connection that caused this error should be closed, if at all.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            RouterError::DuplicateHello(_) => DisconnectReason::DuplicateHello,
            RouterError::Delivery(DeliveryError::SlowConsumer { .. }) => {
                DisconnectReason::SlowConsumer
            }
            other => DisconnectReason::Protocol(other.to_string()),
        }
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Where an HTTP-triggered command ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Bus(BusDelivery),
    /// The webhook accepted the payload.
    Webhook,
}

impl BroadcastOutcome {
    pub fn attempted(&self) -> usize {
        match self {
            BroadcastOutcome::Bus(d) => d.attempted,
            BroadcastOutcome::Webhook => 1,
        }
    }

    pub fn delivered(&self) -> usize {
        match self {
            BroadcastOutcome::Bus(d) => d.delivered,
            BroadcastOutcome::Webhook => 1,
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            BroadcastOutcome::Bus(_) => "bus",
            BroadcastOutcome::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterStats {
    /// Frames decoded from clients.
    pub messages_processed: u64,
    /// Successful relay enqueues of client traffic.
    pub frames_relayed: u64,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    notifier: Arc<dyn Notifier>,
    max_frame_len: usize,
    messages_processed: AtomicU64,
    frames_relayed: AtomicU64,
}

impl std::fmt::Debug for BroadcastRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRouter")
            .field("registry", &self.registry)
            .field("max_frame_len", &self.max_frame_len)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BroadcastRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        notifier: Arc<dyn Notifier>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            registry,
            notifier,
            max_frame_len,
            messages_processed: AtomicU64::new(0),
            frames_relayed: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
        }
    }

    // ── Bus ingress ───────────────────────────────────────────────────────────

    /// Greets a freshly accepted connection with `HELLO { yourID }`.
    pub fn on_connect(&self, id: ConnectionId) -> Result<(), RouterError> {
        let hello = Message::new(names::HELLO).with_arg("yourID", id.to_string());
        self.send_to(id, &hello)
    }

    /// Handles one decoded message from connection `source`.
    ///
    /// # Errors
    ///
    /// Any error means `source` should be disconnected with
    /// [`RouterError::disconnect_reason`].  Other connections are unaffected.
    pub fn on_message(&self, source: ConnectionId, msg: Message) -> Result<(), RouterError> {
        if !self.registry.touch(source) {
            return Err(DeliveryError::NotFound(source).into());
        }
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        debug!(source, name = %msg.name, args = msg.args.len(), "message received");

        match msg.name.as_str() {
            names::HELLO => self.handle_hello(source, &msg),
            names::LIST_CLIENTS => self.handle_list_clients(source, &msg),
            _ => self.relay(source, &msg).map(|_| ()),
        }
    }

    fn handle_hello(&self, source: ConnectionId, msg: &Message) -> Result<(), RouterError> {
        let user_agent = msg
            .arg("userAgent")
            .filter(|ua| !ua.is_empty())
            .unwrap_or(DEFAULT_USER_AGENT);
        let private_only = msg.arg("privateOnly").is_some_and(is_truthy);

        let client = match self.registry.identify(source, user_agent, private_only) {
            Ok(client) => client,
            Err(IdentifyError::AlreadyIdentified(id)) => {
                return Err(RouterError::DuplicateHello(id))
            }
            Err(IdentifyError::NotFound(id)) => return Err(DeliveryError::NotFound(id).into()),
        };
        info!("client identified: {}", client.name());

        let join = Message::new(names::JOIN)
            .with_arg("clientID", source.to_string())
            .with_arg("name", client.name())
            .with_arg("userAgent", user_agent)
            .with_arg("host", client.peer.ip().to_string());
        let frame = self.encode(&join)?;
        let delivery = self
            .registry
            .enqueue_all(frame, |c| c.identified && c.id != source);
        self.settle(&delivery);
        Ok(())
    }

    fn handle_list_clients(&self, source: ConnectionId, msg: &Message) -> Result<(), RouterError> {
        let mut reply = Message::new(names::LIST_CLIENTS);
        let mut count = 0usize;
        for client in self.registry.list().into_iter().filter(|c| c.identified) {
            reply.push_arg(format!("client{count}"), client.id.to_string());
            reply.push_arg(
                format!("clientUserAgent{count}"),
                client.user_agent.unwrap_or_default(),
            );
            count += 1;
        }
        reply.push_arg("count", count.to_string());
        if let Some(seq) = msg.arg("SEQ") {
            reply.push_arg("SEQ", seq);
        }
        reply.push_arg("IRY", "1");
        self.send_to(source, &reply)
    }

    /// Forwards `msg` unchanged to every live connection except `source`.
    pub fn relay(&self, source: ConnectionId, msg: &Message) -> Result<BusDelivery, RouterError> {
        let frame = self.encode(msg)?;
        let delivery = self.registry.enqueue_all(frame, |c| c.id != source);
        self.frames_relayed
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        debug!(
            source,
            name = %msg.name,
            delivered = delivery.delivered,
            attempted = delivery.attempted,
            "relayed"
        );
        self.settle(&delivery);
        Ok(delivery)
    }

    // ── HTTP ingress ──────────────────────────────────────────────────────────

    /// Validates raw `target` / `command` strings and dispatches them.
    pub async fn broadcast_command(
        &self,
        target: &str,
        command: &str,
    ) -> Result<BroadcastOutcome, RouterError> {
        let request = BroadcastRequest::new(Some(target), Some(command))?;
        self.dispatch(&request).await
    }

    /// Sends a validated command to the bus or to the webhook.
    ///
    /// A bus broadcast with no clients connected succeeds with zero counts.
    /// Per-connection failures are reported in the [`BusDelivery`], not as
    /// an error.
    pub async fn dispatch(&self, request: &BroadcastRequest) -> Result<BroadcastOutcome, RouterError> {
        match request.target {
            TargetSelector::All => {
                let delivery = self.broadcast(&request.to_message())?;
                info!(
                    command = %request.command,
                    delivered = delivery.delivered,
                    attempted = delivery.attempted,
                    "command broadcast"
                );
                Ok(BroadcastOutcome::Bus(delivery))
            }
            TargetSelector::Discord => match self.notifier.send(&request.command).await {
                Ok(()) => {
                    info!(command = %request.command, "command sent to webhook");
                    Ok(BroadcastOutcome::Webhook)
                }
                Err(e) => {
                    warn!(command = %request.command, error = %e, "webhook delivery failed");
                    Err(e.into())
                }
            },
        }
    }

    /// Queues `msg` on every live connection.
    pub fn broadcast(&self, msg: &Message) -> Result<BusDelivery, RouterError> {
        let frame = self.encode(msg)?;
        let delivery = self.registry.enqueue_all(frame, |_| true);
        for (id, e) in &delivery.failures {
            warn!(id, error = %e, "broadcast enqueue failed");
        }
        self.settle(&delivery);
        Ok(delivery)
    }

    /// Queues `msg` on one connection.  A slow consumer is evicted.
    pub fn send_to(&self, id: ConnectionId, msg: &Message) -> Result<(), RouterError> {
        let frame = self.encode(msg)?;
        match self.registry.enqueue(id, frame) {
            Ok(()) => Ok(()),
            Err(e @ DeliveryError::SlowConsumer { .. }) => {
                self.disconnect(id, DisconnectReason::SlowConsumer);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Closes a connection and tells the identified clients it left.
    ///
    /// Idempotent.  If a `LEAVE` overflows another client's queue, that
    /// client is evicted too, in the same call.
    pub fn disconnect(&self, id: ConnectionId, reason: DisconnectReason) -> Option<ConnectionInfo> {
        let info = self.registry.remove(id)?;
        self.announce_departures(vec![(info.clone(), reason)]);
        Some(info)
    }

    /// Disconnects every live connection (server shutdown).  No `LEAVE` is sent.
    pub fn disconnect_all(&self) -> usize {
        let drained = self.registry.drain();
        for client in &drained {
            info!("client {} disconnected: {}", client.name(), DisconnectReason::Shutdown);
        }
        drained.len()
    }

    fn settle(&self, delivery: &BusDelivery) {
        let evicted: Vec<_> = delivery
            .slow_consumers()
            .filter_map(|id| self.registry.remove(id))
            .map(|info| (info, DisconnectReason::SlowConsumer))
            .collect();
        if !evicted.is_empty() {
            self.announce_departures(evicted);
        }
    }

    fn announce_departures(&self, departed: Vec<(ConnectionInfo, DisconnectReason)>) {
        let mut work: VecDeque<_> = departed.into();
        while let Some((client, reason)) = work.pop_front() {
            match &reason {
                DisconnectReason::PeerClosed | DisconnectReason::Shutdown => {
                    info!("client {} disconnected: {reason}", client.name());
                }
                _ => warn!("client {} disconnected: {reason}", client.name()),
            }
            if !client.identified {
                continue;
            }

            let leave = Message::new(names::LEAVE).with_arg("clientID", client.id.to_string());
            let frame = match self.encode(&leave) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(id = client.id, error = %e, "could not encode LEAVE");
                    continue;
                }
            };
            let delivery = self.registry.enqueue_all(frame, |c| c.identified);
            for slow in delivery.slow_consumers() {
                if let Some(info) = self.registry.remove(slow) {
                    work.push_back((info, DisconnectReason::SlowConsumer));
                }
            }
        }
    }

    fn encode(&self, msg: &Message) -> Result<Frame, ProtocolError> {
        encode_message_with_limit(msg, self.max_frame_len).map(Frame::from)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
