//! In-process message bus for agent coordination.
//!
//! Point-to-point messages go into a per-recipient FIFO mailbox. Receivers
//! that find their mailbox empty park as waiters; a new message is handed
//! to the oldest live waiter, so each message reaches exactly one receiver.
//! Requests carry a [`CorrelationId`] and are resolved by the first
//! Response or Error bearing it. Broadcasts go to current subscribers only.
//!
//! Senders never suspend. Only receivers and requesters wait.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::util::lock;
use crate::{clog_debug, clog_trace, clog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Links a Response or Error back to the Request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Status,
    Error,
    Broadcast,
}

impl MessageType {
    /// Whether this type settles a pending request.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub message_type: MessageType,
    pub from: String,
    /// Absent for broadcasts.
    pub to: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    fn new(
        message_type: MessageType,
        from: &str,
        to: Option<&str>,
        payload: serde_json::Value,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type,
            from: from.to_string(),
            to: to.map(String::from),
            payload,
            timestamp: Utc::now(),
            correlation_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub broadcast_capacity: usize,
    /// Used by `receive_message` when no timeout is given.
    pub default_receive_timeout: Duration,
    /// Used by `send_request` when no timeout is given.
    pub default_request_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            default_receive_timeout: Duration::from_secs(30),
            default_request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Message>,
    waiters: VecDeque<oneshot::Sender<Message>>,
}

impl Mailbox {
    /// Hand the message to the oldest live waiter, or queue it.
    fn deliver(&mut self, message: Message) {
        if let Some(message) = self.hand_off(message) {
            self.queue.push_back(message);
        }
    }

    /// Like `deliver`, but a message nobody takes goes to the head of the
    /// queue. Used for messages a dropped receiver had already been given.
    fn redeliver(&mut self, message: Message) {
        if let Some(message) = self.hand_off(message) {
            self.queue.push_front(message);
        }
    }

    fn hand_off(&mut self, mut message: Message) -> Option<Message> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(message) {
                Ok(()) => return None,
                // Waiter timed out or went away; try the next one.
                Err(returned) => message = returned,
            }
        }
        Some(message)
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct BusState {
    mailboxes: HashMap<String, Mailbox>,
    pending: HashMap<CorrelationId, oneshot::Sender<Message>>,
    closed: bool,
}

impl BusState {
    /// Drop closed waiters for `agent_id`, and the mailbox itself once it
    /// holds nothing.
    fn prune(&mut self, agent_id: &str) {
        let idle = match self.mailboxes.get_mut(agent_id) {
            Some(mailbox) => {
                mailbox.waiters.retain(|w| !w.is_closed());
                mailbox.is_idle()
            }
            None => false,
        };
        if idle {
            self.mailboxes.remove(agent_id);
        }
    }
}

/// A receiver parked on a mailbox.
///
/// Dropping it before it resolves withdraws the waiter. A message that was
/// already handed over goes back to the mailbox, so `receive_message` can
/// lose a race (a `select!` branch, an outer timeout) without losing mail.
struct ParkedReceiver<'a> {
    bus: &'a MessageBus,
    agent_id: &'a str,
    rx: Option<oneshot::Receiver<Message>>,
}

impl ParkedReceiver<'_> {
    async fn wait(&mut self, limit: Duration) -> Option<Message> {
        let rx = self.rx.as_mut()?;
        let result = tokio::time::timeout(limit, rx).await;
        match result {
            Ok(received) => {
                // Err means the bus was destroyed while parked.
                self.rx = None;
                received.ok()
            }
            Err(_) => {
                let bus = self.bus;
                let mut state = lock(&bus.state);
                // A sender may have won the race against the timer.
                let handed = self.withdraw(&mut state);
                if handed.is_none() {
                    clog_debug!("receive for {} timed out after {:?}", self.agent_id, limit);
                }
                handed
            }
        }
    }

    /// Leave the waiter list, returning anything handed over before the
    /// receiver closed.
    fn withdraw(&mut self, state: &mut BusState) -> Option<Message> {
        let mut rx = self.rx.take()?;
        rx.close();
        let handed = rx.try_recv().ok();
        state.prune(self.agent_id);
        handed
    }
}

impl Drop for ParkedReceiver<'_> {
    fn drop(&mut self) {
        if self.rx.is_none() {
            return;
        }
        let bus = self.bus;
        let mut state = lock(&bus.state);
        if let Some(message) = self.withdraw(&mut state) {
            if state.closed {
                return;
            }
            clog_debug!("receiver for {} dropped, message requeued", self.agent_id);
            state
                .mailboxes
                .entry(self.agent_id.to_string())
                .or_default()
                .redeliver(message);
        }
    }
}

pub struct MessageBus {
    state: Mutex<BusState>,
    broadcasts: broadcast::Sender<Message>,
    config: BusConfig,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let (broadcasts, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            state: Mutex::new(BusState::default()),
            broadcasts,
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Send a point-to-point message.
    ///
    /// A Response or Error carrying a correlation id also resolves the
    /// matching pending request, if it is still waiting.
    pub fn send_to_agent(
        &self,
        to: &str,
        from: &str,
        message_type: MessageType,
        payload: serde_json::Value,
        correlation_id: Option<CorrelationId>,
    ) -> MessageId {
        let message = Message::new(message_type, from, Some(to), payload, correlation_id);
        let id = message.id;

        let mut state = lock(&self.state);
        if state.closed {
            clog_debug!("bus destroyed, discarding {:?} {} -> {}", message_type, from, to);
            return id;
        }

        if message_type.is_reply() {
            if let Some(cid) = correlation_id {
                match state.pending.remove(&cid) {
                    Some(requester) => {
                        if requester.send(message.clone()).is_err() {
                            clog_debug!("requester for {} already gone", cid);
                        }
                    }
                    None => {
                        clog_debug!("no pending request for {}, reply not forwarded", cid);
                    }
                }
            }
        }

        clog_trace!("bus: {:?} {} -> {}", message_type, from, to);
        state
            .mailboxes
            .entry(to.to_string())
            .or_default()
            .deliver(message);
        id
    }

    /// Take the next message for `agent_id`, waiting up to `timeout`
    /// (or the configured default) if none is queued.
    ///
    /// Returns `None` on timeout or once the bus has been destroyed.
    /// Cancel-safe: dropping the future never consumes a message.
    pub async fn receive_message(
        &self,
        agent_id: &str,
        timeout: Option<Duration>,
    ) -> Option<Message> {
        let limit = timeout.unwrap_or(self.config.default_receive_timeout);
        let rx = {
            let mut state = lock(&self.state);
            if state.closed {
                return None;
            }
            let mailbox = state.mailboxes.entry(agent_id.to_string()).or_default();
            if let Some(message) = mailbox.queue.pop_front() {
                state.prune(agent_id);
                return Some(message);
            }
            let (tx, rx) = oneshot::channel();
            mailbox.waiters.push_back(tx);
            rx
        };

        let mut parked = ParkedReceiver {
            bus: self,
            agent_id,
            rx: Some(rx),
        };
        parked.wait(limit).await
    }

    /// Send a Request to `to` and wait for its correlated reply.
    ///
    /// A Response yields its payload; an Error yields
    /// [`Error::RemoteError`]. Only the first reply counts.
    pub async fn send_request(
        &self,
        to: &str,
        from: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let limit = timeout.unwrap_or(self.config.default_request_timeout);
        let correlation_id = CorrelationId::new();
        let mut rx = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(Error::BusClosed);
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(correlation_id, tx);
            rx
        };

        self.send_to_agent(to, from, MessageType::Request, payload, Some(correlation_id));

        let reply = match tokio::time::timeout(limit, &mut rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => return Err(Error::BusClosed),
            Err(_) => {
                lock(&self.state).pending.remove(&correlation_id);
                rx.close();
                match rx.try_recv() {
                    Ok(message) => message,
                    Err(_) => {
                        clog_warn!("request {} to {} timed out after {:?}", correlation_id, to, limit);
                        return Err(Error::MessageTimeout(limit));
                    }
                }
            }
        };

        match reply.message_type {
            MessageType::Error => Err(Error::RemoteError(error_text(&reply.payload))),
            _ => Ok(reply.payload),
        }
    }

    pub fn send_response(
        &self,
        to: &str,
        from: &str,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> MessageId {
        self.send_to_agent(to, from, MessageType::Response, payload, Some(correlation_id))
    }

    pub fn send_error(
        &self,
        to: &str,
        from: &str,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> MessageId {
        self.send_to_agent(to, from, MessageType::Error, payload, Some(correlation_id))
    }

    /// Interim progress report; not correlated.
    pub fn send_status(&self, to: &str, from: &str, payload: serde_json::Value) -> MessageId {
        self.send_to_agent(to, from, MessageType::Status, payload, None)
    }

    /// Publish to current broadcast subscribers. Nothing is retained.
    pub fn broadcast(&self, from: &str, payload: serde_json::Value) -> MessageId {
        let message = Message::new(MessageType::Broadcast, from, None, payload, None);
        let id = message.id;
        if lock(&self.state).closed {
            return id;
        }
        match self.broadcasts.send(message) {
            Ok(receivers) => clog_trace!("broadcast from {} to {} subscribers", from, receivers),
            Err(_) => clog_trace!("broadcast from {} had no subscribers", from),
        }
        id
    }

    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<Message> {
        self.broadcasts.subscribe()
    }

    /// Number of queued, undelivered messages for `agent_id`.
    pub fn pending_count(&self, agent_id: &str) -> usize {
        lock(&self.state)
            .mailboxes
            .get(agent_id)
            .map(|m| m.queue.len())
            .unwrap_or(0)
    }

    /// Number of receivers currently parked on `agent_id`.
    pub fn waiter_count(&self, agent_id: &str) -> usize {
        lock(&self.state)
            .mailboxes
            .get(agent_id)
            .map(Mailbox::live_waiters)
            .unwrap_or(0)
    }

    /// Number of requests still awaiting a reply.
    pub fn outstanding_requests(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Drop queued messages for `agent_id`; returns how many were dropped.
    pub fn clear_messages(&self, agent_id: &str) -> usize {
        lock(&self.state)
            .mailboxes
            .get_mut(agent_id)
            .map(|m| {
                let dropped = m.queue.len();
                m.queue.clear();
                dropped
            })
            .unwrap_or(0)
    }

    /// Tear the bus down. Parked receivers return `None`, pending
    /// requesters fail with [`Error::BusClosed`], and later waits are
    /// refused.
    pub fn destroy(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        let mailboxes = state.mailboxes.len();
        let pending = state.pending.len();
        state.mailboxes.clear();
        state.pending.clear();
        clog_debug!("bus destroyed ({} mailboxes, {} pending requests)", mailboxes, pending);
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn error_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("error")
            .and_then(|e| e.as_str())
            .map(String::from)
            .unwrap_or_else(|| other.to_string()),
    }
}
