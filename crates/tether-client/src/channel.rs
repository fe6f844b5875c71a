//! Channels: one joined topic on a socket.
//!
//! ```text
//!            join()                 ok
//!  Closed ───────────▶ Joining ─────────────▶ Joined
//!    ▲                  │  ▲                    │
//!    │     error/timeout│  │rejoin              │ phx_error / socket error
//!    │                  ▼  │                    ▼
//!    │                 Errored ◀────────────────┘
//!    │
//!    └──── phx_close ◀──── Leaving ◀──── leave()
//! ```
//!
//! A channel instance joins at most once. Once closed it is removed from the
//! socket and a new instance is needed to join the topic again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tether_protocol::{events, status, Payload, Reply};
use thiserror::Error;
use tracing::debug;

use crate::metrics;
use crate::options::Params;
use crate::push::{PayloadSource, Push, PushId, PushKind, PushRecord, ReplyHook};
use crate::socket::{Command, Socket, SocketActor, SocketError, SocketShared};
use crate::timer::{RetryTimer, TimerKey, Timers};

pub(crate) type ChannelId = u64;

/// Channel errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// `join` was called twice on the same channel instance.
    #[error("tried to join multiple times on channel `{0}`; create a new channel to rejoin")]
    AlreadyJoined(String),

    /// `push` was called before `join`.
    #[error("tried to push `{event}` to `{topic}` before joining; call join() first")]
    PushBeforeJoin {
        /// Channel topic.
        topic: String,
        /// Event that was pushed.
        event: String,
    },
}

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Errored,
    Joined,
    Joining,
    Leaving,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joined => "joined",
            ChannelState::Joining => "joining",
            ChannelState::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Handle returned by [`Channel::on`], used to remove the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingRef(pub(crate) u64);

/// An event delivered to a binding.
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    /// Event name.
    pub event: &'a str,
    /// Event payload.
    pub payload: &'a Payload,
    /// Reference of the message, for replies.
    pub reference: Option<&'a str>,
    /// Join reference of the message, or the channel's when absent.
    pub join_ref: Option<&'a str>,
    /// The channel's current join reference.
    pub channel_join_ref: Option<&'a str>,
}

/// Callback bound to a channel event.
pub type BindingCallback = Box<dyn FnMut(&Event<'_>) + Send>;

/// Payload transform run before bindings: `(event, payload, ref) -> payload`.
pub type MessageHook = Box<dyn FnMut(&str, Payload, Option<&str>) -> Payload + Send>;

struct Binding {
    event: String,
    reference: BindingRef,
    callback: BindingCallback,
}

pub(crate) enum ChannelCommand {
    Create {
        topic: String,
        params: Params,
        join_push: PushId,
    },
    Join {
        timeout: Option<Duration>,
    },
    Leave {
        push: PushId,
        timeout: Option<Duration>,
        liveness: Weak<()>,
    },
    Push {
        push: PushId,
        event: String,
        payload: Payload,
        timeout: Option<Duration>,
        liveness: Weak<()>,
    },
    On {
        event: String,
        reference: BindingRef,
        callback: BindingCallback,
    },
    Off {
        event: String,
        reference: Option<BindingRef>,
    },
    OnMessage(MessageHook),
    Receive {
        push: PushId,
        status: String,
        callback: ReplyHook,
    },
}

pub(crate) struct ChannelRecord {
    pub(crate) id: ChannelId,
    pub(crate) topic: String,
    pub(crate) state: ChannelState,
    pub(crate) timeout: Duration,
    pub(crate) join_push: PushId,
    pub(crate) pushes: Vec<PushRecord>,
    push_buffer: Vec<PushId>,
    bindings: Vec<Binding>,
    message_hook: Option<MessageHook>,
    rejoin: RetryTimer,
    released: bool,
}

impl ChannelRecord {
    fn new(id: ChannelId, topic: String, params: Params, timeout: Duration, join_push: PushId) -> Self {
        let join = PushRecord::new(
            join_push,
            PushKind::Join,
            events::JOIN,
            PayloadSource::Params(params),
            timeout,
            Weak::new(),
        );
        Self {
            id,
            topic,
            state: ChannelState::Closed,
            timeout,
            join_push,
            pushes: vec![join],
            push_buffer: Vec::new(),
            bindings: Vec::new(),
            message_hook: None,
            rejoin: RetryTimer::new(TimerKey::Rejoin(id)),
            released: false,
        }
    }

    /// The join reference is the reference of the latest join push send.
    pub(crate) fn join_ref(&self) -> Option<String> {
        self.push(self.join_push)
            .and_then(|push| push.reference.clone())
    }

    pub(crate) fn push(&self, id: PushId) -> Option<&PushRecord> {
        self.pushes.iter().find(|p| p.id == id)
    }

    pub(crate) fn push_mut(&mut self, id: PushId) -> Option<&mut PushRecord> {
        self.pushes.iter_mut().find(|p| p.id == id)
    }

    fn cancel_timers(&mut self, timers: &mut Timers) {
        self.rejoin.reset(timers);
        for push in &self.pushes {
            timers.cancel(TimerKey::PushTimeout(self.id, push.id));
        }
    }
}

/// Channels owned by a socket.
///
/// `active` is the socket's channel list, in creation order. Closed channels
/// that still have handles move to `detached` so the handles keep working.
#[derive(Default)]
pub(crate) struct ChannelTable {
    active: Vec<ChannelRecord>,
    detached: HashMap<ChannelId, ChannelRecord>,
}

impl ChannelTable {
    pub(crate) fn get(&self, id: ChannelId) -> Option<&ChannelRecord> {
        self.active
            .iter()
            .find(|c| c.id == id)
            .or_else(|| self.detached.get(&id))
    }

    pub(crate) fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelRecord> {
        match self.active.iter_mut().find(|c| c.id == id) {
            Some(record) => Some(record),
            None => self.detached.get_mut(&id),
        }
    }

    pub(crate) fn get_active(&self, id: ChannelId) -> Option<&ChannelRecord> {
        self.active.iter().find(|c| c.id == id)
    }

    fn get_active_mut(&mut self, id: ChannelId) -> Option<&mut ChannelRecord> {
        self.active.iter_mut().find(|c| c.id == id)
    }

    pub(crate) fn active_ids(&self) -> Vec<ChannelId> {
        self.active.iter().map(|c| c.id).collect()
    }

    pub(crate) fn iter_active(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.active.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    fn insert(&mut self, record: ChannelRecord) {
        self.active.push(record);
    }

    /// Remove from the channel list. Returns the record if no handle is left.
    fn remove(&mut self, id: ChannelId) -> Option<ChannelRecord> {
        let index = self.active.iter().position(|c| c.id == id)?;
        let record = self.active.remove(index);
        if record.released {
            Some(record)
        } else {
            self.detached.insert(id, record);
            None
        }
    }

    /// Every handle is gone. Returns the record if it can be dropped.
    fn release(&mut self, id: ChannelId) -> Option<ChannelRecord> {
        if let Some(record) = self.active.iter_mut().find(|c| c.id == id) {
            record.released = true;
            return None;
        }
        self.detached.remove(&id)
    }
}

struct ChannelShared {
    socket: Arc<SocketShared>,
    id: ChannelId,
    join_push: PushId,
    topic: String,
    joined_once: AtomicBool,
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        self.socket.send_quiet(Command::Release(self.id));
    }
}

/// Handle to a channel.
///
/// Cheap to clone. Calls are queued to the socket and take effect in order.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn create(socket: Arc<SocketShared>, topic: String, params: Params) -> Self {
        let id = socket.next_id();
        let join_push = socket.next_id();
        socket.send_quiet(Command::Channel(
            id,
            ChannelCommand::Create {
                topic: topic.clone(),
                params,
                join_push,
            },
        ));
        Self {
            shared: Arc::new(ChannelShared {
                socket,
                id,
                join_push,
                topic,
                joined_once: AtomicBool::new(false),
            }),
        }
    }

    fn send(&self, command: ChannelCommand) {
        self.shared
            .socket
            .send_quiet(Command::Channel(self.shared.id, command));
    }

    /// The channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// The socket this channel belongs to.
    #[must_use]
    pub fn socket(&self) -> Socket {
        Socket::from_shared(self.shared.socket.clone())
    }

    /// Join the topic with the socket's default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyJoined`] if this instance was joined
    /// before.
    pub fn join(&self) -> Result<Push, ChannelError> {
        self.join_inner(None)
    }

    /// Join the topic, waiting at most `timeout` for the first join reply.
    /// Rejoins use the channel's timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyJoined`] if this instance was joined
    /// before.
    pub fn join_with_timeout(&self, timeout: Duration) -> Result<Push, ChannelError> {
        self.join_inner(Some(timeout))
    }

    fn join_inner(&self, timeout: Option<Duration>) -> Result<Push, ChannelError> {
        if self.shared.joined_once.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyJoined(self.shared.topic.clone()));
        }
        self.send(ChannelCommand::Join { timeout });
        Ok(Push::new(
            self.shared.socket.clone(),
            self.shared.id,
            self.shared.join_push,
        ))
    }

    /// Leave the topic with the channel's timeout.
    pub fn leave(&self) -> Push {
        self.leave_inner(None)
    }

    /// Leave the topic, waiting at most `timeout` for the server.
    pub fn leave_with_timeout(&self, timeout: Duration) -> Push {
        self.leave_inner(Some(timeout))
    }

    fn leave_inner(&self, timeout: Option<Duration>) -> Push {
        let push = Push::new(
            self.shared.socket.clone(),
            self.shared.id,
            self.shared.socket.next_id(),
        );
        self.send(ChannelCommand::Leave {
            push: push.id(),
            timeout,
            liveness: push.liveness(),
        });
        push
    }

    /// Push an event with the channel's timeout.
    ///
    /// Sent right away when joined and connected, buffered otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if `join` was never called.
    pub fn push(
        &self,
        event: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<Push, ChannelError> {
        self.push_inner(event.into(), payload.into(), None)
    }

    /// Push an event with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if `join` was never called.
    pub fn push_with_timeout(
        &self,
        event: impl Into<String>,
        payload: impl Into<Payload>,
        timeout: Duration,
    ) -> Result<Push, ChannelError> {
        self.push_inner(event.into(), payload.into(), Some(timeout))
    }

    fn push_inner(
        &self,
        event: String,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<Push, ChannelError> {
        if !self.shared.joined_once.load(Ordering::SeqCst) {
            return Err(ChannelError::PushBeforeJoin {
                topic: self.shared.topic.clone(),
                event,
            });
        }
        let push = Push::new(
            self.shared.socket.clone(),
            self.shared.id,
            self.shared.socket.next_id(),
        );
        self.send(ChannelCommand::Push {
            push: push.id(),
            event,
            payload,
            timeout,
            liveness: push.liveness(),
        });
        Ok(push)
    }

    /// Bind a callback to an event.
    pub fn on(
        &self,
        event: impl Into<String>,
        callback: impl FnMut(&Event<'_>) + Send + 'static,
    ) -> BindingRef {
        let reference = BindingRef(self.shared.socket.next_id());
        self.send(ChannelCommand::On {
            event: event.into(),
            reference,
            callback: Box::new(callback),
        });
        reference
    }

    /// Remove bindings for `event`: the one with `reference`, or all.
    pub fn off(&self, event: impl Into<String>, reference: Option<BindingRef>) {
        self.send(ChannelCommand::Off {
            event: event.into(),
            reference,
        });
    }

    /// Bind a callback to the channel closing.
    pub fn on_close(&self, callback: impl FnMut(&Event<'_>) + Send + 'static) -> BindingRef {
        self.on(events::CLOSE, callback)
    }

    /// Bind a callback to channel errors.
    pub fn on_error(&self, callback: impl FnMut(&Event<'_>) + Send + 'static) -> BindingRef {
        self.on(events::ERROR, callback)
    }

    /// Install a payload transform run before any binding sees a message.
    pub fn on_message(
        &self,
        hook: impl FnMut(&str, Payload, Option<&str>) -> Payload + Send + 'static,
    ) {
        self.send(ChannelCommand::OnMessage(Box::new(hook)));
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Terminated`] if the socket is gone.
    pub async fn state(&self) -> Result<ChannelState, SocketError> {
        let id = self.shared.id;
        self.shared
            .socket
            .inspect(move |actor| {
                actor
                    .channels
                    .get(id)
                    .map_or(ChannelState::Closed, |c| c.state)
            })
            .await
    }

    /// Reference of the current join, if one was sent.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Terminated`] if the socket is gone.
    pub async fn join_ref(&self) -> Result<Option<String>, SocketError> {
        let id = self.shared.id;
        self.shared
            .socket
            .inspect(move |actor| actor.channels.get(id).and_then(ChannelRecord::join_ref))
            .await
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> ChannelId {
        self.shared.id
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("topic", &self.shared.topic)
            .finish()
    }
}

impl SocketActor {
    pub(crate) fn handle_channel(&mut self, id: ChannelId, command: ChannelCommand) {
        match command {
            ChannelCommand::Create {
                topic,
                params,
                join_push,
            } => {
                let record = ChannelRecord::new(id, topic, params, self.options.timeout, join_push);
                self.channels.insert(record);
            }
            ChannelCommand::Join { timeout } => self.rejoin(id, timeout),
            ChannelCommand::Leave {
                push,
                timeout,
                liveness,
            } => self.leave_channel(id, push, timeout, liveness),
            ChannelCommand::Push {
                push,
                event,
                payload,
                timeout,
                liveness,
            } => self.push_channel(id, push, event, payload, timeout, liveness),
            ChannelCommand::On {
                event,
                reference,
                callback,
            } => {
                if let Some(ch) = self.channels.get_mut(id) {
                    ch.bindings.push(Binding {
                        event,
                        reference,
                        callback,
                    });
                }
            }
            ChannelCommand::Off { event, reference } => {
                if let Some(ch) = self.channels.get_mut(id) {
                    ch.bindings.retain(|b| {
                        !(b.event == event && reference.map_or(true, |r| r == b.reference))
                    });
                }
            }
            ChannelCommand::OnMessage(hook) => {
                if let Some(ch) = self.channels.get_mut(id) {
                    ch.message_hook = Some(hook);
                }
            }
            ChannelCommand::Receive {
                push,
                status,
                callback,
            } => self.add_reply_hook(id, push, status, callback),
        }
    }

    pub(crate) fn rejoin(&mut self, id: ChannelId, timeout: Option<Duration>) {
        let Some(ch) = self.channels.get(id) else {
            return;
        };
        if ch.state == ChannelState::Leaving {
            return;
        }
        let topic = ch.topic.clone();
        let timeout = timeout.unwrap_or(ch.timeout);
        let join_push = ch.join_push;

        self.leave_open_topic(&topic, id);
        if let Some(ch) = self.channels.get_mut(id) {
            ch.state = ChannelState::Joining;
        }
        self.resend_push(id, join_push, timeout);
    }

    /// Make another joined or joining channel on `topic` leave first.
    fn leave_open_topic(&mut self, topic: &str, except: ChannelId) {
        let duplicate = self
            .channels
            .iter_active()
            .find(|c| {
                c.id != except
                    && c.topic == topic
                    && matches!(c.state, ChannelState::Joined | ChannelState::Joining)
            })
            .map(|c| c.id);
        if let Some(duplicate) = duplicate {
            debug!(topic, "leaving duplicate topic");
            self.options
                .log("transport", &format!("leaving duplicate topic \"{topic}\""), None);
            let push = self.ids.next();
            self.leave_channel(duplicate, push, None, Weak::new());
        }
    }

    fn leave_channel(
        &mut self,
        id: ChannelId,
        push: PushId,
        timeout: Option<Duration>,
        liveness: Weak<()>,
    ) {
        let connected = self.is_connected();
        // A closed channel has left already.
        let Some(ch) = self.channels.get_active_mut(id) else {
            return;
        };
        ch.rejoin.reset(&mut self.timers);
        self.timers.cancel(TimerKey::PushTimeout(id, ch.join_push));

        let could_push = connected && ch.state == ChannelState::Joined;
        ch.state = ChannelState::Leaving;
        let timeout = timeout.unwrap_or(ch.timeout);
        ch.pushes.push(PushRecord::new(
            push,
            PushKind::Leave,
            events::LEAVE,
            PayloadSource::Fixed(Payload::empty()),
            timeout,
            liveness,
        ));
        debug!(topic = %ch.topic, "leaving channel");

        self.send_push(id, push);
        if !could_push {
            self.settle_push(id, push, Reply::new(status::OK, Payload::empty()));
        }
    }

    fn push_channel(
        &mut self,
        id: ChannelId,
        push: PushId,
        event: String,
        payload: Payload,
        timeout: Option<Duration>,
        liveness: Weak<()>,
    ) {
        let connected = self.is_connected();
        let Some(ch) = self.channels.get_mut(id) else {
            return;
        };
        let timeout = timeout.unwrap_or(ch.timeout);
        ch.pushes.push(PushRecord::new(
            push,
            PushKind::Plain,
            event,
            PayloadSource::Fixed(payload),
            timeout,
            liveness,
        ));

        if connected && ch.state == ChannelState::Joined {
            self.send_push(id, push);
        } else {
            ch.push_buffer.push(push);
            self.start_push_timeout(id, push);
        }
    }

    pub(crate) fn on_join_reply(&mut self, id: ChannelId, status: &str) {
        let connected = self.is_connected();
        match status {
            status::OK => {
                let Some(ch) = self.channels.get_mut(id) else {
                    return;
                };
                ch.state = ChannelState::Joined;
                ch.rejoin.reset(&mut self.timers);
                debug!(topic = %ch.topic, join_ref = ?ch.join_ref(), "joined channel");
                metrics::record_join();
                let buffered = std::mem::take(&mut ch.push_buffer);
                for push in buffered {
                    self.send_push(id, push);
                }
            }
            status::ERROR => {
                let Some(ch) = self.channels.get_mut(id) else {
                    return;
                };
                debug!(topic = %ch.topic, "join rejected");
                ch.state = ChannelState::Errored;
                if connected {
                    ch.rejoin.schedule(&mut self.timers, &self.options.rejoin_after);
                }
            }
            status::TIMEOUT => {
                let Some(ch) = self.channels.get(id) else {
                    return;
                };
                let join_push = ch.join_push;
                let join_ref = ch.join_ref();
                debug!(topic = %ch.topic, ?join_ref, "join timed out");
                self.options.log(
                    "channel",
                    &format!("timeout {} ({})", ch.topic, join_ref.unwrap_or_default()),
                    Some(&Value::from(ch.timeout.as_millis() as u64)),
                );

                self.send_fire_and_forget_leave(id);
                if let Some(ch) = self.channels.get_mut(id) {
                    ch.state = ChannelState::Errored;
                }
                self.reset_push(id, join_push);
                if connected {
                    if let Some(ch) = self.channels.get_mut(id) {
                        ch.rejoin.schedule(&mut self.timers, &self.options.rejoin_after);
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn close_after_leave(&mut self, id: ChannelId) {
        if let Some(ch) = self.channels.get(id) {
            self.options
                .log("channel", &format!("leave {}", ch.topic), None);
        }
        self.trigger(id, events::CLOSE, Payload::Json(Value::from("leave")), None, None);
    }

    pub(crate) fn on_rejoin_timer(&mut self, id: ChannelId) {
        if let Some(ch) = self.channels.get_mut(id) {
            ch.rejoin.fired();
        }
        if self.is_connected() {
            self.rejoin(id, None);
        }
    }

    /// Whether a message belongs to the channel's current join.
    pub(crate) fn is_member(
        &self,
        id: ChannelId,
        topic: &str,
        event: &str,
        payload: &Payload,
        join_ref: Option<&str>,
    ) -> bool {
        let Some(ch) = self.channels.get_active(id) else {
            return false;
        };
        if ch.topic != topic {
            return false;
        }
        if let Some(join_ref) = join_ref {
            if events::is_lifecycle(event) && ch.join_ref().as_deref() != Some(join_ref) {
                debug!(topic, event, join_ref, "dropping outdated message");
                if let Some(logger) = &self.options.logger {
                    let data = serde_json::json!({
                        "topic": topic,
                        "event": event,
                        "payload": payload.as_json(),
                        "join_ref": join_ref,
                    });
                    logger("channel", "dropping outdated message", Some(&data));
                }
                return false;
            }
        }
        true
    }

    /// Deliver an event to a channel: internal handling, then bindings.
    pub(crate) fn trigger(
        &mut self,
        id: ChannelId,
        event: &str,
        payload: Payload,
        reference: Option<&str>,
        join_ref: Option<&str>,
    ) {
        let payload = match self
            .channels
            .get_mut(id)
            .and_then(|c| c.message_hook.as_mut())
        {
            Some(hook) => hook(event, payload, reference),
            None => payload,
        };

        match event {
            events::CLOSE => self.on_channel_close(id),
            events::ERROR => self.on_channel_error(id),
            events::REPLY => {
                if let Some(reference) = reference {
                    self.route_reply(id, reference, &payload);
                }
            }
            _ => {}
        }

        if let Some(ch) = self.channels.get_mut(id) {
            let channel_join_ref = ch.join_ref();
            let mut bindings = std::mem::take(&mut ch.bindings);
            let delivered = Event {
                event,
                payload: &payload,
                reference,
                join_ref: join_ref.or(channel_join_ref.as_deref()),
                channel_join_ref: channel_join_ref.as_deref(),
            };
            for binding in bindings.iter_mut().filter(|b| b.event == event) {
                (binding.callback)(&delivered);
            }
            ch.bindings = bindings;
        }

        if event == events::CLOSE {
            self.remove_channel(id);
        }
    }

    fn on_channel_close(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(id) else {
            return;
        };
        ch.rejoin.reset(&mut self.timers);
        debug!(topic = %ch.topic, join_ref = ?ch.join_ref(), "channel closed");
        self.options.log(
            "channel",
            &format!("close {} {}", ch.topic, ch.join_ref().unwrap_or_default()),
            None,
        );
        ch.state = ChannelState::Closed;
    }

    fn on_channel_error(&mut self, id: ChannelId) {
        let connected = self.is_connected();
        let Some(ch) = self.channels.get(id) else {
            return;
        };
        debug!(topic = %ch.topic, "channel errored");
        self.options
            .log("channel", &format!("error {}", ch.topic), None);
        if ch.state == ChannelState::Joining {
            let join_push = ch.join_push;
            self.reset_push(id, join_push);
        }
        if let Some(ch) = self.channels.get_mut(id) {
            ch.state = ChannelState::Errored;
            if connected {
                ch.rejoin.schedule(&mut self.timers, &self.options.rejoin_after);
            }
        }
    }

    fn remove_channel(&mut self, id: ChannelId) {
        if let Some(mut record) = self.channels.remove(id) {
            record.cancel_timers(&mut self.timers);
        }
    }

    pub(crate) fn release_channel(&mut self, id: ChannelId) {
        if let Some(mut record) = self.channels.release(id) {
            record.cancel_timers(&mut self.timers);
        }
    }

    /// Error every channel that is not already errored, leaving or closed.
    pub(crate) fn trigger_chan_error(&mut self) {
        for id in self.channels.active_ids() {
            let affected = self.channels.get_active(id).is_some_and(|c| {
                !matches!(
                    c.state,
                    ChannelState::Errored | ChannelState::Leaving | ChannelState::Closed
                )
            });
            if affected {
                self.trigger(id, events::ERROR, Payload::empty(), None, None);
            }
        }
    }

    /// Socket opened: rejoin errored channels right away.
    pub(crate) fn channels_on_open(&mut self) {
        for id in self.channels.active_ids() {
            let errored = match self.channels.get_mut(id) {
                Some(ch) => {
                    ch.rejoin.reset(&mut self.timers);
                    ch.state == ChannelState::Errored
                }
                None => false,
            };
            if errored {
                self.rejoin(id, None);
            }
        }
    }

    /// Socket errored: rejoins wait for the socket to open again.
    pub(crate) fn channels_on_error(&mut self) {
        for id in self.channels.active_ids() {
            if let Some(ch) = self.channels.get_mut(id) {
                ch.rejoin.reset(&mut self.timers);
            }
        }
    }
}
