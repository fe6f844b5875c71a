//! Pushes: outgoing requests awaiting at most one reply.
//!
//! A push moves from unsent to sent to replied (or timed out). Every send
//! takes a fresh reference from the socket and re-arms the timeout; the
//! first reply carrying that reference settles the push and later ones are
//! ignored. A timeout is delivered as a local `timeout` reply through the
//! same path as a server reply.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tether_protocol::{events, status, Message, Payload, Reply};
use tracing::{debug, trace};

use crate::channel::{ChannelCommand, ChannelId};
use crate::metrics;
use crate::options::Params;
use crate::socket::{Command, SocketActor, SocketShared};
use crate::timer::TimerKey;

pub(crate) type PushId = u64;

/// Hook run with the response of a reply.
pub type ReplyHook = Box<dyn FnMut(&Payload) + Send>;

/// Internal reaction attached to a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushKind {
    /// The channel's join push.
    Join,
    /// A leave requested through `leave()`; closes the channel on `ok` or
    /// `timeout`.
    Leave,
    /// No internal reaction.
    Plain,
}

/// Produces the payload at send time.
pub(crate) enum PayloadSource {
    Fixed(Payload),
    Params(Params),
}

impl PayloadSource {
    fn produce(&self) -> Payload {
        match self {
            PayloadSource::Fixed(payload) => payload.clone(),
            PayloadSource::Params(params) => Payload::Json(params.value()),
        }
    }
}

pub(crate) struct PushRecord {
    pub(crate) id: PushId,
    pub(crate) kind: PushKind,
    pub(crate) event: String,
    payload: PayloadSource,
    pub(crate) timeout: Duration,
    pub(crate) reference: Option<String>,
    /// Whether a reply with `reference` is still expected.
    pub(crate) awaiting: bool,
    pub(crate) received: Option<Reply>,
    hooks: Vec<(String, ReplyHook)>,
    liveness: Weak<()>,
}

impl PushRecord {
    pub(crate) fn new(
        id: PushId,
        kind: PushKind,
        event: impl Into<String>,
        payload: PayloadSource,
        timeout: Duration,
        liveness: Weak<()>,
    ) -> Self {
        Self {
            id,
            kind,
            event: event.into(),
            payload,
            timeout,
            reference: None,
            awaiting: false,
            received: None,
            hooks: Vec::new(),
            liveness,
        }
    }

    fn has_received(&self, status: &str) -> bool {
        self.received
            .as_ref()
            .is_some_and(|reply| reply.status == status)
    }

    /// Settled, not the join push, and no handle left to observe it.
    pub(crate) fn is_prunable(&self) -> bool {
        self.kind != PushKind::Join
            && self.received.is_some()
            && self.liveness.strong_count() == 0
    }
}

/// Handle to a push.
///
/// Dropping every handle of a settled push lets the socket forget it.
#[derive(Clone)]
pub struct Push {
    socket: Arc<SocketShared>,
    channel: ChannelId,
    id: PushId,
    alive: Arc<()>,
}

impl Push {
    pub(crate) fn new(socket: Arc<SocketShared>, channel: ChannelId, id: PushId) -> Self {
        Self {
            socket,
            channel,
            id,
            alive: Arc::new(()),
        }
    }

    pub(crate) fn id(&self) -> PushId {
        self.id
    }

    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.alive)
    }

    /// Register a hook for replies with `status`.
    ///
    /// If a reply with that status already arrived, the hook also runs right
    /// away with the stored response.
    pub fn receive(
        &self,
        status: impl Into<String>,
        callback: impl FnMut(&Payload) + Send + 'static,
    ) -> &Self {
        self.socket.send_quiet(Command::Channel(
            self.channel,
            ChannelCommand::Receive {
                push: self.id,
                status: status.into(),
                callback: Box::new(callback),
            },
        ));
        self
    }
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Push")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}

impl SocketActor {
    /// Take a fresh reference and arm the push timeout.
    pub(crate) fn start_push_timeout(&mut self, channel: ChannelId, push: PushId) {
        let Some(record) = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.push_mut(push))
        else {
            return;
        };
        record.reference = Some(self.refs.next_ref());
        record.awaiting = true;
        let timeout = record.timeout;
        self.timers
            .schedule(TimerKey::PushTimeout(channel, push), timeout);
    }

    pub(crate) fn send_push(&mut self, channel: ChannelId, push: PushId) {
        let timed_out = self
            .channels
            .get(channel)
            .and_then(|c| c.push(push))
            .map_or(true, |record| record.has_received(status::TIMEOUT));
        if timed_out {
            return;
        }

        self.start_push_timeout(channel, push);

        let Some(ch) = self.channels.get(channel) else {
            return;
        };
        let join_ref = ch.join_ref();
        let topic = ch.topic.clone();
        let Some(record) = ch.push(push) else {
            return;
        };
        let mut message = Message::new(topic, record.event.clone(), record.payload.produce());
        message.reference = record.reference.clone();
        message.join_ref = join_ref;

        self.push(message);
    }

    /// Forget the reference, response and timer so the push can be resent.
    pub(crate) fn reset_push(&mut self, channel: ChannelId, push: PushId) {
        self.timers.cancel(TimerKey::PushTimeout(channel, push));
        if let Some(record) = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.push_mut(push))
        {
            record.reference = None;
            record.awaiting = false;
            record.received = None;
        }
    }

    pub(crate) fn resend_push(&mut self, channel: ChannelId, push: PushId, timeout: Duration) {
        if let Some(record) = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.push_mut(push))
        {
            record.timeout = timeout;
        }
        self.reset_push(channel, push);
        self.send_push(channel, push);
    }

    /// Route a `phx_reply` to the push still waiting for `reference`.
    pub(crate) fn route_reply(&mut self, channel: ChannelId, reference: &str, payload: &Payload) {
        let Some(reply) = Reply::from_payload(payload) else {
            debug!(reference, "ignoring reply without a status");
            return;
        };
        let push = self.channels.get(channel).and_then(|c| {
            c.pushes
                .iter()
                .find(|p| p.awaiting && p.reference.as_deref() == Some(reference))
                .map(|p| p.id)
        });
        if let Some(push) = push {
            self.settle_push(channel, push, reply);
        }
    }

    pub(crate) fn on_push_timeout(&mut self, channel: ChannelId, push: PushId) {
        if let Some(ch) = self.channels.get(channel) {
            debug!(topic = %ch.topic, push, "push timed out");
        }
        metrics::record_push_timeout();
        self.settle_push(channel, push, Reply::timeout());
    }

    /// Accept the one reply of the current send.
    pub(crate) fn settle_push(&mut self, channel: ChannelId, push: PushId, reply: Reply) {
        self.timers.cancel(TimerKey::PushTimeout(channel, push));
        let Some(record) = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.push_mut(push))
        else {
            return;
        };
        trace!(push, status = %reply.status, "push settled");
        record.awaiting = false;
        record.received = Some(reply.clone());
        let kind = record.kind;
        let mut hooks = std::mem::take(&mut record.hooks);

        match kind {
            PushKind::Join => self.on_join_reply(channel, &reply.status),
            PushKind::Leave if reply.status == status::OK || reply.status == status::TIMEOUT => {
                self.close_after_leave(channel);
            }
            PushKind::Leave | PushKind::Plain => {}
        }

        for (hook_status, hook) in &mut hooks {
            if *hook_status == reply.status {
                hook(&reply.response);
            }
        }

        if let Some(ch) = self.channels.get_mut(channel) {
            if let Some(record) = ch.push_mut(push) {
                record.hooks = hooks;
            }
            ch.pushes.retain(|p| !p.is_prunable());
        }
    }

    pub(crate) fn add_reply_hook(
        &mut self,
        channel: ChannelId,
        push: PushId,
        status: String,
        mut callback: ReplyHook,
    ) {
        let Some(record) = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.push_mut(push))
        else {
            return;
        };
        if let Some(reply) = &record.received {
            if reply.status == status {
                callback(&reply.response);
            }
        }
        record.hooks.push((status, callback));
    }

    /// Send a leave that nobody waits for.
    pub(crate) fn send_fire_and_forget_leave(&mut self, channel: ChannelId) {
        let id = self.ids.next();
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let timeout = ch.timeout;
        ch.pushes.push(PushRecord::new(
            id,
            PushKind::Plain,
            events::LEAVE,
            PayloadSource::Fixed(Payload::empty()),
            timeout,
            Weak::new(),
        ));
        self.send_push(channel, id);
    }
}
