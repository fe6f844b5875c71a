//! Presence: a per-topic roster kept in sync with the server.
//!
//! The server sends the full roster (`presence_state`) after every join and
//! incremental `presence_diff`s afterwards. Each key (usually a user id) maps
//! to a list of metas, one per connection, told apart by `phx_ref`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::channel::{Channel, Event};

/// One connection of a present key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Identifies this meta across diffs.
    pub phx_ref: String,
    /// Application fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PresenceMeta {
    /// A meta with no application fields.
    #[must_use]
    pub fn new(phx_ref: impl Into<String>) -> Self {
        Self {
            phx_ref: phx_ref.into(),
            fields: Map::new(),
        }
    }
}

/// Everything known about one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub metas: Vec<PresenceMeta>,
    /// Fields the server attached next to `metas`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(metas: Vec<PresenceMeta>) -> Self {
        Self {
            metas,
            extra: Map::new(),
        }
    }

    fn refs(&self) -> Vec<&str> {
        self.metas.iter().map(|m| m.phx_ref.as_str()).collect()
    }
}

/// The roster, in key order.
pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// An incremental roster change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

/// Reconcile `current` with a full snapshot from the server.
///
/// Keys missing from `new` leave. For keys in both, metas are compared by
/// `phx_ref`. The resulting diff is applied with [`sync_diff`].
pub fn sync_state<J, L>(
    current: &PresenceState,
    new: &PresenceState,
    on_join: J,
    on_leave: L,
) -> PresenceState
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, &PresenceEntry, &PresenceEntry),
{
    let mut diff = PresenceDiff::default();

    for (key, presence) in current {
        if !new.contains_key(key) {
            diff.leaves.insert(key.clone(), presence.clone());
        }
    }

    for (key, new_presence) in new {
        let Some(current_presence) = current.get(key) else {
            diff.joins.insert(key.clone(), new_presence.clone());
            continue;
        };
        let new_refs = new_presence.refs();
        let current_refs = current_presence.refs();

        let joined: Vec<PresenceMeta> = new_presence
            .metas
            .iter()
            .filter(|m| !current_refs.contains(&m.phx_ref.as_str()))
            .cloned()
            .collect();
        let left: Vec<PresenceMeta> = current_presence
            .metas
            .iter()
            .filter(|m| !new_refs.contains(&m.phx_ref.as_str()))
            .cloned()
            .collect();

        if !joined.is_empty() {
            diff.joins.insert(
                key.clone(),
                PresenceEntry {
                    metas: joined,
                    extra: new_presence.extra.clone(),
                },
            );
        }
        if !left.is_empty() {
            diff.leaves.insert(
                key.clone(),
                PresenceEntry {
                    metas: left,
                    extra: current_presence.extra.clone(),
                },
            );
        }
    }

    sync_diff(current.clone(), &diff, on_join, on_leave)
}

/// Apply a diff: joins first, then leaves.
///
/// A joined key holds the joined metas followed by its prior metas that
/// were not re-joined. A key whose last meta leaves is removed. Leaves for
/// unknown keys are ignored.
pub fn sync_diff<J, L>(
    mut state: PresenceState,
    diff: &PresenceDiff,
    mut on_join: J,
    mut on_leave: L,
) -> PresenceState
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, &PresenceEntry, &PresenceEntry),
{
    for (key, new_presence) in &diff.joins {
        let prior = state.insert(key.clone(), new_presence.clone());
        if let (Some(prior), Some(entry)) = (&prior, state.get_mut(key)) {
            let joined_refs: Vec<String> =
                entry.metas.iter().map(|m| m.phx_ref.clone()).collect();
            entry.metas.extend(
                prior
                    .metas
                    .iter()
                    .filter(|m| !joined_refs.contains(&m.phx_ref))
                    .cloned(),
            );
        }
        on_join(key, prior.as_ref(), new_presence);
    }

    for (key, left_presence) in &diff.leaves {
        let Some(current) = state.get_mut(key) else {
            continue;
        };
        let refs_to_remove = left_presence.refs();
        current
            .metas
            .retain(|m| !refs_to_remove.contains(&m.phx_ref.as_str()));
        on_leave(key, current, left_presence);
        if current.metas.is_empty() {
            state.remove(key);
        }
    }

    state
}

/// Project every key of the roster, in key order.
pub fn list<T>(state: &PresenceState, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
    state
        .iter()
        .map(|(key, presence)| chooser(key, presence))
        .collect()
}

/// Called when metas join: `(key, prior entry, joined entry)`.
pub type JoinCallback = Arc<dyn Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + Sync>;
/// Called when metas leave: `(key, remaining entry, left entry)`.
pub type LeaveCallback = Arc<dyn Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync>;
/// Called after each applied state or diff.
pub type SyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Event names a [`Presence`] listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceOptions {
    pub state_event: String,
    pub diff_event: String,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            state_event: "presence_state".to_string(),
            diff_event: "presence_diff".to_string(),
        }
    }
}

enum Change {
    Join(String, Option<PresenceEntry>, PresenceEntry),
    Leave(String, PresenceEntry, PresenceEntry),
}

#[derive(Default)]
struct Inner {
    state: PresenceState,
    pending_diffs: Vec<PresenceDiff>,
    join_ref: Option<String>,
    on_join: Option<JoinCallback>,
    on_leave: Option<LeaveCallback>,
    on_sync: Option<SyncCallback>,
}

impl Inner {
    fn apply_state(&mut self, new: &PresenceState, changes: &RefCell<Vec<Change>>) {
        self.state = sync_state(&self.state, new, join_recorder(changes), leave_recorder(changes));
    }

    fn apply_diff(&mut self, diff: &PresenceDiff, changes: &RefCell<Vec<Change>>) {
        let state = std::mem::take(&mut self.state);
        self.state = sync_diff(state, diff, join_recorder(changes), leave_recorder(changes));
    }
}

fn join_recorder(
    changes: &RefCell<Vec<Change>>,
) -> impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry) + '_ {
    move |key, prior, joined| {
        changes
            .borrow_mut()
            .push(Change::Join(key.to_string(), prior.cloned(), joined.clone()));
    }
}

fn leave_recorder(changes: &RefCell<Vec<Change>>) -> impl FnMut(&str, &PresenceEntry, &PresenceEntry) + '_ {
    move |key, remaining, left| {
        changes
            .borrow_mut()
            .push(Change::Leave(key.to_string(), remaining.clone(), left.clone()));
    }
}

/// A roster bound to a channel.
///
/// Diffs that arrive before the snapshot of the current join are queued and
/// applied right after it. Callbacks run without any lock held.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<Mutex<Inner>>,
}

impl Presence {
    /// Track presence on `channel` using the default event names.
    #[must_use]
    pub fn new(channel: &Channel) -> Self {
        Self::with_options(channel, PresenceOptions::default())
    }

    /// Track presence on `channel`.
    #[must_use]
    pub fn with_options(channel: &Channel, options: PresenceOptions) -> Self {
        let presence = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        };

        let on_state = presence.clone();
        channel.on(options.state_event, move |event| on_state.handle_state(event));
        let on_diff = presence.clone();
        channel.on(options.diff_event, move |event| on_diff.handle_diff(event));

        presence
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_state(&self, event: &Event<'_>) {
        let Some(new) = parse::<PresenceState>(event) else {
            return;
        };
        let changes = RefCell::new(Vec::new());
        let callbacks = {
            let mut inner = self.lock();
            inner.join_ref = event.channel_join_ref.map(str::to_string);
            inner.apply_state(&new, &changes);
            let pending = std::mem::take(&mut inner.pending_diffs);
            if !pending.is_empty() {
                debug!(count = pending.len(), "applying queued presence diffs");
            }
            for diff in &pending {
                inner.apply_diff(diff, &changes);
            }
            inner.callbacks()
        };
        callbacks.run(changes.into_inner());
    }

    fn handle_diff(&self, event: &Event<'_>) {
        let Some(diff) = parse::<PresenceDiff>(event) else {
            return;
        };
        let changes = RefCell::new(Vec::new());
        let callbacks = {
            let mut inner = self.lock();
            let pending_sync =
                inner.join_ref.is_none() || inner.join_ref.as_deref() != event.channel_join_ref;
            if pending_sync {
                inner.pending_diffs.push(diff);
                return;
            }
            inner.apply_diff(&diff, &changes);
            inner.callbacks()
        };
        callbacks.run(changes.into_inner());
    }

    /// Set the join callback.
    pub fn on_join(
        &self,
        callback: impl Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + Sync + 'static,
    ) {
        self.lock().on_join = Some(Arc::new(callback));
    }

    /// Set the leave callback.
    pub fn on_leave(
        &self,
        callback: impl Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync + 'static,
    ) {
        self.lock().on_leave = Some(Arc::new(callback));
    }

    /// Set the sync callback.
    pub fn on_sync(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().on_sync = Some(Arc::new(callback));
    }

    /// Project the current roster.
    pub fn list<T>(&self, chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        list(&self.lock().state, chooser)
    }

    /// A copy of the current roster.
    #[must_use]
    pub fn state(&self) -> PresenceState {
        self.lock().state.clone()
    }

    /// Whether diffs are being held back until the next snapshot.
    #[must_use]
    pub fn is_pending_sync(&self) -> bool {
        !self.lock().pending_diffs.is_empty()
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Presence")
            .field("keys", &inner.state.len())
            .field("pending_diffs", &inner.pending_diffs.len())
            .field("join_ref", &inner.join_ref)
            .finish()
    }
}

struct Callbacks {
    on_join: Option<JoinCallback>,
    on_leave: Option<LeaveCallback>,
    on_sync: Option<SyncCallback>,
}

impl Inner {
    fn callbacks(&self) -> Callbacks {
        Callbacks {
            on_join: self.on_join.clone(),
            on_leave: self.on_leave.clone(),
            on_sync: self.on_sync.clone(),
        }
    }
}

impl Callbacks {
    fn run(self, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Join(key, prior, joined) => {
                    if let Some(on_join) = &self.on_join {
                        on_join(&key, prior.as_ref(), &joined);
                    }
                }
                Change::Leave(key, remaining, left) => {
                    if let Some(on_leave) = &self.on_leave {
                        on_leave(&key, &remaining, &left);
                    }
                }
            }
        }
        if let Some(on_sync) = &self.on_sync {
            on_sync();
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(event: &Event<'_>) -> Option<T> {
    let Some(value) = event.payload.as_json() else {
        warn!(event = event.event, "ignoring binary presence payload");
        return None;
    };
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(event = event.event, error = %e, "ignoring malformed presence payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{joined_channel, settle, MemorySetup};
    use serde_json::json;
    use std::time::Duration;
    use tether_protocol::Message;

    fn state(value: Value) -> PresenceState {
        serde_json::from_value(value).unwrap()
    }

    fn refs(state: &PresenceState, key: &str) -> Vec<String> {
        state[key].metas.iter().map(|m| m.phx_ref.clone()).collect()
    }

    #[test]
    fn test_sync_state_from_empty_joins() {
        let mut joins = Vec::new();
        let new = state(json!({"u1": {"metas": [{"phx_ref": "a"}]}}));

        let synced = sync_state(
            &PresenceState::new(),
            &new,
            |key, prior, joined| joins.push((key.to_string(), prior.cloned(), joined.clone())),
            |_, _, _| panic!("nothing should leave"),
        );

        assert_eq!(synced, new);
        assert_eq!(
            joins,
            vec![(
                "u1".to_string(),
                None,
                PresenceEntry::new(vec![PresenceMeta::new("a")])
            )]
        );
    }

    #[test]
    fn test_sync_state_diffs_metas_by_ref() {
        let current = state(json!({
            "u1": {"metas": [{"phx_ref": "a"}, {"phx_ref": "b"}]},
            "u2": {"metas": [{"phx_ref": "c"}]}
        }));
        let new = state(json!({
            "u1": {"metas": [{"phx_ref": "b"}, {"phx_ref": "d", "device": "phone"}]},
            "u3": {"metas": [{"phx_ref": "e"}]}
        }));
        let mut joined = Vec::new();
        let mut left = Vec::new();

        let synced = sync_state(
            &current,
            &new,
            |key, _, entry| joined.push((key.to_string(), entry.refs().join(","))),
            |key, _, entry| left.push((key.to_string(), entry.refs().join(","))),
        );

        assert_eq!(refs(&synced, "u1"), ["d", "b"]);
        assert_eq!(synced["u1"].metas[0].fields["device"], json!("phone"));
        assert_eq!(refs(&synced, "u3"), ["e"]);
        assert!(!synced.contains_key("u2"));
        assert_eq!(
            joined,
            [("u1".to_string(), "d".to_string()), ("u3".to_string(), "e".to_string())]
        );
        assert_eq!(
            left,
            [("u1".to_string(), "a".to_string()), ("u2".to_string(), "c".to_string())]
        );
    }

    #[test]
    fn test_sync_diff_rejoin_same_ref_is_idempotent() {
        let current = state(json!({"u1": {"metas": [{"phx_ref": "a"}]}}));
        let diff: PresenceDiff = serde_json::from_value(json!({
            "joins": {"u1": {"metas": [{"phx_ref": "a"}]}},
            "leaves": {}
        }))
        .unwrap();

        let once = sync_diff(current, &diff, |_, _, _| {}, |_, _, _| {});
        let twice = sync_diff(once, &diff, |_, _, _| {}, |_, _, _| {});
        assert_eq!(twice["u1"].metas.len(), 1);
    }

    #[test]
    fn test_sync_diff_leaves() {
        let current = state(json!({
            "u1": {"metas": [{"phx_ref": "a"}, {"phx_ref": "b"}]},
            "u2": {"metas": [{"phx_ref": "c"}]}
        }));
        let diff: PresenceDiff = serde_json::from_value(json!({
            "leaves": {
                "u1": {"metas": [{"phx_ref": "a"}]},
                "u2": {"metas": [{"phx_ref": "c"}]},
                "ghost": {"metas": [{"phx_ref": "z"}]}
            }
        }))
        .unwrap();
        let mut remaining = Vec::new();

        let synced = sync_diff(
            current,
            &diff,
            |_, _, _| {},
            |key, current, _| remaining.push((key.to_string(), current.metas.len())),
        );

        assert_eq!(refs(&synced, "u1"), ["b"]);
        assert!(!synced.contains_key("u2"));
        assert_eq!(remaining, [("u1".to_string(), 1), ("u2".to_string(), 0)]);
    }

    #[test]
    fn test_list_projects_in_key_order() {
        let roster = state(json!({
            "b": {"metas": [{"phx_ref": "2"}]},
            "a": {"metas": [{"phx_ref": "1"}, {"phx_ref": "3"}]}
        }));
        let counts = list(&roster, |key, entry| format!("{key}:{}", entry.metas.len()));
        assert_eq!(counts, ["a:2", "b:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_queues_diffs_until_state() {
        let setup = MemorySetup::connected().await;
        let channel = setup.socket.channel("room:1", json!({}));
        let presence = Presence::new(&channel);
        let syncs = Arc::new(Mutex::new(0));
        let joins = Arc::new(Mutex::new(Vec::new()));
        {
            let syncs = syncs.clone();
            presence.on_sync(move || *syncs.lock().unwrap() += 1);
            let joins = joins.clone();
            presence.on_join(move |key, _, _| joins.lock().unwrap().push(key.to_string()));
        }

        channel.join().unwrap();
        settle(&setup.socket).await;
        let join = setup.server.take_sent().remove(0);
        setup.server.push(&Message::new(
            "room:1",
            "presence_diff",
            json!({"joins": {"u2": {"metas": [{"phx_ref": "b"}]}}, "leaves": {}}),
        ));
        settle(&setup.socket).await;
        assert!(presence.is_pending_sync());
        assert!(presence.state().is_empty());

        setup
            .server
            .reply(&join, tether_protocol::Reply::new("ok", json!({})));
        setup.server.push(&Message::new(
            "room:1",
            "presence_state",
            json!({"u1": {"metas": [{"phx_ref": "a"}]}}),
        ));
        settle(&setup.socket).await;

        assert!(!presence.is_pending_sync());
        assert_eq!(presence.list(|key, _| key.to_string()), ["u1", "u2"]);
        assert_eq!(*joins.lock().unwrap(), ["u1", "u2"]);
        assert_eq!(*syncs.lock().unwrap(), 1);

        setup.server.push(&Message::new(
            "room:1",
            "presence_diff",
            json!({"leaves": {"u1": {"metas": [{"phx_ref": "a"}]}}}),
        ));
        settle(&setup.socket).await;
        assert_eq!(presence.list(|key, _| key.to_string()), ["u2"]);
        assert_eq!(*syncs.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_resyncs_after_rejoin() {
        let setup = MemorySetup::connected().await;
        let channel = setup.socket.channel("room:1", json!({}));
        let presence = Presence::new(&channel);
        channel.join().unwrap();
        settle(&setup.socket).await;
        let join = setup.server.take_sent().remove(0);
        setup
            .server
            .reply(&join, tether_protocol::Reply::new("ok", json!({})));
        setup.server.push(&Message::new(
            "room:1",
            "presence_state",
            json!({"u1": {"metas": [{"phx_ref": "a"}]}}),
        ));
        settle(&setup.socket).await;
        let first_join_ref = channel.join_ref().await.unwrap();
        assert_eq!(presence.list(|key, _| key.to_string()), ["u1"]);

        // Drop the connection; the socket reconnects and the channel rejoins.
        setup.server.close(1006, "", false);
        settle(&setup.socket).await;
        tokio::time::sleep(Duration::from_millis(11)).await;
        settle(&setup.socket).await;
        assert_eq!(setup.connector.connection_count(), 2);
        let server = setup.connector.last().unwrap();
        let rejoin = server.take_sent().remove(0);
        assert_eq!(rejoin.event, "phx_join");
        server.reply(&rejoin, tether_protocol::Reply::new("ok", json!({})));
        settle(&setup.socket).await;
        assert_ne!(channel.join_ref().await.unwrap(), first_join_ref);

        // A diff for the new join arrives ahead of its state.
        server.push(&Message::new(
            "room:1",
            "presence_diff",
            json!({
                "joins": {"u2": {"metas": [{"phx_ref": "b"}]}},
                "leaves": {"u1": {"metas": [{"phx_ref": "a"}]}}
            }),
        ));
        settle(&setup.socket).await;
        assert!(presence.is_pending_sync());
        assert_eq!(presence.list(|key, _| key.to_string()), ["u1"]);

        server.push(&Message::new(
            "room:1",
            "presence_state",
            json!({"u1": {"metas": [{"phx_ref": "a"}]}}),
        ));
        settle(&setup.socket).await;
        assert!(!presence.is_pending_sync());
        assert_eq!(presence.list(|key, _| key.to_string()), ["u2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_custom_event_names() {
        let setup = MemorySetup::connected().await;
        let channel = joined_channel(&setup, "room:1").await;
        let presence = Presence::with_options(
            &channel,
            PresenceOptions {
                state_event: "roster".into(),
                diff_event: "roster_diff".into(),
            },
        );

        setup.server.push(&Message::new(
            "room:1",
            "roster",
            json!({"u1": {"metas": [{"phx_ref": "a"}]}}),
        ));
        setup.server.push(&Message::new(
            "room:1",
            "presence_state",
            json!({"u9": {"metas": [{"phx_ref": "z"}]}}),
        ));
        settle(&setup.socket).await;
        assert_eq!(presence.list(|key, _| key.to_string()), ["u1"]);
    }
}
