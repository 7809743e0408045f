//! The authoritative in-memory replica of the server's user/channel tree.
//!
//! One model task owns this structure and processes decoded control
//! messages in arrival order; observers are invoked inline on that task,
//! which is what guarantees their total ordering.

pub mod channel;
pub mod permissions;
pub mod user;

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use murmel_audio::speech::TalkState;
use murmel_proto::control::{self, ControlMessage, RequestBlob};

use crate::events::{ModelObserver, TextMessageEvent, UserGone};
use channel::{Channel, ROOT_CHANNEL};
use permissions::{ChannelAccessControl, PermissionDenial};
use user::User;

/// Inputs to the model task. Control messages arrive in network order;
/// everything else is connection bookkeeping routed through the same
/// mailbox so observers keep a single total order.
pub(crate) enum ModelInput {
    Control(ControlMessage),
    AddObserver(Box<dyn ModelObserver>),
    TalkStates(Vec<(u32, TalkState)>),
    TrustFailure(Vec<Vec<u8>>),
    Closed(Option<String>),
    UdpAvailable(bool),
    SetLocalMute { session: u32, muted: bool },
    SetFriend { session: u32, friend: bool },
}

/// Map-owning state, separated from the observer list so handlers can
/// mutate maps and then emit with disjoint borrows.
pub struct ModelState {
    pub users: HashMap<u32, User>,
    pub channels: HashMap<u32, Channel>,
    /// Our own session id, known after ServerSync.
    pub session: Option<u32>,
    pub welcome_text: Option<String>,
    pub max_bandwidth: Option<u32>,
    pub server_config: Option<control::ServerConfig>,
    pub codec: Option<control::CodecVersion>,
    pub access_controls: HashMap<u32, ChannelAccessControl>,
    /// Cached PermissionQuery results per channel.
    pub permissions: HashMap<u32, u32>,
}

impl ModelState {
    fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(ROOT_CHANNEL, Channel::new(ROOT_CHANNEL, "Root".into()));
        Self {
            users: HashMap::new(),
            channels,
            session: None,
            welcome_text: None,
            max_bandwidth: None,
            server_config: None,
            codec: None,
            access_controls: HashMap::new(),
            permissions: HashMap::new(),
        }
    }
}

pub struct ServerModel {
    state: ModelState,
    observers: Vec<Box<dyn ModelObserver>>,
    /// Control messages the model itself needs to send (blob requests,
    /// crypt resync replies come from the router instead).
    outbound: mpsc::UnboundedSender<ControlMessage>,
}

fn emit(observers: &mut [Box<dyn ModelObserver>], f: impl Fn(&mut dyn ModelObserver)) {
    for observer in observers.iter_mut() {
        f(observer.as_mut());
    }
}

impl ServerModel {
    pub fn new(outbound: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            state: ModelState::new(),
            observers: Vec::new(),
            outbound,
        }
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn add_observer(&mut self, observer: Box<dyn ModelObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn handle(&mut self, input: ModelInput) {
        match input {
            ModelInput::Control(msg) => self.handle_message(msg),
            ModelInput::AddObserver(observer) => self.observers.push(observer),
            ModelInput::TalkStates(states) => self.apply_talk_states(states),
            ModelInput::TrustFailure(chain) => {
                emit(&mut self.observers, |o| o.trust_failure(&chain))
            }
            ModelInput::Closed(error) => {
                emit(&mut self.observers, |o| o.connection_closed(error.as_deref()))
            }
            ModelInput::UdpAvailable(available) => {
                emit(&mut self.observers, |o| o.udp_availability_changed(available))
            }
            ModelInput::SetLocalMute { session, muted } => self.set_local_mute(session, muted),
            ModelInput::SetFriend { session, friend } => self.set_friend(session, friend),
        }
    }

    /// Local-only mute flag. The connection also drops the session's
    /// datagrams before decode; this records the state and notifies.
    pub fn set_local_mute(&mut self, session: u32, muted: bool) {
        let Self {
            state, observers, ..
        } = self;
        if let Some(user) = state.users.get_mut(&session) {
            if user.local_muted != muted {
                user.local_muted = muted;
                emit(observers, |o| o.user_local_mute_changed(session, muted));
            }
        }
    }

    /// Friend annotation, kept client-side.
    pub fn set_friend(&mut self, session: u32, friend: bool) {
        let Self {
            state, observers, ..
        } = self;
        if let Some(user) = state.users.get_mut(&session) {
            if user.friend != friend {
                user.friend = friend;
                emit(observers, |o| o.user_friend_changed(session, friend));
            }
        }
    }

    pub fn handle_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::ServerSync(m) => self.handle_server_sync(m),
            ControlMessage::UserState(m) => self.handle_user_state(m),
            ControlMessage::UserRemove(m) => self.handle_user_remove(m),
            ControlMessage::ChannelState(m) => self.handle_channel_state(m),
            ControlMessage::ChannelRemove(m) => self.handle_channel_remove(m),
            ControlMessage::TextMessage(m) => self.handle_text_message(m),
            ControlMessage::PermissionDenied(m) => {
                let denial = PermissionDenial::from(&m);
                emit(&mut self.observers, |o| o.permission_denied(&denial));
            }
            ControlMessage::Acl(m) => self.handle_acl(m),
            ControlMessage::PermissionQuery(m) => self.handle_permission_query(m),
            ControlMessage::CodecVersion(m) => {
                self.state.codec = Some(m.clone());
                emit(&mut self.observers, |o| o.codec_changed(&m));
            }
            ControlMessage::Reject(m) => {
                let kind = m.kind();
                let reason = m.reason.unwrap_or_default();
                emit(&mut self.observers, |o| o.connection_rejected(kind, &reason));
            }
            ControlMessage::UserStats(m) => {
                emit(&mut self.observers, |o| o.user_stats_received(&m))
            }
            ControlMessage::ContextActionModify(m) => {
                emit(&mut self.observers, |o| o.context_action_changed(&m))
            }
            ControlMessage::ServerConfig(m) => {
                self.state.server_config = Some(m.clone());
                emit(&mut self.observers, |o| o.server_config_received(&m));
            }
            ControlMessage::BanList(m) => {
                emit(&mut self.observers, |o| o.ban_list_received(&m.bans))
            }
            ControlMessage::UserList(m) => {
                emit(&mut self.observers, |o| o.registered_users_received(&m.users))
            }
            // Intercepted by the transport before the model; arriving here
            // is harmless.
            ControlMessage::Version(_)
            | ControlMessage::Ping(_)
            | ControlMessage::CryptSetup(_)
            | ControlMessage::UdpTunnel(_) => trace!("transport message reached the model"),
            // Serverbound-only shapes; a server never sends these.
            ControlMessage::Authenticate(_)
            | ControlMessage::QueryUsers(_)
            | ControlMessage::VoiceTarget(_)
            | ControlMessage::ContextAction(_)
            | ControlMessage::RequestBlob(_) => debug!("ignoring serverbound message"),
        }
    }

    fn handle_server_sync(&mut self, msg: control::ServerSync) {
        let Self {
            state, observers, ..
        } = self;
        state.session = msg.session;
        state.welcome_text = msg.welcome_text.clone();
        state.max_bandwidth = msg.max_bandwidth;

        emit(observers, |o| o.connection_opened());
        if let Some(session) = msg.session {
            if let Some(user) = state.users.get(&session) {
                emit(observers, |o| {
                    o.joined_server(user, state.welcome_text.as_deref())
                });
            }
        }
    }

    fn handle_user_state(&mut self, msg: control::UserState) {
        let Some(session) = msg.session else {
            warn!("UserState without a session id");
            return;
        };
        let Self {
            state,
            observers,
            outbound,
        } = self;

        let is_new = !state.users.contains_key(&session);
        if is_new {
            let mut user = User::new(session, msg.name.clone().unwrap_or_default());
            user.hash = msg.hash.clone();
            state.users.insert(session, user);
            if let Some(root) = state.channels.get_mut(&ROOT_CHANNEL) {
                root.users.push(session);
            }
            emit(observers, |o| o.user_joined(&state.users[&session]));
        } else if let Some(new_name) = msg.name.clone() {
            let old_name = state.users[&session].name.clone();
            if old_name != new_name {
                state.users.get_mut(&session).expect("checked").name = new_name.clone();
                emit(observers, |o| o.user_renamed(session, &old_name, &new_name));
            }
        }

        if let Some(user_id) = msg.user_id {
            let user = state.users.get_mut(&session).expect("checked");
            if user.user_id != i64::from(user_id) {
                user.user_id = i64::from(user_id);
                emit(observers, |o| o.user_authenticated(session, user_id));
            }
        }
        if let Some(hash) = msg.hash.clone() {
            state.users.get_mut(&session).expect("checked").hash = Some(hash);
        }

        let mut mute_changed = false;
        {
            let user = state.users.get_mut(&session).expect("checked");
            if let Some(mute) = msg.mute {
                mute_changed |= user.muted != mute;
                user.muted = mute;
            }
            if let Some(deaf) = msg.deaf {
                mute_changed |= user.deafened != deaf;
                user.deafened = deaf;
            }
            if let Some(suppress) = msg.suppress {
                mute_changed |= user.suppressed != suppress;
                user.suppressed = suppress;
            }
        }
        if mute_changed {
            emit(observers, |o| {
                o.user_mute_state_changed(&state.users[&session], msg.actor)
            });
        }

        let mut self_changed = false;
        {
            let user = state.users.get_mut(&session).expect("checked");
            if let Some(self_mute) = msg.self_mute {
                self_changed |= user.self_muted != self_mute;
                user.self_muted = self_mute;
            }
            if let Some(self_deaf) = msg.self_deaf {
                self_changed |= user.self_deafened != self_deaf;
                user.self_deafened = self_deaf;
            }
        }
        if self_changed {
            emit(observers, |o| o.user_self_state_changed(&state.users[&session]));
        }

        if let Some(priority) = msg.priority_speaker {
            let user = state.users.get_mut(&session).expect("checked");
            if user.priority_speaker != priority {
                user.priority_speaker = priority;
                emit(observers, |o| o.user_priority_speaker_changed(session, priority));
            }
        }
        if let Some(recording) = msg.recording {
            let user = state.users.get_mut(&session).expect("checked");
            if user.recording != recording {
                user.recording = recording;
                emit(observers, |o| o.user_recording_changed(session, recording));
            }
        }

        // Comment and texture: inline data wins; a bare changed hash means
        // the blob has to be fetched.
        if let Some(comment) = msg.comment.clone() {
            let user = state.users.get_mut(&session).expect("checked");
            user.comment = Some(comment);
            user.comment_hash = msg.comment_hash.clone();
            emit(observers, |o| o.user_comment_changed(session));
        } else if let Some(hash) = msg.comment_hash.clone() {
            let user = state.users.get_mut(&session).expect("checked");
            if user.comment_hash.as_ref() != Some(&hash) {
                user.comment_hash = Some(hash);
                user.comment = None;
                emit(observers, |o| o.user_comment_changed(session));
                let _ = outbound.send(ControlMessage::RequestBlob(RequestBlob {
                    session_comment: vec![session],
                    ..Default::default()
                }));
            }
        }
        if let Some(texture) = msg.texture.clone() {
            let user = state.users.get_mut(&session).expect("checked");
            user.texture = Some(texture);
            user.texture_hash = msg.texture_hash.clone();
            emit(observers, |o| o.user_texture_changed(session));
        } else if let Some(hash) = msg.texture_hash.clone() {
            let user = state.users.get_mut(&session).expect("checked");
            if user.texture_hash.as_ref() != Some(&hash) {
                user.texture_hash = Some(hash);
                user.texture = None;
                emit(observers, |o| o.user_texture_changed(session));
                let _ = outbound.send(ControlMessage::RequestBlob(RequestBlob {
                    session_texture: vec![session],
                    ..Default::default()
                }));
            }
        }

        if let Some(target) = msg.channel_id {
            let from = state.users[&session].channel_id;
            if from != target {
                if state.channels.contains_key(&target) {
                    move_user(state, session, target);
                    emit(observers, |o| o.user_moved(session, from, target, msg.actor));
                } else {
                    warn!(session, channel = target, "move into unknown channel");
                }
            }
        }
    }

    fn handle_user_remove(&mut self, msg: control::UserRemove) {
        let Self {
            state, observers, ..
        } = self;
        let Some(user) = state.users.remove(&msg.session) else {
            return;
        };
        if let Some(channel) = state.channels.get_mut(&user.channel_id) {
            channel.users.retain(|&s| s != msg.session);
        }

        let reason = if msg.ban == Some(true) {
            UserGone::Banned {
                actor: msg.actor,
                reason: msg.reason.clone(),
            }
        } else if msg.actor.is_some() {
            UserGone::Kicked {
                actor: msg.actor,
                reason: msg.reason.clone(),
            }
        } else {
            UserGone::Disconnected
        };
        emit(observers, |o| o.user_left(&user, &reason));
    }

    fn handle_channel_state(&mut self, msg: control::ChannelState) {
        let Some(id) = msg.channel_id else {
            warn!("ChannelState without a channel id");
            return;
        };
        let Self {
            state,
            observers,
            outbound,
        } = self;

        let is_new = !state.channels.contains_key(&id);
        if is_new {
            let mut channel = Channel::new(id, msg.name.clone().unwrap_or_default());
            channel.position = msg.position.unwrap_or(0);
            channel.temporary = msg.temporary.unwrap_or(false);
            state.channels.insert(id, channel);
            if id != ROOT_CHANNEL {
                attach(state, id, msg.parent.unwrap_or(ROOT_CHANNEL));
            }
            emit(observers, |o| o.channel_added(&state.channels[&id]));
        } else {
            if let Some(new_parent) = msg.parent {
                let old_parent = state.channels[&id].parent;
                if id != ROOT_CHANNEL && old_parent != Some(new_parent) {
                    if would_cycle(state, id, new_parent) {
                        warn!(channel = id, parent = new_parent, "reparent would cycle");
                    } else if state.channels.contains_key(&new_parent) {
                        detach(state, id);
                        attach(state, id, new_parent);
                        emit(observers, |o| {
                            o.channel_moved(id, old_parent.unwrap_or(ROOT_CHANNEL), new_parent)
                        });
                    }
                }
            }
            if let Some(name) = msg.name.clone() {
                if state.channels[&id].name != name {
                    state.channels.get_mut(&id).expect("checked").name = name.clone();
                    if let Some(parent) = state.channels[&id].parent {
                        sort_children(state, parent);
                    }
                    emit(observers, |o| o.channel_renamed(id, &name));
                }
            }
        }

        if let Some(position) = msg.position {
            if state.channels[&id].position != position {
                state.channels.get_mut(&id).expect("checked").position = position;
                if let Some(parent) = state.channels[&id].parent {
                    sort_children(state, parent);
                }
            }
        }
        if let Some(temporary) = msg.temporary {
            state.channels.get_mut(&id).expect("checked").temporary = temporary;
        }

        if !msg.links.is_empty() {
            let current = state.channels[&id].links.clone();
            let full: HashSet<u32> = msg.links.iter().copied().filter(|&l| l != id).collect();
            let added: Vec<u32> = full.difference(&current).copied().collect();
            let removed: Vec<u32> = current.difference(&full).copied().collect();
            apply_links(state, id, &added, &removed);
            if current.is_empty() {
                let list: Vec<u32> = full.iter().copied().collect();
                emit(observers, |o| o.channel_links_set(id, &list));
            } else if !added.is_empty() || !removed.is_empty() {
                emit(observers, |o| o.channel_links_changed(id, &added, &removed));
            }
        }
        if !msg.links_add.is_empty() || !msg.links_remove.is_empty() {
            let added: Vec<u32> = msg
                .links_add
                .iter()
                .copied()
                .filter(|&l| l != id && !state.channels[&id].links.contains(&l))
                .collect();
            let removed: Vec<u32> = msg
                .links_remove
                .iter()
                .copied()
                .filter(|l| state.channels[&id].links.contains(l))
                .collect();
            apply_links(state, id, &added, &removed);
            if !added.is_empty() || !removed.is_empty() {
                emit(observers, |o| o.channel_links_changed(id, &added, &removed));
            }
        }

        if let Some(description) = msg.description.clone() {
            let channel = state.channels.get_mut(&id).expect("checked");
            channel.description = Some(description);
            channel.description_hash = msg.description_hash.clone();
            emit(observers, |o| o.channel_description_changed(id));
        } else if let Some(hash) = msg.description_hash.clone() {
            let channel = state.channels.get_mut(&id).expect("checked");
            if channel.description_hash.as_ref() != Some(&hash) {
                channel.description_hash = Some(hash);
                channel.description = None;
                emit(observers, |o| o.channel_description_changed(id));
                let _ = outbound.send(ControlMessage::RequestBlob(RequestBlob {
                    channel_description: vec![id],
                    ..Default::default()
                }));
            }
        }
    }

    fn handle_channel_remove(&mut self, msg: control::ChannelRemove) {
        let Self {
            state, observers, ..
        } = self;
        if msg.channel_id == ROOT_CHANNEL {
            warn!("server asked to remove the root channel");
            return;
        }
        detach(state, msg.channel_id);
        let Some(channel) = state.channels.remove(&msg.channel_id) else {
            return;
        };
        if !channel.children.is_empty() {
            // The sender guarantees children are removed first.
            warn!(channel = msg.channel_id, "removed channel still had children");
        }
        for link in &channel.links {
            if let Some(other) = state.channels.get_mut(link) {
                other.links.remove(&msg.channel_id);
            }
        }
        state.access_controls.remove(&msg.channel_id);
        state.permissions.remove(&msg.channel_id);
        emit(observers, |o| o.channel_removed(msg.channel_id));
    }

    fn handle_text_message(&mut self, msg: control::TextMessage) {
        let Self {
            state, observers, ..
        } = self;
        let event = TextMessageEvent {
            actor: msg.actor,
            actor_name: msg
                .actor
                .and_then(|a| state.users.get(&a))
                .map(|u| u.name.clone()),
            sessions: msg.session,
            channels: msg.channel_id,
            trees: msg.tree_id,
            message: msg.message,
        };
        emit(observers, |o| o.text_message(&event));
    }

    fn handle_acl(&mut self, msg: control::Acl) {
        let Self {
            state, observers, ..
        } = self;
        let acl = ChannelAccessControl::from(&msg);
        state.access_controls.insert(msg.channel_id, acl);
        emit(observers, |o| {
            o.access_control_received(msg.channel_id, &state.access_controls[&msg.channel_id])
        });
    }

    fn handle_permission_query(&mut self, msg: control::PermissionQuery) {
        let Self {
            state, observers, ..
        } = self;
        if msg.flush == Some(true) {
            state.permissions.clear();
        }
        if let (Some(channel_id), Some(permissions)) = (msg.channel_id, msg.permissions) {
            state.permissions.insert(channel_id, permissions);
            emit(observers, |o| {
                o.permission_query_resolved(channel_id, permissions)
            });
        }
    }

    fn apply_talk_states(&mut self, states: Vec<(u32, TalkState)>) {
        let Self {
            state, observers, ..
        } = self;
        for (session, talk) in states {
            if let Some(user) = state.users.get_mut(&session) {
                if user.talk_state != talk {
                    user.talk_state = talk;
                    emit(observers, |o| o.user_talk_state_changed(session, talk));
                }
            }
        }
    }
}

/// The model task: drains the mailbox until the connection drops it.
pub(crate) async fn run_model(
    mut model: ServerModel,
    mut rx: mpsc::UnboundedReceiver<ModelInput>,
) {
    while let Some(input) = rx.recv().await {
        model.handle(input);
    }
}

fn move_user(state: &mut ModelState, session: u32, target: u32) {
    let Some(user) = state.users.get_mut(&session) else {
        return;
    };
    let from = user.channel_id;
    user.channel_id = target;
    if let Some(channel) = state.channels.get_mut(&from) {
        channel.users.retain(|&s| s != session);
    }
    if let Some(channel) = state.channels.get_mut(&target) {
        channel.users.push(session);
    }
}

fn attach(state: &mut ModelState, id: u32, parent: u32) {
    let parent = if state.channels.contains_key(&parent) {
        parent
    } else {
        warn!(channel = id, parent, "unknown parent, attaching to root");
        ROOT_CHANNEL
    };
    if let Some(channel) = state.channels.get_mut(&id) {
        channel.parent = Some(parent);
    }
    if let Some(parent_channel) = state.channels.get_mut(&parent) {
        parent_channel.children.push(id);
    }
    sort_children(state, parent);
}

fn detach(state: &mut ModelState, id: u32) {
    let Some(parent) = state.channels.get(&id).and_then(|c| c.parent) else {
        return;
    };
    if let Some(parent_channel) = state.channels.get_mut(&parent) {
        parent_channel.children.retain(|&c| c != id);
    }
    if let Some(channel) = state.channels.get_mut(&id) {
        channel.parent = None;
    }
}

fn sort_children(state: &mut ModelState, parent: u32) {
    let Some(channel) = state.channels.get(&parent) else {
        return;
    };
    let mut children = channel.children.clone();
    children.sort_by_key(|id| {
        state
            .channels
            .get(id)
            .map(|c| (c.position, c.name.clone()))
            .unwrap_or_default()
    });
    if let Some(channel) = state.channels.get_mut(&parent) {
        channel.children = children;
    }
}

fn apply_links(state: &mut ModelState, id: u32, added: &[u32], removed: &[u32]) {
    for &link in added {
        if link == id || !state.channels.contains_key(&link) {
            continue;
        }
        if let Some(channel) = state.channels.get_mut(&id) {
            channel.links.insert(link);
        }
        if let Some(other) = state.channels.get_mut(&link) {
            other.links.insert(id);
        }
    }
    for &link in removed {
        if let Some(channel) = state.channels.get_mut(&id) {
            channel.links.remove(&link);
        }
        if let Some(other) = state.channels.get_mut(&link) {
            other.links.remove(&id);
        }
    }
}

fn would_cycle(state: &ModelState, id: u32, new_parent: u32) -> bool {
    let mut cursor = Some(new_parent);
    while let Some(current) = cursor {
        if current == id {
            return true;
        }
        cursor = state.channels.get(&current).and_then(|c| c.parent);
    }
    false
}
