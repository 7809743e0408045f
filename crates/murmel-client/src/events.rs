//! The observer surface of the server model.
//!
//! Observers are registered with the connection and called from a single
//! model task, so callbacks for any two mutations arrive in the order the
//! server sent them and never see torn state.

use murmel_audio::speech::TalkState;
use murmel_proto::control::{
    BanEntry, CodecVersion, ContextActionModify, RegisteredUser, RejectKind, ServerConfig,
    UserStats,
};

use crate::model::channel::Channel;
use crate::model::permissions::{ChannelAccessControl, PermissionDenial};
use crate::model::user::User;

/// Why a user left the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserGone {
    Disconnected,
    Kicked {
        actor: Option<u32>,
        reason: Option<String>,
    },
    Banned {
        actor: Option<u32>,
        reason: Option<String>,
    },
}

/// A delivered text message with the sender resolved.
#[derive(Debug, Clone)]
pub struct TextMessageEvent {
    pub actor: Option<u32>,
    pub actor_name: Option<String>,
    pub sessions: Vec<u32>,
    pub channels: Vec<u32>,
    pub trees: Vec<u32>,
    pub message: String,
}

/// Callbacks for everything the model observes. All methods default to
/// no-ops; implement what you need.
#[allow(unused_variables)]
pub trait ModelObserver: Send {
    // Connection lifecycle -------------------------------------------------

    /// The server accepted us; the model is synchronized.
    fn connection_opened(&mut self) {}

    /// We are `user` on this server.
    fn joined_server(&mut self, user: &User, welcome: Option<&str>) {}

    fn connection_rejected(&mut self, kind: RejectKind, reason: &str) {}

    /// The transport closed; `error` is `None` for a local disconnect.
    fn connection_closed(&mut self, error: Option<&str>) {}

    /// Certificate verification failed; the chain is DER, leaf first. The
    /// transport stays halted until `reconnect` or `disconnect`.
    fn trust_failure(&mut self, chain: &[Vec<u8>]) {}

    fn udp_availability_changed(&mut self, available: bool) {}

    // Users ----------------------------------------------------------------

    fn user_joined(&mut self, user: &User) {}

    fn user_left(&mut self, user: &User, reason: &UserGone) {}

    fn user_moved(&mut self, session: u32, from: u32, to: u32, actor: Option<u32>) {}

    fn user_renamed(&mut self, session: u32, old_name: &str, new_name: &str) {}

    fn user_talk_state_changed(&mut self, session: u32, state: TalkState) {}

    /// Server-side mute/deafen/suppress changed.
    fn user_mute_state_changed(&mut self, user: &User, actor: Option<u32>) {}

    /// The user changed their own mute/deafen.
    fn user_self_state_changed(&mut self, user: &User) {}

    fn user_priority_speaker_changed(&mut self, session: u32, priority: bool) {}

    fn user_recording_changed(&mut self, session: u32, recording: bool) {}

    /// Local-only mute toggled by this client; never sent to the server.
    fn user_local_mute_changed(&mut self, session: u32, muted: bool) {}

    /// Friend flag toggled by this client (a local annotation).
    fn user_friend_changed(&mut self, session: u32, friend: bool) {}

    fn user_authenticated(&mut self, session: u32, user_id: u32) {}

    fn user_comment_changed(&mut self, session: u32) {}

    fn user_texture_changed(&mut self, session: u32) {}

    // Channels -------------------------------------------------------------

    fn channel_added(&mut self, channel: &Channel) {}

    fn channel_removed(&mut self, channel_id: u32) {}

    fn channel_renamed(&mut self, channel_id: u32, name: &str) {}

    fn channel_moved(&mut self, channel_id: u32, old_parent: u32, new_parent: u32) {}

    fn channel_links_set(&mut self, channel_id: u32, links: &[u32]) {}

    fn channel_links_changed(&mut self, channel_id: u32, added: &[u32], removed: &[u32]) {}

    fn channel_description_changed(&mut self, channel_id: u32) {}

    // Server-driven data ---------------------------------------------------

    fn text_message(&mut self, message: &TextMessageEvent) {}

    fn permission_denied(&mut self, denial: &PermissionDenial) {}

    fn access_control_received(&mut self, channel_id: u32, acl: &ChannelAccessControl) {}

    fn permission_query_resolved(&mut self, channel_id: u32, permissions: u32) {}

    fn codec_changed(&mut self, codec: &CodecVersion) {}

    fn user_stats_received(&mut self, stats: &UserStats) {}

    fn context_action_changed(&mut self, action: &ContextActionModify) {}

    fn server_config_received(&mut self, config: &ServerConfig) {}

    fn ban_list_received(&mut self, bans: &[BanEntry]) {}

    fn registered_users_received(&mut self, users: &[RegisteredUser]) {}
}
