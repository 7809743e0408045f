use murmel_audio::speech::TalkState;

/// A user as replicated from UserState/UserRemove traffic.
#[derive(Debug, Clone)]
pub struct User {
    /// Transient id, unique per server session.
    pub session: u32,
    /// Registered id; negative while unregistered, 0 is the superuser.
    pub user_id: i64,
    pub name: String,
    /// Hex SHA-1 of the user's certificate, when the server shares it.
    pub hash: Option<String>,
    pub channel_id: u32,
    pub talk_state: TalkState,

    pub muted: bool,
    pub deafened: bool,
    pub suppressed: bool,
    pub self_muted: bool,
    pub self_deafened: bool,
    /// Local-only mute, never sent to the server; toggled through the
    /// connection, which also drops the session's audio.
    pub local_muted: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    /// Client-side friend annotation, toggled through the connection.
    pub friend: bool,

    pub comment: Option<String>,
    pub comment_hash: Option<Vec<u8>>,
    pub texture: Option<Vec<u8>>,
    pub texture_hash: Option<Vec<u8>>,
}

impl User {
    pub(crate) fn new(session: u32, name: String) -> Self {
        Self {
            session,
            user_id: -1,
            name,
            hash: None,
            channel_id: 0,
            talk_state: TalkState::Passive,
            muted: false,
            deafened: false,
            suppressed: false,
            self_muted: false,
            self_deafened: false,
            local_muted: false,
            priority_speaker: false,
            recording: false,
            friend: false,
            comment: None,
            comment_hash: None,
            texture: None,
            texture_hash: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id >= 0
    }
}
