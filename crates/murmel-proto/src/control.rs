//! Control-channel messages.
//!
//! Hand-written `prost` structs carrying the protocol's field tags. Absent
//! optional fields mean "no change" for stateful messages (UserState,
//! ChannelState, CryptSetup), so every scalar here is `Option` unless the
//! protocol marks it required.

use bytes::Bytes;
use prost::Message;

use crate::error::ProtocolError;
use crate::framing::{encode_frame, MessageKind};

#[derive(Clone, PartialEq, Message)]
pub struct Version {
    /// Packed `major << 16 | minor << 8 | patch`.
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub release: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub os: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub os_version: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Authenticate {
    #[prost(string, optional, tag = "1")]
    pub username: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub password: Option<String>,
    #[prost(string, repeated, tag = "3")]
    pub tokens: Vec<String>,
    #[prost(int32, repeated, packed = "false", tag = "4")]
    pub celt_versions: Vec<i32>,
    #[prost(bool, optional, tag = "5")]
    pub opus: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub good: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub late: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub lost: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub resync: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub udp_packets: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub tcp_packets: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub udp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub udp_ping_var: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub tcp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub tcp_ping_var: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RejectKind {
    None = 0,
    WrongVersion = 1,
    InvalidUsername = 2,
    WrongUserPassword = 3,
    WrongServerPassword = 4,
    UsernameInUse = 5,
    ServerFull = 6,
    NoCertificate = 7,
    AuthenticatorFail = 8,
}

#[derive(Clone, PartialEq, Message)]
pub struct Reject {
    #[prost(enumeration = "RejectKind", optional, tag = "1")]
    pub kind: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub reason: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerSync {
    /// The session id assigned to this client.
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub welcome_text: Option<String>,
    #[prost(uint64, optional, tag = "4")]
    pub permissions: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChannelRemove {
    #[prost(uint32, required, tag = "1")]
    pub channel_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChannelState {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub parent: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    /// Full replacement link set.
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub links: Vec<u32>,
    #[prost(string, optional, tag = "5")]
    pub description: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "6")]
    pub links_add: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "7")]
    pub links_remove: Vec<u32>,
    #[prost(bool, optional, tag = "8")]
    pub temporary: Option<bool>,
    #[prost(int32, optional, tag = "9")]
    pub position: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub description_hash: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserRemove {
    #[prost(uint32, required, tag = "1")]
    pub session: u32,
    /// Present when the removal was a kick or ban.
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub reason: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub ban: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserState {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    /// Registered user id; absent for unregistered users.
    #[prost(uint32, optional, tag = "4")]
    pub user_id: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub channel_id: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub mute: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub deaf: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub suppress: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub self_mute: Option<bool>,
    #[prost(bool, optional, tag = "10")]
    pub self_deaf: Option<bool>,
    #[prost(bytes = "vec", optional, tag = "11")]
    pub texture: Option<Vec<u8>>,
    #[prost(string, optional, tag = "14")]
    pub comment: Option<String>,
    /// Hex SHA-1 of the user's certificate.
    #[prost(string, optional, tag = "15")]
    pub hash: Option<String>,
    #[prost(bytes = "vec", optional, tag = "16")]
    pub comment_hash: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "17")]
    pub texture_hash: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "18")]
    pub priority_speaker: Option<bool>,
    #[prost(bool, optional, tag = "19")]
    pub recording: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BanEntry {
    #[prost(bytes = "vec", required, tag = "1")]
    pub address: Vec<u8>,
    #[prost(uint32, required, tag = "2")]
    pub mask: u32,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub hash: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub reason: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub start: Option<String>,
    #[prost(uint32, optional, tag = "7")]
    pub duration: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BanList {
    #[prost(message, repeated, tag = "1")]
    pub bans: Vec<BanEntry>,
    #[prost(bool, optional, tag = "2")]
    pub query: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TextMessage {
    #[prost(uint32, optional, tag = "1")]
    pub actor: Option<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub session: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "3")]
    pub channel_id: Vec<u32>,
    /// Channels whose whole subtree receives the message.
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub tree_id: Vec<u32>,
    #[prost(string, required, tag = "5")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DenyKind {
    Text = 0,
    Permission = 1,
    SuperUser = 2,
    ChannelName = 3,
    TextTooLong = 4,
    H9K = 5,
    TemporaryChannel = 6,
    MissingCertificate = 7,
    UserName = 8,
    ChannelFull = 9,
    NestingLimit = 10,
}

#[derive(Clone, PartialEq, Message)]
pub struct PermissionDenied {
    #[prost(uint32, optional, tag = "1")]
    pub permission: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub session: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub reason: Option<String>,
    #[prost(enumeration = "DenyKind", optional, tag = "5")]
    pub kind: Option<i32>,
    /// The offending name for ChannelName / UserName denials.
    #[prost(string, optional, tag = "6")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AclGroup {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(bool, optional, tag = "2")]
    pub inherited: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub inherit: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub inheritable: Option<bool>,
    #[prost(uint32, repeated, packed = "false", tag = "5")]
    pub add: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "6")]
    pub remove: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "7")]
    pub inherited_members: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AclEntry {
    #[prost(bool, optional, tag = "1")]
    pub apply_here: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub apply_subs: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub inherited: Option<bool>,
    #[prost(uint32, optional, tag = "4")]
    pub user_id: Option<u32>,
    #[prost(string, optional, tag = "5")]
    pub group: Option<String>,
    #[prost(uint32, optional, tag = "6")]
    pub grant: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub deny: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Acl {
    #[prost(uint32, required, tag = "1")]
    pub channel_id: u32,
    #[prost(bool, optional, tag = "2")]
    pub inherit_acls: Option<bool>,
    #[prost(message, repeated, tag = "3")]
    pub groups: Vec<AclGroup>,
    #[prost(message, repeated, tag = "4")]
    pub acls: Vec<AclEntry>,
    #[prost(bool, optional, tag = "5")]
    pub query: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryUsers {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub ids: Vec<u32>,
    #[prost(string, repeated, tag = "2")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CryptSetup {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub client_nonce: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub server_nonce: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ContextActionOp {
    Add = 0,
    Remove = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct ContextActionModify {
    #[prost(string, required, tag = "1")]
    pub action: String,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub context: Option<u32>,
    #[prost(enumeration = "ContextActionOp", optional, tag = "4")]
    pub operation: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ContextAction {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(string, required, tag = "3")]
    pub action: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RegisteredUser {
    #[prost(uint32, required, tag = "1")]
    pub user_id: u32,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserList {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<RegisteredUser>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceTargetEntry {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub session: Vec<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub group: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub links: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub children: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceTarget {
    /// Whisper target slot, 1..=30.
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub targets: Vec<VoiceTargetEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PermissionQuery {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub permissions: Option<u32>,
    /// Server asks the client to drop its whole permission cache.
    #[prost(bool, optional, tag = "3")]
    pub flush: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CodecVersion {
    #[prost(int32, required, tag = "1")]
    pub alpha: i32,
    #[prost(int32, required, tag = "2")]
    pub beta: i32,
    #[prost(bool, required, tag = "3")]
    pub prefer_alpha: bool,
    #[prost(bool, optional, tag = "4")]
    pub opus: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserStatsEntry {
    #[prost(uint32, optional, tag = "1")]
    pub good: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub late: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub lost: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub resync: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserStats {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub stats_only: Option<bool>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub certificates: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "4")]
    pub from_client: Option<UserStatsEntry>,
    #[prost(message, optional, tag = "5")]
    pub from_server: Option<UserStatsEntry>,
    #[prost(uint32, optional, tag = "6")]
    pub udp_packets: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub tcp_packets: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub udp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub udp_ping_var: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub tcp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub tcp_ping_var: Option<f32>,
    #[prost(message, optional, tag = "12")]
    pub version: Option<Version>,
    #[prost(int32, repeated, packed = "false", tag = "13")]
    pub celt_versions: Vec<i32>,
    #[prost(bool, optional, tag = "15")]
    pub certificate_valid: Option<bool>,
    #[prost(bool, optional, tag = "16")]
    pub opus: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestBlob {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub session_texture: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub session_comment: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "3")]
    pub channel_description: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerConfig {
    #[prost(uint32, optional, tag = "1")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub welcome_text: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub allow_html: Option<bool>,
    #[prost(uint32, optional, tag = "4")]
    pub message_length: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub image_message_length: Option<u32>,
}

/// A decoded control message, tagged by wire type.
///
/// `UdpTunnel` is the one non-protobuf frame: its payload is a raw voice
/// datagram handed straight to the UDP receive path.
#[derive(Clone, Debug)]
pub enum ControlMessage {
    Version(Version),
    UdpTunnel(Bytes),
    Authenticate(Authenticate),
    Ping(Ping),
    Reject(Reject),
    ServerSync(ServerSync),
    ChannelRemove(ChannelRemove),
    ChannelState(ChannelState),
    UserRemove(UserRemove),
    UserState(UserState),
    BanList(BanList),
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    Acl(Acl),
    QueryUsers(QueryUsers),
    CryptSetup(CryptSetup),
    ContextActionModify(ContextActionModify),
    ContextAction(ContextAction),
    UserList(UserList),
    VoiceTarget(VoiceTarget),
    PermissionQuery(PermissionQuery),
    CodecVersion(CodecVersion),
    UserStats(UserStats),
    RequestBlob(RequestBlob),
    ServerConfig(ServerConfig),
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        use ControlMessage::*;
        match self {
            Version(_) => MessageKind::Version,
            UdpTunnel(_) => MessageKind::UdpTunnel,
            Authenticate(_) => MessageKind::Authenticate,
            Ping(_) => MessageKind::Ping,
            Reject(_) => MessageKind::Reject,
            ServerSync(_) => MessageKind::ServerSync,
            ChannelRemove(_) => MessageKind::ChannelRemove,
            ChannelState(_) => MessageKind::ChannelState,
            UserRemove(_) => MessageKind::UserRemove,
            UserState(_) => MessageKind::UserState,
            BanList(_) => MessageKind::BanList,
            TextMessage(_) => MessageKind::TextMessage,
            PermissionDenied(_) => MessageKind::PermissionDenied,
            Acl(_) => MessageKind::Acl,
            QueryUsers(_) => MessageKind::QueryUsers,
            CryptSetup(_) => MessageKind::CryptSetup,
            ContextActionModify(_) => MessageKind::ContextActionModify,
            ContextAction(_) => MessageKind::ContextAction,
            UserList(_) => MessageKind::UserList,
            VoiceTarget(_) => MessageKind::VoiceTarget,
            PermissionQuery(_) => MessageKind::PermissionQuery,
            CodecVersion(_) => MessageKind::CodecVersion,
            UserStats(_) => MessageKind::UserStats,
            RequestBlob(_) => MessageKind::RequestBlob,
            ServerConfig(_) => MessageKind::ServerConfig,
        }
    }

    /// Decode a frame payload. `Ok(None)` means the type is not one this
    /// client understands; the caller logs and drops it.
    pub fn decode(raw_kind: u16, payload: Bytes) -> Result<Option<Self>, ProtocolError> {
        let Some(kind) = MessageKind::from_wire(raw_kind) else {
            return Ok(None);
        };
        let msg = match kind {
            MessageKind::Version => Self::Version(Version::decode(&payload[..])?),
            MessageKind::UdpTunnel => Self::UdpTunnel(payload),
            MessageKind::Authenticate => Self::Authenticate(Authenticate::decode(&payload[..])?),
            MessageKind::Ping => Self::Ping(Ping::decode(&payload[..])?),
            MessageKind::Reject => Self::Reject(Reject::decode(&payload[..])?),
            MessageKind::ServerSync => Self::ServerSync(ServerSync::decode(&payload[..])?),
            MessageKind::ChannelRemove => {
                Self::ChannelRemove(ChannelRemove::decode(&payload[..])?)
            }
            MessageKind::ChannelState => Self::ChannelState(ChannelState::decode(&payload[..])?),
            MessageKind::UserRemove => Self::UserRemove(UserRemove::decode(&payload[..])?),
            MessageKind::UserState => Self::UserState(UserState::decode(&payload[..])?),
            MessageKind::BanList => Self::BanList(BanList::decode(&payload[..])?),
            MessageKind::TextMessage => Self::TextMessage(TextMessage::decode(&payload[..])?),
            MessageKind::PermissionDenied => {
                Self::PermissionDenied(PermissionDenied::decode(&payload[..])?)
            }
            MessageKind::Acl => Self::Acl(Acl::decode(&payload[..])?),
            MessageKind::QueryUsers => Self::QueryUsers(QueryUsers::decode(&payload[..])?),
            MessageKind::CryptSetup => Self::CryptSetup(CryptSetup::decode(&payload[..])?),
            MessageKind::ContextActionModify => {
                Self::ContextActionModify(ContextActionModify::decode(&payload[..])?)
            }
            MessageKind::ContextAction => {
                Self::ContextAction(ContextAction::decode(&payload[..])?)
            }
            MessageKind::UserList => Self::UserList(UserList::decode(&payload[..])?),
            MessageKind::VoiceTarget => Self::VoiceTarget(VoiceTarget::decode(&payload[..])?),
            MessageKind::PermissionQuery => {
                Self::PermissionQuery(PermissionQuery::decode(&payload[..])?)
            }
            MessageKind::CodecVersion => Self::CodecVersion(CodecVersion::decode(&payload[..])?),
            MessageKind::UserStats => Self::UserStats(UserStats::decode(&payload[..])?),
            MessageKind::RequestBlob => Self::RequestBlob(RequestBlob::decode(&payload[..])?),
            MessageKind::ServerConfig => Self::ServerConfig(ServerConfig::decode(&payload[..])?),
        };
        Ok(Some(msg))
    }

    /// Serialize into a ready-to-send frame (header included).
    pub fn encode_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        use ControlMessage::*;
        let payload = match self {
            Version(m) => m.encode_to_vec(),
            UdpTunnel(raw) => raw.to_vec(),
            Authenticate(m) => m.encode_to_vec(),
            Ping(m) => m.encode_to_vec(),
            Reject(m) => m.encode_to_vec(),
            ServerSync(m) => m.encode_to_vec(),
            ChannelRemove(m) => m.encode_to_vec(),
            ChannelState(m) => m.encode_to_vec(),
            UserRemove(m) => m.encode_to_vec(),
            UserState(m) => m.encode_to_vec(),
            BanList(m) => m.encode_to_vec(),
            TextMessage(m) => m.encode_to_vec(),
            PermissionDenied(m) => m.encode_to_vec(),
            Acl(m) => m.encode_to_vec(),
            QueryUsers(m) => m.encode_to_vec(),
            CryptSetup(m) => m.encode_to_vec(),
            ContextActionModify(m) => m.encode_to_vec(),
            ContextAction(m) => m.encode_to_vec(),
            UserList(m) => m.encode_to_vec(),
            VoiceTarget(m) => m.encode_to_vec(),
            PermissionQuery(m) => m.encode_to_vec(),
            CodecVersion(m) => m.encode_to_vec(),
            UserStats(m) => m.encode_to_vec(),
            RequestBlob(m) => m.encode_to_vec(),
            ServerConfig(m) => m.encode_to_vec(),
        };
        encode_frame(self.kind(), &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::try_decode_frame;
    use bytes::BytesMut;

    #[test]
    fn authenticate_roundtrip() {
        let msg = ControlMessage::Authenticate(Authenticate {
            username: Some("alice".into()),
            password: None,
            tokens: vec!["secret".into()],
            celt_versions: vec![0x8000_000b_u32 as i32],
            opus: Some(true),
        });
        let frame = msg.encode_frame().unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let (kind, payload) = try_decode_frame(&mut buf).unwrap().unwrap();
        let decoded = ControlMessage::decode(kind, payload).unwrap().unwrap();
        match decoded {
            ControlMessage::Authenticate(a) => {
                assert_eq!(a.username.as_deref(), Some("alice"));
                assert_eq!(a.tokens, vec!["secret".to_string()]);
                assert_eq!(a.opus, Some(true));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn user_state_absent_fields_stay_absent() {
        let msg = UserState {
            session: Some(42),
            channel_id: Some(7),
            ..Default::default()
        };
        let bytes = msg.encode_to_vec();
        let decoded = UserState::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.session, Some(42));
        assert_eq!(decoded.channel_id, Some(7));
        assert_eq!(decoded.name, None);
        assert_eq!(decoded.self_mute, None);
        assert_eq!(decoded.texture_hash, None);
    }

    #[test]
    fn crypt_setup_partial() {
        let msg = CryptSetup {
            key: None,
            client_nonce: Some(vec![1u8; 16]),
            server_nonce: None,
        };
        let decoded = CryptSetup::decode(&msg.encode_to_vec()[..]).unwrap();
        assert!(decoded.key.is_none());
        assert_eq!(decoded.client_nonce.as_deref(), Some(&[1u8; 16][..]));
    }

    #[test]
    fn udp_tunnel_payload_is_opaque() {
        let raw = Bytes::from_static(&[0x80, 0x01, 0x02, 0x03]);
        let msg = ControlMessage::UdpTunnel(raw.clone());
        let frame = msg.encode_frame().unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let (kind, payload) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, MessageKind::UdpTunnel as u16);
        assert_eq!(payload, raw);
    }

    #[test]
    fn unknown_kind_decodes_to_none() {
        let decoded = ControlMessage::decode(0x0FFF, Bytes::from_static(b"x")).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn reject_kind_enum_values() {
        let msg = Reject {
            kind: Some(RejectKind::ServerFull as i32),
            reason: Some("full".into()),
        };
        let decoded = Reject::decode(&msg.encode_to_vec()[..]).unwrap();
        assert_eq!(decoded.kind(), RejectKind::ServerFull);
    }

    #[test]
    fn codec_version_required_fields() {
        let msg = CodecVersion {
            alpha: -2147483637,
            beta: 0,
            prefer_alpha: true,
            opus: Some(true),
        };
        let decoded = CodecVersion::decode(&msg.encode_to_vec()[..]).unwrap();
        assert_eq!(decoded.alpha, -2147483637);
        assert!(decoded.prefer_alpha);
    }
}
