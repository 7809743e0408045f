//! Access-control data cached per channel, and the typed shape of
//! PermissionDenied messages.

use murmel_proto::control::{self, DenyKind};

/// A named group inside a channel's ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGroup {
    pub name: String,
    pub inherited: bool,
    pub inherit: bool,
    pub inheritable: bool,
    pub add: Vec<u32>,
    pub remove: Vec<u32>,
    pub members: Vec<u32>,
}

/// One ACL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub apply_here: bool,
    pub apply_subs: bool,
    pub inherited: bool,
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub grant: u32,
    pub deny: u32,
}

/// The access-control state of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelAccessControl {
    pub inherit_acls: bool,
    pub groups: Vec<AccessGroup>,
    pub entries: Vec<AccessEntry>,
}

impl From<&control::Acl> for ChannelAccessControl {
    fn from(msg: &control::Acl) -> Self {
        Self {
            inherit_acls: msg.inherit_acls.unwrap_or(true),
            groups: msg
                .groups
                .iter()
                .map(|g| AccessGroup {
                    name: g.name.clone(),
                    inherited: g.inherited.unwrap_or(false),
                    inherit: g.inherit.unwrap_or(true),
                    inheritable: g.inheritable.unwrap_or(true),
                    add: g.add.clone(),
                    remove: g.remove.clone(),
                    members: g.inherited_members.clone(),
                })
                .collect(),
            entries: msg
                .acls
                .iter()
                .map(|a| AccessEntry {
                    apply_here: a.apply_here.unwrap_or(true),
                    apply_subs: a.apply_subs.unwrap_or(true),
                    inherited: a.inherited.unwrap_or(false),
                    user_id: a.user_id,
                    group: a.group.clone(),
                    grant: a.grant.unwrap_or(0),
                    deny: a.deny.unwrap_or(0),
                })
                .collect(),
        }
    }
}

/// PermissionDenied, mapped to the shapes observers care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDenial {
    /// Missing permission bits on a channel.
    Permission {
        channel_id: Option<u32>,
        session: Option<u32>,
        permission: u32,
    },
    InvalidChannelName {
        name: Option<String>,
    },
    InvalidUserName {
        name: Option<String>,
    },
    TextTooLong,
    TemporaryChannel,
    MissingCertificate {
        session: Option<u32>,
    },
    ChannelFull,
    NestingLimit,
    SuperUserModify,
    /// The server only gave a textual reason.
    Other {
        reason: Option<String>,
    },
}

impl From<&control::PermissionDenied> for PermissionDenial {
    fn from(msg: &control::PermissionDenied) -> Self {
        match msg.kind.map(|_| msg.kind()) {
            Some(DenyKind::Permission) => Self::Permission {
                channel_id: msg.channel_id,
                session: msg.session,
                permission: msg.permission.unwrap_or(0),
            },
            Some(DenyKind::ChannelName) => Self::InvalidChannelName {
                name: msg.name.clone(),
            },
            Some(DenyKind::UserName) => Self::InvalidUserName {
                name: msg.name.clone(),
            },
            Some(DenyKind::TextTooLong) => Self::TextTooLong,
            Some(DenyKind::TemporaryChannel) => Self::TemporaryChannel,
            Some(DenyKind::MissingCertificate) => Self::MissingCertificate {
                session: msg.session,
            },
            Some(DenyKind::ChannelFull) => Self::ChannelFull,
            Some(DenyKind::NestingLimit) => Self::NestingLimit,
            Some(DenyKind::SuperUser) => Self::SuperUserModify,
            Some(DenyKind::Text) | Some(DenyKind::H9K) | None => Self::Other {
                reason: msg.reason.clone(),
            },
        }
    }
}
