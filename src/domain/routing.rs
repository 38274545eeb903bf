//! 路由键定义 / Routing key definitions
//!
//! 路由键标识一个可投递的端点：用户在线通道、用户在某个单聊会话、用户在某个群聊会话。
//! A routing key identifies one addressable endpoint: a user's presence channel,
//! a user's session on one direct chat, or a user's session on one group chat.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

const USER_PREFIX: &str = "user:";
const SCOPE_SEPARATOR: &str = "::";

/// 路由作用域 / Routing scope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Presence,
    DmSession,
    GroupSession,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Presence, Scope::DmSession, Scope::GroupSession];

    /// 作用域标签 / Scope tag
    pub fn tag(&self) -> &'static str {
        match self {
            Scope::Presence => "presence",
            Scope::DmSession => "dm",
            Scope::GroupSession => "group",
        }
    }

    /// 离线兜底表名 / Offline fallback table name
    pub fn pending_table(&self) -> &'static str {
        match self {
            Scope::Presence => "pending_presence_events",
            Scope::DmSession => "pending_dm_events",
            Scope::GroupSession => "pending_group_events",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// 路由键 / Routing key
///
/// 字符串形式 / String forms:
/// - `user:<userId>`
/// - `user:<userId>::dm:<dmChatId>`
/// - `user:<userId>::group:<groupChatId>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoutingKey {
    Presence { user_id: String },
    Dm { user_id: String, chat_id: String },
    Group { user_id: String, chat_id: String },
}

impl RoutingKey {
    pub fn presence(user_id: impl Into<String>) -> Self {
        RoutingKey::Presence { user_id: user_id.into() }
    }

    pub fn dm(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        RoutingKey::Dm { user_id: user_id.into(), chat_id: chat_id.into() }
    }

    pub fn group(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        RoutingKey::Group { user_id: user_id.into(), chat_id: chat_id.into() }
    }

    pub fn scope(&self) -> Scope {
        match self {
            RoutingKey::Presence { .. } => Scope::Presence,
            RoutingKey::Dm { .. } => Scope::DmSession,
            RoutingKey::Group { .. } => Scope::GroupSession,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            RoutingKey::Presence { user_id }
            | RoutingKey::Dm { user_id, .. }
            | RoutingKey::Group { user_id, .. } => user_id,
        }
    }

    /// 会话ID（在线通道没有）/ Chat id (absent for presence keys)
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            RoutingKey::Presence { .. } => None,
            RoutingKey::Dm { chat_id, .. } | RoutingKey::Group { chat_id, .. } => Some(chat_id),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingKey::Presence { user_id } => write!(f, "{}{}", USER_PREFIX, user_id),
            RoutingKey::Dm { user_id, chat_id } => {
                write!(f, "{}{}{}dm:{}", USER_PREFIX, user_id, SCOPE_SEPARATOR, chat_id)
            }
            RoutingKey::Group { user_id, chat_id } => {
                write!(f, "{}{}{}group:{}", USER_PREFIX, user_id, SCOPE_SEPARATOR, chat_id)
            }
        }
    }
}

impl FromStr for RoutingKey {
    type Err = DeliveryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || DeliveryError::InvalidRoutingKey(raw.to_string());
        let rest = raw.strip_prefix(USER_PREFIX).ok_or_else(invalid)?;

        let mut parts = rest.split(SCOPE_SEPARATOR);
        let user_id = parts.next().filter(|u| valid_id(u)).ok_or_else(invalid)?;
        let scoped = parts.next();
        if parts.next().is_some() {
            return Err(invalid());
        }

        match scoped {
            None => Ok(RoutingKey::presence(user_id)),
            Some(segment) => {
                let (tag, chat_id) = segment.split_once(':').ok_or_else(invalid)?;
                if !valid_id(chat_id) {
                    return Err(invalid());
                }
                match tag {
                    "dm" => Ok(RoutingKey::dm(user_id, chat_id)),
                    "group" => Ok(RoutingKey::group(user_id, chat_id)),
                    _ => Err(invalid()),
                }
            }
        }
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(':')
}

impl Serialize for RoutingKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoutingKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_wire_forms() {
        assert_eq!(RoutingKey::presence("42").to_string(), "user:42");
        assert_eq!(RoutingKey::dm("42", "7").to_string(), "user:42::dm:7");
        assert_eq!(RoutingKey::group("42", "g1").to_string(), "user:42::group:g1");
    }

    #[test]
    fn test_parse_each_shape() {
        let key: RoutingKey = "user:42::group:g1".parse().unwrap();
        assert_eq!(key.scope(), Scope::GroupSession);
        assert_eq!(key.user_id(), "42");
        assert_eq!(key.chat_id(), Some("g1"));

        let key: RoutingKey = "user:42".parse().unwrap();
        assert_eq!(key, RoutingKey::presence("42"));
        assert_eq!(key.chat_id(), None);
    }

    #[test]
    fn test_reject_malformed_keys() {
        for raw in [
            "",
            "user:",
            "42",
            "member:42",
            "user:42::dm:",
            "user:42::chat:7",
            "user:42::dm:7::group:8",
            "user:42::dm",
        ] {
            assert!(raw.parse::<RoutingKey>().is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_scopes_never_collide() {
        let dm = RoutingKey::dm("1", "9");
        let group = RoutingKey::group("1", "9");
        assert_ne!(dm, group);
        assert_ne!(dm.to_string(), group.to_string());
    }
}
