use serde::{Deserialize, Serialize};

use super::status::DeliveryStatus;

/// 投递事件 / Delivered event
///
/// 线上格式 / Wire shape: `{ "event": <string>, "data": <payload> }`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    pub data: serde_json::Value,
}

pub const DM_STATUS_CHANGED: &str = "dm_message_status_changed";
pub const GROUP_STATUS_CHANGED: &str = "group_message_status_changed";

impl Event {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self { event: event.into(), data }
    }

    /// 单聊消息状态变更 / DM message status changed
    pub fn dm_status_changed(message_id: &str, dm_chat_id: &str, status: DeliveryStatus) -> Self {
        Self::new(
            DM_STATUS_CHANGED,
            serde_json::json!({
                "messageId": message_id,
                "dmChatId": dm_chat_id,
                "newStatus": status,
            }),
        )
    }

    /// 群聊消息聚合状态变更 / Group message aggregate status changed
    pub fn group_status_changed(message_id: &str, group_id: &str, status: DeliveryStatus) -> Self {
        Self::new(
            GROUP_STATUS_CHANGED,
            serde_json::json!({
                "messageId": message_id,
                "groupId": group_id,
                "newStatus": status,
            }),
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let ev = Event::group_status_changed("m1", "g1", DeliveryStatus::Delivered);
        let v: serde_json::Value = serde_json::from_str(&ev.to_json().unwrap()).unwrap();
        assert_eq!(v["event"], "group_message_status_changed");
        assert_eq!(v["data"]["messageId"], "m1");
        assert_eq!(v["data"]["groupId"], "g1");
        assert_eq!(v["data"]["newStatus"], "delivered");
        assert_eq!(v.as_object().unwrap().len(), 2);
    }
}
