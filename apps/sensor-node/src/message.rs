use crate::error::MessageError;
use crate::observation::{Observation, OBSERVATION_TYPE};
use serde_json::{json, Map, Value};

/// Everything that travels over the intercom.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Observation(Box<Observation>),
    Notification(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Alert,
    Irc,
    Sms,
    Email,
    Mastodon,
    Rss,
    Gpio,
    Service,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 8] = [
        NotificationKind::Alert,
        NotificationKind::Irc,
        NotificationKind::Sms,
        NotificationKind::Email,
        NotificationKind::Mastodon,
        NotificationKind::Rss,
        NotificationKind::Gpio,
        NotificationKind::Service,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            NotificationKind::Alert => "alert",
            NotificationKind::Irc => "irc",
            NotificationKind::Sms => "sms",
            NotificationKind::Email => "email",
            NotificationKind::Mastodon => "mastodon",
            NotificationKind::Rss => "rss",
            NotificationKind::Gpio => "gpio",
            NotificationKind::Service => "service",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, MessageError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or_else(|| MessageError::UnknownTag(tag.to_string()))
    }

    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            NotificationKind::Alert => &["dt", "level", "name", "message", "receiver"],
            NotificationKind::Irc => &["message"],
            NotificationKind::Sms => &["number", "message"],
            NotificationKind::Email => &["to", "message"],
            NotificationKind::Mastodon => &["message"],
            NotificationKind::Rss => &["message"],
            NotificationKind::Gpio => &["value"],
            NotificationKind::Service => &["action"],
        }
    }
}

/// A tagged control message, `[{"type": <tag>}, {<fields>}]` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
}

impl Notification {
    pub fn new(kind: NotificationKind, fields: Map<String, Value>) -> Result<Self, MessageError> {
        let missing: Vec<&'static str> = kind
            .required_fields()
            .iter()
            .copied()
            .filter(|field| !fields.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(MessageError::MissingFields {
                tag: kind.tag(),
                missing,
            });
        }
        Ok(Self { kind, fields })
    }

    pub fn service(action: ServiceAction) -> Self {
        let action = match action {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
        };
        let mut fields = Map::new();
        fields.insert("action".to_string(), Value::from(action));
        Self {
            kind: NotificationKind::Service,
            fields,
        }
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn service_action(&self) -> Option<ServiceAction> {
        if self.kind != NotificationKind::Service {
            return None;
        }
        match self.field_str("action")? {
            "start" => Some(ServiceAction::Start),
            "stop" => Some(ServiceAction::Stop),
            _ => None,
        }
    }
}

impl Message {
    pub fn observation(obs: Observation) -> Self {
        Message::Observation(Box::new(obs))
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Message::Observation(_) => OBSERVATION_TYPE,
            Message::Notification(n) => n.kind.tag(),
        }
    }

    pub fn to_value(&self) -> Result<Value, MessageError> {
        match self {
            Message::Observation(obs) => Ok(serde_json::to_value(obs.as_ref())?),
            Message::Notification(n) => Ok(json!([{ "type": n.kind.tag() }, n.fields])),
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        match value {
            Value::Object(ref map) => {
                match map.get("type").and_then(Value::as_str) {
                    Some(OBSERVATION_TYPE) => {}
                    _ => return Err(MessageError::InvalidEnvelope),
                }
                let obs: Observation = serde_json::from_value(value)?;
                Ok(Message::observation(obs))
            }
            Value::Array(mut items) if items.len() == 2 => {
                let fields = items.pop();
                let header = items.pop();
                let tag = header
                    .as_ref()
                    .and_then(|h| h.get("type"))
                    .and_then(Value::as_str)
                    .ok_or(MessageError::InvalidEnvelope)?;
                let kind = NotificationKind::from_tag(tag)?;
                let Some(Value::Object(fields)) = fields else {
                    return Err(MessageError::InvalidEnvelope);
                };
                Ok(Message::Notification(Notification::new(kind, fields)?))
            }
            _ => Err(MessageError::InvalidEnvelope),
        }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, MessageError> {
        Self::from_value(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_alert_envelope() {
        let raw = br#"[{"type":"alert"},{"dt":"2024-01-01T00:00:00Z","level":"warning","name":"com1","message":"timeout","receiver":"ops@example.com"}]"#;
        let msg = Message::from_slice(raw).expect("parse");
        let Message::Notification(n) = msg else {
            panic!("expected notification");
        };
        assert_eq!(n.kind, NotificationKind::Alert);
        assert_eq!(n.field_str("message"), Some("timeout"));
    }

    #[test]
    fn rejects_missing_fields() {
        let raw = br#"[{"type":"sms"},{"message":"hi"}]"#;
        match Message::from_slice(raw) {
            Err(MessageError::MissingFields { tag, missing }) => {
                assert_eq!(tag, "sms");
                assert_eq!(missing, vec!["number"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_tag_and_bad_shapes() {
        assert!(matches!(
            Message::from_slice(br#"[{"type":"pager"},{}]"#),
            Err(MessageError::UnknownTag(_))
        ));
        assert!(matches!(
            Message::from_slice(br#"[{"type":"gpio"},"on"]"#),
            Err(MessageError::InvalidEnvelope)
        ));
        assert!(matches!(
            Message::from_slice(br#"{"name":"x","type":"alert"}"#),
            Err(MessageError::InvalidEnvelope)
        ));
        assert!(Message::from_slice(b"[1,2,3]").is_err());
    }

    #[test]
    fn notification_wire_form_is_two_element_array() {
        let msg = Message::Notification(Notification::service(ServiceAction::Stop));
        let value = msg.to_value().expect("value");
        assert_eq!(value, json!([{"type": "service"}, {"action": "stop"}]));
        let parsed = Message::from_value(value).expect("parse");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn observation_envelope_round_trips() {
        let obs: Observation = serde_json::from_value(json!({
            "name": "getValues",
            "type": "observation",
            "receivers": ["preProcessor"],
            "id": Observation::new_id()
        }))
        .expect("obs");
        let msg = Message::observation(obs);
        let raw = msg.to_json().expect("json");
        assert_eq!(Message::from_slice(raw.as_bytes()).expect("parse"), msg);
    }

    #[test]
    fn service_action_only_for_service_messages() {
        let n = Notification::service(ServiceAction::Start);
        assert_eq!(n.service_action(), Some(ServiceAction::Start));
        let mut fields = Map::new();
        fields.insert("message".to_string(), Value::from("hello"));
        let irc = Notification::new(NotificationKind::Irc, fields).expect("irc");
        assert_eq!(irc.service_action(), None);
    }
}
