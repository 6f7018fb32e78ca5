use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::codec::CodecError;

/// A command sent to the peer.
///
/// `namespace`, `instance_id`, `name` and `args` determine what the peer does.
/// `id` only correlates the reply and is random per command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    #[serde(rename = "ns")]
    pub namespace: String,
    #[serde(rename = "nsid", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "cache", default, skip_serializing_if = "is_false")]
    pub wants_cache: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Command {
    /// Create a command with a fresh random id
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            instance_id: None,
            name: name.into(),
            args: None,
            etag: None,
            wants_cache: false,
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Same as [`Command::with_instance`] but accepts an optional id
    pub fn with_instance_opt(mut self, instance_id: Option<&str>) -> Self {
        self.instance_id = instance_id.map(str::to_string);
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    /// Property name when this is a property read (`args.prop`)
    pub fn prop_name(&self) -> Option<&str> {
        self.args.as_ref()?.get("prop")?.as_str()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace)?;
        if let Some(instance_id) = &self.instance_id {
            write!(f, "({})", instance_id)?;
        }
        write!(f, ".{}", self.name)?;
        match &self.args {
            Some(args) => write!(f, "({})", args),
            None => write!(f, "()"),
        }
    }
}

/// What an inbound response is about.
///
/// Anything other than the four reserved names is a property event id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseKind {
    Result,
    Error,
    Connect,
    Disconnect,
    Event(String),
}

impl From<String> for ResponseKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "result" => ResponseKind::Result,
            "error" => ResponseKind::Error,
            "connect" => ResponseKind::Connect,
            "disconnect" => ResponseKind::Disconnect,
            _ => ResponseKind::Event(value),
        }
    }
}

impl From<ResponseKind> for String {
    fn from(kind: ResponseKind) -> Self {
        match kind {
            ResponseKind::Result => "result".to_string(),
            ResponseKind::Error => "error".to_string(),
            ResponseKind::Connect => "connect".to_string(),
            ResponseKind::Disconnect => "disconnect".to_string(),
            ResponseKind::Event(id) => id,
        }
    }
}

/// A message received from the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Command id for `result`/`error`; absent or null for pushed events
    #[serde(rename = "uuid", default)]
    pub id: Option<String>,
    #[serde(rename = "event")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn result(id: Uuid, data: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: ResponseKind::Result,
            data,
        }
    }

    pub fn error(id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: ResponseKind::Error,
            data: Value::String(message.into()),
        }
    }

    /// A pushed event (connect, disconnect or property change)
    pub fn event(kind: ResponseKind, data: Value) -> Self {
        Self {
            id: None,
            kind,
            data,
        }
    }

    /// Command id as a UUID, if present and well formed
    pub fn command_id(&self) -> Option<Uuid> {
        self.id.as_deref().and_then(|id| Uuid::parse_str(id).ok())
    }
}

/// Reply shape for commands sent with `cache: true`
#[derive(Debug, Clone, PartialEq)]
pub enum CacheResponse {
    /// The peer's value matches the etag we sent; use the local copy
    UseCached,
    /// New data, cacheable only when an etag came with it
    Fresh { data: Value, etag: Option<String> },
}

#[derive(Deserialize)]
struct FreshPayload {
    data: Value,
    #[serde(default)]
    etag: Option<String>,
}

impl CacheResponse {
    pub const CACHED_MARKER: &'static str = "__cached";

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        if value.get(Self::CACHED_MARKER).and_then(Value::as_bool) == Some(true) {
            return Ok(CacheResponse::UseCached);
        }

        let fresh: FreshPayload = serde_json::from_value(value)?;
        Ok(CacheResponse::Fresh {
            data: fresh.data,
            etag: fresh.etag,
        })
    }
}
