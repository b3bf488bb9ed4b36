pub mod codec;
pub mod paths;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Unique identifier for a kernel.
pub type KernelId = String;

/// Unique identifier for an attached client channel.
pub type ClientId = String;

/// Unique identifier for a session.
pub type SessionId = String;

/// Wire sub-protocol version, fixed for every channel.
pub const WIRE_SUBPROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// Message protocol version stamped into headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Message type that carries interactive stdin responses. Frames of this
/// type bypass the per-kernel exclusive processing path.
pub const INPUT_REPLY_MSG_TYPE: &str = "input_reply";

/// Upper bound for one JSON line on the control surface.
pub const MAX_JSON_LINE_BYTES: usize = 1024 * 1024;

/// Semantic routing class of a wire message. `iopub` is broadcast to every
/// attached client, all other channels are unicast.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Shell,
    Control,
    Iopub,
    Stdin,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "shell" => Some(Channel::Shell),
            "control" => Some(Channel::Control),
            "iopub" => Some(Channel::Iopub),
            "stdin" => Some(Channel::Stdin),
            _ => None,
        }
    }
}

/// Kernel lifecycle status.
///
/// `unknown -> starting -> idle <-> busy -> {restarting -> starting, dead}`;
/// `autorestarting` is the unplanned-recovery variant of `restarting`.
/// `dead` is terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Restarting,
    Autorestarting,
    Dead,
}

impl KernelStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, KernelStatus::Dead)
    }
}

/// Header common to every wire message. `session` names the originating
/// client channel, not the session record of the session broker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

impl MessageHeader {
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        let date = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            session: session.into(),
            username: String::new(),
            date,
            msg_type: msg_type.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A structured kernel-protocol message: the envelope carried on the wire.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireMessage {
    pub channel: Channel,
    pub header: MessageHeader,
    #[serde(default = "empty_object")]
    pub parent_header: serde_json::Value,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    #[serde(default = "empty_object")]
    pub content: serde_json::Value,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "base64_buffers"
    )]
    pub buffers: Vec<Vec<u8>>,
}

impl WireMessage {
    /// Build a request-style message with an empty parent header.
    pub fn request(
        channel: Channel,
        msg_type: impl Into<String>,
        session: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            channel,
            header: MessageHeader::new(msg_type, session),
            parent_header: empty_object(),
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
        }
    }

    /// Build a reply addressed back to the client that sent `parent`.
    pub fn reply(
        parent: &WireMessage,
        channel: Channel,
        msg_type: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            channel,
            header: MessageHeader::new(msg_type, parent.header.session.clone()),
            parent_header: serde_json::to_value(&parent.header).unwrap_or_else(|_| empty_object()),
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
        }
    }

    /// Whether this message must bypass exclusive processing.
    pub fn is_input_reply(&self) -> bool {
        self.header.msg_type == INPUT_REPLY_MSG_TYPE
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A transport-level frame as delivered on a client channel. Textual and
/// binary transports are handled uniformly: text frames are UTF-8-encoded
/// and decoded through the same binary layout.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Lightweight kernel model returned by list/find operations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KernelModel {
    pub id: KernelId,
    pub name: String,
}

/// A session record: a named binding between a document path and a kernel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionModel {
    pub id: SessionId,
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub kernel: Option<KernelModel>,
}

/// Partial kernel reference used by session start/patch requests.
/// An `id` takes precedence over a `name`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KernelRef {
    #[serde(default)]
    pub id: Option<KernelId>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Error codes for structured error handling across the control surface.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    KernelNotFound,
    SessionNotFound,
    UnregisteredKernelType,
    KernelDead,
    InvalidRequest,
    ServerError,
}

/// Control-surface requests. GET/POST/DELETE over the kernel and session
/// collections map 1:1 onto these operations.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    KernelList,
    KernelStart {
        #[serde(default)]
        id: Option<KernelId>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        location: Option<String>,
    },
    KernelGet {
        kernel_id: KernelId,
    },
    KernelRestart {
        kernel_id: KernelId,
    },
    KernelShutdown {
        kernel_id: KernelId,
    },
    SessionList,
    SessionGet {
        session_id: SessionId,
    },
    SessionStart {
        path: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        kernel: Option<KernelRef>,
    },
    SessionPatch {
        session_id: SessionId,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        kernel: Option<KernelRef>,
    },
    SessionShutdown {
        session_id: SessionId,
    },
}

/// Control-surface responses. Success bodies carry the JSON-encoded record;
/// shutdown responses carry no body.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl ApiResponse {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        ApiResponse::Ok { data }
    }

    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        ApiResponse::Error {
            message: message.into(),
            code,
        }
    }
}

/// Base64 encoding for binary buffers in JSON.
mod base64_buffers {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(buffers: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(buffers.len()))?;
        for buf in buffers {
            seq.serialize_element(&STANDARD.encode(buf))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(d)?;
        encoded
            .into_iter()
            .map(|b| STANDARD.decode(b).map_err(serde::de::Error::custom))
            .collect()
    }
}
