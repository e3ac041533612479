//! Types and constants used across the multilang binding
//!
//! This module contains the tuple model, the command shapes exchanged with the
//! host, and the reserved names of the host's pseudo-components.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Component name the host uses for system generated tuples.
pub const SYSTEM_COMPONENT: &str = "__system";

/// Stream of the heartbeat tuples sent to bolts.
pub const HEARTBEAT_STREAM: &str = "__heartbeat";

/// Stream of the periodic tick tuples.
pub const TICK_STREAM: &str = "__tick";

/// Identifier of a tuple. The host treats it as opaque JSON and hands it back
/// verbatim on `ack`/`fail`, so it is kept as a [`Value`].
pub type TupleId = Value;

/// Storm's primitive data type passed around via streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    /// ID of the tuple, `None` for unreliable emits and system tuples.
    #[serde(default)]
    pub id: Option<TupleId>,
    /// Component the tuple was generated from.
    #[serde(rename = "comp")]
    pub component: String,
    /// Stream the tuple was emitted into.
    pub stream: String,
    /// Task the tuple was generated from.
    pub task: i64,
    /// The payload of the tuple.
    #[serde(rename = "tuple")]
    pub values: Vec<Value>,
}

impl Tuple {
    pub fn new(
        id: Option<TupleId>,
        component: impl Into<String>,
        stream: impl Into<String>,
        task: i64,
        values: Vec<Value>,
    ) -> Self {
        Self {
            id,
            component: component.into(),
            stream: stream.into(),
            task,
            values,
        }
    }

    /// Heartbeats only ask the worker to prove it is alive, they never reach user code.
    pub fn is_heartbeat(&self) -> bool {
        self.component == SYSTEM_COMPONENT && self.stream == HEARTBEAT_STREAM
    }

    pub fn is_tick(&self) -> bool {
        self.component == SYSTEM_COMPONENT && self.stream == TICK_STREAM
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.as_ref().unwrap_or(&Value::Null);
        write!(
            f,
            "Tuple(id={}, component={:?}, stream={:?}, task={}, values={})",
            id,
            self.component,
            self.stream,
            self.task,
            Value::Array(self.values.clone())
        )
    }
}

/// Target of an `ack`/`fail`: either a whole [`Tuple`] or just its id.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleRef(pub(crate) Option<TupleId>);

impl From<&Tuple> for TupleRef {
    fn from(tup: &Tuple) -> Self {
        TupleRef(tup.id.clone())
    }
}

impl From<TupleId> for TupleRef {
    fn from(id: TupleId) -> Self {
        TupleRef(Some(id))
    }
}

impl From<&TupleId> for TupleRef {
    fn from(id: &TupleId) -> Self {
        TupleRef(Some(id.clone()))
    }
}

impl From<&str> for TupleRef {
    fn from(id: &str) -> Self {
        TupleRef(Some(Value::from(id)))
    }
}

impl From<String> for TupleRef {
    fn from(id: String) -> Self {
        TupleRef(Some(Value::from(id)))
    }
}

impl From<i64> for TupleRef {
    fn from(id: i64) -> Self {
        TupleRef(Some(Value::from(id)))
    }
}

/// Severity of a `log` command. The discriminants are the host's ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    /// Maps a level name to its host ordinal. Unknown names fall back to `info`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "critical" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Commands the host sends to a spout.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Next,
    Ack(TupleId),
    Fail(TupleId),
    Activate,
    Deactivate,
    /// Anything else. It is still answered with `sync`.
    Unknown(Map<String, Value>),
}

impl HostCommand {
    pub fn from_message(msg: Map<String, Value>) -> Self {
        let id = msg.get("id").cloned();
        match (msg.get("command").and_then(Value::as_str), id) {
            (Some("next"), _) => HostCommand::Next,
            (Some("ack"), Some(id)) => HostCommand::Ack(id),
            (Some("fail"), Some(id)) => HostCommand::Fail(id),
            (Some("activate"), _) => HostCommand::Activate,
            (Some("deactivate"), _) => HostCommand::Deactivate,
            _ => HostCommand::Unknown(msg),
        }
    }
}

/// Commands a component sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub(crate) enum ComponentCommand {
    Emit {
        tuple: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<TupleId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        anchors: Option<Vec<TupleId>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        need_task_ids: Option<bool>,
    },
    Ack {
        id: Option<TupleId>,
    },
    Fail {
        id: Option<TupleId>,
    },
    Log {
        msg: String,
        level: u8,
    },
    Error {
        msg: String,
    },
    Sync,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_tuple_from_wire() {
        let msg = json!({"id": "-6955786537413359385", "comp": "1", "stream": "1",
                         "task": 9, "tuple": ["snow white and the seven dwarfs", "field2", 3]});
        let tup: Tuple = serde_json::from_value(msg).unwrap();
        assert_eq!(tup.id, Some(json!("-6955786537413359385")));
        assert_eq!(tup.component, "1");
        assert_eq!(tup.task, 9);
        assert_eq!(tup.values.len(), 3);
        assert!(!tup.is_tick());
        assert!(!tup.is_heartbeat());
    }

    #[test]
    fn test_system_tuples() {
        let tick: Tuple = serde_json::from_value(json!({"id": null, "task": -1,
            "comp": "__system", "stream": "__tick", "tuple": [50]}))
        .unwrap();
        assert_eq!(tick.id, None);
        assert!(tick.is_tick());

        let heartbeat: Tuple = serde_json::from_value(json!({"id": null, "task": -1,
            "comp": "__system", "stream": "__heartbeat", "tuple": []}))
        .unwrap();
        assert!(heartbeat.is_heartbeat());
        assert!(!heartbeat.is_tick());
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(LogLevel::from_name("trace").ordinal(), 0);
        assert_eq!(LogLevel::from_name("WARNING").ordinal(), 3);
        assert_eq!(LogLevel::from_name("critical").ordinal(), 4);
        assert_eq!(LogLevel::from_name("chatty"), LogLevel::Info);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_host_command_parsing() {
        let cmd = |v: Value| HostCommand::from_message(v.as_object().unwrap().clone());
        assert_eq!(cmd(json!({"command": "next"})), HostCommand::Next);
        assert_eq!(cmd(json!({"command": "ack", "id": 1234})), HostCommand::Ack(json!(1234)));
        assert_eq!(cmd(json!({"command": "fail", "id": "x"})), HostCommand::Fail(json!("x")));
        assert!(matches!(cmd(json!({"command": "ack"})), HostCommand::Unknown(_)));
        assert!(matches!(cmd(json!({"command": "dance"})), HostCommand::Unknown(_)));
    }

    #[test]
    fn test_emit_omits_absent_fields() {
        let emit = ComponentCommand::Emit {
            tuple: vec![json!(1), json!(2)],
            id: None,
            stream: None,
            anchors: Some(vec![json!("42")]),
            task: None,
            need_task_ids: None,
        };
        assert_eq!(
            serde_json::to_value(&emit).unwrap(),
            json!({"command": "emit", "tuple": [1, 2], "anchors": ["42"]})
        );
        assert_eq!(serde_json::to_value(ComponentCommand::Sync).unwrap(), json!({"command": "sync"}));
    }
}
