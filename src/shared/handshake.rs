//! Handshake with the host
//!
//! The first message of every session carries the component configuration,
//! the topology context and a directory in which the worker announces itself
//! by creating an empty file named after its pid. The worker answers with its
//! pid and only then starts serving commands.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Error, Result};

/// The handshake request sent by the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Handshake {
    pub conf: Map<String, Value>,
    pub context: Map<String, Value>,
    #[serde(rename = "pidDir")]
    pub pid_dir: PathBuf,
}

/// The handshake reply sent back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct HandshakeReply {
    pub pid: u32,
}

impl Handshake {
    pub fn from_message(msg: Value) -> Result<Self> {
        serde_json::from_value(msg).map_err(|e| Error::MalformedHandshake(e.to_string()))
    }

    /// Writes the pid marker file and returns the context the component runs with.
    pub(crate) async fn establish(self) -> Result<ComponentContext> {
        let pid = std::process::id();
        write_pid_file(&self.pid_dir, pid).await?;

        let context = ComponentContext {
            conf: self.conf,
            context: self.context,
            pid,
        };
        info!(
            pid,
            topology = context.topology_name().unwrap_or_default(),
            component = context.component_name().unwrap_or_default(),
            task_id = ?context.task_id(),
            "Handshake complete"
        );
        Ok(context)
    }
}

async fn write_pid_file(pid_dir: &Path, pid: u32) -> Result<()> {
    let path = pid_dir.join(pid.to_string());
    tokio::fs::File::create(&path).await.map_err(|e| {
        Error::MalformedHandshake(format!("creating pid file {}: {e}", path.display()))
    })?;
    Ok(())
}

/// Configuration and topology context received during the handshake.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComponentContext {
    /// Storm configuration of the component, merged with the topology's.
    pub conf: Map<String, Value>,
    /// Topology context: task ids, component names, stream layout.
    pub context: Map<String, Value>,
    /// pid of this worker as announced to the host.
    pub pid: u32,
}

impl ComponentContext {
    pub fn topology_name(&self) -> Option<&str> {
        self.conf.get("topology.name").and_then(Value::as_str)
    }

    pub fn task_id(&self) -> Option<i64> {
        self.context.get("taskid").and_then(Value::as_i64)
    }

    /// Name of this component, looked up from the task id in the `task->component` map.
    pub fn component_name(&self) -> Option<&str> {
        let task_id = self.task_id()?;
        self.context
            .get("task->component")?
            .get(task_id.to_string())?
            .as_str()
    }
}
