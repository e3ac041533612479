//! In-process stand-in for the host, used by the component tests.

use std::path::Path;

use serde_json::{json, Value};
use tokio::io::{duplex, BufReader, DuplexStream};

use crate::error::Result;
use crate::shared::channel::{FrameConfig, FrameReader, FrameWriter};

const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) struct FakeHost {
    reader: FrameReader<BufReader<DuplexStream>>,
    writer: FrameWriter<DuplexStream>,
}

/// Input and output a component under test should be started with.
pub(crate) struct ComponentPipes {
    pub input: DuplexStream,
    pub output: DuplexStream,
}

impl FakeHost {
    pub(crate) fn new() -> (Self, ComponentPipes) {
        let (host_tx, component_rx) = duplex(PIPE_CAPACITY);
        let (component_tx, host_rx) = duplex(PIPE_CAPACITY);
        let host = Self {
            reader: FrameReader::new(BufReader::new(host_rx), FrameConfig::default()),
            writer: FrameWriter::new(host_tx),
        };
        let pipes = ComponentPipes {
            input: component_rx,
            output: component_tx,
        };
        (host, pipes)
    }

    pub(crate) async fn send(&mut self, msg: Value) {
        self.writer.write_message(&msg).await.unwrap();
    }

    pub(crate) async fn recv(&mut self) -> Result<Value> {
        self.reader.read_message().await
    }

    /// Next message, which must be a command of the given name.
    pub(crate) async fn expect(&mut self, command: &str) -> Value {
        let msg = self.recv().await.unwrap();
        assert_eq!(msg["command"], command, "unexpected message {msg}");
        msg
    }

    /// Performs the handshake and returns the reply.
    pub(crate) async fn handshake(&mut self, pid_dir: &Path) -> Value {
        self.send(json!({
            "conf": {"topology.name": "test-topology"},
            "context": {"taskid": 3, "task->component": {"3": "test-component"}},
            "pidDir": pid_dir,
        }))
        .await;
        self.recv().await.unwrap()
    }

    pub(crate) async fn send_tuple(&mut self, id: Value, values: Value) {
        self.send(json!({"id": id, "comp": "upstream", "stream": "default", "task": 0, "tuple": values}))
            .await;
    }

    pub(crate) async fn send_tick(&mut self) {
        self.send(json!({"id": null, "comp": "__system", "stream": "__tick", "task": -1, "tuple": [50]}))
            .await;
    }

    pub(crate) async fn send_heartbeat(&mut self) {
        self.send(json!({"id": null, "comp": "__system", "stream": "__heartbeat", "task": -1, "tuple": []}))
            .await;
    }
}
