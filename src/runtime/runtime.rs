use std::collections::VecDeque;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::runtime::fault::Fault;
use crate::shared::channel::{FrameReader, FrameWriter};
use crate::shared::handshake::{ComponentContext, Handshake, HandshakeReply};
use crate::shared::panic::init_panic_hook;
use crate::shared::server::ServerConfig;
use crate::shared::types::{ComponentCommand, LogLevel, Tuple, TupleId, TupleRef};

/// Options of a single `emit`.
///
/// ```
/// use multilang::runtime::Emission;
/// use serde_json::json;
///
/// let emission = Emission::new(vec![json!("word"), json!(3)])
///     .with_stream("counts")
///     .with_need_task_ids(true);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Emission {
    values: Vec<Value>,
    id: Option<TupleId>,
    stream: Option<String>,
    anchors: Option<Vec<TupleId>>,
    direct_task: Option<i64>,
    need_task_ids: bool,
}

impl Emission {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            ..Default::default()
        }
    }

    /// Id of the emitted tuple. Spouts set it to get `ack`/`fail` callbacks for it.
    pub fn with_id(mut self, id: impl Into<TupleId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Explicit anchors, overriding automatic anchoring. Tuples without an id
    /// are skipped; an empty list explicitly emits unanchored.
    pub fn with_anchors<I, T>(mut self, anchors: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TupleRef>,
    {
        self.anchors = Some(
            anchors
                .into_iter()
                .filter_map(|anchor| anchor.into().0)
                .collect(),
        );
        self
    }

    /// Emit directly to the given task instead of through the stream groupings.
    pub fn with_direct_task(mut self, task: i64) -> Self {
        self.direct_task = Some(task);
        self
    }

    /// Whether `emit` should return the ids of the tasks that received the tuple.
    pub fn with_need_task_ids(mut self, need_task_ids: bool) -> Self {
        self.need_task_ids = need_task_ids;
        self
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// The protocol runtime of one component.
///
/// It owns the channel to the host: every emit, ack, fail and log goes through
/// it, and it hands the component the commands and tuples the host sends.
pub struct Runtime {
    incoming: mpsc::Receiver<Result<Value>>,
    writer: FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    pending_commands: VecDeque<Map<String, Value>>,
    pending_task_ids: VecDeque<Vec<i64>>,
    current_tuples: Vec<Tuple>,
    auto_anchor: bool,
    context: Option<ComponentContext>,
    _reader_guard: DropGuard,
}

impl Runtime {
    /// Creates the runtime and starts the task reading from `input`.
    pub(crate) fn new<R, W>(input: R, output: W, config: &ServerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(config.channel_size());
        let cln_token = CancellationToken::new();
        tokio::spawn(read_messages(
            FrameReader::new(BufReader::new(input), config.frame_config()),
            tx,
            cln_token.clone(),
        ));

        Self {
            incoming: rx,
            writer: FrameWriter::new(Box::new(output)),
            pending_commands: VecDeque::new(),
            pending_task_ids: VecDeque::new(),
            current_tuples: Vec::new(),
            auto_anchor: true,
            context: None,
            _reader_guard: cln_token.drop_guard(),
        }
    }

    pub(crate) fn set_auto_anchor(&mut self, auto_anchor: bool) {
        self.auto_anchor = auto_anchor;
    }

    /// Context received during the handshake.
    pub fn context(&self) -> Option<&ComponentContext> {
        self.context.as_ref()
    }

    /// Performs the handshake. Any failure is a [`Error::MalformedHandshake`].
    pub(crate) async fn handshake(&mut self) -> Result<ComponentContext> {
        let msg = self
            .next_message()
            .await
            .map_err(|e| Error::MalformedHandshake(format!("reading handshake: {e}")))?;
        let context = Handshake::from_message(msg)?.establish().await?;
        self.send(&HandshakeReply { pid: context.pid })
            .await
            .map_err(|e| Error::MalformedHandshake(format!("replying to handshake: {e}")))?;
        self.context = Some(context.clone());
        Ok(context)
    }

    async fn next_message(&mut self) -> Result<Value> {
        self.incoming.recv().await.unwrap_or(Err(Error::ChannelClosed))
    }

    /// Reads the next command object. Task id lists arriving in the meantime
    /// are queued for [`Runtime::read_task_ids`].
    pub async fn read_command(&mut self) -> Result<Map<String, Value>> {
        if let Some(cmd) = self.pending_commands.pop_front() {
            return Ok(cmd);
        }
        loop {
            match self.next_message().await? {
                Value::Object(cmd) => return Ok(cmd),
                Value::Array(ids) => {
                    let ids = parse_task_ids(ids)?;
                    self.pending_task_ids.push_back(ids);
                }
                other => return Err(unexpected_message(&other)),
            }
        }
    }

    /// Reads the next task id list. Commands arriving in the meantime are
    /// queued for [`Runtime::read_command`].
    pub async fn read_task_ids(&mut self) -> Result<Vec<i64>> {
        if let Some(ids) = self.pending_task_ids.pop_front() {
            return Ok(ids);
        }
        loop {
            match self.next_message().await? {
                Value::Array(ids) => return parse_task_ids(ids),
                Value::Object(cmd) => self.pending_commands.push_back(cmd),
                other => return Err(unexpected_message(&other)),
            }
        }
    }

    /// Reads the next command and decodes it as a tuple.
    pub async fn read_tuple(&mut self) -> Result<Tuple> {
        let cmd = self.read_command().await?;
        serde_json::from_value(Value::Object(cmd))
            .map_err(|e| Error::MalformedMessage(format!("expected a tuple: {e}")))
    }

    async fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        self.writer.write_message(msg).await
    }

    /// Emits a tuple. Returns the ids of the receiving tasks when the
    /// emission asked for them, waiting for the host's reply if needed.
    pub async fn emit(&mut self, emission: Emission) -> Result<Option<Vec<i64>>> {
        let Emission {
            values,
            id,
            stream,
            anchors,
            direct_task,
            need_task_ids,
        } = emission;

        let anchors = anchors.or_else(|| self.auto_anchors());
        let command = ComponentCommand::Emit {
            tuple: values,
            id,
            stream,
            anchors,
            task: direct_task,
            // the host replies with task ids unless told otherwise
            need_task_ids: (!need_task_ids && direct_task.is_none()).then_some(false),
        };
        self.send(&command).await?;

        match (need_task_ids, direct_task) {
            (false, _) => Ok(None),
            (true, Some(task)) => Ok(Some(vec![task])),
            (true, None) => self.read_task_ids().await.map(Some),
        }
    }

    /// Emits every payload of `batch` with the options of `template`. The
    /// template's own values are ignored.
    pub async fn emit_many<I>(
        &mut self,
        batch: I,
        template: &Emission,
    ) -> Result<Vec<Option<Vec<i64>>>>
    where
        I: IntoIterator<Item = Vec<Value>> + Send,
        I::IntoIter: Send,
    {
        let mut task_ids = Vec::new();
        for values in batch {
            let emission = Emission {
                values,
                ..template.clone()
            };
            task_ids.push(self.emit(emission).await?);
        }
        Ok(task_ids)
    }

    fn auto_anchors(&self) -> Option<Vec<TupleId>> {
        if !self.auto_anchor {
            return None;
        }
        let anchors: Vec<TupleId> = self
            .current_tuples
            .iter()
            .filter_map(|tup| tup.id.clone())
            .collect();
        (!anchors.is_empty()).then_some(anchors)
    }

    pub async fn ack(&mut self, tup: impl Into<TupleRef>) -> Result<()> {
        let TupleRef(id) = tup.into();
        self.send(&ComponentCommand::Ack { id }).await
    }

    pub async fn fail(&mut self, tup: impl Into<TupleRef>) -> Result<()> {
        let TupleRef(id) = tup.into();
        self.send(&ComponentCommand::Fail { id }).await
    }

    /// Logs through the host's logging.
    pub async fn log(&mut self, msg: impl Into<String>, level: LogLevel) -> Result<()> {
        self.send(&ComponentCommand::Log {
            msg: msg.into(),
            level: level.ordinal(),
        })
        .await
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.send(&ComponentCommand::Sync).await
    }

    /// Tuples the component is currently working on, used for auto-anchoring
    /// and for fault reports.
    pub fn current_tuples(&self) -> &[Tuple] {
        &self.current_tuples
    }

    pub(crate) fn set_current(&mut self, tuples: Vec<Tuple>) {
        self.current_tuples = tuples;
    }

    pub(crate) fn clear_current(&mut self) {
        self.current_tuples.clear();
    }

    /// Reports a hook fault to the host as an `error` followed by a `sync`.
    /// Write failures are only logged, the fault itself is what matters.
    pub(crate) async fn report_fault(&mut self, fault: &Fault) {
        error!(fault = %fault, "Component hook failed");
        let msg = format!(
            "{} raised while processing tuple {}: {}\n{}",
            fault.name,
            self.describe_current(),
            fault.message,
            fault.backtrace
        );
        if let Err(e) = self.report(msg).await {
            warn!(error = %e, "Could not report fault to the host");
        }
    }

    /// Reports an error that stops the component. Handshake failures and user
    /// faults are not reported again.
    pub(crate) async fn report_fatal(&mut self, err: &Error) {
        error!(error = %err, "Component stopped");
        if err.is_user_fault() || matches!(err, Error::MalformedHandshake(_)) {
            return;
        }
        let msg = format!(
            "{} raised while processing tuple {}: {}",
            err.name(),
            self.describe_current(),
            err
        );
        match self.report(msg).await {
            Ok(()) => {}
            // the host is most likely gone already
            Err(e) if err.is_channel_fault() => {
                debug!(error = %e, "Channel fault not delivered to the host")
            }
            Err(e) => warn!(error = %e, "Could not report fault to the host"),
        }
    }

    async fn report(&mut self, msg: String) -> Result<()> {
        self.send(&ComponentCommand::Error { msg }).await?;
        self.sync().await
    }

    fn describe_current(&self) -> String {
        match self.current_tuples.as_slice() {
            [] => "None".to_string(),
            [tup] => tup.to_string(),
            tuples => {
                let described: Vec<String> = tuples.iter().map(Tuple::to_string).collect();
                format!("[{}]", described.join(", "))
            }
        }
    }
}

/// Reads frames until the input fails or the runtime goes away. The first
/// error is forwarded and ends the task.
async fn read_messages<R>(
    mut reader: FrameReader<BufReader<R>>,
    tx: mpsc::Sender<Result<Value>>,
    cln_token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = cln_token.cancelled() => break,
            msg = reader.read_message() => msg,
        };
        let failed = msg.is_err();
        if tx.send(msg).await.is_err() || failed {
            break;
        }
    }
    debug!("Stopped reading from the host");
}

fn parse_task_ids(ids: Vec<Value>) -> Result<Vec<i64>> {
    ids.into_iter()
        .map(|id| {
            id.as_i64()
                .ok_or_else(|| Error::MalformedMessage(format!("task id {id} is not an integer")))
        })
        .collect()
}

fn unexpected_message(msg: &Value) -> Error {
    Error::MalformedMessage(format!("expected an object or a list of task ids, got {msg}"))
}

/// The dispatch logic of a component role, driven by [`serve`].
#[async_trait]
pub(crate) trait Dispatch: Send {
    /// Runs the user's initialization hook.
    async fn initialize(&mut self, context: &ComponentContext, runtime: &mut Runtime) -> Result<()>;

    /// Handles one command from the host.
    async fn step(&mut self, runtime: &mut Runtime) -> Result<()>;

    /// Runs until the first error.
    async fn run(&mut self, runtime: &mut Runtime) -> Result<()> {
        loop {
            self.step(runtime).await?;
        }
    }
}

/// Handshake, initialization and the dispatch loop shared by every role.
///
/// The first error ends the component. It is reported to the host unless the
/// step that raised it already did.
pub(crate) async fn serve<D: Dispatch>(runtime: &mut Runtime, component: &mut D) -> Result<()> {
    init_panic_hook();
    let result = run_component(runtime, component).await;
    if let Err(e) = &result {
        runtime.report_fatal(e).await;
    }
    result
}

async fn run_component<D: Dispatch>(runtime: &mut Runtime, component: &mut D) -> Result<()> {
    let context = runtime.handshake().await?;
    component.initialize(&context, runtime).await?;
    info!("Component initialized, serving commands");
    component.run(runtime).await
}
