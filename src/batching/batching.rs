use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batching::batches::Batches;
use crate::error::{HookError, HookResult, Result};
use crate::runtime::{self, guard, guard_sync, Dispatch, Fault, Runtime};
use crate::shared::server::{stdio_transport, ServerConfig};
use crate::shared::traits::ServiceError;
use crate::shared::{ComponentContext, Tuple};

/// Default interval of [`BatchTrigger::timer_default`].
pub const DEFAULT_SECS_BETWEEN_BATCHES: u64 = 2;

/// When the pending batches are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    /// Every time more than this many ticks arrived since the last flush.
    /// Requires the topology to send ticks to the component.
    Ticks(u32),
    /// On an internal timer, independent of ticks.
    Timer(Duration),
}

impl BatchTrigger {
    pub fn timer_default() -> Self {
        BatchTrigger::Timer(Duration::from_secs(DEFAULT_SECS_BETWEEN_BATCHES))
    }
}

impl Default for BatchTrigger {
    fn default() -> Self {
        BatchTrigger::Ticks(1)
    }
}

/// BatchingBolt trait for processing tuples in groups.
///
/// Incoming tuples are grouped by [`BatchingBolt::group_key`] and handed to
/// [`BatchingBolt::process_batch`] one group at a time when the batch trigger
/// fires. With the default settings emits are anchored to the whole group and
/// every tuple of the group is acked after the group was processed. If
/// processing fails, every pending tuple is failed, not only the current group.
#[async_trait]
pub trait BatchingBolt: Send {
    /// Key tuples are grouped by.
    type Key: Hash + Eq + Clone + Debug + Default + Send + Sync;

    /// Called once after the handshake, before the first tuple.
    async fn initialize(&mut self, _context: &ComponentContext, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }

    /// Group of a tuple. All tuples share the default key unless overridden.
    fn group_key(&self, _tup: &Tuple) -> std::result::Result<Self::Key, HookError> {
        Ok(Self::Key::default())
    }

    /// Processes every tuple collected for `key` since the last flush.
    ///
    /// # Example
    ///
    /// Counting words per batch.
    ///
    /// ```no_run
    /// use multilang::batching::{self, BatchTrigger, BatchingBolt};
    /// use multilang::error::{HookError, HookResult};
    /// use multilang::runtime::{Emission, Runtime};
    /// use multilang::shared::Tuple;
    /// use serde_json::json;
    ///
    /// struct WordCounter;
    ///
    /// #[async_trait::async_trait]
    /// impl BatchingBolt for WordCounter {
    ///     type Key = String;
    ///
    ///     fn group_key(&self, tup: &Tuple) -> Result<String, HookError> {
    ///         Ok(tup.values[0].as_str().unwrap_or_default().to_string())
    ///     }
    ///
    ///     async fn process_batch(&mut self, key: &String, tuples: &[Tuple], runtime: &mut Runtime) -> HookResult {
    ///         runtime.emit(Emission::new(vec![json!(key), json!(tuples.len())])).await?;
    ///         Ok(())
    ///     }
    /// }
    ///
    /// #[tokio::main]
    /// async fn main() -> multilang::error::Result<()> {
    ///     batching::Server::new(WordCounter)
    ///         .with_trigger(BatchTrigger::timer_default())
    ///         .start()
    ///         .await
    /// }
    /// ```
    async fn process_batch(
        &mut self,
        key: &Self::Key,
        tuples: &[Tuple],
        runtime: &mut Runtime,
    ) -> HookResult;

    /// Handles a tick tuple.
    async fn process_tick(&mut self, _tick: &Tuple, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }
}

struct BatchingService<T: BatchingBolt> {
    handler: T,
    trigger: BatchTrigger,
    auto_ack: bool,
    auto_fail: bool,
    batches: Batches<T::Key>,
    ticks: u32,
}

impl<T> BatchingService<T>
where
    T: BatchingBolt,
{
    async fn handle_tuple(&mut self, tup: Tuple, runtime: &mut Runtime) -> Result<()> {
        if tup.is_heartbeat() {
            debug!("Heartbeat");
            return runtime.sync().await;
        }
        if tup.is_tick() {
            return self.handle_tick(tup, runtime).await;
        }

        match guard_sync(|| self.handler.group_key(&tup)) {
            Ok(key) => {
                self.batches.push(key, tup);
                Ok(())
            }
            Err(fault) => {
                runtime.set_current(vec![tup.clone()]);
                Err(self.abort(fault, vec![tup], None, runtime).await)
            }
        }
    }

    async fn handle_tick(&mut self, tick: Tuple, runtime: &mut Runtime) -> Result<()> {
        let counted = matches!(self.trigger, BatchTrigger::Ticks(_));
        if counted {
            runtime.ack(&tick).await?;
        }

        runtime.set_current(vec![tick.clone()]);
        if let Err(fault) = guard(self.handler.process_tick(&tick, runtime)).await {
            return Err(self.abort(fault, Vec::new(), Some(tick), runtime).await);
        }
        runtime.clear_current();

        match self.trigger {
            BatchTrigger::Ticks(between_batches) => {
                self.ticks += 1;
                if self.ticks > between_batches && !self.batches.is_empty() {
                    self.ticks = 0;
                    self.process_batches(runtime, Some(tick)).await?;
                }
            }
            BatchTrigger::Timer(_) => {
                if self.auto_ack {
                    runtime.ack(&tick).await?;
                }
            }
        }
        Ok(())
    }

    /// Processes every pending batch, oldest key first. Each batch is removed
    /// before it is processed.
    async fn process_batches(&mut self, runtime: &mut Runtime, tick: Option<Tuple>) -> Result<()> {
        debug!(batches = self.batches.len(), "Processing batches");
        while let Some((key, tuples)) = self.batches.pop_front() {
            runtime.set_current(tuples.clone());
            let outcome = guard(self.handler.process_batch(&key, &tuples, runtime)).await;
            if let Err(fault) = outcome {
                return Err(self.abort(fault, tuples, tick, runtime).await);
            }
            runtime.clear_current();

            if self.auto_ack {
                for tup in &tuples {
                    runtime.ack(tup).await?;
                }
            }
        }
        Ok(())
    }

    /// Reports a hook fault and, with auto-fail, fails the in-flight tuples,
    /// every pending batch and the tick being handled, in that order. Returns
    /// the error ending the component.
    async fn abort(
        &mut self,
        fault: Fault,
        in_flight: Vec<Tuple>,
        tick: Option<Tuple>,
        runtime: &mut Runtime,
    ) -> crate::error::Error {
        runtime.report_fault(&fault).await;
        runtime.clear_current();

        if self.auto_fail {
            let pending = self.batches.drain_tuples();
            for tup in in_flight.iter().chain(pending.iter()).chain(tick.iter()) {
                if let Err(e) = runtime.fail(tup).await {
                    return e;
                }
            }
        }
        Self::user_error(fault.to_string())
    }

    async fn run_timed(&mut self, period: Duration, runtime: &mut Runtime) -> Result<()> {
        let (flush_tx, mut flush_rx) = mpsc::channel(1);
        let cln_token = CancellationToken::new();
        let mut timer = Some(tokio::spawn(run_timer(period, flush_tx, cln_token.clone())));
        // stops the timer whichever way the loop ends
        let _drop_guard = cln_token.drop_guard();

        loop {
            tokio::select! {
                biased;
                Some(()) = flush_rx.recv() => {
                    self.process_batches(runtime, None).await?;
                }
                tup = runtime.read_tuple() => {
                    self.handle_tuple(tup?, runtime).await?;
                }
                stopped = finished(&mut timer) => {
                    return Err(Self::internal_error(format!(
                        "batch timer stopped unexpectedly: {stopped:?}"
                    )));
                }
            }
        }
    }
}

/// Requests a flush every `period`. Requests coalesce while the component is busy.
async fn run_timer(period: Duration, flush_tx: mpsc::Sender<()>, cln_token: CancellationToken) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cln_token.cancelled() => return,
            _ = interval.tick() => {
                match flush_tx.try_send(()) {
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Closed(())) => {
                        warn!("Batch flush requests are no longer received");
                        return;
                    }
                }
            }
        }
    }
}

/// Waits for the timer task to end, forever if there is none.
async fn finished(timer: &mut Option<JoinHandle<()>>) -> std::result::Result<(), JoinError> {
    match timer {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<T> Dispatch for BatchingService<T>
where
    T: BatchingBolt,
{
    async fn initialize(&mut self, context: &ComponentContext, runtime: &mut Runtime) -> Result<()> {
        if let Err(fault) = guard(self.handler.initialize(context, runtime)).await {
            runtime.report_fault(&fault).await;
            return Err(Self::user_error(fault.to_string()));
        }
        Ok(())
    }

    async fn step(&mut self, runtime: &mut Runtime) -> Result<()> {
        let tup = runtime.read_tuple().await?;
        self.handle_tuple(tup, runtime).await
    }

    async fn run(&mut self, runtime: &mut Runtime) -> Result<()> {
        match self.trigger {
            BatchTrigger::Ticks(between_batches) => {
                info!(between_batches, "Processing batches on ticks");
                loop {
                    self.step(runtime).await?;
                }
            }
            BatchTrigger::Timer(period) => {
                info!(?period, "Processing batches on a timer");
                self.run_timed(period, runtime).await
            }
        }
    }
}

impl<T: BatchingBolt> ServiceError for BatchingService<T> {
    fn service_name() -> &'static str {
        "batchingbolt"
    }
}

/// Batching bolt server serving the multilang protocol.
#[derive(Debug)]
pub struct Server<T> {
    config: ServerConfig,
    trigger: BatchTrigger,
    auto_ack: bool,
    auto_anchor: bool,
    auto_fail: bool,
    handler: T,
}

impl<T> Server<T> {
    pub fn new(batching_bolt: T) -> Self {
        Self {
            config: ServerConfig::default(),
            trigger: BatchTrigger::default(),
            auto_ack: true,
            auto_anchor: true,
            auto_fail: true,
            handler: batching_bolt,
        }
    }

    /// Set when batches are processed. Default value is `BatchTrigger::Ticks(1)`.
    pub fn with_trigger(mut self, trigger: BatchTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn trigger(&self) -> BatchTrigger {
        self.trigger
    }

    /// Ack every tuple of a batch once it was processed. Default value is `true`.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Anchor emits to the batch being processed unless anchors are given
    /// explicitly. Default value is `true`.
    pub fn with_auto_anchor(mut self, auto_anchor: bool) -> Self {
        self.auto_anchor = auto_anchor;
        self
    }

    pub fn auto_anchor(&self) -> bool {
        self.auto_anchor
    }

    /// Fail every pending tuple when processing fails. Default value is `true`.
    pub fn with_auto_fail(mut self, auto_fail: bool) -> Self {
        self.auto_fail = auto_fail;
        self
    }

    pub fn auto_fail(&self) -> bool {
        self.auto_fail
    }

    /// Set the maximum number of bytes a message from the host may span. Default value is 16MB.
    pub fn with_max_message_size(mut self, message_size: usize) -> Self {
        self.config = self.config.with_max_message_size(message_size);
        self
    }

    /// Get the maximum number of bytes a message from the host may span. Default value is 16MB.
    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size()
    }

    /// Replace the whole server configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves the host over the given input and output.
    pub async fn start_with_io<R, W>(self, input: R, output: W) -> Result<()>
    where
        T: BatchingBolt + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut runtime = Runtime::new(input, output, &self.config);
        runtime.set_auto_anchor(self.auto_anchor);
        let mut service = BatchingService {
            handler: self.handler,
            trigger: self.trigger,
            auto_ack: self.auto_ack,
            auto_fail: self.auto_fail,
            batches: Batches::default(),
            ticks: 0,
        };
        runtime::serve(&mut runtime, &mut service).await
    }

    /// Serves the host over the process's stdin and stdout. Anything else
    /// writing to stdout ends up in the log instead of the protocol stream.
    pub async fn start(self) -> Result<()>
    where
        T: BatchingBolt + 'static,
    {
        let (input, output) = stdio_transport()?;
        self.start_with_io(input, output).await
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    use crate::batching::{self, BatchTrigger, BatchingBolt};
    use crate::error::{Error as MultilangError, HookError, HookResult, Result};
    use crate::runtime::{Emission, Runtime};
    use crate::shared::testing::FakeHost;
    use crate::shared::Tuple;

    /// Groups by the first value and emits the batch size. Fails on the "boom" group.
    #[derive(Default)]
    struct GroupCounter {
        calls: Arc<Mutex<Vec<(String, usize)>>>,
    }

    #[async_trait::async_trait]
    impl BatchingBolt for GroupCounter {
        type Key = String;

        fn group_key(&self, tup: &Tuple) -> std::result::Result<String, HookError> {
            match tup.values.first().and_then(Value::as_str) {
                Some("nokey") => Err("tuple has no key".into()),
                Some(key) => Ok(key.to_string()),
                None => Ok(String::new()),
            }
        }

        async fn process_batch(&mut self, key: &String, tuples: &[Tuple], runtime: &mut Runtime) -> HookResult {
            self.calls.lock().unwrap().push((key.clone(), tuples.len()));
            if key == "boom" {
                return Err("cannot count boom".into());
            }
            runtime
                .emit(Emission::new(vec![json!(key), json!(tuples.len())]))
                .await?;
            Ok(())
        }
    }

    async fn start(
        server: batching::Server<GroupCounter>,
    ) -> (FakeHost, JoinHandle<Result<()>>, TempDir) {
        let (mut host, pipes) = FakeHost::new();
        let task = tokio::spawn(server.start_with_io(pipes.input, pipes.output));
        let tmp_dir = TempDir::new().unwrap();
        host.handshake(tmp_dir.path()).await;
        (host, task, tmp_dir)
    }

    async fn send_names(host: &mut FakeHost, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            host.send_tuple(json!(i.to_string()), json!([name])).await;
        }
    }

    #[tokio::test]
    async fn batching_on_ticks() -> std::result::Result<(), Box<dyn Error>> {
        let bolt = GroupCounter::default();
        let calls = Arc::clone(&bolt.calls);
        let server = batching::Server::new(bolt);
        assert_eq!(server.trigger(), BatchTrigger::Ticks(1));
        let (mut host, _task, _tmp_dir) = start(server).await;

        send_names(&mut host, &["mike", "lida", "mike", "lida"]).await;

        // ticks are acked right away, the batch is processed on the second one
        host.send_tick().await;
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": null}));
        host.send_tick().await;
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": null}));

        let emit = host.expect("emit").await;
        assert_eq!(emit["tuple"], json!(["mike", 2]));
        assert_eq!(emit["anchors"], json!(["0", "2"]));
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": "0"}));
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": "2"}));

        let emit = host.expect("emit").await;
        assert_eq!(emit["tuple"], json!(["lida", 2]));
        assert_eq!(emit["anchors"], json!(["1", "3"]));
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": "1"}));
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": "3"}));

        assert_eq!(
            *calls.lock().unwrap(),
            vec![("mike".to_string(), 2), ("lida".to_string(), 2)]
        );

        // heartbeats are answered while batches are pending
        send_names(&mut host, &["mike"]).await;
        host.send_heartbeat().await;
        host.expect("sync").await;
        Ok(())
    }

    #[tokio::test]
    async fn tick_count_carries_over_idle_ticks() -> std::result::Result<(), Box<dyn Error>> {
        let bolt = GroupCounter::default();
        let calls = Arc::clone(&bolt.calls);
        let server = batching::Server::new(bolt).with_trigger(BatchTrigger::Ticks(2));
        let (mut host, _task, _tmp_dir) = start(server).await;

        // nothing pending, so nothing is flushed and the counter keeps growing
        for _ in 0..4 {
            host.send_tick().await;
            assert_eq!(host.recv().await?, json!({"command": "ack", "id": null}));
        }
        assert!(calls.lock().unwrap().is_empty());

        send_names(&mut host, &["zoe"]).await;
        host.send_tick().await;
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": null}));
        let emit = host.expect("emit").await;
        assert_eq!(emit["tuple"], json!(["zoe", 1]));
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": "0"}));

        // the flush reset the counter: three more ticks are needed
        send_names(&mut host, &["mike"]).await;
        for _ in 0..2 {
            host.send_tick().await;
            assert_eq!(host.recv().await?, json!({"command": "ack", "id": null}));
        }
        assert_eq!(*calls.lock().unwrap(), vec![("zoe".to_string(), 1)]);
        host.send_tick().await;
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": null}));
        assert_eq!(host.expect("emit").await["tuple"], json!(["mike", 1]));
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": "0"}));
        Ok(())
    }

    #[tokio::test]
    async fn batching_on_timer() -> std::result::Result<(), Box<dyn Error>> {
        let bolt = GroupCounter::default();
        let calls = Arc::clone(&bolt.calls);
        let server = batching::Server::new(bolt)
            .with_trigger(BatchTrigger::Timer(Duration::from_millis(200)))
            .with_auto_anchor(false);
        let (mut host, _task, _tmp_dir) = start(server).await;

        send_names(&mut host, &["mike", "lida", "mike", "lida"]).await;

        let mut messages = Vec::new();
        for _ in 0..6 {
            messages.push(host.recv().await?);
        }
        let commands: Vec<&str> = messages
            .iter()
            .map(|m| m["command"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(commands, vec!["emit", "ack", "ack", "emit", "ack", "ack"]);
        assert!(messages[0].get("anchors").is_none());
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("mike".to_string(), 2), ("lida".to_string(), 2)]
        );

        // ticks are acked like in a plain bolt
        host.send_tick().await;
        assert_eq!(host.recv().await?, json!({"command": "ack", "id": null}));
        Ok(())
    }

    #[tokio::test]
    async fn batching_failure_fails_all_pending() -> std::result::Result<(), Box<dyn Error>> {
        let (mut host, task, _tmp_dir) = start(batching::Server::new(GroupCounter::default())).await;

        send_names(&mut host, &["mike", "boom", "lida", "boom", "mike"]).await;
        host.send_tick().await;
        host.expect("ack").await;
        host.send_tick().await;
        host.expect("ack").await;

        // mike goes through, boom fails and takes lida down with it
        assert_eq!(host.expect("emit").await["tuple"], json!(["mike", 2]));
        assert_eq!(host.expect("ack").await["id"], "0");
        assert_eq!(host.expect("ack").await["id"], "4");

        let error = host.expect("error").await;
        let msg = error["msg"].as_str().unwrap_or_default();
        assert!(msg.contains("cannot count boom"), "{msg}");
        host.expect("sync").await;

        let mut failed = Vec::new();
        for _ in 0..4 {
            failed.push(host.expect("fail").await["id"].clone());
        }
        assert_eq!(failed, vec![json!("1"), json!("3"), json!("2"), Value::Null]);

        let result = task.await?;
        assert!(matches!(result, Err(MultilangError::BatchingBoltError(_))), "{result:?}");
        assert_eq!(host.recv().await, Err(MultilangError::ChannelClosed));
        Ok(())
    }

    #[tokio::test]
    async fn batching_group_key_failure() -> std::result::Result<(), Box<dyn Error>> {
        let server = batching::Server::new(GroupCounter::default());
        let (mut host, task, _tmp_dir) = start(server).await;

        send_names(&mut host, &["mike", "nokey"]).await;
        let error = host.expect("error").await;
        let msg = error["msg"].as_str().unwrap_or_default();
        assert!(msg.contains("tuple has no key"), "{msg}");
        host.expect("sync").await;
        assert_eq!(host.expect("fail").await["id"], "1");
        assert_eq!(host.expect("fail").await["id"], "0");

        assert!(task.await?.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn batching_without_auto_ack_and_fail() -> std::result::Result<(), Box<dyn Error>> {
        let server = batching::Server::new(GroupCounter::default())
            .with_trigger(BatchTrigger::Ticks(0))
            .with_auto_ack(false)
            .with_auto_fail(false);
        let (mut host, task, _tmp_dir) = start(server).await;

        send_names(&mut host, &["mike", "boom"]).await;
        host.send_tick().await;
        // the tick itself is acked regardless of auto-ack
        host.expect("ack").await;
        assert_eq!(host.expect("emit").await["tuple"], json!(["mike", 1]));
        host.expect("error").await;
        host.expect("sync").await;

        assert!(task.await?.is_err());
        assert_eq!(host.recv().await, Err(MultilangError::ChannelClosed));
        Ok(())
    }
}
