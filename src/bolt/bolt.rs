use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{HookResult, Result};
use crate::runtime::{self, guard, Dispatch, Runtime};
use crate::shared::server::{stdio_transport, ServerConfig};
use crate::shared::traits::ServiceError;
use crate::shared::{ComponentContext, Tuple};

/// Bolt trait for implementing a processing step.
///
/// With the default settings every tuple emitted while processing is anchored
/// to the input tuple, the input is acked once [`Bolt::process`] returns and
/// failed if it returns an error or panics.
#[async_trait]
pub trait Bolt: Send {
    /// Called once after the handshake, before the first tuple.
    async fn initialize(&mut self, _context: &ComponentContext, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }

    /// Processes a single tuple.
    ///
    /// # Example
    ///
    /// A bolt splitting sentences into words.
    ///
    /// ```no_run
    /// use multilang::bolt::{self, Bolt};
    /// use multilang::error::HookResult;
    /// use multilang::runtime::{Emission, Runtime};
    /// use multilang::shared::Tuple;
    /// use serde_json::json;
    ///
    /// struct SplitSentence;
    ///
    /// #[async_trait::async_trait]
    /// impl Bolt for SplitSentence {
    ///     async fn process(&mut self, tup: &Tuple, runtime: &mut Runtime) -> HookResult {
    ///         let sentence = tup.values[0].as_str().unwrap_or_default();
    ///         for word in sentence.split_whitespace() {
    ///             runtime.emit(Emission::new(vec![json!(word)])).await?;
    ///         }
    ///         Ok(())
    ///     }
    /// }
    ///
    /// #[tokio::main]
    /// async fn main() -> multilang::error::Result<()> {
    ///     bolt::Server::new(SplitSentence).start().await
    /// }
    /// ```
    async fn process(&mut self, tup: &Tuple, runtime: &mut Runtime) -> HookResult;

    /// Handles a tick tuple. Ticks only arrive when the topology configures a
    /// tick frequency for the component.
    async fn process_tick(&mut self, _tick: &Tuple, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }
}

/// Acknowledgement policy shared by the bolt roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AutoPolicy {
    pub ack: bool,
    pub anchor: bool,
    pub fail: bool,
}

impl Default for AutoPolicy {
    fn default() -> Self {
        Self {
            ack: true,
            anchor: true,
            fail: true,
        }
    }
}

struct BoltService<T> {
    handler: T,
    policy: AutoPolicy,
}

#[async_trait]
impl<T> Dispatch for BoltService<T>
where
    T: Bolt,
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
        if tup.is_heartbeat() {
            debug!("Heartbeat");
            return runtime.sync().await;
        }

        runtime.set_current(vec![tup.clone()]);
        let outcome = if tup.is_tick() {
            guard(self.handler.process_tick(&tup, runtime)).await
        } else {
            guard(self.handler.process(&tup, runtime)).await
        };

        match outcome {
            Ok(()) => {
                runtime.clear_current();
                if self.policy.ack {
                    runtime.ack(&tup).await?;
                }
                Ok(())
            }
            Err(fault) => {
                runtime.report_fault(&fault).await;
                runtime.clear_current();
                if self.policy.fail {
                    runtime.fail(&tup).await?;
                }
                Err(Self::user_error(fault.to_string()))
            }
        }
    }
}

impl<T> ServiceError for BoltService<T> {
    fn service_name() -> &'static str {
        "bolt"
    }
}

/// Bolt server serving the multilang protocol.
#[derive(Debug)]
pub struct Server<T> {
    config: ServerConfig,
    policy: AutoPolicy,
    handler: T,
}

impl<T> Server<T> {
    pub fn new(bolt: T) -> Self {
        Self {
            config: ServerConfig::default(),
            policy: AutoPolicy::default(),
            handler: bolt,
        }
    }

    /// Ack every tuple once [`Bolt::process`] returns. Default value is `true`.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.policy.ack = auto_ack;
        self
    }

    pub fn auto_ack(&self) -> bool {
        self.policy.ack
    }

    /// Anchor emits to the tuple being processed unless anchors are given
    /// explicitly. Default value is `true`.
    pub fn with_auto_anchor(mut self, auto_anchor: bool) -> Self {
        self.policy.anchor = auto_anchor;
        self
    }

    pub fn auto_anchor(&self) -> bool {
        self.policy.anchor
    }

    /// Fail the tuple being processed when processing fails. Default value is `true`.
    pub fn with_auto_fail(mut self, auto_fail: bool) -> Self {
        self.policy.fail = auto_fail;
        self
    }

    pub fn auto_fail(&self) -> bool {
        self.policy.fail
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
        T: Bolt + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut runtime = Runtime::new(input, output, &self.config);
        runtime.set_auto_anchor(self.policy.anchor);
        let mut service = BoltService {
            handler: self.handler,
            policy: self.policy,
        };
        runtime::serve(&mut runtime, &mut service).await
    }

    /// Serves the host over the process's stdin and stdout. Anything else
    /// writing to stdout ends up in the log instead of the protocol stream.
    pub async fn start(self) -> Result<()>
    where
        T: Bolt + 'static,
    {
        let (input, output) = stdio_transport()?;
        self.start_with_io(input, output).await
    }
}
