use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

use crate::error::{HookResult, Result};
use crate::runtime::{self, guard, Dispatch, Runtime};
use crate::shared::server::{stdio_transport, ServerConfig};
use crate::shared::traits::ServiceError;
use crate::shared::{ComponentContext, HostCommand, TupleId};

/// Spout trait for implementing a source of tuples.
///
/// The host asks for tuples one at a time with `next`, and reports the fate
/// of every tuple emitted with an id through `ack` and `fail`. Replaying
/// failed tuples is up to the implementation.
#[async_trait]
pub trait Spout: Send {
    /// Called once after the handshake, before the first command.
    async fn initialize(&mut self, _context: &ComponentContext, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }

    /// Emits zero or more tuples. It is fine to emit nothing.
    ///
    /// # Example
    ///
    /// A spout endlessly emitting sentences.
    ///
    /// ```no_run
    /// use multilang::error::HookResult;
    /// use multilang::runtime::{Emission, Runtime};
    /// use multilang::spout::{self, Spout};
    /// use serde_json::json;
    ///
    /// struct Sentences {
    ///     sent: u64,
    /// }
    ///
    /// #[async_trait::async_trait]
    /// impl Spout for Sentences {
    ///     async fn next_tuple(&mut self, runtime: &mut Runtime) -> HookResult {
    ///         self.sent += 1;
    ///         let emission = Emission::new(vec![json!("the quick brown fox")]).with_id(self.sent);
    ///         runtime.emit(emission).await?;
    ///         Ok(())
    ///     }
    /// }
    ///
    /// #[tokio::main]
    /// async fn main() -> multilang::error::Result<()> {
    ///     spout::Server::new(Sentences { sent: 0 }).start().await
    /// }
    /// ```
    async fn next_tuple(&mut self, runtime: &mut Runtime) -> HookResult;

    /// The tuple emitted with `id` was fully processed.
    async fn ack(&mut self, _id: TupleId, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }

    /// The tuple emitted with `id` failed or timed out somewhere downstream.
    async fn fail(&mut self, _id: TupleId, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }

    async fn activate(&mut self, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }

    async fn deactivate(&mut self, _runtime: &mut Runtime) -> HookResult {
        Ok(())
    }
}

struct SpoutService<T> {
    handler: T,
}

#[async_trait]
impl<T> Dispatch for SpoutService<T>
where
    T: Spout,
{
    async fn initialize(&mut self, context: &ComponentContext, runtime: &mut Runtime) -> Result<()> {
        if let Err(fault) = guard(self.handler.initialize(context, runtime)).await {
            runtime.report_fault(&fault).await;
            return Err(Self::user_error(fault.to_string()));
        }
        Ok(())
    }

    async fn step(&mut self, runtime: &mut Runtime) -> Result<()> {
        let command = HostCommand::from_message(runtime.read_command().await?);
        debug!(?command, "Spout command");

        let outcome = match command {
            HostCommand::Next => guard(self.handler.next_tuple(runtime)).await,
            HostCommand::Ack(id) => guard(self.handler.ack(id, runtime)).await,
            HostCommand::Fail(id) => guard(self.handler.fail(id, runtime)).await,
            HostCommand::Activate => {
                info!("Spout activated");
                guard(self.handler.activate(runtime)).await
            }
            HostCommand::Deactivate => {
                info!("Spout deactivated");
                guard(self.handler.deactivate(runtime)).await
            }
            HostCommand::Unknown(msg) => {
                error!(command = %serde_json::Value::Object(msg), "Unknown spout command");
                Ok(())
            }
        };

        if let Err(fault) = outcome {
            runtime.report_fault(&fault).await;
            return Err(Self::user_error(fault.to_string()));
        }
        runtime.sync().await
    }
}

impl<T> ServiceError for SpoutService<T> {
    fn service_name() -> &'static str {
        "spout"
    }
}

/// Spout server serving the multilang protocol.
#[derive(Debug)]
pub struct Server<T> {
    config: ServerConfig,
    handler: T,
}

impl<T> Server<T> {
    pub fn new(spout: T) -> Self {
        Self {
            config: ServerConfig::default(),
            handler: spout,
        }
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
        T: Spout + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut runtime = Runtime::new(input, output, &self.config);
        let mut service = SpoutService {
            handler: self.handler,
        };
        runtime::serve(&mut runtime, &mut service).await
    }

    /// Serves the host over the process's stdin and stdout. Anything else
    /// writing to stdout ends up in the log instead of the protocol stream.
    pub async fn start(self) -> Result<()>
    where
        T: Spout + 'static,
    {
        let (input, output) = stdio_transport()?;
        self.start_with_io(input, output).await
    }
}
