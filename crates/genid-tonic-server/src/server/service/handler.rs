//! gRPC service implementation for keyed ID commands.
//!
//! [`IdService`] implements the [`IdGenerator`] service from
//! `proto/genid.proto`. Each `Execute` call is decoded into a
//! [`genid::Command`], run by a [`CommandHandler`] on Tokio's blocking pool
//! (a segment refill is a synchronous database transaction), and encoded back
//! into a `CommandReply`.
//!
//! ## Responsibilities
//!
//! - Keep store I/O off the async reactor.
//! - Report command failures inside the reply and service failures as
//!   `tonic::Status`.
//! - Refuse new commands once shutdown starts, then close the generator.

use crate::server::telemetry::{
    increment_command_errors, increment_commands, increment_ids_issued, record_command_duration,
};
use core::sync::atomic::{AtomicBool, Ordering};
use genid_tonic_core::{
    Error,
    genid::{Command, CommandHandler, KeyedGenerator, Reply, Verb},
    proto::{CommandReply, CommandRequest, id_generator_server::IdGenerator},
};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

/// gRPC front end over a [`KeyedGenerator`].
///
/// Cloning is cheap; clones share the generator and the shutdown flag.
pub struct IdService<G> {
    handler: Arc<CommandHandler<G>>,
    shutting_down: Arc<AtomicBool>,
}

impl<G> Clone for IdService<G> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }
}

impl<G: KeyedGenerator + 'static> IdService<G> {
    pub fn new(generator: G) -> Self {
        Self {
            handler: Arc::new(CommandHandler::new(generator)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stops accepting commands and closes the generator, releasing its
    /// store connections. Commands already running finish first or fail
    /// with a closed error.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.shutting_down.store(true, Ordering::Release);
        let handler = Arc::clone(&self.handler);
        tokio::task::spawn_blocking(move || handler.generator().close())
            .await
            .map_err(|e| Error::TaskFailed {
                context: e.to_string(),
            })??;
        Ok(())
    }

    async fn run(&self, command: Command) -> Result<Reply, Error> {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        let handler = Arc::clone(&self.handler);
        tokio::task::spawn_blocking(move || handler.handle(&command))
            .await
            .map_err(|e| Error::TaskFailed {
                context: e.to_string(),
            })
    }
}

#[tonic::async_trait]
impl<G: KeyedGenerator + 'static> IdGenerator for IdService<G> {
    /// Executes one command.
    ///
    /// If `metrics` is enabled, emits per-verb command counts, error counts
    /// and latency, plus the number of identifiers issued.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(verb = %req.get_ref().verb)))]
    async fn execute(
        &self,
        req: Request<CommandRequest>,
    ) -> Result<Response<CommandReply>, Status> {
        let start = Instant::now();
        let command = Command::from(req.into_inner());
        let verb = Verb::parse(&command.verb).map_or("UNKNOWN", |v| v.as_str());
        increment_commands(verb);

        let reply = match self.run(command).await {
            Ok(reply) => reply,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("command failed: {}", e);
                increment_command_errors(verb);
                return Err(e.into());
            }
        };

        match &reply {
            Reply::Integer(_) => increment_ids_issued(1),
            Reply::Error(_message) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("error reply: {}", _message);
                increment_command_errors(verb);
            }
            Reply::Status(_) | Reply::Text(_) => {}
        }
        record_command_duration(verb, start.elapsed().as_secs_f64() * 1000.0);

        Ok(Response::new(reply.into()))
    }
}
