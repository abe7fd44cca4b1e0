//! Worker process entry point.
//!
//! A worker reads `start(TaskSpec)` from the host, runs one
//! [`TransferEngine`] and, alongside it, a listener loop that routes host
//! replies to waiting RPCs. On `terminate` the listener waits for any
//! in-flight disk commit, kills a running merge and exits.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

use crate::engine::{TaskOutcome, TransferEngine};
use crate::protocol::{ControlClient, Delivery, Message, MessageReader, ProtocolError, spawn_writer};

/// How a worker session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The task reached a terminal outcome.
    Finished(TaskOutcome),
    /// The host asked the worker to stop (or went away).
    Terminated,
}

/// Runs one worker session over `reader`/`writer`.
///
/// # Errors
///
/// Protocol violations and channel I/O failures. On a violation the worker
/// sends `terminate` before returning.
#[instrument(skip_all)]
pub async fn run_worker<R, W>(reader: R, writer: W) -> Result<WorkerExit, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut inbound = MessageReader::new(reader);
    let (outbox, writer_task) = spawn_writer(writer);

    let spec = match inbound.next().await {
        Ok(Some(Message::Start(spec))) => *spec,
        Ok(Some(other)) => {
            let err = ProtocolError::Unexpected { code: other.code() };
            return abort(outbox, writer_task, err).await;
        }
        Ok(None) => {
            debug!("host closed the channel before start");
            return Ok(WorkerExit::Terminated);
        }
        Err(e) => return abort(outbox, writer_task, e).await,
    };
    info!(item = %spec.item, streams = spec.locators.len(), "task received");

    let client = Arc::new(ControlClient::new(outbox.clone(), spec.config.rpc_timeout()));
    let engine = TransferEngine::new(spec, Arc::clone(&client) as _);
    let gate = engine.exit_gate();
    let cancel = engine.cancel_token();
    let mut engine_task = tokio::spawn(engine.run());

    let result = loop {
        tokio::select! {
            joined = &mut engine_task => {
                break match joined {
                    Ok(outcome) => Ok(WorkerExit::Finished(outcome)),
                    Err(e) => {
                        warn!(error = %e, "engine task failed");
                        Ok(WorkerExit::Finished(TaskOutcome::FetchFailed))
                    }
                };
            }
            next = inbound.next() => {
                let delivery = match next {
                    Ok(Some(message)) => client.deliver(message),
                    Ok(None) => {
                        info!("host went away");
                        Ok(Delivery::Terminate)
                    }
                    Err(e) => Err(e),
                };
                match delivery {
                    Ok(Delivery::Handled) => {}
                    Ok(Delivery::Terminate) => {
                        info!("terminating");
                        gate.close().await;
                        cancel.cancel();
                        client.close();
                        engine_task.abort();
                        break Ok(WorkerExit::Terminated);
                    }
                    Err(e) => {
                        warn!(error = %e, "protocol violation, terminating");
                        outbox.terminate();
                        gate.close().await;
                        cancel.cancel();
                        client.close();
                        engine_task.abort();
                        break Err(e);
                    }
                }
            }
        }
    };

    drop(client);
    drop(outbox);
    if let Ok(Err(e)) = writer_task.await {
        debug!(error = %e, "writer stopped with error");
    }
    result
}

async fn abort(
    outbox: crate::protocol::Outbox,
    writer_task: crate::protocol::WriterHandle,
    error: ProtocolError,
) -> Result<WorkerExit, ProtocolError> {
    warn!(error = %error, "protocol violation before start");
    outbox.terminate();
    drop(outbox);
    writer_task.await.ok();
    Err(error)
}
