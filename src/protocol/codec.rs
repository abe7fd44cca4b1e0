//! Line framing and the prioritized writer.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Message, ProtocolError};

/// Longest slice of an offending line kept in a [`ProtocolError::Malformed`].
const MAX_ECHOED_LINE: usize = 200;

/// Encodes one message as a JSON line (newline included).
///
/// # Errors
///
/// Fails only if a payload cannot be represented as JSON.
pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(|source| ProtocolError::Malformed {
        line: message.code().to_string(),
        source,
    })?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for invalid JSON or an unknown code.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    serde_json::from_str(line).map_err(|source| ProtocolError::Malformed {
        line: line.chars().take(MAX_ECHOED_LINE).collect(),
        source,
    })
}

/// Reads messages from the inbound half of a channel.
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next message, or `None` once the peer closed the channel.
    ///
    /// Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// I/O failures and malformed lines.
    pub async fn next(&mut self) -> Result<Option<Message>, ProtocolError> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message = decode(&line)?;
            trace!(code = message.code(), "message received");
            return Ok(Some(message));
        }
        Ok(None)
    }
}

/// Sending half of a channel. Cheap to clone.
///
/// Application messages are queued; [`Outbox::terminate`] jumps the queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    queue: mpsc::UnboundedSender<Message>,
    terminate: Arc<Notify>,
}

impl Outbox {
    /// Queues a message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ChannelClosed`] once the writer has stopped.
    pub fn send(&self, message: Message) -> Result<(), ProtocolError> {
        self.queue
            .send(message)
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Writes `terminate` ahead of anything still queued, then stops the writer.
    pub fn terminate(&self) {
        self.terminate.notify_one();
    }
}

/// Handle to a running writer task.
pub type WriterHandle = JoinHandle<Result<(), ProtocolError>>;

/// Spawns the writer task for one direction of a channel.
///
/// The writer stops after writing `terminate`, or once every [`Outbox`]
/// clone is dropped and the queue is drained.
pub fn spawn_writer<W>(writer: W) -> (Outbox, WriterHandle)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let terminate = Arc::new(Notify::new());
    let outbox = Outbox {
        queue: tx,
        terminate: Arc::clone(&terminate),
    };
    let handle = tokio::spawn(write_loop(writer, rx, terminate));
    (outbox, handle)
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Message>,
    terminate: Arc<Notify>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            () = terminate.notified() => {
                debug!("writing terminate ahead of queued messages");
                write_message(&mut writer, &Message::Terminate).await?;
                rx.close();
                break;
            }
            next = rx.recv() => match next {
                Some(message) => write_message(&mut writer, &message).await?,
                None => break,
            },
        }
    }
    writer.shutdown().await.ok();
    Ok(())
}

async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let line = encode(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    trace!(code = message.code(), "message sent");
    Ok(())
}
