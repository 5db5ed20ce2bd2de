use crate::close::{CloseError, StatusCode};
use crate::config::ConnConfig;
use crate::error::Error;
use crate::frame::{OpCode, Role};
use crate::lifecycle::Terminal;
use crate::message::MessageType;
use crate::read::{self, ReadOutcome, ReadRequest};
use crate::write::{self, ChunkRequest, FlushRequest, WriteChannels};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// State shared between the facade, the write loop, and the read loop. Every field here is
/// reached through an `Arc`; none of it is ever torn down while either loop task is alive.
pub(crate) struct Shared {
    pub role: Role,
    pub config: ConnConfig,
    pub terminal: Terminal,
    /// CAS guard: only one `Conn::read` call may be waiting on the read loop at a time.
    pub active_reader: AtomicBool,
    /// Held by a [`WriteHandle`] for its entire lifetime so a second `Conn::write` call blocks
    /// at message-start instead of racing its chunks into the in-flight message — the write
    /// loop's `start_rx` slot frees up the instant the loop reads it, well before the message
    /// it started has finished streaming, so the channel alone can't serialize writers.
    pub write_permit: Semaphore,
    pub write: WriteChannels,
    pub read_opcode_rx: Mutex<mpsc::Receiver<OpCode>>,
    pub read_bytes_tx: mpsc::Sender<ReadRequest>,
}

/// A full-duplex WebSocket connection engine over an already-upgraded byte transport.
///
/// `Conn` owns nothing about the handshake: callers hand it a transport that has already
/// completed the HTTP Upgrade dance, plus the role it plays on that transport. From there it
/// runs an independent read loop and write loop for the life of the connection, exposing a
/// streaming message API over both.
pub struct Conn {
    shared: Arc<Shared>,
    subprotocol: String,
    write_task: JoinHandle<()>,
    read_task: JoinHandle<()>,
}

impl Conn {
    /// Splits `transport`, spawns the read and write loops, and returns the connection handle.
    /// `subprotocol` is whatever the caller's handshake negotiated; this type never inspects
    /// or validates it, it's just surfaced back through [`Conn::subprotocol`].
    pub fn new<T>(transport: T, role: Role, subprotocol: impl Into<String>, config: ConnConfig) -> Conn
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = split(transport);
        let buf_reader = BufReader::with_capacity(config.read_buffer_capacity, read_half);
        let buf_writer = BufWriter::with_capacity(config.write_buffer_capacity, write_half);

        let (write_channels, write_recv) = write::new_channels();
        let (opcode_tx, opcode_rx) = mpsc::channel(1);
        let (read_bytes_tx, read_bytes_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            role,
            config: config.clone(),
            terminal: Terminal::new(),
            active_reader: AtomicBool::new(false),
            write_permit: Semaphore::new(1),
            write: write_channels,
            read_opcode_rx: Mutex::new(opcode_rx),
            read_bytes_tx,
        });

        let write_task = tokio::spawn(write::run(buf_writer, role, Arc::clone(&shared), write_recv));
        let control_tx = shared.write.control_tx.clone();
        let read_task = tokio::spawn(read::run(
            buf_reader,
            role,
            Arc::clone(&shared),
            control_tx,
            opcode_tx,
            read_bytes_rx,
            config,
        ));

        Conn {
            shared,
            subprotocol: subprotocol.into(),
            write_task,
            read_task,
        }
    }

    /// The subprotocol this connection negotiated during its (external) handshake.
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    fn terminal_err(&self) -> Error {
        self.shared.terminal.cause().unwrap_or(Error::CommunicationError)
    }

    /// Begins writing one outbound message of `msg_type`. The returned handle must be used to
    /// stream the message's bytes and finished with [`WriteHandle::close`]; only one write
    /// handle may be open at a time — a concurrent call blocks here, at message-start, until
    /// the in-flight handle is dropped.
    pub async fn write(&self, cancel: &CancellationToken, msg_type: MessageType) -> Result<WriteHandle<'_>, Error> {
        let permit = tokio::select! {
            biased;
            _ = self.shared.terminal.closed() => return Err(self.terminal_err()),
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.shared.write_permit.acquire() => {
                permit.map_err(|_| self.terminal_err())?
            }
        };

        tokio::select! {
            biased;
            _ = self.shared.terminal.closed() => Err(self.terminal_err()),
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = self.shared.write.start_tx.send(msg_type) => {
                sent.map_err(|_| self.terminal_err())?;
                Ok(WriteHandle { conn: self, cancel: cancel.clone(), _permit: permit })
            }
        }
    }

    /// Waits for the next inbound data message, racing the CAS guard against any reader
    /// already draining a previous message. Returns the message's type and a handle to
    /// stream its payload.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<(MessageType, ReadHandle<'_>), Error> {
        loop {
            if self
                .shared
                .active_reader
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }

            tokio::select! {
                biased;
                _ = self.shared.terminal.closed() => return Err(self.terminal_err()),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.drain_one() => {
                    let still_active = result?;
                    if still_active {
                        return Err(Error::CallerMisuse(
                            "previous message was not fully read before calling read again".into(),
                        ));
                    }
                }
            }
        }

        let mut opcode_rx = self.shared.read_opcode_rx.lock().await;
        let opcode = tokio::select! {
            biased;
            _ = self.shared.terminal.closed() => return Err(self.terminal_err()),
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            op = opcode_rx.recv() => op,
        };
        drop(opcode_rx);

        let opcode = opcode.ok_or_else(|| self.terminal_err())?;
        let msg_type = MessageType::from_opcode(opcode)?;
        Ok((msg_type, ReadHandle { conn: self, cancel: cancel.clone() }))
    }

    /// Sends a zero-length read request to nudge the in-flight reader toward completion, and
    /// reports whether it's still active afterward. Used only while draining a stale reader
    /// out of the way for a new `read` call.
    async fn drain_one(&self) -> Result<bool, Error> {
        let (reply, reply_rx) = oneshot::channel();
        let req = ReadRequest { want: 0, reply };
        self.shared
            .read_bytes_tx
            .send(req)
            .await
            .map_err(|_| self.terminal_err())?;
        match reply_rx.await {
            Ok(Ok(_outcome)) => Ok(self.shared.active_reader.load(Ordering::Acquire)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.terminal_err()),
        }
    }

    /// Submits a close frame with the given code and reason and latches the connection
    /// terminal with the same cause, regardless of whether the frame made it onto the wire.
    pub async fn close(&self, code: StatusCode, reason: impl Into<String>) -> Result<(), Error> {
        let ce = CloseError::new(code, reason.into());
        let payload = ce.encode().unwrap_or_else(|_| {
            CloseError::new(StatusCode::INTERNAL_ERROR, "")
                .encode()
                .expect("empty reason always fits")
        });
        let write_result = write::send_control(
            &self.shared,
            &self.shared.write.control_tx,
            OpCode::Close,
            payload,
            self.shared.config.control_write_timeout,
        )
        .await;
        self.shared.terminal.latch(Error::Close {
            code: ce.code,
            reason: ce.reason,
        });
        write_result
    }
}

impl Drop for Conn {
    /// Best-effort cleanup: if the connection never reached its terminal state (the caller
    /// dropped it instead of closing it), abort both loop tasks so they don't outlive us.
    fn drop(&mut self) {
        if !self.shared.terminal.is_latched() {
            self.write_task.abort();
            self.read_task.abort();
        }
    }
}

/// A handle to the message [`Conn::write`] just started. Streams payload chunks and must be
/// finished with [`WriteHandle::close`] to send the closing (`fin=1`) frame.
pub struct WriteHandle<'a> {
    conn: &'a Conn,
    cancel: CancellationToken,
    /// Released when this handle is dropped, unblocking the next `Conn::write` call waiting
    /// at message-start.
    _permit: SemaphorePermit<'a>,
}

impl WriteHandle<'_> {
    /// Submits one chunk of the message's payload as a non-final frame. Cancellation while
    /// the write loop is already processing this chunk latches the connection terminal with
    /// a write-timeout error, since the frame may be half-written to the wire by then.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), Error> {
        let (ack, mut ack_rx) = oneshot::channel();
        let req = ChunkRequest { bytes, ack };

        let sent = tokio::select! {
            biased;
            _ = self.conn.shared.terminal.closed() => return Err(self.conn.terminal_err()),
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = self.conn.shared.write.chunk_tx.send(req) => r,
        };
        if sent.is_err() {
            return Err(self.conn.terminal_err());
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.conn.shared.terminal.latch(Error::Timeout("write timed out".into()));
                let _ = (&mut ack_rx).await;
                Err(self.conn.terminal_err())
            }
            ack = &mut ack_rx => match ack {
                Ok(result) => result,
                Err(_) => Err(self.conn.terminal_err()),
            },
        }
    }

    /// Finalizes the message with a `fin=1` frame. Does not escalate on cancellation: a
    /// cancelled close just leaves the flush request queued for the write loop to pick up.
    pub async fn close(self) -> Result<(), Error> {
        let (ack, ack_rx) = oneshot::channel();
        let req = FlushRequest { ack };

        let sent = tokio::select! {
            biased;
            _ = self.conn.shared.terminal.closed() => return Err(self.conn.terminal_err()),
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = self.conn.shared.write.flush_tx.send(req) => r,
        };
        if sent.is_err() {
            return Err(self.conn.terminal_err());
        }

        tokio::select! {
            biased;
            _ = self.conn.shared.terminal.closed() => Err(self.conn.terminal_err()),
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            ack = ack_rx => match ack {
                Ok(result) => result,
                Err(_) => Err(self.conn.terminal_err()),
            },
        }
    }
}

/// What one [`ReadHandle::read`] call produced.
pub struct ReadChunk {
    pub n: usize,
    pub eof: bool,
}

/// A handle to the message [`Conn::read`] just yielded. Streams the message's payload; the
/// final chunk carries `eof: true` in the same call, it never requires a trailing empty read.
pub struct ReadHandle<'a> {
    conn: &'a Conn,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ReadHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle").finish_non_exhaustive()
    }
}

impl ReadHandle<'_> {
    /// Copies up to `buf.len()` bytes of the message's payload into `buf`. Cancellation while
    /// the read loop is already servicing this request latches the connection terminal with a
    /// read-timeout error and waits for the read loop to exit before returning, since the
    /// pending handoff can't be un-submitted.
    pub async fn read(&self, buf: &mut [u8]) -> Result<ReadChunk, Error> {
        if !self.conn.shared.active_reader.load(Ordering::Acquire) {
            return Ok(ReadChunk { n: 0, eof: true });
        }

        let (reply, mut reply_rx) = oneshot::channel();
        let req = ReadRequest { want: buf.len(), reply };

        let sent = tokio::select! {
            biased;
            _ = self.conn.shared.terminal.closed() => return Err(self.conn.terminal_err()),
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = self.conn.shared.read_bytes_tx.send(req) => r,
        };
        if sent.is_err() {
            return Err(self.conn.terminal_err());
        }

        let outcome: Result<ReadOutcome, Error> = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.conn.shared.terminal.latch(Error::Timeout("read timed out".into()));
                match (&mut reply_rx).await {
                    Ok(r) => r,
                    Err(_) => return Err(self.conn.terminal_err()),
                }
            }
            ack = &mut reply_rx => ack.map_err(Error::from).and_then(|r| r),
        };

        match outcome {
            Ok(ReadOutcome { data, eof }) => {
                let n = data.len();
                buf[..n].copy_from_slice(&data);
                Ok(ReadChunk { n, eof })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use tokio::io::duplex;

    #[tokio::test]
    async fn single_frame_text_message_round_trips() {
        let (client_io, server_io) = duplex(4096);
        let client = Conn::new(client_io, Role::Client, "", ConnConfig::default());
        let server = Conn::new(server_io, Role::Server, "", ConnConfig::default());

        let cancel = CancellationToken::new();
        let writer = client.write(&cancel, MessageType::Text).await.unwrap();
        writer.write(b"hello".to_vec()).await.unwrap();
        writer.close().await.unwrap();

        let (msg_type, reader) = server.read(&cancel).await.unwrap();
        assert_eq!(msg_type, MessageType::Text);

        // A chunk is always written as its own non-final frame; close() sends a trailing
        // empty fin=1 frame rather than folding fin into the last chunk, so the payload and
        // the end-of-message signal arrive as two separate reads here.
        let mut buf = [0u8; 64];
        let first = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..first.n], b"hello");
        assert!(!first.eof);

        let last = reader.read(&mut buf).await.unwrap();
        assert_eq!(last.n, 0);
        assert!(last.eof);
    }

    #[tokio::test]
    async fn fragmented_message_delivers_continuation_frames() {
        let (client_io, server_io) = duplex(4096);
        let client = Conn::new(client_io, Role::Client, "", ConnConfig::default());
        let server = Conn::new(server_io, Role::Server, "", ConnConfig::default());

        let cancel = CancellationToken::new();
        let writer = client.write(&cancel, MessageType::Binary).await.unwrap();
        writer.write(b"abc".to_vec()).await.unwrap();
        writer.write(b"def".to_vec()).await.unwrap();
        writer.close().await.unwrap();

        let (msg_type, reader) = server.read(&cancel).await.unwrap();
        assert_eq!(msg_type, MessageType::Binary);

        let mut collected = Vec::new();
        loop {
            let mut buf = [0u8; 2];
            let chunk = reader.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..chunk.n]);
            if chunk.eof {
                break;
            }
        }
        assert_eq!(collected, b"abcdef");
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_at_message_start() {
        let (client_io, server_io) = duplex(4096);
        let client = Arc::new(Conn::new(client_io, Role::Client, "", ConnConfig::default()));
        let server = Conn::new(server_io, Role::Server, "", ConnConfig::default());

        let cancel = CancellationToken::new();
        let first = client.write(&cancel, MessageType::Text).await.unwrap();
        first.write(b"first-a".to_vec()).await.unwrap();

        let second_client = Arc::clone(&client);
        let second_cancel = cancel.clone();
        let second = tokio::spawn(async move {
            let handle = second_client.write(&second_cancel, MessageType::Text).await.unwrap();
            handle.write(b"second".to_vec()).await.unwrap();
            handle.close().await.unwrap();
        });

        // Give the spawned writer a chance to run; it must still be blocked acquiring the
        // write permit, not interleaving frames into the first message.
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        first.write(b"first-b".to_vec()).await.unwrap();
        first.close().await.unwrap();
        second.await.unwrap();

        let (msg_type, reader) = server.read(&cancel).await.unwrap();
        assert_eq!(msg_type, MessageType::Text);
        let mut collected = Vec::new();
        loop {
            let mut buf = [0u8; 64];
            let chunk = reader.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..chunk.n]);
            if chunk.eof {
                break;
            }
        }
        assert_eq!(collected, b"first-afirst-b");

        let (msg_type, reader) = server.read(&cancel).await.unwrap();
        assert_eq!(msg_type, MessageType::Text);
        let mut collected = Vec::new();
        loop {
            let mut buf = [0u8; 64];
            let chunk = reader.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..chunk.n]);
            if chunk.eof {
                break;
            }
        }
        assert_eq!(collected, b"second");
    }

    #[tokio::test]
    async fn peer_close_surfaces_on_both_sides() {
        let (client_io, server_io) = duplex(4096);
        let client = Conn::new(client_io, Role::Client, "", ConnConfig::default());
        let server = Conn::new(server_io, Role::Server, "", ConnConfig::default());

        client.close(StatusCode::NORMAL_CLOSURE, "done").await.unwrap();

        let cancel = CancellationToken::new();
        let err = server.read(&cancel).await.unwrap_err();
        assert!(err.is_closed());
    }
}
