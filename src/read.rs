use crate::close::{CloseError, StatusCode};
use crate::config::ConnConfig;
use crate::connection::Shared;
use crate::error::Error;
use crate::frame::{mask, read_header, Header, OpCode, Role, MAX_CONTROL_FRAME_PAYLOAD};
use crate::write::{send_control, ControlRequest};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

/// One caller-driven request for the next chunk of the in-flight message's payload. `want`
/// bytes at most; a request submitted while no reader is in flight only happens during the
/// drain-and-retry path in [`crate::connection::Conn::read`], which always asks for zero.
pub(crate) struct ReadRequest {
    pub want: usize,
    pub reply: oneshot::Sender<Result<ReadOutcome, Error>>,
}

/// What one `ReadRequest` handoff produced: the bytes read so far from the current frame's
/// payload, and whether the message's final byte was included.
pub(crate) struct ReadOutcome {
    pub data: Vec<u8>,
    pub eof: bool,
}

/// The read loop: sole owner of the buffered input half. Parses frames, answers control
/// frames inline, and hands data payloads to whichever `Read` call is in flight.
pub(crate) async fn run<R>(
    mut reader: BufReader<R>,
    role: Role,
    shared: Arc<Shared>,
    control_tx: mpsc::Sender<ControlRequest>,
    opcode_tx: mpsc::Sender<OpCode>,
    mut read_bytes_rx: mpsc::Receiver<ReadRequest>,
    cfg: ConnConfig,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut in_msg = false;

    loop {
        let header = tokio::select! {
            biased;
            _ = shared.terminal.closed() => break,
            h = read_header(&mut reader) => h,
        };
        let header = match header {
            Ok(h) => h,
            Err(e) => {
                shared.terminal.latch(e);
                break;
            }
        };

        if header.masked != role.expects_masked_incoming() {
            close_with_protocol_error(
                &shared,
                &control_tx,
                &cfg,
                "incoming frame's mask bit does not match the expected direction",
            )
            .await;
            break;
        }

        if header.opcode.is_control() {
            match handle_control(&mut reader, &header, &shared, &control_tx, &cfg).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    shared.terminal.latch(e);
                    break;
                }
            }
        }

        match header.opcode {
            OpCode::Text | OpCode::Binary => {
                if in_msg {
                    close_with_protocol_error(
                        &shared,
                        &control_tx,
                        &cfg,
                        "received a new data frame before the previous message finished",
                    )
                    .await;
                    break;
                }
                let sent = tokio::select! {
                    biased;
                    _ = shared.terminal.closed() => break,
                    res = opcode_tx.send(header.opcode) => res,
                };
                if sent.is_err() {
                    break;
                }
                in_msg = true;
            }
            OpCode::Continuation => {
                if !in_msg {
                    close_with_protocol_error(
                        &shared,
                        &control_tx,
                        &cfg,
                        "continuation frame with no message in progress",
                    )
                    .await;
                    break;
                }
            }
            _ => unreachable!("control opcodes are handled above"),
        }

        match payload_pump(&mut reader, &header, &shared, &mut read_bytes_rx).await {
            Ok(fin_reached) => {
                if fin_reached {
                    in_msg = false;
                }
            }
            Err(e) => {
                shared.terminal.latch(e);
                break;
            }
        }
    }
}

/// Pumps one frame's payload out through `read_bytes_rx`, one caller-sized chunk at a time.
/// Returns `Ok(true)` once the frame's `fin` bit closes the message.
async fn payload_pump<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    header: &Header,
    shared: &Arc<Shared>,
    read_bytes_rx: &mut mpsc::Receiver<ReadRequest>,
) -> Result<bool, Error> {
    let mut mask_pos = 0usize;
    let mut remaining = header.payload_length;
    let mut handed_off_once = false;

    loop {
        if remaining == 0 && handed_off_once {
            return Ok(header.fin);
        }

        let req = tokio::select! {
            biased;
            _ = shared.terminal.closed() => return Ok(false),
            req = read_bytes_rx.recv() => req,
        };
        let Some(ReadRequest { want, reply }) = req else {
            return Ok(false);
        };

        let n = (want as u64).min(remaining) as usize;
        let mut buf = vec![0u8; n];
        if n > 0 {
            reader.read_exact(&mut buf).await?;
            remaining -= n as u64;
            if let Some(key) = header.mask_key {
                mask_pos = mask(&key, mask_pos, &mut buf);
            }
        }
        handed_off_once = true;

        let eof = remaining == 0 && header.fin;
        if eof {
            shared.active_reader.store(false, Ordering::Release);
        }
        let _ = reply.send(Ok(ReadOutcome { data: buf, eof }));
        if eof {
            return Ok(true);
        }
    }
}

/// Handles one control frame synchronously. Returns `Ok(true)` to keep reading, `Ok(false)`
/// once the connection has reached its terminal state (peer close, already latched here).
async fn handle_control<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    header: &Header,
    shared: &Arc<Shared>,
    control_tx: &mpsc::Sender<ControlRequest>,
    cfg: &ConnConfig,
) -> Result<bool, Error> {
    if !header.fin || header.payload_length > MAX_CONTROL_FRAME_PAYLOAD {
        close_with_protocol_error(shared, control_tx, cfg, "control frame is fragmented or too large").await;
        return Ok(false);
    }

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = header.mask_key {
        mask(&key, 0, &mut payload);
    }

    match header.opcode {
        OpCode::Ping => {
            let _ = send_control(shared, control_tx, OpCode::Pong, payload, cfg.control_write_timeout).await;
            Ok(true)
        }
        OpCode::Pong => Ok(true),
        OpCode::Close => {
            let ce = CloseError::decode(&payload)?;
            let reply_payload = if ce.code == StatusCode::NO_STATUS_RCVD {
                Vec::new()
            } else {
                ce.encode().unwrap_or_default()
            };
            let _ = send_control(shared, control_tx, OpCode::Close, reply_payload, cfg.control_write_timeout).await;
            shared.terminal.latch(Error::Close {
                code: ce.code,
                reason: ce.reason,
            });
            Ok(false)
        }
        _ => unreachable!("only control opcodes reach handle_control"),
    }
}

async fn close_with_protocol_error(
    shared: &Arc<Shared>,
    control_tx: &mpsc::Sender<ControlRequest>,
    cfg: &ConnConfig,
    message: &str,
) {
    let ce = CloseError::new(StatusCode::PROTOCOL_ERROR, message);
    if let Ok(bytes) = ce.encode() {
        let _ = send_control(shared, control_tx, OpCode::Close, bytes, cfg.control_write_timeout).await;
    }
    shared.terminal.latch(Error::Protocol(message.to_string()));
}
