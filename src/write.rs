use crate::connection::Shared;
use crate::error::Error;
use crate::frame::{marshal_header, mask, Header, OpCode, Role};
use crate::message::MessageType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};

/// Submits a control frame (ping response, or the facade's own ping/close) to the write loop.
pub(crate) struct ControlRequest {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub ack: oneshot::Sender<Result<(), Error>>,
}

/// Submits one chunk of the in-flight streaming message.
pub(crate) struct ChunkRequest {
    pub bytes: Vec<u8>,
    pub ack: oneshot::Sender<Result<(), Error>>,
}

/// Finalizes the in-flight streaming message with a fin=1 frame.
pub(crate) struct FlushRequest {
    pub ack: oneshot::Sender<Result<(), Error>>,
}

/// Sender-side handles the facade uses to talk to the write loop.
#[derive(Clone)]
pub(crate) struct WriteChannels {
    pub start_tx: mpsc::Sender<MessageType>,
    pub control_tx: mpsc::Sender<ControlRequest>,
    pub chunk_tx: mpsc::Sender<ChunkRequest>,
    pub flush_tx: mpsc::Sender<FlushRequest>,
}

pub(crate) struct WriteLoopReceivers {
    pub start_rx: mpsc::Receiver<MessageType>,
    pub control_rx: mpsc::Receiver<ControlRequest>,
    pub chunk_rx: mpsc::Receiver<ChunkRequest>,
    pub flush_rx: mpsc::Receiver<FlushRequest>,
}

/// Builds the rendezvous channel pair: the facade/read-loop-facing senders, and the
/// receivers the write loop itself owns.
pub(crate) fn new_channels() -> (WriteChannels, WriteLoopReceivers) {
    let (start_tx, start_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(1);
    let (chunk_tx, chunk_rx) = mpsc::channel(1);
    let (flush_tx, flush_rx) = mpsc::channel(1);
    (
        WriteChannels {
            start_tx,
            control_tx,
            chunk_tx,
            flush_tx,
        },
        WriteLoopReceivers {
            start_rx,
            control_rx,
            chunk_rx,
            flush_rx,
        },
    )
}

fn fresh_mask_key() -> [u8; 4] {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    [
        rng.random::<u8>(),
        rng.random::<u8>(),
        rng.random::<u8>(),
        rng.random::<u8>(),
    ]
}

/// Marshals and writes one complete frame, masking if this connection's role requires it.
async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    role: Role,
    fin: bool,
    opcode: OpCode,
    mut payload: Vec<u8>,
) -> Result<(), Error> {
    let masked = role.masks_outgoing();
    let mask_key = if masked {
        let key = fresh_mask_key();
        mask(&key, 0, &mut payload);
        Some(key)
    } else {
        None
    };

    let header = Header {
        fin,
        rsv1: false,
        rsv2: false,
        rsv3: false,
        opcode,
        masked,
        payload_length: payload.len() as u64,
        mask_key,
    };

    writer.write_all(&marshal_header(&header)).await?;
    writer.write_all(&payload).await?;
    Ok(())
}

/// Writes a single control frame and flushes. Returns false if the loop must exit.
async fn handle_control<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    role: Role,
    shared: &Arc<Shared>,
    req: ControlRequest,
) -> bool {
    let ControlRequest {
        opcode,
        payload,
        ack,
    } = req;
    let result = write_frame(writer, role, true, opcode, payload).await;
    match result {
        Ok(()) => match writer.flush().await {
            Ok(()) => {
                let _ = ack.send(Ok(()));
                true
            }
            Err(e) => {
                shared.terminal.latch(Error::TransportIo(e));
                false
            }
        },
        Err(e) => {
            shared.terminal.latch(e);
            false
        }
    }
}

/// The write loop: sole owner of the buffered output half. Runs until the connection reaches
/// its terminal state or the transport fails.
pub(crate) async fn run<W>(mut writer: BufWriter<W>, role: Role, shared: Arc<Shared>, mut recv: WriteLoopReceivers)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    'idle: loop {
        tokio::select! {
            biased;
            _ = shared.terminal.closed() => break 'idle,
            control = recv.control_rx.recv() => {
                let Some(req) = control else { break 'idle };
                if !handle_control(&mut writer, role, &shared, req).await {
                    break 'idle;
                }
            }
            start = recv.start_rx.recv() => {
                let Some(data_type) = start else { break 'idle };
                let mut first_sent = false;

                'streaming: loop {
                    tokio::select! {
                        biased;
                        _ = shared.terminal.closed() => break 'idle,
                        control = recv.control_rx.recv() => {
                            let Some(req) = control else { break 'idle };
                            if !handle_control(&mut writer, role, &shared, req).await {
                                break 'idle;
                            }
                        }
                        chunk = recv.chunk_rx.recv() => {
                            let Some(ChunkRequest { bytes, ack }) = chunk else { break 'idle };
                            let opcode = if first_sent { OpCode::Continuation } else { data_type.opcode() };
                            match write_frame(&mut writer, role, false, opcode, bytes).await {
                                Ok(()) => {
                                    first_sent = true;
                                    let _ = ack.send(Ok(()));
                                }
                                Err(e) => {
                                    shared.terminal.latch(e);
                                    break 'idle;
                                }
                            }
                        }
                        flush = recv.flush_rx.recv() => {
                            let Some(FlushRequest { ack }) = flush else { break 'idle };
                            let opcode = if first_sent { OpCode::Continuation } else { data_type.opcode() };
                            match write_frame(&mut writer, role, true, opcode, Vec::new()).await {
                                Ok(()) => {
                                    if let Err(e) = writer.flush().await {
                                        shared.terminal.latch(Error::TransportIo(e));
                                        break 'idle;
                                    }
                                    let _ = ack.send(Ok(()));
                                    break 'streaming;
                                }
                                Err(e) => {
                                    shared.terminal.latch(e);
                                    break 'idle;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
}

/// Submits a control frame to the write loop and awaits its ack, bounded by `timeout`. Used
/// both by the read loop (ping responses, mirrored close) and by the facade's own `close()`.
/// A timeout latches the connection terminal, matching the fate of any other control write
/// that can't complete.
pub(crate) async fn send_control(
    shared: &Arc<Shared>,
    control_tx: &mpsc::Sender<ControlRequest>,
    opcode: OpCode,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<(), Error> {
    let (ack_tx, ack_rx) = oneshot::channel();
    let req = ControlRequest {
        opcode,
        payload,
        ack: ack_tx,
    };

    let attempt = async {
        let sent = tokio::select! {
            biased;
            _ = shared.terminal.closed() => return Err(terminal_or(shared)),
            r = control_tx.send(req) => r,
        };
        if sent.is_err() {
            return Err(terminal_or(shared));
        }
        tokio::select! {
            biased;
            _ = shared.terminal.closed() => Err(terminal_or(shared)),
            ack = ack_rx => ack.map_err(Error::from).and_then(|r| r),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_elapsed) => {
            let cause = shared.terminal.latch(Error::Timeout("control frame write timed out".into()));
            Err(Error::Closed(cause))
        }
    }
}

fn terminal_or(shared: &Arc<Shared>) -> Error {
    shared.terminal.cause().unwrap_or(Error::CommunicationError)
}
