// Agent event loop
//
// One task owns the write half. Outgoing commands are written as they are
// queued and their reply senders parked by packet id. A reader task owns the
// read half and hands over whole packets, so a frame is never abandoned
// halfway through. Replies go to the parked sender; composite event packets
// are decoded and forwarded to the session.

use super::commands::{command_sets, event_commands};
use super::events::parse_event_packet;
use super::protocol::{CommandPacket, Header, PacketKind, ReplyPacket, HEADER_SIZE};
use crate::error::{NativeError, NativeResult};
use crate::native::NativeEvent;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;
const COMMAND_QUEUE: usize = 32;

type ReplySender = oneshot::Sender<NativeResult<ReplyPacket>>;

pub struct CommandRequest {
    pub packet: CommandPacket,
    pub reply_tx: ReplySender,
}

#[derive(Clone, Debug)]
pub struct EventLoopHandle {
    command_tx: mpsc::Sender<CommandRequest>,
}

impl EventLoopHandle {
    /// Send a command and wait for its reply.
    pub async fn send_command(&self, packet: CommandPacket) -> NativeResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(CommandRequest { packet, reply_tx })
            .await
            .map_err(|_| NativeError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| NativeError::ConnectionClosed)?
    }

    /// Queue a command without waiting for its reply.
    pub fn send_detached(&self, packet: CommandPacket) {
        let (reply_tx, _) = oneshot::channel();
        if let Err(e) = self.command_tx.try_send(CommandRequest { packet, reply_tx }) {
            warn!("Failed to queue detached command: {}", e);
        }
    }
}

/// Start the event loop task. Decoded notifications go to `event_tx`.
pub fn spawn_event_loop<R, W>(
    reader: R,
    writer: W,
    event_tx: mpsc::UnboundedSender<NativeEvent>,
) -> EventLoopHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (packet_tx, packet_rx) = mpsc::unbounded_channel();
    tokio::spawn(reader_task(reader, packet_tx));
    tokio::spawn(event_loop_task(writer, command_rx, packet_rx, event_tx));
    EventLoopHandle { command_tx }
}

/// Reads packets until the socket fails or the event loop goes away.
async fn reader_task<R>(mut reader: R, packet_tx: mpsc::UnboundedSender<(Header, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_packet(&mut reader).await {
            Ok(packet) => {
                if packet_tx.send(packet).is_err() {
                    debug!("Event loop gone, reader exiting");
                    break;
                }
            }
            Err(e) => {
                error!("Failed to read packet: {}", e);
                break;
            }
        }
    }
}

async fn event_loop_task<W>(
    mut writer: W,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    mut packet_rx: mpsc::UnboundedReceiver<(Header, Vec<u8>)>,
    event_tx: mpsc::UnboundedSender<NativeEvent>,
) where
    W: AsyncWrite + Unpin,
{
    info!("Agent event loop started");
    let mut pending: HashMap<u32, ReplySender> = HashMap::new();

    loop {
        tokio::select! {
            Some(request) = command_rx.recv() => {
                let packet = &request.packet;
                debug!(
                    "Sending command id={} set={} cmd={}",
                    packet.id, packet.command_set, packet.command
                );
                match write_packet(&mut writer, packet).await {
                    Ok(()) => {
                        pending.insert(packet.id, request.reply_tx);
                    }
                    Err(e) => {
                        error!("Failed to send command {}: {}", packet.id, e);
                        request.reply_tx.send(Err(e)).ok();
                    }
                }
            }

            received = packet_rx.recv() => {
                // The reader only stops on a socket error or EOF
                let Some((header, data)) = received else {
                    break;
                };
                match header.kind {
                    PacketKind::Reply { error_code } => {
                        debug!("Received reply id={}", header.id);
                        match pending.remove(&header.id) {
                            Some(tx) => {
                                tx.send(Ok(ReplyPacket { id: header.id, error_code, data })).ok();
                            }
                            None => warn!("Received reply for unknown command id={}", header.id),
                        }
                    }
                    PacketKind::Command { command_set, command } => {
                        if command_set == command_sets::EVENT
                            && command == event_commands::COMPOSITE
                        {
                            forward_events(&data, &event_tx);
                        } else {
                            warn!(
                                "Ignoring agent command packet set={} cmd={}",
                                command_set, command
                            );
                        }
                    }
                }
            }
        }
    }

    // Waiters see ConnectionClosed once their senders drop here
    info!("Agent event loop stopped ({} replies pending)", pending.len());
}

fn forward_events(data: &[u8], event_tx: &mpsc::UnboundedSender<NativeEvent>) {
    let events = match parse_event_packet(data) {
        Ok(events) => events,
        Err(e) => {
            warn!("Failed to parse event packet: {}", e);
            return;
        }
    };
    debug!("Event packet with {} events", events.len());
    for event in events {
        if event_tx.send(event).is_err() {
            debug!("Event receiver dropped");
            return;
        }
    }
}

async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &CommandPacket,
) -> NativeResult<()> {
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> NativeResult<(Header, Vec<u8>)> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let header = Header::parse(&raw)?;

    if header.length > MAX_PACKET_SIZE {
        return Err(NativeError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            header.length, MAX_PACKET_SIZE
        )));
    }

    let mut data = vec![0u8; header.payload_len()];
    reader.read_exact(&mut data).await?;
    Ok((header, data))
}
