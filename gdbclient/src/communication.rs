/// Transport layer for the GDB Remote Serial Protocol
///
/// This module owns the connection to the remote stub: it frames and writes
/// commands one at a time, runs the background receive loop, acknowledges
/// inbound packets and routes stop notifications out as events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::correlator::{CommandCorrelator, CommandKind, Dispatch};
use crate::packet::{Packet, PacketError};
use crate::reassembler::{Inbound, StreamReassembler};

/// The byte a stub treats as an asynchronous break request
pub const INTERRUPT: u8 = 0x03;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("Command cancelled")]
    Cancelled,
    #[error("Not connected to the remote stub")]
    Disconnected,
    #[error("Failed to write to the remote stub: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Notifications from the receive loop
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An `S`/`T` packet arrived
    Stop(Packet),
    /// A continue/step command was accepted
    Resumed,
    /// The stream closed or failed; the session is unusable
    ConnectionLost,
}

/// Timing and retry knobs for a transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub resume_timeout: Duration,
    pub command_timeout: Duration,
    pub max_retransmits: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            resume_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(10),
            max_retransmits: 3,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct Retransmit {
    last_sent: Option<Vec<u8>>,
    attempts: u32,
}

struct Shared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    exec_lock: tokio::sync::Mutex<()>,
    correlator: CommandCorrelator,
    retransmit: Mutex<Retransmit>,
    connected: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    event_sender: mpsc::UnboundedSender<TransportEvent>,
    options: TransportOptions,
}

/// Cloneable handle to one connection
#[derive(Clone)]
pub struct TransportSession {
    shared: Arc<Shared>,
}

/// Removes a command from the correlator when its waiter goes away,
/// whether it completed, timed out or was cancelled
struct PendingGuard<'a> {
    correlator: &'a CommandCorrelator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

impl TransportSession {
    /// Connect to a stub over TCP
    pub async fn connect(
        host: &str,
        port: u16,
        options: TransportOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        log::info!("Connecting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        log::info!("Connected to {}:{}", host, port);
        Self::attach(stream, options).await
    }

    /// Run the protocol over an already open stream, start the receive loop
    /// and ask the stub why it is halted. The `?` reply arrives as a stop event.
    pub async fn attach<S>(
        stream: S,
        options: TransportOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let session = TransportSession {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
                exec_lock: tokio::sync::Mutex::new(()),
                correlator: CommandCorrelator::new(),
                retransmit: Mutex::new(Retransmit::default()),
                connected: AtomicBool::new(true),
                reader_task: Mutex::new(None),
                event_sender,
                options,
            }),
        };

        let handle = tokio::spawn(receive_loop(Arc::clone(&session.shared), reader));
        *session.shared.reader_task.lock().unwrap() = Some(handle);

        session.send_packet("?").await?;
        Ok((session, event_receiver))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &TransportOptions {
        &self.shared.options
    }

    /// Send a command and wait for its reply, using the resume timeout for
    /// continue/step and the command timeout for everything else
    pub async fn send_command(&self, command: &str) -> Result<Packet> {
        let timeout = if CommandKind::classify(command).is_resume() {
            self.shared.options.resume_timeout
        } else {
            self.shared.options.command_timeout
        };
        self.send_command_with_timeout(command, timeout).await
    }

    /// Send a command and wait for its reply. Only one command is on the wire
    /// at any time; later callers queue on the execution lock.
    pub async fn send_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Packet> {
        self.ensure_connected()?;
        let packet = Packet::new(command)?;

        let _exec = self.shared.exec_lock.lock().await;
        self.ensure_connected()?;

        let (id, receiver) = self.shared.correlator.submit(command);
        let _guard = PendingGuard {
            correlator: &self.shared.correlator,
            id,
        };

        log::debug!("SEND[{}]: {}", id, command);
        self.write_packet(&packet).await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(reply))) => {
                log::debug!("RECV[{}]: {}", id, abbreviate(reply.payload()));
                Ok(reply)
            }
            Ok(Ok(Err(e))) => {
                log::debug!("RECV[{}]: FAILED -> {}", id, e);
                Err(e)
            }
            Ok(Err(_)) => Err(TransportError::Cancelled),
            Err(_) => {
                log::warn!("SEND[{}]: '{}' timed out after {:?}", id, command, timeout);
                Err(TransportError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Write a framed packet without waiting for a reply
    pub async fn send_packet(&self, payload: &str) -> Result<()> {
        self.ensure_connected()?;
        let packet = Packet::new(payload)?;
        log::debug!("SEND: {} (no reply expected)", payload);
        self.write_packet(&packet).await
    }

    /// Write the raw break byte. It bypasses framing and the execution lock.
    pub async fn send_interrupt(&self) -> Result<()> {
        self.ensure_connected()?;
        log::debug!("SEND: <interrupt>");
        self.shared.write_raw(&[INTERRUPT]).await
    }

    /// Commands still awaiting a reply, oldest first
    pub fn pending_commands(&self) -> Vec<String> {
        self.shared.correlator.pending_commands()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Stop the receive loop, close the stream and cancel every pending
    /// command. Calling it again is a no-op.
    pub async fn dispose(&self) {
        let was_connected = self.shared.connected.swap(false, Ordering::SeqCst);

        if let Some(handle) = self.shared.reader_task.lock().unwrap().take() {
            handle.abort();
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let cancelled = self.shared.correlator.cancel_all(|| TransportError::Cancelled);
        if was_connected {
            log::info!("Transport closed, {} pending command(s) cancelled", cancelled);
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode();
        {
            let mut retransmit = self.shared.retransmit.lock().unwrap();
            retransmit.last_sent = Some(bytes.clone());
            retransmit.attempts = 0;
        }
        self.shared.write_raw(&bytes).await
    }
}

impl Shared {
    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::Disconnected)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn handle_inbound(&self, item: Inbound) {
        match item {
            Inbound::Ack => {
                {
                    let mut retransmit = self.retransmit.lock().unwrap();
                    retransmit.last_sent = None;
                    retransmit.attempts = 0;
                }
                if self.correlator.on_ack() {
                    let _ = self.event_sender.send(TransportEvent::Resumed);
                }
            }
            Inbound::Nack => self.retransmit_last().await,
            Inbound::Packet(packet) => {
                if let Err(e) = self.write_raw(b"+").await {
                    log::warn!("Failed to acknowledge packet: {}", e);
                }
                log::trace!("RECV: {}", abbreviate(packet.payload()));

                match self.correlator.on_packet(packet) {
                    Dispatch::Stop(packet) => {
                        log::debug!("STOP: {}", packet.payload());
                        let _ = self.event_sender.send(TransportEvent::Stop(packet));
                    }
                    Dispatch::Resumed { .. } => {
                        let _ = self.event_sender.send(TransportEvent::Resumed);
                    }
                    _ => {}
                }
            }
            Inbound::Corrupt { .. } => {
                if let Err(e) = self.write_raw(b"-").await {
                    log::warn!("Failed to request retransmission: {}", e);
                }
            }
        }
    }

    async fn retransmit_last(&self) {
        let (bytes, attempt) = {
            let mut retransmit = self.retransmit.lock().unwrap();
            let Some(last) = retransmit.last_sent.clone() else {
                log::debug!("NACK received with nothing to resend");
                return;
            };
            if retransmit.attempts >= self.options.max_retransmits {
                log::warn!(
                    "NACK received but retransmit limit ({}) reached, dropping",
                    self.options.max_retransmits
                );
                return;
            }
            retransmit.attempts += 1;
            (last, retransmit.attempts)
        };

        log::warn!(
            "NACK received, resending {} (attempt {}/{})",
            String::from_utf8_lossy(&bytes),
            attempt,
            self.options.max_retransmits
        );
        if let Err(e) = self.write_raw(&bytes).await {
            log::warn!("Retransmission failed: {}", e);
        }
    }

    async fn connection_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();

        let cancelled = self.correlator.cancel_all(|| TransportError::Disconnected);
        if cancelled > 0 {
            log::warn!("{} pending command(s) failed by disconnect", cancelled);
        }
        let _ = self.event_sender.send(TransportEvent::ConnectionLost);
    }
}

async fn receive_loop<S>(shared: Arc<Shared>, mut reader: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    log::debug!("RSP receive loop started");
    let mut reassembler = StreamReassembler::new();
    let mut buf = vec![0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("Remote stub closed the connection");
                break;
            }
            Ok(n) => {
                for item in reassembler.feed(&buf[..n]) {
                    shared.handle_inbound(item).await;
                }
            }
            Err(e) => {
                log::error!("RSP read error: {}", e);
                break;
            }
        }
    }

    shared.connection_lost().await;
    log::debug!("RSP receive loop finished");
}

fn abbreviate(payload: &str) -> String {
    const LIMIT: usize = 64;
    if payload.len() <= LIMIT {
        payload.to_string()
    } else {
        let cut = (0..=LIMIT).rev().find(|i| payload.is_char_boundary(*i)).unwrap_or(0);
        format!("{}... ({} bytes)", &payload[..cut], payload.len())
    }
}
