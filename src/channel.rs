use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::command::Command;
use crate::config::MAX_BLOCK_SIZE;
use crate::error::ChannelError;

/// Opcode + block number + the largest negotiable payload.
pub const MAX_DATAGRAM_SIZE: usize = 4 + MAX_BLOCK_SIZE as usize;

/// This trait decouples datagram I/O from the handling of a command once it is received.
///
/// It is the channel's entire outward-facing surface to the session layer, passed around as
///  an `Arc<dyn ...>` to minimize coupling.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn on_command(&self, sender: SocketAddr, command: Command);

    /// Transport or parse failure during receive. `sender` is present for malformed
    ///  datagrams (so a session can identify a misbehaving peer) and absent for socket
    ///  level errors, which the OS does not reliably attribute.
    async fn on_error(&self, sender: Option<SocketAddr>, error: ChannelError);
}

/// One received channel notification, for consumers that prefer a queue over a callback.
#[derive(Debug)]
pub enum ChannelEvent {
    Command { sender: SocketAddr, command: Command },
    Error { sender: Option<SocketAddr>, error: ChannelError },
}

/// Adapter forwarding channel callbacks into a bounded queue of [`ChannelEvent`]s, which is
///  how the session consumes a channel: single-threaded, one event at a time.
pub struct ChannelEvents {
    events: mpsc::Sender<ChannelEvent>,
}

impl ChannelEvents {
    pub fn queue(capacity: usize) -> (Arc<ChannelEvents>, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(ChannelEvents { events: tx }), rx)
    }
}

#[async_trait]
impl CommandHandler for ChannelEvents {
    async fn on_command(&self, sender: SocketAddr, command: Command) {
        if self.events.send(ChannelEvent::Command { sender, command }).await.is_err() {
            debug!("event queue is gone - dropping command from {:?}", sender);
        }
    }

    async fn on_error(&self, sender: Option<SocketAddr>, error: ChannelError) {
        if self.events.send(ChannelEvent::Error { sender, error }).await.is_err() {
            debug!("event queue is gone - dropping error event");
        }
    }
}

struct ChannelState {
    open: bool,
    closed: bool,
    remote: Option<SocketAddr>,
    recv_task: Option<JoinHandle<()>>,
}

/// Bridge between datagram I/O and typed commands: owns the UDP socket, runs the receive
///  loop, serializes outgoing commands to the configured remote endpoint.
///
/// The transport stays connectionless: the remote endpoint is default-destination
///  bookkeeping for `send`, and any datagram from any sender is dispatched to the handler
///  with its source endpoint attached, letting the session decide whether to accept it.
pub struct TransferChannel {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn CommandHandler>,
    state: Arc<Mutex<ChannelState>>,
}

impl TransferChannel {
    pub(crate) fn new(socket: UdpSocket, handler: Arc<dyn CommandHandler>) -> TransferChannel {
        TransferChannel {
            socket: Arc::new(socket),
            handler,
            state: Arc::new(Mutex::new(ChannelState {
                open: false,
                closed: false,
                remote: None,
                recv_task: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel state lock poisoned")
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.state().remote
    }

    /// Fails after disposal, and for an endpoint whose address family the channel's
    ///  transport does not support.
    pub fn set_remote_endpoint(&self, remote: SocketAddr) -> Result<(), ChannelError> {
        let mut state = self.state();
        if state.closed {
            return Err(ChannelError::Disposed);
        }
        if remote.is_ipv4() != self.local_addr().is_ipv4() {
            return Err(ChannelError::UnsupportedAddressFamily);
        }
        debug!("remote endpoint set to {:?}", remote);
        state.remote = Some(remote);
        Ok(())
    }

    /// Arms the receive loop. A no-op if the loop is already armed, an error after disposal.
    pub fn open(&self) -> Result<(), ChannelError> {
        let mut state = self.state();
        if state.closed {
            return Err(ChannelError::Disposed);
        }
        if state.open {
            return Ok(());
        }
        state.open = true;

        let socket = self.socket.clone();
        let handler = self.handler.clone();
        let shared_state = self.state.clone();
        state.recv_task = Some(tokio::spawn(async move {
            Self::recv_loop(socket, handler, shared_state).await;
        }));
        Ok(())
    }

    /// One receive outstanding at a time, re-armed after every completion including
    ///  failures: a single malformed datagram or transport error must not terminate the
    ///  loop. The liveness check runs under the state lock so a disposal racing with a
    ///  completed receive is observed before anything is dispatched.
    async fn recv_loop(
        socket: Arc<UdpSocket>,
        handler: Arc<dyn CommandHandler>,
        state: Arc<Mutex<ChannelState>>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    if state.lock().expect("channel state lock poisoned").closed {
                        return;
                    }
                    error!("socket error: {}", e);
                    handler.on_error(None, ChannelError::Io(e)).await;
                    continue;
                }
            };

            {
                let state = state.lock().expect("channel state lock poisoned");
                if state.closed {
                    return;
                }
            }

            trace!("received {} bytes from {:?}", num_read, from);

            let parse_buf = &mut &buf[..num_read];
            match Command::deser(parse_buf) {
                Ok(command) => {
                    handler.on_command(from, command).await;
                }
                Err(e) => {
                    warn!("received malformed datagram from {:?} - dropping: {}", from, e);
                    handler.on_error(Some(from), ChannelError::Parse(e)).await;
                }
            }
        }
    }

    /// Serializes the command and writes it to the configured remote endpoint.
    ///
    /// Not internally serialized against concurrent sends: the session is stop-and-wait by
    ///  construction and never has more than one command in flight.
    pub async fn send(&self, command: &Command) -> Result<(), ChannelError> {
        let remote = {
            let state = self.state();
            if state.closed {
                return Err(ChannelError::Disposed);
            }
            state.remote.ok_or(ChannelError::NotConnected)?
        };

        let mut buf = BytesMut::new();
        command.ser(&mut buf);

        trace!("sending {:?} to {:?}", command.opcode(), remote);
        self.socket.send_to(&buf, remote).await?;
        Ok(())
    }

    /// Closes the channel exactly once; subsequent calls are no-ops. After this returns, no
    ///  further command events are dispatched.
    pub fn close(&self) {
        let recv_task = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.recv_task.take()
        };
        if let Some(task) = recv_task {
            task.abort();
        }
        debug!("channel on {:?} closed", self.local_addr());
    }
}

impl Drop for TransferChannel {
    fn drop(&mut self) {
        self.close();
    }
}
