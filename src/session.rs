use std::cmp::min;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelEvent, ChannelEvents, TransferChannel};
use crate::command::{BlockId, Command, ErrorCode, TransferMode};
use crate::config::{TransferConfig, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{ChannelError, TransferError};
use crate::factory::ChannelFactory;
use crate::store::{FileStore, StoreError};

const EVENT_QUEUE_CAPACITY: usize = 32;
const BLOCK_SIZE_OPTION: &str = "blksize";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    AwaitingFirstContact,
    Transferring,
    Completed,
    Failed,
}

/// Drives a single read or write transfer to a terminal state: negotiates options,
///  sequences data blocks stop-and-wait, retransmits on timeout, detects completion and
///  terminal errors.
///
/// The session consumes the channel's event queue single-threaded, so receive completions
///  and retry timeouts cannot race each other: a late ack and a timeout-triggered
///  retransmission serialize through the same loop.
pub struct TransferSession {
    channel: Arc<TransferChannel>,
    events: mpsc::Receiver<ChannelEvent>,
    config: TransferConfig,
    state: SessionState,
    /// the peer this transfer is pinned to after first contact; datagrams from any other
    ///  source are ignored from then on
    peer: Option<SocketAddr>,
    /// the effective payload size per Data command, after option negotiation
    block_size: u16,
    /// true between sending a request with options and learning whether the peer
    ///  negotiates (Option-Acknowledgment) or silently declines (plain old answer)
    negotiation_pending: bool,
}

impl TransferSession {
    /// A client-side session targeting `remote`: ephemeral local endpoint, remote endpoint
    ///  fixed at construction.
    pub async fn connect(remote: SocketAddr, config: TransferConfig) -> Result<TransferSession, TransferError> {
        config.validate().map_err(|e| TransferError::Config(e.to_string()))?;

        let (handler, events) = ChannelEvents::queue(EVENT_QUEUE_CAPACITY);
        let channel = Arc::new(ChannelFactory::create_connection(remote, handler).await?);
        channel.open()?;
        Ok(TransferSession::new(channel, events, config))
    }

    fn new(
        channel: Arc<TransferChannel>,
        events: mpsc::Receiver<ChannelEvent>,
        config: TransferConfig,
    ) -> TransferSession {
        TransferSession {
            channel,
            events,
            config,
            state: SessionState::Idle,
            peer: None,
            block_size: DEFAULT_BLOCK_SIZE,
            negotiation_pending: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Requests `filename` from the peer and returns its contents.
    pub async fn download(&mut self, filename: &str, mode: TransferMode) -> Result<Vec<u8>, TransferError> {
        self.start_client()?;

        let options = self.request_options();
        self.negotiation_pending = !options.is_empty();
        let request = Command::ReadRequest { filename: filename.to_string(), mode, options };
        self.channel.send(&request).await?;
        debug!("requested read of {:?} from {:?}", filename, self.channel.remote_endpoint());

        let contents = self.recv_data_phase(request).await?;
        self.state = SessionState::Completed;
        info!("read transfer of {:?} completed: {} bytes", filename, contents.len());
        Ok(contents)
    }

    /// Sends `contents` to the peer as `filename`.
    pub async fn upload(&mut self, filename: &str, mode: TransferMode, contents: &[u8]) -> Result<(), TransferError> {
        self.start_client()?;

        let options = self.request_options();
        let negotiating = !options.is_empty();
        let request = Command::WriteRequest { filename: filename.to_string(), mode, options };
        self.channel.send(&request).await?;
        debug!("requested write of {:?} to {:?}", filename, self.channel.remote_endpoint());

        // the handshake: an ack of block 0 or an Option-Acknowledgment opens the data phase
        loop {
            let (sender, command) = self.next_command(&request).await?;
            match command {
                Command::Ack { block } if block == BlockId::ZERO => {
                    self.pin_peer(sender)?;
                    if negotiating {
                        debug!("peer ignored the requested options, continuing with the standard block size");
                    }
                    break;
                }
                Command::OptionAck { options } if negotiating => {
                    self.pin_peer(sender)?;
                    self.apply_negotiated_options(&options).await?;
                    break;
                }
                other => {
                    return self
                        .protocol_error(format!("unexpected {:?} answering a write request", other.opcode()))
                        .await;
                }
            }
        }

        self.send_data_phase(contents).await?;
        self.state = SessionState::Completed;
        info!("write transfer of {:?} completed: {} bytes", filename, contents.len());
        Ok(())
    }

    /// Serves one transfer on a server channel: waits for the first request from any peer,
    ///  pins that peer, then drives the mirror image of the client state machine.
    pub(crate) async fn serve(&mut self, store: Arc<dyn FileStore>) -> Result<(), TransferError> {
        // a server session is reusable, one transfer at a time
        self.state = SessionState::AwaitingFirstContact;
        self.peer = None;
        self.block_size = DEFAULT_BLOCK_SIZE;
        self.negotiation_pending = false;

        let (sender, command) = self.wait_first_contact().await?;
        match command {
            Command::ReadRequest { filename, mode, options } => {
                self.pin_peer(sender)?;
                debug!("read request for {:?} ({:?}) from {:?}", filename, mode, sender);
                self.serve_read(store, &filename, &options).await
            }
            Command::WriteRequest { filename, mode, options } => {
                self.pin_peer(sender)?;
                debug!("write request for {:?} ({:?}) from {:?}", filename, mode, sender);
                self.serve_write(store, &filename, &options).await
            }
            other => {
                // answer the sender even though it never becomes the session's peer
                let _ = self.channel.set_remote_endpoint(sender);
                self.protocol_error(format!("expected a request command, got {:?}", other.opcode()))
                    .await
            }
        }
    }

    fn start_client(&mut self) -> Result<(), TransferError> {
        if self.state != SessionState::Idle {
            return Err(TransferError::Protocol("session was already used for a transfer".to_string()));
        }
        self.state = SessionState::AwaitingFirstContact;
        Ok(())
    }

    fn request_options(&self) -> Vec<(String, String)> {
        if self.config.block_size != DEFAULT_BLOCK_SIZE {
            vec![(BLOCK_SIZE_OPTION.to_string(), self.config.block_size.to_string())]
        }
        else {
            Vec::new()
        }
    }

    /// First valid contact fixes the transfer's peer: the channel's remote endpoint is set
    ///  to the source address, and everything else is ignored from then on.
    fn pin_peer(&mut self, sender: SocketAddr) -> Result<(), TransferError> {
        if self.peer.is_some() {
            return Ok(());
        }
        debug!("first contact from {:?} - pinning the transfer to this peer", sender);
        self.channel.set_remote_endpoint(sender)?;
        self.peer = Some(sender);
        self.state = SessionState::Transferring;
        Ok(())
    }

    /// Waits for the next command from the pinned peer, retransmitting `last_sent` whenever
    ///  the retry timeout elapses, within the configured retry budget.
    ///
    /// Channel-level errors (malformed datagrams, transport hiccups) are logged and do not
    ///  terminate the session - only the retry budget or a peer Error command does. An
    ///  Error command is intercepted here since it is terminal in every state.
    async fn next_command(&mut self, last_sent: &Command) -> Result<(SocketAddr, Command), TransferError> {
        let mut retries = 0;
        loop {
            match timeout(self.config.retry_timeout, self.events.recv()).await {
                Err(_elapsed) => {
                    if retries >= self.config.max_retries {
                        self.state = SessionState::Failed;
                        return Err(TransferError::Timeout { retries });
                    }
                    retries += 1;
                    debug!(
                        "no answer within {:?} - retransmitting {:?} ({}/{})",
                        self.config.retry_timeout, last_sent.opcode(), retries, self.config.max_retries
                    );
                    self.channel.send(last_sent).await?;
                }
                Ok(None) => {
                    self.state = SessionState::Failed;
                    return Err(TransferError::Channel(ChannelError::Disposed));
                }
                Ok(Some(ChannelEvent::Error { sender, error })) => {
                    debug!("channel reported {} (from {:?}) - session continues", error, sender);
                }
                Ok(Some(ChannelEvent::Command { sender, command })) => {
                    if let Some(peer) = self.peer {
                        if sender != peer {
                            debug!("ignoring datagram from unrelated peer {:?}", sender);
                            continue;
                        }
                    }
                    if let Command::Error { code, message } = command {
                        warn!("peer terminated the transfer: {:?} {:?}", code, message);
                        self.state = SessionState::Failed;
                        return Err(TransferError::Peer { code, message });
                    }
                    return Ok((sender, command));
                }
            }
        }
    }

    /// The server side of first contact: no timeout and nothing to retransmit, a server
    ///  waits as long as it takes for a request to arrive.
    async fn wait_first_contact(&mut self) -> Result<(SocketAddr, Command), TransferError> {
        loop {
            match self.events.recv().await {
                None => {
                    self.state = SessionState::Failed;
                    return Err(TransferError::Channel(ChannelError::Disposed));
                }
                Some(ChannelEvent::Error { sender, error }) => {
                    debug!("channel reported {} (from {:?}) while awaiting first contact", error, sender);
                }
                Some(ChannelEvent::Command { sender, command }) => {
                    return Ok((sender, command));
                }
            }
        }
    }

    /// Receiving side of the data phase (client read / server write): collect in-order
    ///  blocks, acknowledge each, finish on the first block shorter than the negotiated
    ///  size. `last_sent` is whatever opened this phase and is what a timeout retransmits
    ///  until the first block arrives.
    async fn recv_data_phase(&mut self, mut last_sent: Command) -> Result<Vec<u8>, TransferError> {
        let mut expected = BlockId::from_raw(1);
        let mut contents = Vec::new();
        loop {
            let (sender, command) = self.next_command(&last_sent).await?;
            match command {
                Command::Data { block, payload } => {
                    self.pin_peer(sender)?;
                    if block == expected {
                        self.negotiation_pending = false;
                        contents.extend_from_slice(&payload);
                        let ack = Command::Ack { block };
                        self.channel.send(&ack).await?;
                        trace!("block {} accepted ({} bytes)", block, payload.len());

                        let finished = payload.len() < self.block_size as usize;
                        expected = expected.next();
                        last_sent = ack;
                        if finished {
                            return Ok(contents);
                        }
                    }
                    else if block == expected.prev() {
                        // the peer did not see our ack and resent the block: re-acknowledge,
                        // do not advance
                        debug!("duplicate of block {} - re-acknowledging", block);
                        self.channel.send(&Command::Ack { block }).await?;
                    }
                    else {
                        return self
                            .protocol_error(format!("unexpected data block {} while expecting {}", block, expected))
                            .await;
                    }
                }
                Command::OptionAck { options } if self.negotiation_pending => {
                    self.pin_peer(sender)?;
                    self.negotiation_pending = false;
                    self.apply_negotiated_options(&options).await?;
                    let ack = Command::Ack { block: BlockId::ZERO };
                    self.channel.send(&ack).await?;
                    last_sent = ack;
                }
                other => {
                    return self
                        .protocol_error(format!("unexpected {:?} during the data phase", other.opcode()))
                        .await;
                }
            }
        }
    }

    /// Sending side of the data phase (client write / server read): send one block, wait
    ///  for its ack, advance. The final block is the first one shorter than the negotiated
    ///  size - a transfer of an exact multiple ends with an empty block.
    async fn send_data_phase(&mut self, contents: &[u8]) -> Result<(), TransferError> {
        let block_size = self.block_size as usize;
        let mut block = BlockId::from_raw(1);
        let mut offset = 0usize;
        loop {
            let end = min(offset + block_size, contents.len());
            let chunk = &contents[offset..end];
            let data = Command::Data { block, payload: chunk.to_vec() };
            self.channel.send(&data).await?;
            trace!("sent block {} ({} bytes)", block, chunk.len());

            loop {
                let (_sender, command) = self.next_command(&data).await?;
                match command {
                    Command::Ack { block: acked } if acked == block => break,
                    Command::Ack { block: acked } if acked == block.prev() => {
                        // stale ack from the previous exchange, the peer has not seen this
                        // block yet - keep waiting, the retry timer covers the resend
                        trace!("stale ack for {} - still waiting for {}", acked, block);
                    }
                    other => {
                        return self
                            .protocol_error(format!(
                                "unexpected {:?} while waiting for the ack of block {}",
                                other.opcode(),
                                block
                            ))
                            .await;
                    }
                }
            }

            offset = end;
            let finished = chunk.len() < block_size;
            block = block.next();
            if finished {
                return Ok(());
            }
        }
    }

    async fn serve_read(
        &mut self,
        store: Arc<dyn FileStore>,
        filename: &str,
        options: &[(String, String)],
    ) -> Result<(), TransferError> {
        let contents = match store.read(filename) {
            Ok(contents) => contents,
            Err(e) => return self.store_error(e).await,
        };

        if let Some(option_ack) = self.grant_options(options) {
            self.channel.send(&option_ack).await?;
            // the client confirms the negotiated options with an ack of block 0
            loop {
                let (_sender, command) = self.next_command(&option_ack).await?;
                match command {
                    Command::Ack { block } if block == BlockId::ZERO => break,
                    other => {
                        return self
                            .protocol_error(format!(
                                "expected the ack of the option negotiation, got {:?}",
                                other.opcode()
                            ))
                            .await;
                    }
                }
            }
        }

        self.send_data_phase(&contents).await?;
        self.state = SessionState::Completed;
        info!("served read of {:?}: {} bytes", filename, contents.len());
        Ok(())
    }

    async fn serve_write(
        &mut self,
        store: Arc<dyn FileStore>,
        filename: &str,
        options: &[(String, String)],
    ) -> Result<(), TransferError> {
        if let Err(e) = store.create(filename) {
            return self.store_error(e).await;
        }

        let opening = self.grant_options(options).unwrap_or(Command::Ack { block: BlockId::ZERO });
        self.channel.send(&opening).await?;

        let contents = self.recv_data_phase(opening).await?;
        let num_bytes = contents.len();
        if let Err(e) = store.write(filename, contents) {
            return self.store_error(e).await;
        }
        self.state = SessionState::Completed;
        info!("served write of {:?}: {} bytes", filename, num_bytes);
        Ok(())
    }

    /// Applies an Option-Acknowledgment on the requesting side. A granted block size must
    ///  not exceed the requested one - a peer negotiating upwards is a protocol violation.
    async fn apply_negotiated_options(&mut self, options: &[(String, String)]) -> Result<(), TransferError> {
        for (name, value) in options {
            if name.eq_ignore_ascii_case(BLOCK_SIZE_OPTION) {
                let requested = self.config.block_size;
                match value.parse::<u16>() {
                    Ok(granted) if granted >= MIN_BLOCK_SIZE && granted <= requested => {
                        debug!("peer granted block size {}", granted);
                        self.block_size = granted;
                    }
                    _ => {
                        let msg = format!(
                            "unacceptable negotiated block size {:?} (requested {})",
                            value, requested
                        );
                        warn!("{}", msg);
                        self.state = SessionState::Failed;
                        let error = Command::Error {
                            code: ErrorCode::OPTION_NEGOTIATION_FAILED,
                            message: msg.clone(),
                        };
                        if let Err(e) = self.channel.send(&error).await {
                            debug!("could not send error command: {}", e);
                        }
                        return Err(TransferError::Protocol(msg));
                    }
                }
            }
            else {
                debug!("ignoring unknown negotiated option {:?}", name);
            }
        }
        Ok(())
    }

    /// Decides the granting side of option negotiation. The configured block size acts as
    ///  the cap for requesting clients; unusable or unsupported options are ignored rather
    ///  than rejected, per the negotiation rules.
    fn grant_options(&mut self, requested: &[(String, String)]) -> Option<Command> {
        let mut granted = Vec::new();
        for (name, value) in requested {
            if name.eq_ignore_ascii_case(BLOCK_SIZE_OPTION) {
                match value.parse::<u16>() {
                    Ok(req) if req >= MIN_BLOCK_SIZE => {
                        let effective = min(req, self.config.block_size);
                        debug!("granting block size {} (requested {})", effective, req);
                        self.block_size = effective;
                        granted.push((BLOCK_SIZE_OPTION.to_string(), effective.to_string()));
                    }
                    _ => warn!("ignoring unusable block size option {:?}", value),
                }
            }
            else {
                debug!("ignoring unsupported option {:?}", name);
            }
        }

        if granted.is_empty() {
            None
        }
        else {
            Some(Command::OptionAck { options: granted })
        }
    }

    /// Terminal protocol violation: best effort Error command to the peer, then fail.
    async fn protocol_error<T>(&mut self, msg: String) -> Result<T, TransferError> {
        warn!("{}", msg);
        self.state = SessionState::Failed;
        let error = Command::Error { code: ErrorCode::ILLEGAL_OPERATION, message: msg.clone() };
        if let Err(e) = self.channel.send(&error).await {
            debug!("could not send error command: {}", e);
        }
        Err(TransferError::Protocol(msg))
    }

    /// Store rejection: answer the peer with the store's wire-level error code, then fail.
    async fn store_error<T>(&mut self, e: StoreError) -> Result<T, TransferError> {
        warn!("store rejected the transfer: {}", e);
        self.state = SessionState::Failed;
        let error = Command::Error { code: e.code, message: e.message.clone() };
        if let Err(send_err) = self.channel.send(&error).await {
            debug!("could not send error command: {}", send_err);
        }
        Err(TransferError::Store(e))
    }
}

/// A server channel bound to a well-known port plus the session serving it, one transfer
///  at a time.
pub struct TransferServer {
    session: TransferSession,
    store: Arc<dyn FileStore>,
}

impl TransferServer {
    pub async fn bind(
        local: SocketAddr,
        store: Arc<dyn FileStore>,
        config: TransferConfig,
    ) -> Result<TransferServer, TransferError> {
        config.validate().map_err(|e| TransferError::Config(e.to_string()))?;

        let (handler, events) = ChannelEvents::queue(EVENT_QUEUE_CAPACITY);
        let channel = Arc::new(ChannelFactory::create_server(local, handler).await?);
        channel.open()?;
        Ok(TransferServer {
            session: TransferSession::new(channel, events, config),
            store,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.session.channel.local_addr()
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Serves exactly one transfer: waits for the next request, pins that peer, drives the
    ///  transfer to a terminal state.
    pub async fn serve_once(&mut self) -> Result<(), TransferError> {
        self.session.serve(self.store.clone()).await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::net::UdpSocket;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::store::MemoryStore;

    use super::*;

    fn fast_config() -> TransferConfig {
        TransferConfig {
            retry_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn spawn_server(
        store: Arc<MemoryStore>,
        config: TransferConfig,
    ) -> (SocketAddr, JoinHandle<Result<(), TransferError>>) {
        let mut server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), store, config)
            .await
            .unwrap();
        let addr = server.local_addr();
        let handle = tokio::spawn(async move { server.serve_once().await });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_download_single_block() {
        let store = Arc::new(MemoryStore::new());
        store.write("test.txt", b"hello tftp".to_vec()).unwrap();
        let (addr, server) = spawn_server(store, fast_config()).await;

        let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
        let contents = session.download("test.txt", TransferMode::Octet).await.unwrap();

        assert_eq!(contents, b"hello tftp");
        assert_eq!(session.state(), SessionState::Completed);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_multi_block() {
        let expected: Vec<u8> = (0..1200).map(|i| (i % 251) as u8).collect();
        let store = Arc::new(MemoryStore::new());
        store.write("big.bin", expected.clone()).unwrap();
        let (addr, server) = spawn_server(store, fast_config()).await;

        let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
        let contents = session.download("big.bin", TransferMode::Octet).await.unwrap();

        assert_eq!(contents, expected);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_exact_block_multiple_needs_empty_final_block() {
        let expected = vec![0x5a_u8; 1024];
        let store = Arc::new(MemoryStore::new());
        store.write("even.bin", expected.clone()).unwrap();
        let (addr, server) = spawn_server(store, fast_config()).await;

        let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
        let contents = session.download("even.bin", TransferMode::Octet).await.unwrap();

        assert_eq!(contents, expected);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upload_roundtrip() {
        let expected: Vec<u8> = (0..700).map(|i| (i % 97) as u8).collect();
        let store = Arc::new(MemoryStore::new());
        let (addr, server) = spawn_server(store.clone(), fast_config()).await;

        let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
        session.upload("up.bin", TransferMode::Octet, &expected).await.unwrap();

        server.await.unwrap().unwrap();
        assert_eq!(store.get("up.bin").unwrap(), expected);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let store = Arc::new(MemoryStore::new());
        let (addr, server) = spawn_server(store, fast_config()).await;

        let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
        let result = session.download("missing.txt", TransferMode::Octet).await;

        match result {
            Err(TransferError::Peer { code, .. }) => assert_eq!(code, ErrorCode::FILE_NOT_FOUND),
            other => panic!("expected peer error, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(server.await.unwrap(), Err(TransferError::Store(_))));
    }

    #[tokio::test]
    async fn test_upload_existing_file_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.write("taken.txt", b"old".to_vec()).unwrap();
        let (addr, server) = spawn_server(store, fast_config()).await;

        let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
        let result = session.upload("taken.txt", TransferMode::Octet, b"new").await;

        match result {
            Err(TransferError::Peer { code, .. }) => assert_eq!(code, ErrorCode::FILE_EXISTS),
            other => panic!("expected peer error, got {:?}", other),
        }
        assert!(matches!(server.await.unwrap(), Err(TransferError::Store(_))));
    }

    #[tokio::test]
    async fn test_download_with_negotiated_block_size() {
        let expected: Vec<u8> = (0..1500).map(|i| (i % 233) as u8).collect();
        let store = Arc::new(MemoryStore::new());
        store.write("big.bin", expected.clone()).unwrap();

        let server_config = TransferConfig { block_size: 2048, ..fast_config() };
        let (addr, server) = spawn_server(store, server_config).await;

        let client_config = TransferConfig { block_size: 1024, ..fast_config() };
        let mut session = TransferSession::connect(addr, client_config).await.unwrap();
        let contents = session.download("big.bin", TransferMode::Octet).await.unwrap();

        assert_eq!(contents, expected);
        assert_eq!(session.block_size, 1024);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_clamps_negotiated_block_size() {
        let expected = vec![1_u8; 600];
        let store = Arc::new(MemoryStore::new());
        store.write("f.bin", expected.clone()).unwrap();
        let (addr, server) = spawn_server(store, fast_config()).await; // server cap: 512

        let client_config = TransferConfig { block_size: 8192, ..fast_config() };
        let mut session = TransferSession::connect(addr, client_config).await.unwrap();
        let contents = session.download("f.bin", TransferMode::Octet).await.unwrap();

        assert_eq!(contents, expected);
        assert_eq!(session.block_size, 512);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upload_with_negotiated_block_size() {
        let expected: Vec<u8> = (0..1100).map(|i| (i % 111) as u8).collect();
        let store = Arc::new(MemoryStore::new());
        let server_config = TransferConfig { block_size: 2048, ..fast_config() };
        let (addr, server) = spawn_server(store.clone(), server_config).await;

        let client_config = TransferConfig { block_size: 1024, ..fast_config() };
        let mut session = TransferSession::connect(addr, client_config).await.unwrap();
        session.upload("up.bin", TransferMode::Octet, &expected).await.unwrap();

        server.await.unwrap().unwrap();
        assert_eq!(store.get("up.bin").unwrap(), expected);
        assert_eq!(session.block_size, 1024);
    }

    #[tokio::test]
    async fn test_client_retransmits_lost_request() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();

        let config = TransferConfig {
            retry_timeout: Duration::from_millis(100),
            max_retries: 3,
            ..Default::default()
        };
        let client = tokio::spawn(async move {
            let mut session = TransferSession::connect(addr, config).await.unwrap();
            session.download("test.txt", TransferMode::Octet).await
        });

        let mut buf = [0u8; 2048];

        // drop the first request on the floor
        let (n, _) = raw.recv_from(&mut buf).await.unwrap();
        let first_request = buf[..n].to_vec();

        // the retry timer fires: exactly one retransmission, identical to the original
        let (n, from) = raw.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], first_request.as_slice());

        // now answer - a single short block completes the transfer
        let mut reply = BytesMut::new();
        Command::Data { block: BlockId::from_raw(1), payload: b"done".to_vec() }.ser(&mut reply);
        raw.send_to(&reply, from).await.unwrap();

        let (n, _) = raw.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x04\x00\x01");

        assert_eq!(client.await.unwrap().unwrap(), b"done");
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_a_timeout() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();

        let config = TransferConfig {
            retry_timeout: Duration::from_millis(50),
            max_retries: 2,
            ..Default::default()
        };
        let client = tokio::spawn(async move {
            let mut session = TransferSession::connect(addr, config).await.unwrap();
            session.download("test.txt", TransferMode::Octet).await
        });

        // initial request plus two retransmissions, then the peer stays silent
        let mut buf = [0u8; 2048];
        for _ in 0..3 {
            raw.recv_from(&mut buf).await.unwrap();
        }

        match client.await.unwrap() {
            Err(TransferError::Timeout { retries }) => assert_eq!(retries, 2),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_error_fails_the_session_and_silences_the_client() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
            session.download("test.txt", TransferMode::Octet).await
        });

        let mut buf = [0u8; 2048];
        let (_, from) = raw.recv_from(&mut buf).await.unwrap();

        let mut reply = BytesMut::new();
        Command::Error { code: ErrorCode::FILE_NOT_FOUND, message: "nope".to_string() }.ser(&mut reply);
        raw.send_to(&reply, from).await.unwrap();

        match client.await.unwrap() {
            Err(TransferError::Peer { code, message }) => {
                assert_eq!(code, ErrorCode::FILE_NOT_FOUND);
                assert_eq!(message, "nope");
            }
            other => panic!("expected peer error, got {:?}", other),
        }

        // the failed session sends nothing further
        let result = timeout(Duration::from_millis(150), raw.recv_from(&mut buf)).await;
        assert!(result.is_err(), "client sent a datagram after a terminal error");
    }

    #[tokio::test]
    async fn test_duplicate_data_block_is_reacknowledged() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut session = TransferSession::connect(addr, fast_config()).await.unwrap();
            session.download("test.txt", TransferMode::Octet).await
        });

        let mut buf = [0u8; 2048];
        let (_, from) = raw.recv_from(&mut buf).await.unwrap();

        let mut block1 = BytesMut::new();
        Command::Data { block: BlockId::from_raw(1), payload: vec![7u8; 512] }.ser(&mut block1);

        raw.send_to(&block1, from).await.unwrap();
        let (n, _) = raw.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x04\x00\x01");

        // the ack "got lost": the server resends block 1 and must be re-acknowledged
        raw.send_to(&block1, from).await.unwrap();
        let (n, _) = raw.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x04\x00\x01");

        let mut block2 = BytesMut::new();
        Command::Data { block: BlockId::from_raw(2), payload: b"tail".to_vec() }.ser(&mut block2);
        raw.send_to(&block2, from).await.unwrap();
        let (n, _) = raw.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x04\x00\x02");

        let mut expected = vec![7u8; 512];
        expected.extend_from_slice(b"tail");
        assert_eq!(client.await.unwrap().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_oversize_negotiated_block_size_is_rejected() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();

        let config = TransferConfig { block_size: 1024, ..fast_config() };
        let client = tokio::spawn(async move {
            let mut session = TransferSession::connect(addr, config).await.unwrap();
            session.download("test.txt", TransferMode::Octet).await
        });

        let mut buf = [0u8; 2048];
        let (_, from) = raw.recv_from(&mut buf).await.unwrap();

        // granting more than was requested is a protocol violation
        let mut reply = BytesMut::new();
        Command::OptionAck { options: vec![("blksize".to_string(), "2048".to_string())] }.ser(&mut reply);
        raw.send_to(&reply, from).await.unwrap();

        assert!(matches!(client.await.unwrap(), Err(TransferError::Protocol(_))));

        // the client announces the failed negotiation before going silent
        let (n, _) = raw.recv_from(&mut buf).await.unwrap();
        match Command::deser(&mut &buf[..n]).unwrap() {
            Command::Error { code, .. } => assert_eq!(code, ErrorCode::OPTION_NEGOTIATION_FAILED),
            other => panic!("expected error command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_ignores_datagrams_from_unrelated_peers() {
        let store = Arc::new(MemoryStore::new());
        store.write("f.txt", b"12345".to_vec()).unwrap();
        let (addr, server) = spawn_server(store, fast_config()).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut request = BytesMut::new();
        Command::ReadRequest { filename: "f.txt".to_string(), mode: TransferMode::Octet, options: vec![] }
            .ser(&mut request);
        peer.send_to(&request, addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            Command::deser(&mut &buf[..n]).unwrap(),
            Command::Data { block: BlockId::from_raw(1), payload: b"12345".to_vec() }
        );

        // an ack from the wrong source must not advance the transfer
        intruder.send_to(b"\x00\x04\x00\x01", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        peer.send_to(b"\x00\x04\x00\x01", addr).await.unwrap();
        server.await.unwrap().unwrap();
    }
}
