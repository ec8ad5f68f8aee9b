use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::info;

use crate::channel::{CommandHandler, TransferChannel};
use crate::error::ChannelError;

/// Constructs transfer channels, picking the transport by the endpoint's address family.
///
/// Only the UDP transport exists; it covers both IP families. Adding a transport means
///  adding a branch here, without touching callers.
pub struct ChannelFactory;

impl ChannelFactory {
    /// A server-side channel: bound to the well-known local endpoint, with no fixed remote.
    ///  The remote is learned from the first inbound request and pinned by the session via
    ///  [`TransferChannel::set_remote_endpoint`].
    pub async fn create_server(
        local: SocketAddr,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<TransferChannel, ChannelError> {
        let socket = UdpSocket::bind(local).await?;
        info!("bound server channel to {:?}", socket.local_addr()?);
        Ok(TransferChannel::new(socket, handler))
    }

    /// A client-side channel: bound to an ephemeral local endpoint of the matching address
    ///  family, targeting `remote`.
    pub async fn create_connection(
        remote: SocketAddr,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<TransferChannel, ChannelError> {
        let socket = if remote.is_ipv4() {
            UdpSocket::bind("0.0.0.0:0").await?
        }
        else {
            UdpSocket::bind("[::]:0").await?
        };

        let channel = TransferChannel::new(socket, handler);
        channel.set_remote_endpoint(remote)?;
        Ok(channel)
    }
}
