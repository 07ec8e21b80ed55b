use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::collab::{AckHandler, LocalSendError, Transport};
use crate::endpoint::TransportVariant;
use crate::report::header::ReportHeader;
use crate::report::{ContentHash, ReportKind};

/// Sends reports as plain UDP datagrams, and receives acknowledgments on the same sockets.
///  Other transport variants are not supported.
pub struct UdpTransport {
    cancel_sender: broadcast::Sender<()>,
    ipv4_socket: UdpSocket,
    /// `None` if the host has no IPv6 support
    ipv6_socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub async fn new() -> anyhow::Result<UdpTransport> {
        let (cancel_sender, _) = broadcast::channel(1);

        let ipv4_socket = UdpSocket::bind(SocketAddr::from_str("0.0.0.0:0")?).await?;
        let ipv6_socket = match UdpSocket::bind(SocketAddr::from_str("[::]:0")?).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("no IPv6 socket available, sending via IPv4 only: {}", e);
                None
            }
        };

        Ok(UdpTransport {
            cancel_sender,
            ipv4_socket,
            ipv6_socket,
        })
    }

    /// Passes acknowledgments to `handler` until [UdpTransport::cancel_recv_loop] is called
    pub async fn recv_loop(&self, handler: Arc<dyn AckHandler>) -> anyhow::Result<()> {
        let mut buf_v4 = [0u8; 2048];
        let mut buf_v6 = [0u8; 2048];

        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop");

        loop {
            select! {
                r = self.ipv4_socket.recv_from(&mut buf_v4) => {
                    let (len, from) = r.inspect_err(|e| error!(error = ?e, "error receiving from IPv4 socket"))?;
                    on_datagram(&buf_v4[..len], from, handler.as_ref()).await;
                }
                r = recv_from_opt(self.ipv6_socket.as_ref(), &mut buf_v6) => {
                    let (len, from) = r.inspect_err(|e| error!(error = ?e, "error receiving from IPv6 socket"))?;
                    on_datagram(&buf_v6[..len], from, handler.as_ref()).await;
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        Ok(())
    }

    pub fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

async fn recv_from_opt(socket: Option<&UdpSocket>, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn on_datagram(buf: &[u8], from: SocketAddr, handler: &dyn AckHandler) {
    let mut buf = buf;
    match ReportHeader::deser(&mut buf) {
        Ok(header) if header.is_ack() => {
            trace!("received acknowledgment {} from {:?}", header.sequence, from);
            handler.on_receive_accounting(from, header.sequence).await;
        }
        Ok(header) => debug!("ignoring packet of type {} from {:?}", header.packet_type, from),
        Err(e) => debug!("ignoring malformed datagram from {:?}: {}", from, e),
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, variant: TransportVariant, packet: &[u8], kind: ReportKind, hash: ContentHash, sequence: u32) -> anyhow::Result<usize> {
        if variant != TransportVariant::Plain {
            return Ok(0);
        }

        let socket = if to.is_ipv4() {
            &self.ipv4_socket
        }
        else {
            match &self.ipv6_socket {
                Some(socket) => socket,
                None => return Err(LocalSendError { to, reason: "no IPv6 socket" }.into()),
            }
        };

        let len = socket.send_to(packet, to).await?;
        trace!("sent {:?} report {} ({:?}) to {:?}", kind, sequence, hash, to);
        Ok(len)
    }
}
