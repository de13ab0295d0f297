use super::{Address, Proto, TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE};
use crate::transport::leg::Leg;
use crate::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

const MAX_UDP_MESSAGE_SIZE: usize = 65535;

struct UdpInner {
    socket: UdpSocket,
    local: SocketAddr,
    external: Option<SocketAddr>,
}

#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

impl UdpTransport {
    pub async fn bind(local: SocketAddr, external: Option<SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Self::from_socket(socket, external)
    }

    pub fn from_socket(socket: UdpSocket, external: Option<SocketAddr>) -> Result<Self> {
        let local = socket.local_addr()?;
        let t = UdpTransport {
            inner: Arc::new(UdpInner {
                socket,
                local,
                external,
            }),
        };
        info!("created UDP transport: {} external: {:?}", t, external);
        Ok(t)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.external.unwrap_or(self.inner.local)
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        trace!("sending {} {} -> {}", buf.len(), self.inner.local, target);
        self.inner.socket.send_to(buf, target).await?;
        Ok(())
    }

    pub async fn recv_raw(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.inner.socket.recv_from(buf).await.map_err(Into::into)
    }

    pub async fn serve_loop(&self, leg: Leg, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
        loop {
            let (len, addr) = match self.inner.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            if &buf[..len] == KEEPALIVE_REQUEST {
                self.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                continue;
            }
            if &buf[..len] == KEEPALIVE_RESPONSE {
                continue;
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    leg.note_parse_error();
                    info!("error decoding message from: {} error: {}", addr, e);
                    continue;
                }
            };

            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    leg.note_parse_error();
                    info!("error parsing message from: {} error: {}", addr, e);
                    continue;
                }
            };

            trace!("received {} {} -> {}", len, addr, self.inner.local);
            leg.ingress(msg, Address::from_socket_addr(Proto::Udp, addr), &sender);
        }
    }
}

impl std::fmt::Display for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.local)
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        info!("dropping UDP transport: {}", self.local);
    }
}
