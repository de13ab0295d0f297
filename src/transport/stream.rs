//! Framing and connection state shared by the stream transports (tcp/tls).

use super::{Address, Proto, TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE};
use crate::transport::leg::Leg;
use crate::Result;
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use std::{net::SocketAddr, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// RFC 3261 stream framing: one message per CRLFCRLF-terminated header
/// block plus body, with CRLF keepalives in between.
pub struct SipCodec {
    max_size: usize,
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_SIP_MESSAGE_SIZE,
        }
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SipCodec {
    type Item = SipMessage;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Err(crate::Error::Keepalive);
        }

        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Err(crate::Error::Keepalive);
        }

        let data = match std::str::from_utf8(&src[..]) {
            Ok(s) => s,
            Err(_) => {
                if src.len() > self.max_size {
                    return Err(crate::Error::Error("SIP message too large".to_string()));
                }
                return Ok(None);
            }
        };

        if !data.contains("\r\n\r\n") {
            if src.len() > self.max_size {
                return Err(crate::Error::Error("SIP message too large".to_string()));
            }
            return Ok(None);
        }

        match SipMessage::try_from(data) {
            Ok(msg) => {
                let msg_len = data.find("\r\n\r\n").unwrap() + 4;
                src.advance(msg_len);
                Ok(Some(msg))
            }
            Err(e) => {
                // Skip past the broken frame so the stream can recover.
                if let Some(pos) = data[1..].find("\r\n\r\n") {
                    src.advance(pos + 5);
                } else {
                    src.clear();
                }
                Err(crate::Error::Error(format!(
                    "failed to parse SIP message: {}",
                    e
                )))
            }
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

type ReadBox = Box<dyn AsyncRead + Send + Unpin>;
type WriteBox = Box<dyn AsyncWrite + Send + Unpin>;

struct StreamConnInner {
    remote: SocketAddr,
    read: std::sync::Mutex<Option<ReadBox>>,
    write: tokio::sync::Mutex<WriteBox>,
}

/// One established stream (TCP or TLS) to a remote peer. The read half is
/// consumed by `serve_loop`; writes share the connection.
#[derive(Clone)]
pub struct StreamConn {
    inner: Arc<StreamConnInner>,
}

impl StreamConn {
    pub fn new(remote: SocketAddr, read: ReadBox, write: WriteBox) -> Self {
        StreamConn {
            inner: Arc::new(StreamConnInner {
                remote,
                read: std::sync::Mutex::new(Some(read)),
                write: tokio::sync::Mutex::new(write),
            }),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.inner.remote
    }

    pub async fn send_message(&self, msg: &SipMessage) -> Result<()> {
        self.send_raw(msg.to_string().as_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut write = self.inner.write.lock().await;
        write.write_all(data).await?;
        write.flush().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write = self.inner.write.lock().await;
        write.shutdown().await?;
        Ok(())
    }

    pub async fn serve_loop(&self, leg: Leg, proto: Proto, sender: TransportSender) -> Result<()> {
        let read = self.inner.read.lock().unwrap().take();
        let mut read = read.ok_or_else(|| {
            crate::Error::Error("StreamConn::serve_loop called twice".to_string())
        })?;

        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];
        let from = Address::from_socket_addr(proto, self.inner.remote);

        loop {
            match read.read(&mut read_buf).await {
                Ok(0) => {
                    debug!("connection closed: {}", self.inner.remote);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[0..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(msg)) => {
                                leg.ingress(msg, from.clone(), &sender);
                            }
                            Ok(None) => break,
                            Err(crate::Error::Keepalive) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await.ok();
                            }
                            Err(e) => {
                                leg.note_parse_error();
                                warn!("error decoding message from {}: {:?}", self.inner.remote, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("error reading from {}: {}", self.inner.remote, e);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for StreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "-> {}", self.inner.remote)
    }
}
