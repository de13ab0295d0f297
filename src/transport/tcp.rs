//! Stream transport for tcp/tls legs: a listening socket plus a pool of
//! established connections, dialed on demand.

use super::{
    stream::StreamConn,
    tls::TlsContext,
    Address, Proto, TransportSender,
};
use crate::transport::leg::Leg;
use crate::Result;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

struct StreamPoolInner {
    proto: Proto,
    local: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    conns: Mutex<HashMap<SocketAddr, StreamConn>>,
    tls: Option<TlsContext>,
    // Set when the leg is installed; dialed connections join the serve
    // loop through it.
    serve_ctx: Mutex<Option<(Leg, TransportSender)>>,
}

#[derive(Clone)]
pub struct StreamPool {
    inner: Arc<StreamPoolInner>,
}

impl StreamPool {
    pub async fn bind(proto: Proto, local: SocketAddr, tls: Option<TlsContext>) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let local = listener.local_addr()?;
        info!("created {} transport: {}", proto, local);
        Ok(StreamPool {
            inner: Arc::new(StreamPoolInner {
                proto,
                local,
                listener: Mutex::new(Some(listener)),
                conns: Mutex::new(HashMap::new()),
                tls,
                serve_ctx: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub async fn send(&self, msg: &rsip::SipMessage, dst: &Address) -> Result<()> {
        let conn = self.get_or_connect(dst).await?;
        conn.send_message(msg).await
    }

    async fn get_or_connect(&self, dst: &Address) -> Result<StreamConn> {
        let target = dst.socket_addr();
        if let Some(conn) = self.inner.conns.lock().unwrap().get(&target) {
            return Ok(conn.clone());
        }

        let stream = TcpStream::connect(target).await?;
        let conn = match &self.inner.tls {
            Some(tls) => {
                let tls_stream = tls.connect(&dst.server_name(), stream).await?;
                let (read, write) = tokio::io::split(tls_stream);
                StreamConn::new(target, Box::new(read), Box::new(write))
            }
            None => {
                let (read, write) = tokio::io::split(stream);
                StreamConn::new(target, Box::new(read), Box::new(write))
            }
        };
        info!("created {} client connection: {} -> {}", self.inner.proto, self.inner.local, target);

        self.inner
            .conns
            .lock()
            .unwrap()
            .insert(target, conn.clone());
        self.spawn_conn_serve(conn.clone());
        Ok(conn)
    }

    fn spawn_conn_serve(&self, conn: StreamConn) {
        let ctx = self.inner.serve_ctx.lock().unwrap().clone();
        let Some((leg, sender)) = ctx else {
            return;
        };
        let pool = self.clone();
        let proto = self.inner.proto;
        tokio::spawn(async move {
            if let Err(e) = conn.serve_loop(leg, proto, sender).await {
                warn!("stream serve loop error: {:?}", e);
            }
            pool.inner.conns.lock().unwrap().remove(&conn.remote());
        });
    }

    pub async fn serve_loop(&self, leg: Leg, sender: TransportSender) -> Result<()> {
        {
            let mut ctx = self.inner.serve_ctx.lock().unwrap();
            *ctx = Some((leg.clone(), sender.clone()));
        }
        // Connections dialed before installation join now.
        let existing = self
            .inner
            .conns
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for conn in existing {
            self.spawn_conn_serve(conn);
        }

        let listener = self.inner.listener.lock().unwrap().take();
        let Some(listener) = listener else {
            // Client-only pool: nothing to accept, stay alive for writes.
            return std::future::pending().await;
        };

        if self.inner.tls.as_ref().map(|t| !t.can_accept()).unwrap_or(false) {
            warn!(
                "TLS leg {} has no server certificate, accepting disabled",
                self.inner.local
            );
            return std::future::pending().await;
        }

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {:?}", e);
                    continue;
                }
            };
            let conn = match &self.inner.tls {
                Some(tls) => match tls.accept(stream).await {
                    Ok(tls_stream) => {
                        let (read, write) = tokio::io::split(tls_stream);
                        StreamConn::new(remote, Box::new(read), Box::new(write))
                    }
                    Err(e) => {
                        warn!("TLS handshake failed from {}: {:?}", remote, e);
                        continue;
                    }
                },
                None => {
                    let (read, write) = tokio::io::split(stream);
                    StreamConn::new(remote, Box::new(read), Box::new(write))
                }
            };
            info!("new {} connection from {}", self.inner.proto, remote);
            self.inner
                .conns
                .lock()
                .unwrap()
                .insert(remote, conn.clone());
            self.spawn_conn_serve(conn);
        }
    }

    pub async fn close(&self) -> Result<()> {
        let conns = self
            .inner
            .conns
            .lock()
            .unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect::<Vec<_>>();
        for conn in conns {
            conn.close().await.ok();
        }
        Ok(())
    }
}

impl std::fmt::Display for StreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.inner.proto, self.inner.local)
    }
}

impl std::fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
