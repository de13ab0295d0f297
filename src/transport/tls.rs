//! TLS configuration and session establishment for stream legs.

use crate::{Error, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{pki_types, ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector,
};

/// Opaque TLS material, PEM encoded. Certificate policy stays with the
/// caller; this layer only loads what it is handed.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Server certificate chain.
    pub cert: Option<Vec<u8>>,
    /// Server private key.
    pub key: Option<Vec<u8>>,
    /// Root CA certificates trusted for outbound connections.
    pub ca_certs: Option<Vec<u8>>,
}

/// Session factories built once per leg from a `TlsConfig`.
pub(crate) struct TlsContext {
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
}

impl TlsContext {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let acceptor = match (&config.cert, &config.key) {
            (Some(_), Some(_)) => Some(Self::build_acceptor(config)?),
            _ => None,
        };

        let mut root_store = RootCertStore::empty();
        if let Some(ca_certs) = &config.ca_certs {
            let mut reader = std::io::BufReader::new(ca_certs.as_slice());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert
                    .map_err(|e| Error::Config(format!("failed to parse CA certificate: {}", e)))?;
                root_store
                    .add(cert)
                    .map_err(|e| Error::Config(format!("failed to add CA certificate: {}", e)))?;
            }
        }
        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        Ok(TlsContext {
            acceptor,
            connector,
        })
    }

    fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
        let cert_data = config
            .cert
            .as_ref()
            .ok_or_else(|| Error::Config("no certificate provided".to_string()))?;
        let mut reader = std::io::BufReader::new(cert_data.as_slice());
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, std::io::Error>>()
            .map_err(|e| Error::Config(format!("failed to parse certificate: {}", e)))?;

        let key_data = config
            .key
            .as_ref()
            .ok_or_else(|| Error::Config("no private key provided".to_string()))?;
        let mut reader = std::io::BufReader::new(key_data.as_slice());
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .collect::<std::result::Result<Vec<_>, std::io::Error>>()
            .map_err(|e| Error::Config(format!("failed to parse PKCS8 key: {}", e)))?;

        let key = if let Some(key) = keys.pop() {
            pki_types::PrivateKeyDer::Pkcs8(key)
        } else {
            let mut reader = std::io::BufReader::new(key_data.as_slice());
            let mut keys = rustls_pemfile::rsa_private_keys(&mut reader)
                .collect::<std::result::Result<Vec<_>, std::io::Error>>()
                .map_err(|e| Error::Config(format!("failed to parse RSA key: {}", e)))?;
            match keys.pop() {
                Some(key) => pki_types::PrivateKeyDer::Pkcs1(key),
                None => return Err(Error::Config("no valid private key found".to_string())),
            }
        };

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub fn can_accept(&self) -> bool {
        self.acceptor.is_some()
    }

    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| Error::Config("TLS leg has no server certificate".to_string()))?;
        acceptor.accept(stream).await.map_err(Into::into)
    }

    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let server_name = pki_types::ServerName::try_from(server_name)
            .map_err(|_| Error::Error(format!("invalid TLS server name: {}", server_name)))?
            .to_owned();
        self.connector
            .connect(server_name, stream)
            .await
            .map_err(Into::into)
    }
}
