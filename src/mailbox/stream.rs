//! Plaintext or TLS transport for the IMAP session.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::Protocol;
use crate::error::SessionError;

/// A stream that can be either plaintext or TLS.
pub enum MailStream {
    Plain(TcpStream),
    /// Boxed to keep the enum small.
    Tls(Box<TlsStream<TcpStream>>),
}

impl MailStream {
    /// Open a connection using the configured protocol.
    pub async fn connect(host: &str, port: u16, protocol: Protocol) -> Result<Self, SessionError> {
        let connect_failed = |reason: String| SessionError::ConnectFailed {
            host: host.to_string(),
            port,
            reason,
        };

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        match protocol {
            Protocol::Imap => Ok(Self::Plain(tcp)),
            Protocol::Imaps => {
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| connect_failed(format!("invalid server name: {e}")))?;
                let tls = tls_connector()
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| connect_failed(format!("TLS handshake failed: {e}")))?;
                Ok(Self::Tls(Box::new(tls)))
            }
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

/// TLS connector trusting the webpki root set.
fn tls_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
