//! Connection establishment and the HTTP/1.1 transport handle.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{rustls, TlsConnector};

use crate::{
    error::{transport, BoxError, Result},
    pool::{Endpoint, Poolable},
};

/// An established HTTP/1.1 connection.
///
/// The hyper connection driver runs in a task spawned at dial time; dropping
/// this handle closes the connection and winds the driver down.
pub(crate) struct HttpTransport {
    sender: http1::SendRequest<Full<Bytes>>,
}

impl HttpTransport {
    pub async fn send(
        &mut self,
        req: http::Request<Full<Bytes>>,
    ) -> Result<http::Response<hyper::body::Incoming>, hyper::Error> {
        self.sender.send_request(req).await
    }
}

impl Poolable for HttpTransport {
    fn is_open(&self) -> bool {
        self.sender.is_ready()
    }
}

/// Dials TCP (plus TLS for encrypted endpoints) and performs the HTTP/1.1
/// handshake.
pub(crate) struct Connector {
    timeout: Option<Duration>,
    tls: TlsConnector,
}

impl Connector {
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            timeout,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Establish a fresh connection to `endpoint`. `host` is the name the
    /// request was made with and is used for SNI and certificate validation.
    pub async fn dial(&self, endpoint: &Endpoint, host: &str) -> Result<HttpTransport> {
        let addr = SocketAddr::new(endpoint.ip, endpoint.port);
        let stream = with_timeout(self.timeout, TcpStream::connect(addr)).await?;
        if endpoint.tls {
            let name = ServerName::try_from(host.to_owned()).map_err(transport)?;
            let stream = with_timeout(self.timeout, self.tls.connect(name, stream)).await?;
            handshake(stream).await
        } else {
            handshake(stream).await
        }
    }
}

async fn handshake<S>(io: S) -> Result<HttpTransport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::Builder::new()
        .handshake(TokioIo::new(io))
        .await
        .map_err(transport)?;
    tokio::spawn(conn);
    // Wait for the connection to ready up before handing the sender out.
    sender.ready().await.map_err(transport)?;
    Ok(HttpTransport { sender })
}

/// Run `fut` under the configured per-socket timeout, mapping both the
/// elapsed timer and the inner failure to a transport error.
pub(crate) async fn with_timeout<F, T, E>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(transport),
            Err(elapsed) => Err(transport(elapsed)),
        },
        None => fut.await.map_err(transport),
    }
}
