// TCP dialing and optional TLS upgrade.
//
// The broker sends its initial INFO line in plaintext; a TLS handshake,
// when required, happens after that line has been consumed. The upgrade
// therefore reads directly from the raw socket and only then wraps it.
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::errors::{Error, Result};
use crate::server::ServerAddr;

pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

pub(crate) type BoxedStream = Box<dyn IoStream>;

pub(crate) async fn dial(addr: &ServerAddr, timeout: Duration) -> Result<TcpStream> {
    let connect = TcpStream::connect((addr.host.as_str(), addr.port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::Timeout),
    }
}

static TLS_CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

fn tls_config() -> Arc<rustls::ClientConfig> {
    TLS_CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

pub(crate) async fn upgrade_tls(stream: TcpStream, host: &str) -> Result<BoxedStream> {
    let connector = TlsConnector::from(tls_config());
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::InvalidUrl(format!("bad tls server name: {host}")))?;
    let tls = connector.connect(name, stream).await?;
    Ok(Box::new(tls))
}
