#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use servicedriver::tls::SslContext;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use url::Url;

/// A request as seen by the test server, with its body collected.
pub type Received = http::Request<Bytes>;

fn decode_pem(pem: &'static [u8]) -> (&'static str, Vec<u8>) {
    pem_rfc7468::decode_vec(pem).unwrap()
}

fn tls_acceptor() -> TlsAcceptor {
    let (_, cert) = decode_pem(include_bytes!("../minica/localhost/cert.pem"));
    let (label, key) = decode_pem(include_bytes!("../minica/localhost/key.pem"));
    assert_eq!(label, "PRIVATE KEY");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(cert)],
            PrivateKeyDer::Pkcs8(key.into()),
        )
        .unwrap();
    config.alpn_protocols.push(b"http/1.1".to_vec());
    TlsAcceptor::from(Arc::new(config))
}

/// Trust configuration accepting the certificate served by
/// [`TestServer::start_tls`].
pub fn test_ssl_context() -> Arc<SslContext> {
    let (_, ca) = decode_pem(include_bytes!("../minica/minica.pem"));
    Arc::new(SslContext::new([CertificateDer::from(ca)]))
}

/// An HTTP/1.1 server on a local port, answering every request with
/// `handler`.
pub struct TestServer {
    addr: SocketAddr,
    secure: bool,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Received) -> http::Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::serve(handler, None).await
    }

    /// Serve HTTPS on `127.0.0.1`, with a certificate issued by the test CA.
    pub async fn start_tls<F>(handler: F) -> Self
    where
        F: Fn(&Received) -> http::Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::serve(handler, Some(tls_acceptor())).await
    }

    async fn serve<F>(handler: F, tls: Option<TlsAcceptor>) -> Self
    where
        F: Fn(&Received) -> http::Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let secure = tls.is_some();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let handle = tokio::spawn({
            let connections = connections.clone();
            let requests = requests.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);

                    let handler = handler.clone();
                    let requests = requests.clone();
                    let service = hyper::service::service_fn(move |req: http::Request<Incoming>| {
                        let handler = handler.clone();
                        let requests = requests.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await?.to_bytes();
                            requests.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, hyper::Error>(handler(&http::Request::from_parts(parts, body)))
                        }
                    });

                    let tls = tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    hyper::server::conn::http1::Builder::new()
                                        .serve_connection(TokioIo::new(stream), service)
                                        .await
                                }
                                Err(error) => {
                                    tracing::debug!("test server handshake error: {error}");
                                    return;
                                }
                            },
                            None => {
                                hyper::server::conn::http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                            }
                        };
                        if let Err(error) = result {
                            tracing::debug!("test server connection error: {error}");
                        }
                    });
                }
            }
        });

        Self {
            addr,
            secure,
            connections,
            requests,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> Url {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}{}", self.addr, path).parse().unwrap()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Requests answered so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn respond(status: u16) -> http::response::Builder {
    http::Response::builder().status(status)
}

pub fn text(status: u16, body: impl Into<Bytes>) -> http::Response<Full<Bytes>> {
    respond(status).body(Full::new(body.into())).unwrap()
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
