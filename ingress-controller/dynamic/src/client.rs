use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::Full;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::{io::AsyncWriteExt, net::TcpStream};

pub const BACKENDS_PATH: &str = "/configuration/backends";
pub const SERVERS_PATH: &str = "/configuration/servers";

/// Delivers payloads to the proxy.
#[async_trait::async_trait]
pub trait SideChannel: Send + Sync {
    /// POSTs a JSON body to `path` and returns the response status.
    async fn post(&self, path: &'static str, body: Vec<u8>) -> Result<StatusCode, PushError>;

    /// Writes a JSON body to the stream configuration socket.
    async fn stream(&self, body: Vec<u8>) -> Result<(), PushError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("POST {path} failed: {source}")]
    Transport {
        path: &'static str,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("POST {path} returned unexpected status {status}")]
    Status {
        path: &'static str,
        status: StatusCode,
    },

    #[error("stream configuration to {addr} failed: {source}")]
    Stream {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// The proxy's side channel on the loopback interface.
#[derive(Clone, Debug)]
pub struct LocalProxy {
    status_port: u16,
    stream_port: u16,
    client: Client<HttpConnector, Full<Bytes>>,
}

// === impl LocalProxy ===

impl LocalProxy {
    pub fn new(status_port: u16, stream_port: u16) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            status_port,
            stream_port,
            client,
        }
    }

    fn stream_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.stream_port))
    }
}

#[async_trait::async_trait]
impl SideChannel for LocalProxy {
    async fn post(&self, path: &'static str, body: Vec<u8>) -> Result<StatusCode, PushError> {
        let req = Request::post(format!("http://127.0.0.1:{}{path}", self.status_port))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;
        let rsp = self
            .client
            .request(req)
            .await
            .map_err(|source| PushError::Transport { path, source })?;
        Ok(rsp.status())
    }

    async fn stream(&self, body: Vec<u8>) -> Result<(), PushError> {
        let addr = self.stream_addr();
        let write = async {
            let mut conn = TcpStream::connect(addr).await?;
            conn.write_all(&body).await?;
            conn.write_all(b"\r\n").await?;
            conn.shutdown().await
        };
        write
            .await
            .map_err(|source| PushError::Stream { addr, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    #[tokio::test]
    async fn stream_payload_is_terminated() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let proxy = LocalProxy::new(0, port);
        proxy.stream(b"[]".to_vec()).await.unwrap();
        assert_eq!(server.await.unwrap(), b"[]\r\n");
    }

    #[tokio::test]
    async fn stream_reports_refused_connections() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = LocalProxy::new(0, port)
            .stream(b"[]".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Stream { addr, .. } if addr.port() == port));
    }
}
