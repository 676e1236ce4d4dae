use core::{num::NonZeroU16, time::Duration};
use std::sync::Arc;

use anyhow::{anyhow, Error};
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use tokio::net::TcpStream;

use self::io::TokioIo;

mod io;

/// Performs a single HTTP request.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Sends the request, returning the response status code.
    ///
    /// The response body is consumed and discarded.
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<StatusCode, Error>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    #[inline]
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<StatusCode, Error> {
        (**self).send(request).await
    }
}

/// HTTP/1.1 transport over plain TCP.
///
/// Every request is sent over a fresh connection.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Target hostname.
    hostname: String,
    /// Target port.
    port: NonZeroU16,
    /// Request timeout, including connection establishment.
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(hostname: impl Into<String>, port: NonZeroU16, timeout: Duration) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            timeout,
        }
    }

    async fn do_send(&self, request: Request<Full<Bytes>>) -> Result<StatusCode, Error> {
        let stream = TcpStream::connect((self.hostname.as_str(), self.port.get())).await?;
        stream.set_nodelay(true)?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await?;
        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("connection failed: {err}");
            }
        });

        let mut resp = sender.send_request(request).await?;
        let code = resp.status();
        while let Some(next) = resp.frame().await {
            next?;
        }

        Ok(code)
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<StatusCode, Error> {
        match tokio::time::timeout(self.timeout, self.do_send(request)).await {
            Ok(rc) => rc,
            Err(..) => Err(anyhow!("timed out after {:?}", self.timeout)),
        }
    }
}

#[cfg(test)]
mod test {
    use http::{header, Method};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    use super::*;

    /// Accepts a single connection, captures the raw request and replies with
    /// the given status line.
    async fn serve_once(status: &'static str) -> (NonZeroU16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = NonZeroU16::new(listener.local_addr().unwrap().port()).unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            let mut buf = [0u8; 4096];

            loop {
                let n = stream.read(&mut buf).await.unwrap();
                data.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&data).to_string();
                if let Some(pos) = text.find("\r\n\r\n") {
                    let len = text[..pos]
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .map(|(_, v)| v.trim().parse::<usize>().unwrap())
                        .unwrap_or(0);
                    if data.len() >= pos + 4 + len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let resp = format!("HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
            stream.write_all(resp.as_bytes()).await.unwrap();
            tx.send(String::from_utf8_lossy(&data).to_string()).unwrap();
        });

        (port, rx)
    }

    #[tokio::test]
    async fn test_send_get() {
        let (port, rx) = serve_once("200 OK").await;
        let transport = HttpTransport::new("127.0.0.1", port, Duration::from_secs(5));

        let request = Request::builder()
            .method(Method::GET)
            .uri("/apps")
            .header(header::HOST, format!("127.0.0.1:{port}"))
            .header("X-Bar", "456")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let code = transport.send(request).await.unwrap();
        assert_eq!(StatusCode::OK, code);

        let raw = rx.await.unwrap();
        assert!(raw.starts_with("GET /apps HTTP/1.1\r\n"), "{raw}");
        assert!(raw.to_lowercase().contains("x-bar: 456\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn test_send_post_with_body() {
        let (port, rx) = serve_once("503 Service Unavailable").await;
        let transport = HttpTransport::new("127.0.0.1", port, Duration::from_secs(5));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/foo")
            .header(header::HOST, format!("127.0.0.1:{port}"))
            .body(Full::new(Bytes::from_static(br#"{"hello":"world"}"#)))
            .unwrap();

        let code = transport.send(request).await.unwrap();
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, code);

        let raw = rx.await.unwrap();
        assert!(raw.starts_with("POST /foo HTTP/1.1\r\n"), "{raw}");
        assert!(raw.ends_with(r#"{"hello":"world"}"#), "{raw}");
    }

    #[tokio::test]
    async fn test_send_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = NonZeroU16::new(listener.local_addr().unwrap().port()).unwrap();
        // Accepts, but never replies.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let transport = HttpTransport::new("127.0.0.1", port, Duration::from_millis(100));
        let request = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();

        assert!(transport.send(request).await.is_err());
        server.abort();
    }

    #[tokio::test]
    async fn test_send_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            NonZeroU16::new(listener.local_addr().unwrap().port()).unwrap()
        };

        let transport = HttpTransport::new("127.0.0.1", port, Duration::from_secs(1));
        let request = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();

        assert!(transport.send(request).await.is_err());
    }
}
