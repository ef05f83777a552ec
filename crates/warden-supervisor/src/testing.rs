//! Loopback HTTP stub used by unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Reply {
    Body { status: u16, body: Vec<u8> },
    Redirect { location: String },
    /// Announce `total` bytes, send `prefix`, then hang.
    Stall { prefix: Vec<u8>, total: u64 },
}

#[derive(Default)]
struct Routes {
    replies: HashMap<String, Reply>,
    hits: HashMap<String, usize>,
}

/// Minimal HTTP/1.1 server answering canned replies per path.
pub(crate) struct StubServer {
    addr: SocketAddr,
    routes: Arc<Mutex<Routes>>,
    shutdown: CancellationToken,
}

impl StubServer {
    pub(crate) async fn start() -> Self {
        Self::start_on(0).await
    }

    pub(crate) async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(Mutex::new(Routes::default()));
        let shutdown = CancellationToken::new();

        let accept_routes = routes.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                let routes = accept_routes.clone();
                let shutdown = accept_shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = handle(stream, routes) => {}
                    }
                });
            }
        });

        Self {
            addr,
            routes,
            shutdown,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub(crate) fn route(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.set(
            path,
            Reply::Body {
                status,
                body: body.into(),
            },
        );
    }

    pub(crate) fn redirect(&self, path: &str, location: impl Into<String>) {
        self.set(
            path,
            Reply::Redirect {
                location: location.into(),
            },
        );
    }

    pub(crate) fn stall(&self, path: &str, prefix: impl Into<Vec<u8>>, total: u64) {
        self.set(
            path,
            Reply::Stall {
                prefix: prefix.into(),
                total,
            },
        );
    }

    pub(crate) fn hits(&self, path: &str) -> usize {
        let routes = self.routes.lock().unwrap();
        routes.hits.get(path).copied().unwrap_or(0)
    }

    fn set(&self, path: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        routes.replies.insert(path.to_string(), reply);
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle(stream: TcpStream, routes: Arc<Mutex<Routes>>) {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
        return;
    }
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header).await {
            Ok(0) => break,
            Ok(_) if header == "\r\n" || header == "\n" => break,
            Ok(_) => continue,
            Err(_) => return,
        }
    }

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/").to_string();

    let reply = {
        let mut routes = routes.lock().unwrap();
        *routes.hits.entry(path.clone()).or_insert(0) += 1;
        routes.replies.get(&path).cloned()
    };

    let mut stream = reader.into_inner();
    match reply {
        Some(Reply::Body { status, body }) => {
            let head = format!(
                "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
        }
        Some(Reply::Redirect { location }) => {
            let head = format!(
                "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                location
            );
            let _ = stream.write_all(head.as_bytes()).await;
        }
        Some(Reply::Stall { prefix, total }) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                total
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&prefix).await;
            let _ = stream.flush().await;
            std::future::pending::<()>().await;
        }
        None => {
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
    }
    let _ = stream.shutdown().await;
}

/// A loopback port nothing is listening on.
pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
