//! Minimal HTTP stub server for exercising network paths in tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub(crate) struct StubServer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    pub(crate) fn request(&self, index: usize) -> String {
        self.requests
            .lock()
            .expect("stub request lock")
            .get(index)
            .cloned()
            .unwrap_or_default()
    }
}

/// Serve the given raw responses, one per connection, in order.
pub(crate) async fn serve_responses(responses: Vec<Vec<u8>>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub server should bind");
    let addr = listener.local_addr().expect("stub server should have addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let served = hits.clone();
    let captured = requests.clone();
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buffer = [0u8; 4096];
            let mut request = Vec::new();
            loop {
                let Ok(read) = socket.read(&mut buffer).await else {
                    break;
                };
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
                if request.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            served.fetch_add(1, Ordering::SeqCst);
            captured
                .lock()
                .expect("stub request lock")
                .push(String::from_utf8_lossy(&request).into_owned());
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        }
    });

    StubServer {
        addr,
        hits,
        requests,
    }
}

/// Accept connections, read the request headers, then hold every socket open
/// without ever responding.
pub(crate) async fn serve_stalled() -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub server should bind");
    let addr = listener.local_addr().expect("stub server should have addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let served = hits.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buffer = [0u8; 4096];
            let mut request = Vec::new();
            loop {
                let Ok(read) = socket.read(&mut buffer).await else {
                    break;
                };
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
                if request.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            served.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    StubServer {
        addr,
        hits,
        requests,
    }
}

/// Build a raw HTTP/1.1 response. A `content-length` header is added unless
/// the caller supplies one (tests that need a mismatching length do).
pub(crate) fn http_response(
    status: u16,
    reason: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {status} {reason}\r\nconnection: close\r\n");
    let mut has_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            has_length = true;
        }
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_length {
        response.push_str(&format!("content-length: {}\r\n", body.len()));
    }
    response.push_str("\r\n");
    response.push_str(body);
    response.into_bytes()
}
