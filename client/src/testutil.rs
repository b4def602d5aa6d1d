//! Mock origin servers for tests, in the spirit of a programmable
//! backend on a raw listener: fixed canned response, hit counter, and
//! captured request heads for header assertions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct MockOrigin {
    pub addr: SocketAddr,
    /// Connections accepted
    pub hits: Arc<AtomicUsize>,
    /// Raw request heads, one entry per request
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockOrigin {
    pub async fn start(response: &'static str) -> Self {
        Self::start_with_delay(response, Duration::ZERO).await
    }

    /// Like [`MockOrigin::start`], but sleeps before answering so tests
    /// can cancel mid-flight.
    pub async fn start_with_delay(response: &'static str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let accepted = hits.clone();
        let heads = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let heads = heads.clone();
                tokio::spawn(async move {
                    let head = read_request(&mut socket).await;
                    heads.lock().unwrap().push(head);
                    tokio::time::sleep(delay).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, hits, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Read one HTTP/1.1 request, returning the head. Drains any body named
/// by content-length so the client never blocks on a half-written request.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut tmp).await else {
            break;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let content_len = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);

            let mut body_len = buf.len() - pos - 4;
            while body_len < content_len {
                let Ok(n) = socket.read(&mut tmp).await else {
                    break;
                };
                if n == 0 {
                    break;
                }
                body_len += n;
            }
            return head;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
