#![allow(dead_code)]

//! In-process stand-ins for nsqd and nsqlookupd.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub const IDENTIFY_RESPONSE: &str = r#"{"max_rdy_count":2500,"version":"1.3.0","max_msg_timeout":900000,"msg_timeout":60000,"tls_v1":false,"deflate":false,"deflate_level":0,"max_deflate_level":6,"snappy":false,"sample_rate":0,"auth_required":false,"output_buffer_size":16384,"output_buffer_timeout":250}"#;

#[derive(Debug, Clone)]
pub struct Received {
    pub name: String,
    pub args: Vec<String>,
    pub body: Option<Vec<u8>>,
}

pub struct FakeNsqd {
    listener: TcpListener,
    pub addr: String,
}

impl FakeNsqd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        Self { listener, addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.rsplit_once(':').unwrap().1.parse().unwrap()
    }

    /// Accepts a client and consumes the protocol magic.
    pub async fn accept(&self) -> Session {
        let (stream, _) = timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        let (read, write) = stream.into_split();
        let mut session = Session {
            reader: BufReader::new(read),
            writer: write,
        };
        let mut magic = [0u8; 4];
        session.reader.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"  V2");
        session
    }
}

pub struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    pub async fn read_command(&mut self) -> Option<Received> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let mut parts = line.trim_end_matches('\n').split(' ').map(str::to_string);
        let name = parts.next().unwrap_or_default();
        let args: Vec<String> = parts.collect();
        let body = match name.as_str() {
            "IDENTIFY" | "AUTH" | "PUB" | "MPUB" | "DPUB" => {
                let size = self.reader.read_u32().await.ok()?;
                let mut body = vec![0u8; size as usize];
                self.reader.read_exact(&mut body).await.ok()?;
                Some(body)
            }
            _ => None,
        };
        Some(Received { name, args, body })
    }

    /// Reads until a `name` command satisfying `matches` arrives. NOP and RDY
    /// are skipped unless they are what is being waited for.
    pub async fn expect_where(&mut self, name: &str, matches: impl Fn(&Received) -> bool) -> Received {
        timeout(STEP_TIMEOUT, async {
            loop {
                let command = self
                    .read_command()
                    .await
                    .unwrap_or_else(|| panic!("connection closed while waiting for {name}"));
                if command.name == name && matches(&command) {
                    return command;
                }
                assert!(
                    matches!(command.name.as_str(), "NOP" | "RDY") || command.name == name,
                    "unexpected {command:?} while waiting for {name}"
                );
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
    }

    pub async fn expect(&mut self, name: &str) -> Received {
        self.expect_where(name, |_| true).await
    }

    pub async fn expect_rdy(&mut self, count: u64) {
        let count = count.to_string();
        self.expect_where("RDY", |c| c.args == [count.clone()]).await;
    }

    /// Answers IDENTIFY and returns the client's IDENTIFY body.
    pub async fn identify(&mut self) -> serde_json::Value {
        let identify = self.expect("IDENTIFY").await;
        self.respond(IDENTIFY_RESPONSE.as_bytes()).await;
        serde_json::from_slice(&identify.body.unwrap()).unwrap()
    }

    /// IDENTIFY plus SUB, as a reader performs them.
    pub async fn subscribe(&mut self) -> Received {
        self.identify().await;
        let sub = self.expect("SUB").await;
        self.ok().await;
        sub
    }

    pub async fn respond(&mut self, body: &[u8]) {
        self.frame(0, body).await;
    }

    pub async fn ok(&mut self) {
        self.respond(b"OK").await;
    }

    pub async fn heartbeat(&mut self) {
        self.respond(b"_heartbeat_").await;
    }

    pub async fn error(&mut self, body: &[u8]) {
        self.frame(1, body).await;
    }

    pub async fn message(&mut self, id: &[u8; 16], attempts: u16, body: &[u8]) {
        let mut data = Vec::with_capacity(26 + body.len());
        data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
        data.extend_from_slice(&attempts.to_be_bytes());
        data.extend_from_slice(id);
        data.extend_from_slice(body);
        self.frame(2, &data).await;
    }

    async fn frame(&mut self, frame_type: i32, data: &[u8]) {
        let mut frame = Vec::with_capacity(8 + data.len());
        frame.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(&frame_type.to_be_bytes());
        frame.extend_from_slice(data);
        self.writer.write_all(&frame).await.unwrap();
    }
}

/// Splits an MPUB body into its messages.
pub fn mpub_bodies(body: &[u8]) -> Vec<Vec<u8>> {
    let count = u32::from_be_bytes(body[..4].try_into().unwrap()) as usize;
    let mut offset = 4;
    let mut bodies = Vec::with_capacity(count);
    for _ in 0..count {
        let len = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        bodies.push(body[offset..offset + len].to_vec());
        offset += len;
    }
    bodies
}

/// Serves `body` as the JSON answer to every HTTP request and reports each
/// request line.
pub async fn fake_lookupd(
    body: String,
) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    fake_lookupd_with(Arc::new(Mutex::new(body))).await
}

/// Like [`fake_lookupd`], but answers with whatever `body` holds at request time.
pub async fn fake_lookupd_with(
    body: Arc<Mutex<String>>,
) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (requests_tx, requests) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await.is_err() {
                continue;
            }
            loop {
                let mut header = String::new();
                match reader.read_line(&mut header).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) if header == "\r\n" => break,
                    Ok(_) => {}
                }
            }
            let _ = requests_tx.send(request_line.trim_end().to_string());
            let body = body.lock().unwrap().clone();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = write.write_all(response.as_bytes()).await;
            let _ = write.shutdown().await;
        }
    });

    (addr, requests)
}
