//! A single TCP session to one nsqd.
//!
//! [`open`] runs the handshake (magic, IDENTIFY, optional TLS and compression
//! upgrades, AUTH, SUB) and hands back a [`Connection`] whose writer task owns
//! the write half, plus the [`FrameReader`] the caller drives in its own read
//! loop.

use crate::compression::{codec, Decoder, Encoder, StreamCompression};
use crate::config::ConnectionConfig;
use crate::error::{NsqError, Result};
use crate::message::Completion;
use crate::protocol::{
    decode_frame, AuthResponse, Command, Frame, IdentifyRequest, IdentifyResponse, CLOSE_WAIT,
    MAGIC_V2, OK,
};
use crate::tls;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_CHUNK_SIZE: usize = 16 * 1024;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;
pub(crate) type StreamReader = FrameReader<ReadHalf<BoxedStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Identifying,
    Ready,
    Draining,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Identifying,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Connection state shared between the connection, its tasks and its messages.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Events a connection's read loop and its messages report to the owner.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Delivered { conn: u64 },
    Completed { conn: u64, completion: Completion },
    CloseWait { conn: u64 },
    DaemonError { conn: u64, error: NsqError },
    Closed { conn: u64, error: Option<NsqError> },
}

pub(crate) struct ConnectOptions {
    pub addr: String,
    pub config: ConnectionConfig,
    pub identify: IdentifyRequest,
    pub subscribe: Option<(String, String)>,
}

/// What nsqd agreed to during the handshake.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub identify: IdentifyResponse,
    pub tls: bool,
    pub compression: StreamCompression,
    pub auth: Option<AuthResponse>,
}

pub(crate) struct FrameReader<R> {
    inner: R,
    decoder: Decoder,
    plain: BytesMut,
    scratch: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R) -> Self {
        Self::with_buffer(inner, BytesMut::new())
    }

    fn with_buffer(inner: R, plain: BytesMut) -> Self {
        let (_, decoder) = codec(StreamCompression::None);
        Self {
            inner,
            decoder,
            plain,
            scratch: vec![0; READ_CHUNK_SIZE],
        }
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.plain)? {
                return Ok(frame);
            }
            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                return Err(NsqError::ConnectionClosed);
            }
            self.decoder.decode(&self.scratch[..n], &mut self.plain)?;
        }
    }

    /// Installs a decoder; bytes already buffered belong to the compressed stream.
    fn set_decoder(&mut self, decoder: Decoder) -> Result<()> {
        self.decoder = decoder;
        let leftover = self.plain.split();
        if !leftover.is_empty() {
            self.decoder.decode(&leftover, &mut self.plain)?;
        }
        Ok(())
    }

    fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.plain)
    }
}

pub(crate) struct FrameWriter<W> {
    inner: W,
    encoder: Encoder,
    buf: BytesMut,
    wire: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    fn new(inner: W) -> Self {
        let (encoder, _) = codec(StreamCompression::None);
        Self {
            inner,
            encoder,
            buf: BytesMut::new(),
            wire: Vec::new(),
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub(crate) async fn send(&mut self, command: &Command) -> Result<()> {
        self.buf.clear();
        self.wire.clear();
        command.encode(&mut self.buf);
        self.encoder.encode(&self.buf, &mut self.wire)?;
        self.inner.write_all(&self.wire).await?;
        self.inner.flush().await?;
        Ok(())
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

pub struct Connection {
    id: u64,
    addr: Arc<str>,
    state: StateCell,
    commands: mpsc::UnboundedSender<Command>,
    negotiated: Arc<Negotiated>,
    /// Dropping or firing this stops the writer task once queued commands are written.
    shutdown: Option<oneshot::Sender<()>>,
    read_task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    pub(crate) fn shared_address(&self) -> Arc<str> {
        Arc::clone(&self.addr)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    pub(crate) fn attach_read_task(&mut self, task: JoinHandle<()>) {
        self.read_task = Some(task);
    }

    pub fn send(&self, command: Command) -> Result<()> {
        send_command(&self.state, &self.commands, command)
    }

    /// Tells nsqd how many messages it may have in flight on this connection.
    pub fn set_ready(&self, count: u64) -> Result<()> {
        self.send(Command::Rdy(count))
    }

    /// Stops accepting new messages; in-flight messages can still be answered.
    pub fn start_drain(&self) -> Result<()> {
        self.send(Command::Rdy(0))?;
        self.send(Command::Cls)?;
        self.state.set(ConnectionState::Draining);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.state.get() != ConnectionState::Closed {
            tracing::debug!(addr = %self.addr, conn = self.id, "closing nsqd connection");
        }
        self.state.set(ConnectionState::Closed);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn send_command(
    state: &StateCell,
    commands: &mpsc::UnboundedSender<Command>,
    command: Command,
) -> Result<()> {
    if state.get() == ConnectionState::Closed {
        return Err(NsqError::ConnectionClosed);
    }
    commands
        .send(command)
        .map_err(|cmd| NsqError::MessageResponse(format!("{} not sent, writer stopped", cmd.0.name())))
}

/// Connects to nsqd and completes the handshake.
pub(crate) async fn open(options: ConnectOptions) -> Result<(Connection, StreamReader)> {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let state = StateCell::new(ConnectionState::Connecting);
    let dial_timeout = options.config.dial_timeout;

    let tcp = timeout(dial_timeout, TcpStream::connect(options.addr.as_str()))
        .await
        .map_err(|_| NsqError::Connect {
            addr: options.addr.clone(),
            reason: format!("timed out after {}ms", dial_timeout.as_millis()),
        })?
        .map_err(|e| NsqError::Connect {
            addr: options.addr.clone(),
            reason: e.to_string(),
        })?;
    tcp.set_nodelay(true)?;

    state.set(ConnectionState::Identifying);
    let read_timeout = options.config.read_timeout;
    let (reader, writer, negotiated) = timeout(read_timeout, handshake(tcp, &options))
        .await
        .map_err(|_| NsqError::Timeout(read_timeout.as_millis() as u64))?
        .map_err(|e| match e {
            NsqError::Identify(_) => e,
            other => NsqError::Identify(format!("{}: {other}", options.addr)),
        })?;

    let (commands, command_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = oneshot::channel();
    tokio::spawn(run_writer_task(
        writer,
        command_rx,
        shutdown_rx,
        options.addr.clone(),
    ));
    state.set(ConnectionState::Ready);

    tracing::info!(
        addr = %options.addr,
        conn = id,
        tls = negotiated.tls,
        compression = ?negotiated.compression,
        max_rdy_count = negotiated.identify.max_rdy_count,
        "nsqd connection ready"
    );

    let connection = Connection {
        id,
        addr: Arc::from(options.addr.as_str()),
        state,
        commands,
        negotiated: Arc::new(negotiated),
        shutdown: Some(shutdown),
        read_task: None,
    };
    Ok((connection, reader))
}

async fn handshake(
    tcp: TcpStream,
    options: &ConnectOptions,
) -> Result<(StreamReader, FrameWriter<WriteHalf<BoxedStream>>, Negotiated)> {
    let (read_half, write_half) = tokio::io::split(tcp);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    writer.write_raw(MAGIC_V2).await?;
    writer.send(&options.identify.to_command()?).await?;
    let body = read_response(&mut reader).await?;
    let identify = IdentifyResponse::parse(&body)
        .map_err(|e| NsqError::Identify(format!("invalid IDENTIFY response: {e}")))?;

    let (read_half, plain) = reader.into_parts();
    let tcp = read_half.unsplit(writer.into_inner());

    let tls = options.config.tls && identify.tls_v1;
    let stream: BoxedStream = if tls {
        if !plain.is_empty() {
            return Err(NsqError::Protocol(
                "unexpected data before TLS upgrade".to_string(),
            ));
        }
        let host = host_of(&options.addr);
        Box::new(tls::upgrade(tcp, host, options.config.tls_verification).await?)
    } else {
        Box::new(tcp)
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::with_buffer(read_half, plain);
    let mut writer = FrameWriter::new(write_half);
    if tls {
        expect_ok(&mut reader, "TLS upgrade").await?;
    }

    let compression = if identify.deflate {
        StreamCompression::Deflate {
            level: identify.deflate_level,
        }
    } else if identify.snappy {
        StreamCompression::Snappy
    } else {
        StreamCompression::None
    };
    if compression != StreamCompression::None {
        let (encoder, decoder) = codec(compression);
        writer.encoder = encoder;
        reader.set_decoder(decoder)?;
        expect_ok(&mut reader, "compression upgrade").await?;
    }

    let auth = if identify.auth_required {
        let secret = options.config.auth_secret.clone().ok_or_else(|| {
            NsqError::Identify(format!("{} requires auth but no secret is set", options.addr))
        })?;
        writer.send(&Command::Auth(secret)).await?;
        let body = read_response(&mut reader).await?;
        let auth: AuthResponse = serde_json::from_slice(&body)?;
        tracing::debug!(
            identity = %auth.identity,
            permissions = auth.permission_count,
            "authenticated with nsqd"
        );
        Some(auth)
    } else {
        if options.config.auth_secret.is_some() {
            tracing::warn!(addr = %options.addr, "auth secret set but nsqd does not require auth");
        }
        None
    };

    if let Some((topic, channel)) = &options.subscribe {
        writer
            .send(&Command::Sub {
                topic: topic.clone(),
                channel: channel.clone(),
            })
            .await?;
        expect_ok(&mut reader, "SUB").await?;
    }

    let negotiated = Negotiated {
        identify,
        tls,
        compression,
        auth,
    };
    Ok((reader, writer, negotiated))
}

/// Reads the next response frame. Heartbeats during the handshake are skipped;
/// nsqd only expects NOP once the connection is subscribed or publishing.
async fn read_response<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Bytes> {
    loop {
        match reader.read_frame().await? {
            Frame::Response(body) if body.as_ref() == crate::protocol::HEARTBEAT => continue,
            Frame::Response(body) => return Ok(body),
            Frame::Error(body) => {
                return Err(NsqError::Identify(
                    NsqError::from_daemon_frame(&body).to_string(),
                ))
            }
            Frame::Message(_) => {
                return Err(NsqError::Protocol(
                    "message received during handshake".to_string(),
                ))
            }
        }
    }
}

async fn expect_ok<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>, step: &str) -> Result<()> {
    let body = read_response(reader).await?;
    if body.as_ref() == OK {
        Ok(())
    } else {
        Err(NsqError::Identify(format!(
            "{step}: unexpected response {:?}",
            String::from_utf8_lossy(&body)
        )))
    }
}

async fn run_writer_task(
    mut writer: FrameWriter<WriteHalf<BoxedStream>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: oneshot::Receiver<()>,
    addr: String,
) {
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => {
                let Some(command) = command else { break };
                if let Err(err) = writer.send(&command).await {
                    tracing::debug!(addr = %addr, error = %err, command = command.name(), "nsqd write failed");
                    break;
                }
            }
            _ = &mut shutdown => {
                // FIN/REQ queued before the close still reach nsqd
                let flush = async {
                    while let Ok(command) = commands.try_recv() {
                        writer.send(&command).await?;
                    }
                    Ok::<_, NsqError>(())
                };
                match timeout(FLUSH_TIMEOUT, flush).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::debug!(addr = %addr, error = %err, "nsqd flush failed"),
                    Err(_) => tracing::debug!(addr = %addr, "nsqd flush timed out"),
                }
                break;
            }
        }
    }
    let _ = writer.inner.shutdown().await;
}

/// Response frames a read loop hands back to its owner after heartbeats are handled.
pub(crate) enum Inbound {
    Message(crate::protocol::RawMessage),
    Response(Bytes),
    Error(NsqError),
}

/// Reads the next frame that needs the owner's attention.
///
/// Heartbeats are answered inline through the command queue so they are never
/// held up by pause, backoff or a slow application.
pub(crate) async fn next_inbound(
    reader: &mut StreamReader,
    commands: &mpsc::UnboundedSender<Command>,
) -> Result<Inbound> {
    loop {
        let frame = reader.read_frame().await?;
        if frame.is_heartbeat() {
            tracing::trace!("heartbeat");
            commands.send(Command::Nop).map_err(|_| NsqError::ConnectionClosed)?;
            continue;
        }
        return Ok(match frame {
            Frame::Message(raw) => Inbound::Message(raw),
            Frame::Response(body) => Inbound::Response(body),
            Frame::Error(body) => Inbound::Error(NsqError::from_daemon_frame(&body)),
        });
    }
}

pub(crate) fn is_close_wait(body: &[u8]) -> bool {
    body == CLOSE_WAIT
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

pub(crate) fn negotiated_timeouts(negotiated: &Negotiated) -> (Duration, Duration) {
    (
        negotiated.identify.msg_timeout(),
        negotiated.identify.max_msg_timeout(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn response_frame(body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32((body.len() + 4) as u32);
        buf.put_i32(0);
        buf.put_slice(body);
        buf.to_vec()
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new(ConnectionState::Connecting);
        assert_eq!(cell.get(), ConnectionState::Connecting);
        for state in [
            ConnectionState::Identifying,
            ConnectionState::Ready,
            ConnectionState::Draining,
            ConnectionState::Closed,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_send_after_close_fails() {
        let cell = StateCell::new(ConnectionState::Ready);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(send_command(&cell, &tx, Command::Nop).is_ok());

        cell.set(ConnectionState::Closed);
        assert!(matches!(
            send_command(&cell, &tx, Command::Nop),
            Err(NsqError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_send_after_writer_stopped() {
        let cell = StateCell::new(ConnectionState::Ready);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(matches!(
            send_command(&cell, &tx, Command::Nop),
            Err(NsqError::MessageResponse(_))
        ));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("nsqd.local:4150"), "nsqd.local");
        assert_eq!(host_of("[::1]:4150"), "::1");
        assert_eq!(host_of("bare"), "bare");
    }

    #[tokio::test]
    async fn test_frame_reader_handles_split_frames() {
        let mut wire = response_frame(b"OK");
        wire.extend_from_slice(&response_frame(b"CLOSE_WAIT"));
        let (client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            for piece in wire.chunks(3) {
                server.write_all(piece).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(client);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Response(Bytes::from_static(b"OK"))
        );
        match reader.read_frame().await.unwrap() {
            Frame::Response(body) => assert!(is_close_wait(&body)),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(
            reader.read_frame().await,
            Err(NsqError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reader_switches_to_compressed_stream_mid_buffer() {
        let mode = StreamCompression::Deflate { level: 6 };
        let (mut encoder, _) = codec(mode);
        let mut wire = response_frame(b"{}");
        encoder.encode(&response_frame(b"OK"), &mut wire).unwrap();

        let (client, mut server) = tokio::io::duplex(4096);
        server.write_all(&wire).await.unwrap();
        drop(server);

        let mut reader = FrameReader::new(client);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Response(Bytes::from_static(b"{}"))
        );
        reader.set_decoder(codec(mode).1).unwrap();
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Response(Bytes::from_static(b"OK"))
        );
    }
}
