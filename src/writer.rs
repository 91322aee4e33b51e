use crate::config::{WriterConfig, WriterConfigBuilder};
use crate::connection::{self, next_inbound, ConnectOptions, Connection, Inbound, StreamReader};
use crate::error::{NsqError, Result};
use crate::protocol::{validate_topic_name, Command, IdentifyRequest, OK};
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Events emitted by a [`Writer`].
#[derive(Debug)]
pub enum WriterEvent {
    /// The connection to nsqd is identified and accepting publishes.
    Ready,
    /// The connection is gone; pending publishes failed with
    /// [`NsqError::ConnectionClosed`].
    Closed,
    Error(NsqError),
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<()>>,
}

/// Publishes messages to a single nsqd.
///
/// Publishes are pipelined over one connection and acknowledged in order.
///
/// # Examples
///
/// ```no_run
/// use nsq_client::Writer;
///
/// #[tokio::main]
/// async fn main() -> Result<(), nsq_client::NsqError> {
///     let mut writer = Writer::new("localhost", 4150)?;
///     writer.connect().await?;
///
///     writer.publish("events", ["hello"]).await?;
///     writer.publish("events", ["one", "two", "three"]).await?;
///
///     writer.close().await;
///     Ok(())
/// }
/// ```
pub struct Writer {
    config: WriterConfig,
    requests: Option<mpsc::UnboundedSender<Request>>,
    events_tx: Option<mpsc::UnboundedSender<WriterEvent>>,
    events: mpsc::UnboundedReceiver<WriterEvent>,
    task: Option<JoinHandle<()>>,
}

impl Writer {
    /// Creates a writer for the nsqd at `host:port` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`NsqError::Validation`] if `host` is empty.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::with_config(WriterConfigBuilder::new().host(host).port(port).build())
    }

    /// Creates a writer from a full [`WriterConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`NsqError::Validation`] if the configuration is invalid.
    pub fn with_config(config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let (events_tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            requests: None,
            events_tx: Some(events_tx),
            events,
            task: None,
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Connects and identifies. Emits [`WriterEvent::Ready`] on success.
    ///
    /// A writer whose connection was lost ([`WriterEvent::Closed`]) can be
    /// connected again.
    ///
    /// # Errors
    ///
    /// Returns [`NsqError::Connect`] or [`NsqError::Identify`] when nsqd cannot
    /// be reached or rejects the handshake, and [`NsqError::Validation`] when
    /// the writer is already connected or was closed.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(NsqError::Validation("writer is already connected".to_string()));
        }
        let Some(events) = self.events_tx.clone() else {
            return Err(NsqError::Validation("writer is closed".to_string()));
        };
        self.requests = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        let options = ConnectOptions {
            addr: self.config.address(),
            config: self.config.connection.clone(),
            identify: IdentifyRequest::new(&self.config.connection, None, 0),
            subscribe: None,
        };
        let (connection, reader) = match connection::open(options).await {
            Ok(opened) => opened,
            Err(err) => {
                tracing::warn!(addr = %self.config.address(), error = %err, "writer failed to connect");
                return Err(err);
            }
        };

        let (requests, request_rx) = mpsc::unbounded_channel();
        let _ = events.send(WriterEvent::Ready);
        self.task = Some(tokio::spawn(run(connection, reader, request_rx, events)));
        self.requests = Some(requests);
        Ok(())
    }

    /// True while the connection actor is running.
    pub fn is_connected(&self) -> bool {
        self.requests
            .as_ref()
            .is_some_and(|requests| !requests.is_closed())
    }

    /// Closes the connection. Publishes still awaiting a response fail with
    /// [`NsqError::ConnectionClosed`].
    pub async fn close(&mut self) {
        self.events_tx = None;
        self.requests = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Publishes one or more messages to `topic`. A single payload is sent
    /// with `PUB`, several with one atomic `MPUB`.
    ///
    /// # Errors
    ///
    /// Returns [`NsqError::Validation`] for an invalid topic, an empty batch or
    /// an empty body, [`NsqError::Daemon`] when nsqd rejects the publish, and
    /// [`NsqError::ConnectionClosed`] when the writer is not connected.
    pub async fn publish<I, B>(&self, topic: &str, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        validate_topic_name(topic)?;
        let mut bodies: Vec<Bytes> = payloads.into_iter().map(Into::into).collect();
        validate_bodies(&bodies)?;

        let command = if bodies.len() == 1 {
            Command::Pub {
                topic: topic.to_string(),
                body: bodies.remove(0),
            }
        } else {
            Command::Mpub {
                topic: topic.to_string(),
                bodies,
            }
        };
        self.request(command).await
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.publish(topic, [body]).await
    }

    /// Publishes a message that nsqd delivers after `delay` (`DPUB`).
    pub async fn deferred_publish(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        delay: Duration,
    ) -> Result<()> {
        validate_topic_name(topic)?;
        let body = body.into();
        validate_bodies(std::slice::from_ref(&body))?;
        self.request(Command::Dpub {
            topic: topic.to_string(),
            delay,
            body,
        })
        .await
    }

    pub async fn next_event(&mut self) -> Option<WriterEvent> {
        self.events.recv().await
    }

    async fn request(&self, command: Command) -> Result<()> {
        let requests = self.requests.as_ref().ok_or(NsqError::ConnectionClosed)?;
        let (reply, response) = oneshot::channel();
        requests
            .send(Request { command, reply })
            .map_err(|_| NsqError::ConnectionClosed)?;
        response.await.map_err(|_| NsqError::ConnectionClosed)?
    }
}

fn validate_bodies(bodies: &[Bytes]) -> Result<()> {
    if bodies.is_empty() {
        return Err(NsqError::Validation("nothing to publish".to_string()));
    }
    if bodies.iter().any(|body| body.is_empty()) {
        return Err(NsqError::Validation("message body must not be empty".to_string()));
    }
    Ok(())
}

/// Connection actor of a writer. nsqd answers publishes in order, so replies
/// are matched against a FIFO of waiters.
async fn run(
    mut connection: Connection,
    mut reader: StreamReader,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<WriterEvent>,
) {
    let commands = connection.command_sender();
    let mut pending: VecDeque<oneshot::Sender<Result<()>>> = VecDeque::new();

    let failure = loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Request { command, reply }) => match connection.send(command) {
                    Ok(()) => pending.push_back(reply),
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                },
                None => break None,
            },
            inbound = next_inbound(&mut reader, &commands) => match inbound {
                Ok(Inbound::Response(body)) => {
                    let result = if body.as_ref() == OK {
                        Ok(())
                    } else {
                        Err(NsqError::Protocol(format!(
                            "unexpected response {:?}",
                            String::from_utf8_lossy(&body)
                        )))
                    };
                    match pending.pop_front() {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => tracing::debug!("response without a pending publish"),
                    }
                }
                Ok(Inbound::Error(err)) => {
                    let fatal = err.is_fatal();
                    let reported = match &err {
                        NsqError::Daemon { code, message } => NsqError::Daemon {
                            code: code.clone(),
                            message: message.clone(),
                        },
                        other => NsqError::Protocol(other.to_string()),
                    };
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Err(err));
                    }
                    if fatal {
                        break Some(reported);
                    }
                    let _ = events.send(WriterEvent::Error(reported));
                }
                Ok(Inbound::Message(_)) => {
                    break Some(NsqError::Protocol("message frame on a producer connection".to_string()));
                }
                Err(NsqError::ConnectionClosed) => break None,
                Err(err) => break Some(err),
            },
        }
    };

    connection.close();
    requests.close();
    while let Ok(Request { reply, .. }) = requests.try_recv() {
        pending.push_back(reply);
    }
    for reply in pending.drain(..) {
        let _ = reply.send(Err(NsqError::ConnectionClosed));
    }
    if let Some(err) = failure {
        tracing::warn!(addr = %connection.address(), error = %err, "writer connection failed");
        let _ = events.send(WriterEvent::Error(err));
    }
    let _ = events.send(WriterEvent::Closed);
}
