use crate::backoff::BackoffPolicy;
use crate::config::ReaderConfig;
use crate::connection::ConnectionEvent;
use crate::discovery::{self, lookup_url, AddressDiff};
use crate::error::{NsqError, Result};
use crate::message::{DiscardHandler, Message, MessagePolicy};
use crate::pool::{ConnectionPool, Dialed};
use crate::protocol::{validate_channel_name, validate_topic_name, IdentifyRequest};
use crate::ready::{RdyUpdate, ReadyCoordinator};
use crate::retry::RetryStrategy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Events emitted by a [`Reader`].
#[derive(Debug)]
pub enum ReaderEvent {
    /// A message to process. Answer it with [`Message::finish`],
    /// [`Message::requeue`] or keep it alive with [`Message::touch`].
    Message(Message),
    /// A message that exhausted `max_attempts`. The discard handler has run
    /// and the message has already been finished.
    Discard(Message),
    /// A recoverable problem: failed dial, lost connection, lookupd outage or
    /// an advisory error from nsqd. The reader keeps running.
    Error(NsqError),
    NsqdConnected(String),
    NsqdClosed(String),
}

enum Control {
    Pause,
    Unpause,
    Close(oneshot::Sender<()>),
}

/// Consumes a topic/channel from one or more nsqd daemons.
///
/// `Reader` spreads `max_in_flight` across every connected daemon, backs off
/// when messages are requeued with the backoff flag, and reconnects to daemons
/// that are still listed by discovery.
///
/// # Examples
///
/// ```no_run
/// use nsq_client::{Reader, ReaderConfigBuilder, ReaderEvent};
///
/// #[tokio::main]
/// async fn main() -> Result<(), nsq_client::NsqError> {
///     let config = ReaderConfigBuilder::new()
///         .lookupd_http_address("127.0.0.1:4161")
///         .max_in_flight(10)
///         .build();
///
///     let mut reader = Reader::new("events", "archive", config)?;
///     reader.connect().await?;
///
///     while let Some(event) = reader.next_event().await {
///         match event {
///             ReaderEvent::Message(message) => {
///                 println!("{}", String::from_utf8_lossy(message.body()));
///                 message.finish()?;
///             }
///             ReaderEvent::Error(err) => eprintln!("reader error: {err}"),
///             _ => {}
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Reader {
    topic: String,
    channel: String,
    config: ReaderConfig,
    discard: Option<DiscardHandler>,
    paused: Arc<AtomicBool>,
    events_tx: Option<mpsc::UnboundedSender<ReaderEvent>>,
    events: mpsc::UnboundedReceiver<ReaderEvent>,
    control: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl Reader {
    /// Creates a reader for `topic`/`channel`.
    ///
    /// Nothing is dialed until [`Reader::connect`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`NsqError::Validation`] if the topic or channel name is invalid,
    /// the configuration is inconsistent, or a lookupd address cannot be parsed.
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let topic = topic.into();
        let channel = channel.into();
        validate_topic_name(&topic)?;
        validate_channel_name(&channel)?;
        config.validate()?;
        for endpoint in &config.lookupd_http_addresses {
            lookup_url(endpoint, &topic)?;
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            topic,
            channel,
            config,
            discard: None,
            paused: Arc::new(AtomicBool::new(false)),
            events_tx: Some(events_tx),
            events,
            control: None,
            task: None,
            closed: false,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Registers a callback for messages that reached `max_attempts`.
    ///
    /// The handler runs before the message is finished automatically, both when
    /// such a message is delivered and when a requeue would exceed the limit.
    /// Must be called before [`Reader::connect`].
    pub fn on_discard<F>(&mut self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.discard = Some(Arc::new(handler));
    }

    /// Starts discovery and begins connecting to nsqd.
    ///
    /// Returns once the reader is running; connection progress is reported
    /// through [`ReaderEvent::NsqdConnected`] and [`ReaderEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns [`NsqError::Validation`] when called twice or after
    /// [`Reader::close`].
    pub async fn connect(&mut self) -> Result<()> {
        if self.closed {
            return Err(NsqError::Validation("reader is closed".to_string()));
        }
        let Some(app_events) = self.events_tx.take() else {
            return Err(NsqError::Validation("reader is already connected".to_string()));
        };

        let policy = Arc::new(MessagePolicy {
            max_attempts: self.config.max_attempts,
            requeue_delay: self.config.requeue_delay,
            discard: self.discard.clone(),
            notify: Some(app_events.downgrade()),
        });
        let identify = IdentifyRequest::new(
            &self.config.connection,
            self.config.message_timeout,
            self.config.sample_rate,
        );

        let (conn_events_tx, conn_events) = mpsc::unbounded_channel();
        let (pool, dialed) = ConnectionPool::new(
            self.topic.clone(),
            self.channel.clone(),
            self.config.connection.clone(),
            identify,
            RetryStrategy::new(self.config.reconnect_base, self.config.reconnect_max),
            policy,
            conn_events_tx,
            app_events.clone(),
        );

        let mut coordinator = ReadyCoordinator::new(
            self.config.max_in_flight,
            self.config.rdy_low_water_mark,
            self.config.rdy_redistribute_interval,
            BackoffPolicy::from_config(&self.config),
        );
        if self.paused.load(Ordering::Acquire) {
            coordinator.pause(Instant::now());
        }

        let (discovered_tx, discovered) = mpsc::unbounded_channel();
        let discovery_task =
            discovery::spawn(&self.config, &self.topic, discovered_tx, app_events.clone())?;

        let (control_tx, control) = mpsc::unbounded_channel();
        let control_loop = ControlLoop {
            pool,
            coordinator,
            discovery_task,
            app_events,
        };
        self.task = Some(tokio::spawn(control_loop.run(
            conn_events,
            dialed,
            discovered,
            control,
        )));
        self.control = Some(control_tx);

        tracing::info!(
            topic = %self.topic,
            channel = %self.channel,
            max_in_flight = self.config.max_in_flight,
            "reader started"
        );
        Ok(())
    }

    /// Closes every connection and stops discovery. One-way: the reader cannot
    /// be connected again, and answering messages still held by the
    /// application fails with [`NsqError::ConnectionClosed`].
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events_tx = None;

        if let Some(control) = self.control.take() {
            let (ack_tx, ack) = oneshot::channel();
            if control.send(Control::Close(ack_tx)).is_ok() {
                let _ = ack.await;
            }
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!(topic = %self.topic, channel = %self.channel, "reader closed");
    }

    /// Stops message flow by setting every connection's RDY to 0. Messages
    /// already delivered can still be answered.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.send_control(Control::Pause);
    }

    /// Restores the RDY counts a paused reader had.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
        self.send_control(Control::Unpause);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Waits for the next event. Returns `None` once the reader is closed and
    /// all pending events were consumed.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        self.events.recv().await
    }

    fn send_control(&self, command: Control) {
        if let Some(control) = &self.control {
            let _ = control.send(command);
        }
    }
}

/// The single task that owns the pool, the coordinator and discovery.
struct ControlLoop {
    pool: ConnectionPool,
    coordinator: ReadyCoordinator,
    discovery_task: Option<JoinHandle<()>>,
    app_events: mpsc::UnboundedSender<ReaderEvent>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut dialed: mpsc::UnboundedReceiver<Dialed>,
        mut discovered: mpsc::UnboundedReceiver<AddressDiff>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            let deadline = self.coordinator.next_deadline(Instant::now());
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some(event) = conn_events.recv() => self.on_connection_event(event),
                Some(result) = dialed.recv() => self.on_dialed(result),
                Some(diff) = discovered.recv() => self.on_discovery(diff),
                command = control.recv() => match command {
                    Some(Control::Pause) => {
                        let updates = self.coordinator.pause(Instant::now());
                        self.apply(updates);
                    }
                    Some(Control::Unpause) => {
                        let updates = self.coordinator.unpause(Instant::now());
                        self.apply(updates);
                    }
                    Some(Control::Close(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                _ = timer => {
                    let updates = self.coordinator.tick(Instant::now());
                    self.apply(updates);
                }
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let now = Instant::now();
        match event {
            ConnectionEvent::Delivered { conn } => self.coordinator.message_delivered(conn),
            ConnectionEvent::Completed { conn, completion } => {
                let updates = self.coordinator.message_completed(conn, completion, now);
                self.apply(updates);
                self.close_if_drained(conn, now);
            }
            ConnectionEvent::CloseWait { conn } => self.close_if_drained(conn, now),
            ConnectionEvent::DaemonError { conn, error } => {
                tracing::warn!(
                    conn,
                    addr = self.pool.address_of(conn).unwrap_or("unknown"),
                    error = %error,
                    "nsqd reported an error"
                );
                let _ = self.app_events.send(ReaderEvent::Error(error));
            }
            ConnectionEvent::Closed { conn, error } => {
                self.pool.handle_closed(conn, error);
                let updates = self.coordinator.remove_connection(conn, now);
                self.apply(updates);
            }
        }
    }

    fn on_dialed(&mut self, dialed: Dialed) {
        if let Some(joined) = self.pool.handle_dialed(dialed) {
            let updates = self
                .coordinator
                .add_connection(joined.conn, joined.max_rdy, Instant::now());
            self.apply(updates);
        }
    }

    fn on_discovery(&mut self, diff: AddressDiff) {
        self.pool.add_addresses(&diff.added);
        let now = Instant::now();
        for conn in self.pool.remove_addresses(&diff.removed) {
            let updates = self.coordinator.drain(conn, now);
            self.apply(updates);
            self.close_if_drained(conn, now);
        }
    }

    fn close_if_drained(&mut self, conn: u64, now: Instant) {
        if !self.coordinator.is_drained(conn) {
            return;
        }
        if let Some(addr) = self.pool.address_of(conn) {
            tracing::info!(addr = %addr, conn, "drained nsqd connection");
        }
        self.pool.handle_closed(conn, None);
        let updates = self.coordinator.remove_connection(conn, now);
        self.apply(updates);
    }

    fn apply(&self, updates: Vec<RdyUpdate>) {
        for update in updates {
            self.pool.set_ready(update.conn, update.count);
        }
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
        self.pool.shutdown();
    }
}
