//! Live nsqd connections of a reader.
//!
//! The pool is owned by the reader's control task. Dials and read loops run in
//! their own tasks and report back over channels; every decision about which
//! connections exist is made here.

use crate::config::ConnectionConfig;
use crate::connection::{
    self, is_close_wait, negotiated_timeouts, next_inbound, ConnectOptions, Connection,
    ConnectionEvent, Inbound, StreamReader,
};
use crate::error::{NsqError, Result};
use crate::message::{Message, MessagePolicy, Responder};
use crate::protocol::IdentifyRequest;
use crate::reader::ReaderEvent;
use crate::retry::RetryStrategy;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of a dial started by the pool.
pub(crate) struct Dialed {
    pub(crate) addr: String,
    pub(crate) result: Result<(Connection, StreamReader)>,
}

/// A connection that finished its handshake and joined the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Joined {
    pub(crate) conn: u64,
    pub(crate) max_rdy: u64,
}

pub(crate) struct ConnectionPool {
    topic: String,
    channel: String,
    config: ConnectionConfig,
    identify: IdentifyRequest,
    retry: RetryStrategy,
    policy: Arc<MessagePolicy>,
    desired: BTreeSet<String>,
    live: HashMap<u64, Connection>,
    by_addr: HashMap<String, u64>,
    dialing: HashMap<String, JoinHandle<()>>,
    attempts: HashMap<String, u32>,
    dialed: mpsc::UnboundedSender<Dialed>,
    conn_events: mpsc::UnboundedSender<ConnectionEvent>,
    app_events: mpsc::UnboundedSender<ReaderEvent>,
    closing: bool,
}

impl ConnectionPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        topic: String,
        channel: String,
        config: ConnectionConfig,
        identify: IdentifyRequest,
        retry: RetryStrategy,
        policy: Arc<MessagePolicy>,
        conn_events: mpsc::UnboundedSender<ConnectionEvent>,
        app_events: mpsc::UnboundedSender<ReaderEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<Dialed>) {
        let (dialed, dialed_rx) = mpsc::unbounded_channel();
        let pool = Self {
            topic,
            channel,
            config,
            identify,
            retry,
            policy,
            desired: BTreeSet::new(),
            live: HashMap::new(),
            by_addr: HashMap::new(),
            dialing: HashMap::new(),
            attempts: HashMap::new(),
            dialed,
            conn_events,
            app_events,
            closing: false,
        };
        (pool, dialed_rx)
    }

    pub(crate) fn address_of(&self, conn: u64) -> Option<&str> {
        self.live.get(&conn).map(|connection| connection.address())
    }

    /// Starts dialing newly discovered addresses.
    pub(crate) fn add_addresses(&mut self, addrs: &[String]) {
        for addr in addrs {
            if self.closing || !self.desired.insert(addr.clone()) {
                continue;
            }
            if !self.by_addr.contains_key(addr) && !self.dialing.contains_key(addr) {
                self.dial(addr.clone(), Duration::ZERO);
            }
        }
    }

    /// Forgets addresses that disappeared. Pending dials are cancelled and live
    /// connections start draining; returns the ids now draining.
    pub(crate) fn remove_addresses(&mut self, addrs: &[String]) -> Vec<u64> {
        let mut draining = Vec::new();
        for addr in addrs {
            self.desired.remove(addr);
            self.attempts.remove(addr);
            if let Some(handle) = self.dialing.remove(addr) {
                handle.abort();
            }
            let Some(conn) = self.by_addr.get(addr).copied() else {
                continue;
            };
            if let Some(connection) = self.live.get(&conn) {
                tracing::info!(addr = %addr, conn, "draining nsqd connection");
                // a failed CLS means the writer is gone and the read loop is ending
                if let Err(err) = connection.start_drain() {
                    tracing::debug!(addr = %addr, error = %err, "failed to start drain");
                }
                draining.push(conn);
            }
        }
        draining
    }

    fn dial(&mut self, addr: String, delay: Duration) {
        let options = ConnectOptions {
            addr: addr.clone(),
            config: self.config.clone(),
            identify: self.identify.clone(),
            subscribe: Some((self.topic.clone(), self.channel.clone())),
        };
        let dialed = self.dialed.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let addr = options.addr.clone();
            tracing::debug!(addr = %addr, "connecting to nsqd");
            let result = connection::open(options).await;
            let _ = dialed.send(Dialed { addr, result });
        });
        self.dialing.insert(addr, handle);
    }

    fn schedule_reconnect(&mut self, addr: &str) {
        if self.closing || !self.desired.contains(addr) || self.dialing.contains_key(addr) {
            return;
        }
        let attempt = self.attempts.entry(addr.to_string()).or_insert(0);
        let delay = self.retry.calculate_delay(*attempt);
        *attempt = attempt.saturating_add(1);
        tracing::info!(addr = %addr, delay_ms = delay.as_millis() as u64, "reconnecting to nsqd");
        self.dial(addr.to_string(), delay);
    }

    /// Installs a finished dial. Returns the joined connection so the caller
    /// can hand it to the coordinator.
    pub(crate) fn handle_dialed(&mut self, dialed: Dialed) -> Option<Joined> {
        let Dialed { addr, result } = dialed;
        self.dialing.remove(&addr);

        match result {
            Ok((mut connection, reader)) => {
                if self.closing || !self.desired.contains(&addr) {
                    tracing::debug!(addr = %addr, "dropping connection to an address no longer wanted");
                    connection.close();
                    return None;
                }
                self.attempts.remove(&addr);

                let conn = connection.id();
                let max_rdy = connection.negotiated().identify.max_rdy_count;
                let (msg_timeout, max_msg_timeout) = negotiated_timeouts(connection.negotiated());
                let responder = Arc::new(Responder {
                    conn,
                    addr: connection.shared_address(),
                    state: connection.state_cell(),
                    commands: connection.command_sender(),
                    events: self.conn_events.clone(),
                    msg_timeout,
                    max_msg_timeout,
                });
                let task = tokio::spawn(consume(
                    reader,
                    responder,
                    Arc::clone(&self.policy),
                    self.app_events.clone(),
                    self.conn_events.clone(),
                ));
                connection.attach_read_task(task);

                self.by_addr.insert(addr.clone(), conn);
                self.live.insert(conn, connection);
                let _ = self.app_events.send(ReaderEvent::NsqdConnected(addr));
                Some(Joined { conn, max_rdy })
            }
            Err(err) => {
                tracing::warn!(addr = %addr, error = %err, "failed to connect to nsqd");
                let _ = self.app_events.send(ReaderEvent::Error(err));
                self.schedule_reconnect(&addr);
                None
            }
        }
    }

    /// Handles a read loop that ended. Reconnects when the address is still wanted.
    pub(crate) fn handle_closed(&mut self, conn: u64, error: Option<NsqError>) {
        let Some(addr) = self.close_connection(conn) else {
            return;
        };
        if let Some(err) = error {
            tracing::warn!(addr = %addr, conn, error = %err, "nsqd connection lost");
            let _ = self.app_events.send(ReaderEvent::Error(err));
        }
        self.schedule_reconnect(&addr);
    }

    /// Closes and forgets a connection, announcing it to the application.
    pub(crate) fn close_connection(&mut self, conn: u64) -> Option<String> {
        let mut connection = self.live.remove(&conn)?;
        let addr = connection.address().to_string();
        connection.close();
        if self.by_addr.get(&addr) == Some(&conn) {
            self.by_addr.remove(&addr);
        }
        let _ = self.app_events.send(ReaderEvent::NsqdClosed(addr.clone()));
        Some(addr)
    }

    pub(crate) fn set_ready(&self, conn: u64, count: u64) {
        let Some(connection) = self.live.get(&conn) else {
            return;
        };
        tracing::debug!(addr = %connection.address(), conn, count, "RDY");
        if let Err(err) = connection.set_ready(count) {
            tracing::debug!(conn, error = %err, "failed to send RDY");
        }
    }

    /// Closes everything; the pool accepts no new addresses afterwards.
    pub(crate) fn shutdown(&mut self) {
        self.closing = true;
        self.desired.clear();
        for (_, handle) in self.dialing.drain() {
            handle.abort();
        }
        let conns: Vec<u64> = self.live.keys().copied().collect();
        for conn in conns {
            self.close_connection(conn);
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        for (_, handle) in self.dialing.drain() {
            handle.abort();
        }
    }
}

/// Read loop of one subscribed connection.
async fn consume(
    mut reader: StreamReader,
    responder: Arc<Responder>,
    policy: Arc<MessagePolicy>,
    app_events: mpsc::UnboundedSender<ReaderEvent>,
    conn_events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let conn = responder.conn;
    let error = loop {
        match next_inbound(&mut reader, &responder.commands).await {
            Ok(Inbound::Message(raw)) => {
                let _ = conn_events.send(ConnectionEvent::Delivered { conn });
                let message = Message::new(raw, Arc::clone(&responder), Arc::clone(&policy), Instant::now());
                if policy.attempts_exhausted(message.attempts()) {
                    if let Err(err) = message.discard() {
                        tracing::debug!(id = %message.id(), error = %err, "discard failed");
                    }
                    continue;
                }
                if app_events.send(ReaderEvent::Message(message)).is_err() {
                    break None;
                }
            }
            Ok(Inbound::Response(body)) if is_close_wait(&body) => {
                let _ = conn_events.send(ConnectionEvent::CloseWait { conn });
            }
            Ok(Inbound::Response(body)) => {
                tracing::debug!(
                    addr = %responder.addr,
                    response = %String::from_utf8_lossy(&body),
                    "unexpected response"
                );
            }
            Ok(Inbound::Error(err)) if err.is_fatal() => break Some(err),
            Ok(Inbound::Error(err)) => {
                let _ = conn_events.send(ConnectionEvent::DaemonError { conn, error: err });
            }
            Err(NsqError::ConnectionClosed) => break None,
            Err(err) => break Some(err),
        }
    };
    let _ = conn_events.send(ConnectionEvent::Closed { conn, error });
}
