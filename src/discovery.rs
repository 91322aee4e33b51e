//! Where the reader's daemons come from: a fixed list of `nsqd` addresses or
//! periodic `nsqlookupd` queries.

use crate::config::ReaderConfig;
use crate::error::{NsqError, Result};
use crate::reader::ReaderEvent;
use futures::future::join_all;
use rand::Rng;
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Change to the set of daemons the reader should be connected to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AddressDiff {
    pub(crate) added: Vec<String>,
    pub(crate) removed: Vec<String>,
}

impl AddressDiff {
    pub(crate) fn between(previous: &BTreeSet<String>, next: &BTreeSet<String>) -> Self {
        Self {
            added: next.difference(previous).cloned().collect(),
            removed: previous.difference(next).cloned().collect(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Debug, Deserialize)]
struct Producers {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// Older nsqlookupd versions wrap the payload in `{"status_code", "data"}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    Wrapped { data: Producers },
    Plain(Producers),
}

/// Builds the lookup URL for `endpoint`, which is either `host:port` or a full
/// `http(s)://` URL. An explicit path is kept; otherwise `/lookup` is used.
pub(crate) fn lookup_url(endpoint: &str, topic: &str) -> Result<Url> {
    let raw = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };
    let mut url = Url::parse(&raw)
        .map_err(|e| NsqError::Validation(format!("invalid lookupd address {endpoint:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NsqError::Validation(format!(
            "lookupd address {endpoint:?} must use http or https"
        )));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/lookup");
    }
    url.query_pairs_mut().append_pair("topic", topic);
    Ok(url)
}

pub(crate) fn parse_producers(body: &[u8]) -> Result<BTreeSet<String>> {
    let producers = match serde_json::from_slice::<LookupResponse>(body)? {
        LookupResponse::Wrapped { data } => data.producers,
        LookupResponse::Plain(producers) => producers.producers,
    };
    Ok(producers
        .into_iter()
        .map(|producer| {
            if producer.broadcast_address.contains(':') {
                format!("[{}]:{}", producer.broadcast_address, producer.tcp_port)
            } else {
                format!("{}:{}", producer.broadcast_address, producer.tcp_port)
            }
        })
        .collect())
}

/// Starts discovery. Static addresses are announced once and no task is
/// spawned; lookupd endpoints get a polling task.
pub(crate) fn spawn(
    config: &ReaderConfig,
    topic: &str,
    updates: mpsc::UnboundedSender<AddressDiff>,
    events: mpsc::UnboundedSender<ReaderEvent>,
) -> Result<Option<JoinHandle<()>>> {
    if config.lookupd_http_addresses.is_empty() {
        let addresses: BTreeSet<String> = config.nsqd_tcp_addresses.iter().cloned().collect();
        let _ = updates.send(AddressDiff::between(&BTreeSet::new(), &addresses));
        return Ok(None);
    }

    let poller = LookupdPoller::new(config, topic)?;
    Ok(Some(tokio::spawn(poller.run(updates, events))))
}

pub(crate) struct LookupdPoller {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    last_known: Vec<BTreeSet<String>>,
    current: BTreeSet<String>,
    interval: Duration,
    jitter: f64,
}

impl LookupdPoller {
    pub(crate) fn new(config: &ReaderConfig, topic: &str) -> Result<Self> {
        let endpoints = config
            .lookupd_http_addresses
            .iter()
            .map(|endpoint| lookup_url(endpoint, topic))
            .collect::<Result<Vec<_>>>()?;
        let client = reqwest::Client::builder()
            .timeout(config.lookupd_request_timeout)
            .user_agent(config.connection.user_agent.clone())
            .build()
            .map_err(|e| NsqError::Validation(format!("failed to build lookupd client: {e}")))?;

        Ok(Self {
            client,
            last_known: vec![BTreeSet::new(); endpoints.len()],
            endpoints,
            current: BTreeSet::new(),
            interval: config.lookupd_poll_interval,
            jitter: config.lookupd_poll_jitter,
        })
    }

    async fn run(
        mut self,
        updates: mpsc::UnboundedSender<AddressDiff>,
        events: mpsc::UnboundedSender<ReaderEvent>,
    ) {
        loop {
            let (diff, errors) = self.poll_once().await;
            for error in errors {
                let _ = events.send(ReaderEvent::Error(error));
            }
            if let Some(diff) = diff {
                tracing::info!(
                    added = ?diff.added,
                    removed = ?diff.removed,
                    "lookupd producers changed"
                );
                if updates.send(diff).is_err() {
                    return;
                }
            }

            let r: f64 = rand::rng().random();
            tokio::time::sleep(self.next_delay(r)).await;
        }
    }

    /// Sleep between polls: `interval + interval * jitter * r`.
    pub(crate) fn next_delay(&self, r: f64) -> Duration {
        self.interval + self.interval.mul_f64(self.jitter * r.clamp(0.0, 1.0))
    }

    pub(crate) async fn poll_once(&mut self) -> (Option<AddressDiff>, Vec<NsqError>) {
        let results = join_all(
            self.endpoints
                .iter()
                .map(|url| fetch_producers(&self.client, url)),
        )
        .await;
        self.apply(results)
    }

    /// Folds one round of endpoint results into the address set. A failed
    /// endpoint keeps contributing the producers it last reported.
    pub(crate) fn apply(
        &mut self,
        results: Vec<Result<BTreeSet<String>>>,
    ) -> (Option<AddressDiff>, Vec<NsqError>) {
        let mut errors = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(producers) => self.last_known[index] = producers,
                Err(err) => {
                    tracing::warn!(
                        endpoint = %self.endpoints[index],
                        error = %err,
                        "lookupd query failed, keeping previous producers"
                    );
                    errors.push(err);
                }
            }
        }

        let next: BTreeSet<String> = self.last_known.iter().flatten().cloned().collect();
        let diff = AddressDiff::between(&self.current, &next);
        self.current = next;
        ((!diff.is_empty()).then_some(diff), errors)
    }
}

async fn fetch_producers(client: &reqwest::Client, url: &Url) -> Result<BTreeSet<String>> {
    let failed = |reason: String| NsqError::Discovery {
        endpoint: url.to_string(),
        reason,
    };

    let response = client
        .get(url.clone())
        .header(ACCEPT, "application/vnd.nsq; version=1.0")
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?
        .error_for_status()
        .map_err(|e| failed(e.to_string()))?;
    let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    parse_producers(&body).map_err(|e| failed(e.to_string()))
}
