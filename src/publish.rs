//! Outbound HTTP push publisher pipeline.
//!
//! One publisher runs per HTTP push connection. It receives multi-mapped
//! outbound signals, renders each target's address template, applies header
//! mapping and reserved-header restructuring, signs the request when the
//! connection carries credentials, dispatches through a bounded-parallelism
//! stage and correlates responses back to the originating signal. Every
//! mapped signal gets exactly one reply: an acknowledgements aggregate or a
//! typed live response.
//!
//! Request lifecycle: `Pending -> Dispatched -> (Responded | Failed |
//! TimedOut) -> Replied`. A transport timeout yields a gateway-timeout
//! acknowledgement; other transport failures map through the connection's
//! status resolver. Neither is retried here - reconnection is the
//! supervisor's concern.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::acks::{AckLabel, Acknowledgement, Acknowledgements};
use crate::address::HttpPushAddress;
use crate::config::Config;
use crate::connection::{Connection, Target};
use crate::correlation::{correlate_response, CorrelationOutcome};
use crate::error::Error;
use crate::external::{apply_reserved_headers, ExternalMessage, HttpRequest, HttpResponse, Payload};
use crate::placeholder::{PlaceholderContext, Template};
use crate::signal::{Adaptable, MessageResponse, Signal};
use crate::signing::{signer_for, RequestSigner};
use crate::throttle::{CounterKey, CounterRegistry, Direction};

/// Dispatches one request and resolves to its response.
///
/// Implementations time out on their own; the publisher never cancels an
/// individual dispatch.
pub trait HttpTransport: Send + Sync + 'static {
    fn dispatch(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, Error>>;
}

/// Production transport backed by a pooled reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport_with("failed to build HTTP client", e))?;
        Ok(Self { client, timeout })
    }
}

impl HttpTransport for ReqwestTransport {
    fn dispatch(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, Error>> {
        let client = self.client.clone();
        let timeout_millis = self.timeout.as_millis() as u64;

        Box::pin(async move {
            let mut builder = client.request(request.method, request.uri);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder.body(request.body).send().await.map_err(|e| {
                if e.is_timeout() {
                    Error::RequestTimeout {
                        millis: timeout_millis,
                    }
                } else {
                    Error::transport_with("request dispatch failed", e)
                }
            })?;

            let status = response.status();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_owned(),
                        value.to_str().unwrap_or_default().to_owned(),
                    )
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::transport_with("failed to read response body", e))?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

/// A signal together with its protocol form and external representation.
#[derive(Clone, Debug)]
pub struct MappedOutboundSignal {
    pub signal: Signal,
    pub targets: Vec<Target>,
    pub adaptable: Adaptable,
    pub external_message: ExternalMessage,
}

/// The single reply emitted for one mapped outbound signal.
#[derive(Clone, Debug, PartialEq)]
pub enum PublishReply {
    Acks(Acknowledgements),
    LiveResponse(MessageResponse),
}

/// A batch of mapped signals from one sender, each with its reply slot.
pub struct MultiMappedOutboundSignal {
    /// Identity of the sender, for logging only.
    pub sender: String,
    pub signals: Vec<(MappedOutboundSignal, oneshot::Sender<PublishReply>)>,
}

/// Per-request lifecycle, for tracing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum RequestState {
    Pending,
    Dispatched,
    Responded,
    Failed,
    TimedOut,
}

struct Shared {
    connection: Arc<Connection>,
    base_uri: Url,
    signer: Option<Arc<dyn RequestSigner>>,
    transport: Arc<dyn HttpTransport>,
    counters: Arc<CounterRegistry>,
    semaphore: Arc<Semaphore>,
    ack_timeout: Duration,
    ack_headers: BTreeMap<String, String>,
}

/// Handle to a running publisher pipeline.
#[derive(Clone)]
pub struct HttpPushPublisher {
    input: mpsc::Sender<MultiMappedOutboundSignal>,
    connection_id: String,
}

impl HttpPushPublisher {
    /// Spawns the publisher task for `connection`.
    ///
    /// The returned join handle completes once the pipeline has drained after
    /// cancellation.
    pub fn spawn(
        connection: Arc<Connection>,
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        counters: Arc<CounterRegistry>,
        cancel: CancellationToken,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), Error> {
        let base_uri = Url::parse(&connection.uri)
            .map_err(|e| Error::config_invalid(format!("connection URI: {e}")))?;
        let signer = connection
            .credentials
            .as_ref()
            .map(signer_for)
            .transpose()?;

        let shared = Arc::new(Shared {
            base_uri,
            signer,
            transport,
            counters,
            semaphore: Arc::new(Semaphore::new(config.http_push_parallelism())),
            ack_timeout: config.ack_timeout(),
            ack_headers: connection.ack_headers(),
            connection: connection.clone(),
        });

        let (input, rx) = mpsc::channel(config.http_push_parallelism().max(1) * 2);
        let shutdown_timeout = config.shutdown_timeout();
        let handle = tokio::spawn(run(shared, rx, cancel, shutdown_timeout));

        Ok((
            Self {
                input,
                connection_id: connection.id.to_string(),
            },
            handle,
        ))
    }

    /// Enqueues a batch for publication.
    pub async fn publish(&self, batch: MultiMappedOutboundSignal) -> Result<(), Error> {
        self.input
            .send(batch)
            .await
            .map_err(|_| Error::PublisherGone {
                id: self.connection_id.clone(),
            })
    }

    /// Publishes one mapped signal and returns its reply slot.
    pub async fn publish_signal(
        &self,
        sender: impl Into<String>,
        signal: MappedOutboundSignal,
    ) -> Result<oneshot::Receiver<PublishReply>, Error> {
        let (tx, rx) = oneshot::channel();
        self.publish(MultiMappedOutboundSignal {
            sender: sender.into(),
            signals: vec![(signal, tx)],
        })
        .await?;
        Ok(rx)
    }
}

async fn run(
    shared: Arc<Shared>,
    mut input: mpsc::Receiver<MultiMappedOutboundSignal>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
) {
    let connection_id = shared.connection.id.clone();
    tracing::info!(connection = %connection_id, "publisher started");

    let mut signals = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            batch = input.recv() => {
                let Some(batch) = batch else { break };
                tracing::debug!(
                    connection = %connection_id,
                    sender = %batch.sender,
                    signals = batch.signals.len(),
                    "publishing batch"
                );
                for (mapped, reply) in batch.signals {
                    signals.spawn(handle_signal(shared.clone(), mapped, reply));
                }
            }
            Some(_) = signals.join_next(), if !signals.is_empty() => {}
        }
    }

    // Drain in-flight signals, then give up and abort.
    let drain = async {
        while signals.join_next().await.is_some() {}
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        tracing::warn!(connection = %connection_id, "drain timed out, aborting in-flight requests");
        signals.abort_all();
    }

    tracing::info!(connection = %connection_id, "publisher stopped");
}

/// Publishes one mapped signal to all of its targets and replies exactly once.
async fn handle_signal(
    shared: Arc<Shared>,
    mapped: MappedOutboundSignal,
    reply: oneshot::Sender<PublishReply>,
) {
    let entity_id = mapped.signal.entity_id().clone();
    let correlation_id = mapped.signal.correlation_id().map(str::to_owned);
    let requested = requested_labels(&mapped.signal);

    let deadline = tokio::time::Instant::now() + shared.ack_timeout;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut dispatched = 0usize;
    for (index, target) in mapped.targets.iter().enumerate() {
        // Permits are acquired in declaration order, so dispatch order follows
        // target order even though responses may arrive out of order.
        let permit = match tokio::time::timeout_at(
            deadline,
            shared.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => break,
            Err(_) => break,
        };

        let shared = shared.clone();
        let mapped = mapped.clone();
        let target = target.clone();
        let tx = tx.clone();
        // Detached on purpose: an elapsed acknowledgement deadline stops the
        // aggregation, not the in-flight request.
        tokio::spawn(async move {
            let outcome = publish_to_target(&shared, &mapped, &target).await;
            drop(permit);
            let _ = tx.send((index, outcome));
        });
        dispatched += 1;
    }
    drop(tx);

    let mut outcomes: Vec<Option<CorrelationOutcome>> = vec![None; mapped.targets.len()];
    let mut received = 0usize;
    while received < dispatched {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some((index, outcome))) => {
                outcomes[index] = Some(outcome);
                received += 1;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(entity = %entity_id, "acknowledgement deadline elapsed");
                break;
            }
        }
    }

    let reply_value = build_reply(&requested, entity_id, correlation_id, outcomes);
    if reply.send(reply_value).is_err() {
        tracing::debug!("reply receiver dropped before the publish finished");
    }
}

/// Acknowledgement labels requested by the signal, in request order.
fn requested_labels(signal: &Signal) -> Vec<AckLabel> {
    let mut labels = Vec::new();
    for label in crate::signal::parse_requested_acks(signal.headers()) {
        match AckLabel::new(&label) {
            Ok(label) => {
                if !labels.contains(&label) {
                    labels.push(label);
                }
            }
            Err(e) => tracing::warn!(label = %label, "skipping invalid requested ack label: {e}"),
        }
    }
    labels
}

fn outcome_label(outcome: &CorrelationOutcome) -> AckLabel {
    match outcome {
        CorrelationOutcome::Ack(ack) => ack.label.clone(),
        CorrelationOutcome::LiveResponse(_) => AckLabel::live_response(),
    }
}

/// Assembles the single reply for a mapped signal.
///
/// A lone requested `live-response` satisfied by a validated live response is
/// replied as the typed response; everything else becomes an aggregate with
/// exactly one envelope per requested label, timeout envelopes filling the
/// labels nothing answered.
fn build_reply(
    requested: &[AckLabel],
    entity_id: crate::signal::EntityId,
    correlation_id: Option<String>,
    outcomes: Vec<Option<CorrelationOutcome>>,
) -> PublishReply {
    let outcomes: Vec<CorrelationOutcome> = outcomes.into_iter().flatten().collect();

    if requested.len() == 1 && requested[0].is_live_response() {
        if let Some(CorrelationOutcome::LiveResponse(live)) = outcomes
            .iter()
            .find(|o| matches!(o, CorrelationOutcome::LiveResponse(_)))
            .cloned()
        {
            return PublishReply::LiveResponse(live);
        }
    }

    let mut acks = Acknowledgements::new(entity_id.clone(), correlation_id);
    for label in requested {
        let matched = outcomes
            .iter()
            .find(|outcome| &outcome_label(outcome) == label)
            .cloned();
        match matched {
            Some(outcome) => acks.insert(outcome.into_ack(label.clone())),
            None => acks.insert(Acknowledgement::timeout(label.clone(), entity_id.clone())),
        }
    }

    PublishReply::Acks(acks)
}

/// Builds, signs and dispatches the request for one target, and correlates
/// the response.
async fn publish_to_target(
    shared: &Shared,
    mapped: &MappedOutboundSignal,
    target: &Target,
) -> CorrelationOutcome {
    let issued_label = target
        .issued_acknowledgement_label
        .as_deref()
        .and_then(|raw| AckLabel::new(raw).ok());
    let entity_id = mapped.signal.entity_id().clone();

    let mut state = RequestState::Pending;
    tracing::trace!(state = %state, address = %target.address, "request accepted");

    let result = async {
        let request = build_request(shared, mapped, target)?;

        shared
            .counters
            .counter(CounterKey {
                connection: shared.connection.id.clone(),
                direction: Direction::Outbound,
                address: target.address.clone(),
            })
            .increment();

        state = RequestState::Dispatched;
        tracing::trace!(state = %state, address = %target.address, "request dispatched");

        shared.transport.dispatch(request).await
    }
    .await;

    match result {
        Ok(response) => {
            state = RequestState::Responded;
            tracing::trace!(state = %state, status = %response.status, "response received");
            match &mapped.signal {
                Signal::Message(command) => correlate_response(
                    command,
                    issued_label.as_ref(),
                    &response,
                    &shared.ack_headers,
                ),
                Signal::Event(_) => {
                    let label = issued_label.unwrap_or_else(AckLabel::live_response);
                    let mut headers: BTreeMap<String, String> = response
                        .headers
                        .iter()
                        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                        .collect();
                    headers.extend(shared.ack_headers.clone());
                    CorrelationOutcome::Ack(
                        Acknowledgement::new(label, entity_id, response.status)
                            .with_headers(headers)
                            .with_entity(crate::acks::ack_entity(
                                response.content_type(),
                                &response.body,
                            )),
                    )
                }
            }
        }
        Err(e) => {
            let status = match &e {
                Error::RequestTimeout { .. } => {
                    state = RequestState::TimedOut;
                    e.ack_status()
                }
                Error::TransportFailure { .. } => {
                    state = RequestState::Failed;
                    shared.connection.transport_failure_status()
                }
                _ => {
                    state = RequestState::Failed;
                    e.ack_status()
                }
            };
            tracing::warn!(
                state = %state,
                connection = %shared.connection.id,
                address = %target.address,
                "publish failed: {e}"
            );

            let label = issued_label.unwrap_or_else(AckLabel::live_response);
            CorrelationOutcome::Ack(
                Acknowledgement::new(label, entity_id, status)
                    .with_headers(shared.ack_headers.clone())
                    .with_entity(Some(serde_json::json!({
                        "status": status.as_u16(),
                        "message": e.to_string(),
                    }))),
            )
        }
    }
}

/// Renders address and header templates into a fully-formed unsigned request
/// and signs it when the connection carries credentials.
fn build_request(
    shared: &Shared,
    mapped: &MappedOutboundSignal,
    target: &Target,
) -> Result<HttpRequest, Error> {
    let address = HttpPushAddress::parse(&target.address)?;
    let ctx = PlaceholderContext::from_signal(&mapped.signal);
    let rendered = address.render(&ctx)?;

    let mut uri = shared.base_uri.clone();
    let path = if rendered.path.starts_with('/') {
        rendered.path.clone()
    } else {
        format!("/{}", rendered.path)
    };
    uri.set_path(&path);
    uri.set_query(rendered.query.as_deref());
    uri.set_fragment(rendered.fragment.as_deref());

    let mut request = HttpRequest::new(address.method.clone(), uri);

    let mut headers = mapped.external_message.headers.clone();
    for (name, template) in &target.header_mapping {
        headers.insert(name, Template::parse(template)?.render(&ctx)?);
    }
    apply_reserved_headers(&mut request, &mut headers)?;
    for (name, value) in headers.iter() {
        request.append_header(name, value);
    }

    if let Some(payload) = &mapped.external_message.payload {
        request.body = match payload {
            Payload::Text(text) => bytes::Bytes::from(text.clone().into_bytes()),
            Payload::Bytes(bytes) => bytes.clone(),
        };
    }

    match &shared.signer {
        Some(signer) => signer.sign(&request, chrono::Utc::now()),
        None => Ok(request),
    }
}
