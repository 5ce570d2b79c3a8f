//! Connection lifecycle registry.
//!
//! Owns every open connection: validation at open/modify, a supervisor task
//! per connection with restart backoff for its publisher, consumer stream
//! attachment for source-carrying connections, and drain-on-close semantics.
//! Connections are immutable; modify atomically replaces the stored handle.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::{Connection, ConnectionId, ConnectionStatus, ConnectionType};
use crate::consume::{
    self, AcknowledgeableMessage, CommitSink, ConsumerStreamConfig, SourceQueue, Transform,
};
use crate::error::Error;
use crate::publish::{HttpPushPublisher, HttpTransport, MultiMappedOutboundSignal};
use crate::throttle::{effective_limit, CounterKey, CounterRegistry, Direction, ThrottlingAlert};
use crate::validation;

const RESTART_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Live state of one open connection.
#[derive(Clone)]
struct ConnectionHandle {
    connection: Arc<Connection>,
    cancel: CancellationToken,
    /// Replaced by the supervisor on publisher restart.
    publisher: Arc<RwLock<Option<HttpPushPublisher>>>,
    tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

/// Registry of open connections.
#[derive(Clone)]
pub struct ConnectivityRegistry {
    config: Config,
    transport: Arc<dyn HttpTransport>,
    counters: Arc<CounterRegistry>,
    connections: Arc<papaya::HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectivityRegistry {
    pub fn new(config: Config, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config,
            transport,
            counters: Arc::new(CounterRegistry::new()),
            connections: Arc::new(papaya::HashMap::new()),
        }
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    /// Validates and opens a connection.
    pub async fn open(&self, connection: Connection) -> Result<(), Error> {
        validation::validate(&connection)?;

        let connection = Arc::new(Connection {
            status: ConnectionStatus::Open,
            ..connection
        });
        let id = connection.id.clone();

        let cancel = CancellationToken::new();
        let publisher = Arc::new(RwLock::new(None));
        let tasks = Arc::new(std::sync::Mutex::new(Vec::new()));

        if connection.connection_type == ConnectionType::HttpPush {
            let (initial, task) = HttpPushPublisher::spawn(
                connection.clone(),
                &self.config,
                self.transport.clone(),
                self.counters.clone(),
                cancel.child_token(),
            )?;
            *publisher.write().expect("publisher slot poisoned") = Some(initial);

            let supervisor = tokio::spawn(supervise_publisher(
                connection.clone(),
                self.config.clone(),
                self.transport.clone(),
                self.counters.clone(),
                publisher.clone(),
                cancel.clone(),
                task,
            ));
            tasks.lock().expect("registry task list poisoned").push(supervisor);
        }

        let handle = ConnectionHandle {
            connection,
            cancel,
            publisher,
            tasks,
        };

        let map = self.connections.pin();
        if map.contains_key(&id) {
            handle.cancel.cancel();
            return Err(Error::ConnectionAlreadyExists { id: id.to_string() });
        }
        map.insert(id.clone(), handle);
        tracing::info!(connection = %id, "connection opened");

        Ok(())
    }

    /// Replaces an existing connection with a new definition.
    ///
    /// The new definition is validated before the old connection is touched;
    /// the old pipelines drain before the replacement opens.
    pub async fn modify(&self, connection: Connection) -> Result<(), Error> {
        validation::validate(&connection)?;

        let id = connection.id.clone();
        self.close(&id).await?;
        self.open(connection).await?;
        tracing::info!(connection = %id, "connection replaced");
        Ok(())
    }

    /// Closes a connection, draining in-flight work up to the shutdown
    /// timeout.
    pub async fn close(&self, id: &ConnectionId) -> Result<(), Error> {
        let handle = {
            let map = self.connections.pin();
            map.remove(id).cloned().ok_or_else(|| Error::ConnectionNotFound {
                id: id.to_string(),
            })?
        };

        handle.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *handle.tasks.lock().expect("registry task list poisoned"),
        );
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            tracing::warn!(connection = %id, "connection tasks did not drain in time");
        }

        for (key, rate) in self
            .counters
            .snapshot()
            .into_iter()
            .filter(|(key, _)| &key.connection == id)
        {
            tracing::info!(
                connection = %id,
                direction = %key.direction,
                address = %key.address,
                rate,
                "closing counter"
            );
        }
        self.counters.remove_connection(id);

        tracing::info!(connection = %id, "connection closed");
        Ok(())
    }

    /// Closes every connection whose id matches the predicate.
    ///
    /// This is the broadcast shutdown: the predicate typically matches on the
    /// namespace part of the connection id.
    pub async fn close_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&ConnectionId) -> bool,
    {
        let matching: Vec<ConnectionId> = {
            let map = self.connections.pin();
            map.iter()
                .map(|(id, _)| id)
                .filter(|id| predicate(id))
                .cloned()
                .collect()
        };

        let mut closed = 0;
        for id in matching {
            if self.close(&id).await.is_ok() {
                closed += 1;
            }
        }
        closed
    }

    pub async fn close_all(&self) {
        self.close_matching(|_| true).await;
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .pin()
            .get(id)
            .map(|handle| handle.connection.clone())
    }

    pub fn open_connection_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .pin()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The current publisher of an HTTP push connection.
    pub fn publisher(&self, id: &ConnectionId) -> Result<HttpPushPublisher, Error> {
        let handle = self
            .connections
            .pin()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound { id: id.to_string() })?;

        let publisher = handle
            .publisher
            .read()
            .expect("publisher slot poisoned")
            .clone();
        publisher.ok_or_else(|| Error::PublisherGone { id: id.to_string() })
    }

    /// Publishes a batch over the given connection.
    pub async fn publish(
        &self,
        id: &ConnectionId,
        batch: MultiMappedOutboundSignal,
    ) -> Result<(), Error> {
        self.publisher(id)?.publish(batch).await
    }

    /// Attaches an at-least-once consumer stream to a source of `id`.
    ///
    /// The caller polls its client library and offers records into the
    /// returned queue; offsets flow back through `commit`. Kafka-type
    /// connections are throttled per the consumer throttling config, all
    /// other types run unthrottled.
    pub fn attach_consumer(
        &self,
        id: &ConnectionId,
        source_address: &str,
        transform: Arc<Transform>,
        sink: tokio::sync::mpsc::Sender<AcknowledgeableMessage>,
        commit: impl CommitSink,
    ) -> Result<SourceQueue, Error> {
        let handle = self
            .connections
            .pin()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound { id: id.to_string() })?;

        if !handle
            .connection
            .sources
            .iter()
            .any(|source| source.addresses.iter().any(|a| a == source_address))
        {
            return Err(Error::config_invalid(format!(
                "connection {id} has no source address {source_address:?}"
            )));
        }

        let counter = self.counters.counter(CounterKey {
            connection: id.clone(),
            direction: Direction::Inbound,
            address: source_address.to_owned(),
        });
        let alert = match handle.connection.connection_type {
            ConnectionType::Kafka => Arc::new(ThrottlingAlert::new(
                counter,
                effective_limit(
                    self.config.kafka_throttling_limit(),
                    self.config.kafka_throttling_interval(),
                    self.config.kafka_throttling_tolerance(),
                ),
            )),
            _ => Arc::new(ThrottlingAlert::unlimited(counter)),
        };

        let (queue, task) = consume::spawn(
            ConsumerStreamConfig::from_config(&self.config),
            transform,
            sink,
            commit,
            Some(alert),
            handle.cancel.child_token(),
        );
        handle
            .tasks
            .lock()
            .expect("registry task list poisoned")
            .push(task);

        Ok(queue)
    }
}

/// Keeps one publisher alive until the connection closes.
///
/// A publisher that stops on its own (panic, internal failure) is restarted
/// with doubling backoff; per-signal failures never reach this level.
async fn supervise_publisher(
    connection: Arc<Connection>,
    config: Config,
    transport: Arc<dyn HttpTransport>,
    counters: Arc<CounterRegistry>,
    slot: Arc<RwLock<Option<HttpPushPublisher>>>,
    cancel: CancellationToken,
    mut task: JoinHandle<()>,
) {
    let mut backoff = RESTART_BACKOFF_INITIAL;

    loop {
        match (&mut task).await {
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::warn!(connection = %connection.id, "publisher stopped, restarting");
            }
            Err(e) => {
                tracing::error!(connection = %connection.id, "publisher crashed: {e}, restarting");
            }
        }

        *slot.write().expect("publisher slot poisoned") = None;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);

        match HttpPushPublisher::spawn(
            connection.clone(),
            &config,
            transport.clone(),
            counters.clone(),
            cancel.child_token(),
        ) {
            Ok((publisher, next)) => {
                *slot.write().expect("publisher slot poisoned") = Some(publisher);
                task = next;
            }
            Err(e) => {
                tracing::error!(connection = %connection.id, "failed to restart publisher: {e}");
                return;
            }
        }
    }
}
