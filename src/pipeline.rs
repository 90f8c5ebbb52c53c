/*!
 * Publish pipeline
 *
 * One logical publish runs as follows:
 *
 * 1. Resolve a sender for the active target: a pooled connection from the
 *    target's `ResourcePool`, then a cached per-entity sender from its
 *    `KeyedClientCache`.
 * 2. Send under the `RetryPolicy`. A transient failure replaces the pooled
 *    connection and evicts the cached sender so the next attempt starts
 *    clean.
 * 3. On exhaustion, record the failure against the target. If the
 *    controller crosses its threshold it trips, and the message gets one
 *    more retried send on the new active target.
 * 4. If that fails too, the message goes to the failure log and the caller
 *    gets `PublishStatus::WriteFailed` (or `WriteToLogFailed` when the log
 *    itself is unavailable).
 */

use crate::broker::{
    BrokerConnection, BrokerConnector, BrokerError, EntitySender, Message, NamespaceConfig,
};
use crate::config::BusguardConfig;
use crate::error::{PublishError, Result};
use crate::failure_log::{
    FailedMessageRecord, FailureClassification, FailureLog, FailureLogError, FailureQuery,
};
use crate::policy::BrokerRetryPolicy;
use async_trait::async_trait;
use busguard_core_resilience::{
    Closeable, EntityKey, FailoverController, FailoverSnapshot, KeyedClientCache, PoolStats,
    ResourceFactory, ResourcePool, RetryError, RetryObserver, RetryPolicy, Target,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result of an accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// The broker accepted the message
    Published { target: Target },
    /// Delivery failed on every target; the message is in the failure log
    WriteFailed,
    /// Delivery failed and the failure log rejected the record too
    WriteToLogFailed,
}

impl PublishStatus {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishStatus::Published { .. })
    }

    /// The target that accepted the message, if any did
    pub fn target(&self) -> Option<Target> {
        match self {
            PublishStatus::Published { target } => Some(*target),
            PublishStatus::WriteFailed | PublishStatus::WriteToLogFailed => None,
        }
    }
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStatus::Published { target } => write!(f, "published via {}", target),
            PublishStatus::WriteFailed => write!(f, "write failed"),
            PublishStatus::WriteToLogFailed => write!(f, "write to log failed"),
        }
    }
}

/// Summary of a failure log replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Records a delivery was attempted for
    pub attempted: usize,
    /// Records delivered and removed from the log
    pub delivered: usize,
    /// Records that failed again and stay in the log
    pub still_failing: usize,
}

/// Point-in-time pipeline statistics
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub published: u64,
    pub write_failed: u64,
    pub write_to_log_failed: u64,
    pub fatal: u64,
    pub failover: FailoverSnapshot,
    pub primary_pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_pool: Option<PoolStats>,
}

type ConnectionOf<C> = <C as BrokerConnector>::Connection;

/// A cached entity sender together with the pooled connection it came from
pub struct PooledSender<N: BrokerConnection> {
    connection: Arc<N>,
    sender: N::Sender,
}

#[async_trait]
impl<N: BrokerConnection> Closeable for PooledSender<N> {
    type Error = BrokerError;

    // The connection belongs to the pool and is closed there
    async fn close(&self) -> std::result::Result<(), BrokerError> {
        self.sender.close().await
    }
}

/// Opens connections to one namespace for a `ResourcePool`
struct NamespaceFactory<C> {
    connector: Arc<C>,
    namespace: NamespaceConfig,
}

#[async_trait]
impl<C: BrokerConnector> ResourceFactory<ConnectionOf<C>> for NamespaceFactory<C> {
    type Error = BrokerError;

    async fn create(&self) -> std::result::Result<ConnectionOf<C>, BrokerError> {
        self.connector.connect(&self.namespace).await
    }

    fn describe(&self) -> String {
        self.namespace.name.clone()
    }
}

/// Connection pool and sender cache for one target
struct Endpoint<C: BrokerConnector> {
    target: Target,
    namespace: String,
    pool: ResourcePool<ConnectionOf<C>, BrokerError>,
    senders: KeyedClientCache<EntityKey, PooledSender<ConnectionOf<C>>>,
}

impl<C: BrokerConnector> Endpoint<C> {
    fn new(
        target: Target,
        connector: &Arc<C>,
        namespace: &NamespaceConfig,
        config: &BusguardConfig,
    ) -> Self {
        let factory = Arc::new(NamespaceFactory {
            connector: Arc::clone(connector),
            namespace: namespace.clone(),
        });

        Self {
            target,
            namespace: namespace.name.clone(),
            pool: ResourcePool::new(factory, config.to_pool_config()),
            senders: KeyedClientCache::new(),
        }
    }

    /// Cached sender for `key`, built on a pooled connection on a miss
    async fn sender_for(
        &self,
        key: &EntityKey,
        entity: &str,
    ) -> std::result::Result<Arc<PooledSender<ConnectionOf<C>>>, BrokerError> {
        self.senders
            .get_or_create(key.clone(), || async {
                let connection = self.pool.acquire().await?;
                match connection.create_sender(entity).await {
                    Ok(sender) => Ok::<_, BrokerError>(PooledSender { connection, sender }),
                    Err(e) => {
                        if e.is_transient() {
                            self.pool.fail_resource(&connection, &e.to_string());
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    /// One send attempt, without retries
    async fn send_once(&self, message: &Message) -> std::result::Result<(), BrokerError> {
        let key = EntityKey::new(&self.namespace, &message.entity);

        let mut pooled = self.sender_for(&key, &message.entity).await?;

        // A sender outlives neither the pooling nor the lifetime of its connection
        if !self.pool.is_live(&pooled.connection) {
            self.senders
                .try_close_and_evict_instance(&key, &pooled)
                .await;
            debug!(
                target = %self.target,
                key = %key,
                "connection recycled, rebuilding sender"
            );
            pooled = self.sender_for(&key, &message.entity).await?;
        }

        if let Err(e) = pooled.sender.send(message).await {
            if e.is_transient() {
                let replaced = self.pool.fail_resource(&pooled.connection, &e.to_string());
                self.senders
                    .try_close_and_evict_instance(&key, &pooled)
                    .await;
                debug!(
                    target = %self.target,
                    key = %key,
                    replaced,
                    "transient send failure, sender evicted"
                );
            }
            return Err(e);
        }

        Ok(())
    }
}

enum Outcome {
    Delivered(Target),
    Fatal {
        target: Target,
        attempts: u32,
        error: BrokerError,
    },
    Cancelled {
        attempts: u32,
    },
    Undelivered {
        target: Target,
        attempts: u32,
        error: BrokerError,
    },
}

/// Resilient publisher over a primary and an optional secondary namespace
pub struct PublishPipeline<C: BrokerConnector> {
    primary: Endpoint<C>,
    secondary: Option<Endpoint<C>>,
    failover: FailoverController,
    retry: RetryPolicy,
    classifier: BrokerRetryPolicy,
    failure_log: Arc<dyn FailureLog>,
    surface_exhaustion: bool,
    published: AtomicU64,
    write_failed: AtomicU64,
    write_to_log_failed: AtomicU64,
    fatal: AtomicU64,
}

impl<C: BrokerConnector> PublishPipeline<C> {
    /// Build a pipeline. The configuration is validated first; no
    /// connection is opened until the first publish.
    pub fn new(
        config: &BusguardConfig,
        connector: Arc<C>,
        failure_log: Arc<dyn FailureLog>,
    ) -> Result<Self> {
        config.validate()?;

        let primary = Endpoint::new(Target::Primary, &connector, &config.primary, config);
        let secondary = config
            .secondary
            .as_ref()
            .map(|namespace| Endpoint::new(Target::Secondary, &connector, namespace, config));

        if secondary.is_none() {
            info!(
                primary = %config.primary.name,
                "no secondary namespace configured, failover disabled"
            );
        }

        Ok(Self {
            primary,
            secondary,
            failover: FailoverController::new(config.to_failover_config()),
            retry: RetryPolicy::new(config.to_retry_config()),
            classifier: BrokerRetryPolicy,
            failure_log,
            surface_exhaustion: config.publish.surface_exhaustion,
            published: AtomicU64::new(0),
            write_failed: AtomicU64::new(0),
            write_to_log_failed: AtomicU64::new(0),
            fatal: AtomicU64::new(0),
        })
    }

    /// Replace the retry telemetry sink
    pub fn with_retry_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.retry = std::mem::take(&mut self.retry).with_observer(observer);
        self
    }

    pub fn failover(&self) -> &FailoverController {
        &self.failover
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn failure_log(&self) -> &Arc<dyn FailureLog> {
        &self.failure_log
    }

    // Without a secondary every target maps to the primary
    fn endpoint(&self, target: Target) -> &Endpoint<C> {
        match target {
            Target::Primary => &self.primary,
            Target::Secondary => self.secondary.as_ref().unwrap_or(&self.primary),
        }
    }

    /// Acquire a pooled connection for `target`
    pub async fn connection(
        &self,
        target: Target,
    ) -> std::result::Result<Arc<ConnectionOf<C>>, BrokerError> {
        self.endpoint(target).pool.acquire().await
    }

    /// Report a connection obtained from [`connection`](Self::connection)
    /// as broken. Returns false if it was already replaced.
    pub fn fail_connection(
        &self,
        target: Target,
        connection: &Arc<ConnectionOf<C>>,
        cause: &str,
    ) -> bool {
        self.endpoint(target).pool.fail_resource(connection, cause)
    }

    /// Publish a message
    pub async fn publish(
        &self,
        message: Message,
    ) -> std::result::Result<PublishStatus, PublishError> {
        self.publish_with_cancel(message, &CancellationToken::new()).await
    }

    /// Publish a message, aborting retry waits when `cancel` fires
    pub async fn publish_with_cancel(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> std::result::Result<PublishStatus, PublishError> {
        message.validate().map_err(PublishError::InvalidMessage)?;

        match self.deliver(&message, cancel).await {
            Outcome::Delivered(target) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message_id = %message.id,
                    entity = %message.entity,
                    %target,
                    "message published"
                );
                Ok(PublishStatus::Published { target })
            }
            Outcome::Cancelled { attempts } => {
                debug!(message_id = %message.id, attempts, "publish cancelled");
                Err(PublishError::Cancelled { attempts })
            }
            Outcome::Fatal {
                target,
                attempts,
                error,
            } => {
                self.fatal.fetch_add(1, Ordering::Relaxed);
                self.capture(
                    message,
                    FailureClassification::Fatal,
                    &error,
                    attempts,
                    target,
                )
                .await;
                Err(PublishError::Fatal {
                    target,
                    attempts,
                    source: error,
                })
            }
            Outcome::Undelivered {
                target,
                attempts,
                error,
            } => {
                let logged = self
                    .capture(
                        message,
                        FailureClassification::Exhausted,
                        &error,
                        attempts,
                        target,
                    )
                    .await;

                if logged {
                    self.write_failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.write_to_log_failed.fetch_add(1, Ordering::Relaxed);
                }

                if self.surface_exhaustion {
                    Err(PublishError::Undelivered {
                        attempts,
                        logged,
                        last_error: error,
                    })
                } else if logged {
                    Ok(PublishStatus::WriteFailed)
                } else {
                    Ok(PublishStatus::WriteToLogFailed)
                }
            }
        }
    }

    /// Re-publish failure log records matching `query`
    pub async fn replay(
        &self,
        query: &FailureQuery,
    ) -> std::result::Result<ReplayReport, FailureLogError> {
        self.replay_with_cancel(query, &CancellationToken::new()).await
    }

    /// Re-publish failure log records matching `query`, oldest first.
    ///
    /// Delivered records are removed from the log. Records that fail again
    /// stay where they are; no new records are written.
    pub async fn replay_with_cancel(
        &self,
        query: &FailureQuery,
        cancel: &CancellationToken,
    ) -> std::result::Result<ReplayReport, FailureLogError> {
        let records = self.failure_log.query(query).await?;
        let mut report = ReplayReport::default();

        for record in records {
            match self.deliver(&record.message, cancel).await {
                Outcome::Cancelled { .. } => break,
                Outcome::Delivered(target) => {
                    report.attempted += 1;
                    self.failure_log.remove(&record.id).await?;
                    report.delivered += 1;
                    info!(
                        record = %record.id,
                        message_id = %record.message.id,
                        %target,
                        "replayed failed message"
                    );
                }
                Outcome::Fatal { error, .. } | Outcome::Undelivered { error, .. } => {
                    report.attempted += 1;
                    report.still_failing += 1;
                    debug!(record = %record.id, error = %error, "replay attempt failed");
                }
            }
        }

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            still_failing = report.still_failing,
            "failure log replay finished"
        );
        Ok(report)
    }

    /// Close every cached sender. Returns the number of close failures.
    pub async fn shutdown(&self) -> usize {
        let mut failures = self.primary.senders.close_all().await;
        if let Some(secondary) = &self.secondary {
            failures += secondary.senders.close_all().await;
        }
        failures
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            published: self.published.load(Ordering::Relaxed),
            write_failed: self.write_failed.load(Ordering::Relaxed),
            write_to_log_failed: self.write_to_log_failed.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            failover: self.failover.snapshot(),
            primary_pool: self.primary.pool.stats(),
            secondary_pool: self.secondary.as_ref().map(|e| e.pool.stats()),
        }
    }

    /// Run the retry/failover algorithm for one message
    async fn deliver(&self, message: &Message, cancel: &CancellationToken) -> Outcome {
        let target = self.failover.active();

        let (attempts, error) = match self.send_with_retry(target, message, cancel).await {
            Ok(()) => return Outcome::Delivered(target),
            Err(RetryError::Exhausted { attempts, last }) => (attempts, last),
            Err(other) => return Self::interrupted(target, 0, other),
        };

        if self.secondary.is_none() {
            return Outcome::Undelivered {
                target,
                attempts,
                error,
            };
        }

        let failures = self.failover.record_failure_for(target);
        if self.failover.should_failover_for(target) {
            self.failover.trip_from(target);
        }

        let next = self.failover.active();
        if next == target {
            debug!(%target, failures, "publish exhausted, below failover threshold");
            return Outcome::Undelivered {
                target,
                attempts,
                error,
            };
        }

        info!(
            message_id = %message.id,
            from = %target,
            to = %next,
            error = %error,
            "publish exhausted, trying other target"
        );

        match self.send_with_retry(next, message, cancel).await {
            Ok(()) => Outcome::Delivered(next),
            Err(RetryError::Exhausted {
                attempts: more,
                last,
            }) => {
                self.failover.record_failure_for(next);
                Outcome::Undelivered {
                    target: next,
                    attempts: attempts + more,
                    error: last,
                }
            }
            Err(other) => Self::interrupted(next, attempts, other),
        }
    }

    fn interrupted(target: Target, prior: u32, error: RetryError<BrokerError>) -> Outcome {
        match error {
            RetryError::Fatal { attempts, error } => Outcome::Fatal {
                target,
                attempts: prior + attempts,
                error,
            },
            RetryError::Exhausted { attempts, last } => Outcome::Undelivered {
                target,
                attempts: prior + attempts,
                error: last,
            },
            RetryError::Cancelled { attempts, .. } => Outcome::Cancelled {
                attempts: prior + attempts,
            },
        }
    }

    async fn send_with_retry(
        &self,
        target: Target,
        message: &Message,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), RetryError<BrokerError>> {
        let endpoint = self.endpoint(target);
        let operation_key = format!("{}/{}#{}", endpoint.namespace, message.entity, message.id);

        self.retry
            .execute(
                &operation_key,
                cancel,
                move |_ctx| endpoint.send_once(message),
                &self.classifier,
            )
            .await
    }

    /// Hand a failed message to the failure log. Returns whether the log
    /// accepted it.
    async fn capture(
        &self,
        message: Message,
        classification: FailureClassification,
        error: &BrokerError,
        attempts: u32,
        target: Target,
    ) -> bool {
        let message_id = message.id.clone();
        let entity = message.entity.clone();
        let record = FailedMessageRecord::new(
            message,
            classification,
            error.to_string(),
            attempts,
            Some(target),
        );
        let record_id = record.id.clone();

        match self.failure_log.record(record).await {
            Ok(()) => {
                error!(
                    message_id = %message_id,
                    entity = %entity,
                    record = %record_id,
                    %classification,
                    %target,
                    attempts,
                    error = %error,
                    "message undelivered, captured in failure log"
                );
                true
            }
            Err(log_error) => {
                error!(
                    message_id = %message_id,
                    entity = %entity,
                    %classification,
                    %target,
                    attempts,
                    error = %error,
                    log_error = %log_error,
                    "message undelivered and failure log write failed"
                );
                false
            }
        }
    }
}

impl<C: BrokerConnector> fmt::Debug for PublishPipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishPipeline")
            .field("primary", &self.primary.namespace)
            .field("secondary", &self.secondary.as_ref().map(|e| &e.namespace))
            .field("active", &self.failover.active())
            .field("retry", &self.retry)
            .finish()
    }
}
