//! Agent runtime orchestration.
//!
//! Worker layout (bounded channels throughout):
//!
//! ```text
//! watcher ─┐                  ┌─ publish worker ── broker worker ── MQTT
//! poller  ─┴─ ingress ── pipeline workers ─┘            │
//!                                    command dispatcher ┘ (inbound /cmd)
//! ```
//!
//! The pipeline workers flatten snapshots in parallel; a single publish
//! worker owns the dedupe store and the semantic machinery so every store
//! keeps one writer; the broker worker owns the client and the Sparkplug
//! session. Shutdown closes ingress first, drains the pipeline, then lets
//! the broker worker publish its deaths; a hard deadline bounds the whole
//! sequence, after which the last-will covers NDEATH.

use crate::config::{AgentConfig, PayloadMode};
use crate::mqtt::{now_ms, run_broker_worker, BrokerCommand, InboundMessage};
use crate::observability::{
    record_asset_states, record_command, record_error, record_evictions, record_flattened,
    run_health_server, HealthState,
};
use crate::retained::RetainedPublisher;
use crate::sparkplug::SparkplugSession;
use crate::watcher::run_file_watcher;
use aas_uplink_adapter_aas::{RepositoryClient, RepositoryClientConfig};
use aas_uplink_core::aas::Environment;
use aas_uplink_core::{
    flatten_submodel, iter_submodels, AddressResolver, LeafRecord, MappingConfig,
};
use aas_uplink_proto::topics::{drift_topic, fidelity_topic, lifecycle_topic, context_topic};
use aas_uplink_proto::RetainedTopicScheme;
use aas_uplink_semantic::command::{ack_payload, nack_payload};
use aas_uplink_semantic::{
    AssetState, CommandDecision, CommandRouter, DriftDetector, FidelityCalculator,
    LifecycleTracker, PointerCache, StreamingDetector, Validator, WriteCommand, WriteTarget,
};
use aas_uplink_state::{HashStore, SemanticStore, SparkplugStore};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One ingress event: a complete AAS snapshot with its origin.
pub struct IngressEvent {
    /// Loaded environment
    pub env: Environment,
    /// File path or repository URL
    pub origin: String,
}

/// Flattened output of one snapshot, produced by a pipeline worker.
struct SnapshotWork {
    origin: String,
    submodels: Vec<SubmodelWork>,
}

struct SubmodelWork {
    asset_uri: String,
    records: Vec<LeafRecord>,
    source_count: usize,
}

/// Run the daemon until a shutdown signal.
///
/// # Errors
///
/// Returns error on startup failures (persistence, broker-fatal); the
/// caller maps the error chain to an exit code.
pub async fn run(config: AgentConfig, mappings: MappingConfig) -> Result<()> {
    let health = HealthState::new();
    crate::observability::init_metrics(&config.observability)?;

    // Persistence. Schema mismatches and I/O failures here are fatal.
    let state_dir = &config.state.dir;
    let sparkplug_store =
        SparkplugStore::open(&state_dir.join("sparkplug.db"), config.state.max_aliases)?;
    let hash_store = HashStore::open(&state_dir.join("hashes.db"), config.state.max_hashes)?;
    let semantic_store = SemanticStore::open(
        &state_dir.join("semantic.db"),
        config.state.max_semantic_entries,
    )?;

    // Shared read-mostly components.
    let resolver = Arc::new(AddressResolver::new(mappings));
    let validator = Arc::new(Validator::new(config.semantic.validation.clone()));
    let scheme = RetainedTopicScheme::new(&config.uns.root_topic);
    let router = Arc::new(Mutex::new(CommandRouter::new(config.sync.clone())));

    let session = SparkplugSession::new(config.sparkplug.clone(), sparkplug_store);

    // Channels. Bounded end to end so broker backpressure reaches ingress.
    let (ingress_tx, ingress_rx) = mpsc::channel::<IngressEvent>(16);
    let (work_tx, work_rx) = mpsc::channel::<SnapshotWork>(16);
    let (broker_tx, broker_rx) = mpsc::channel::<BrokerCommand>(256);
    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(64);

    // Health endpoint.
    let health_handle = tokio::spawn(run_health_server(
        health.clone(),
        config.observability.health_port,
    ));

    // Broker I/O worker.
    let broker_handle = tokio::spawn(run_broker_worker(
        config.clone(),
        session,
        broker_rx,
        inbound_tx,
        scheme.command_filter(),
        health.clone(),
    ));

    // Pipeline workers.
    let ingress_rx = Arc::new(tokio::sync::Mutex::new(ingress_rx));
    let mut pipeline_handles = Vec::new();
    for worker in 0..config.pipeline_workers() {
        pipeline_handles.push(tokio::spawn(run_pipeline_worker(
            worker,
            Arc::clone(&ingress_rx),
            work_tx.clone(),
            resolver.clone(),
            config.preferred_language.clone(),
        )));
    }
    drop(work_tx);

    // Publish worker. Persisted streaming-drift models are restored first
    // so restarts resume scoring without a fresh warm-up.
    let mut streaming = StreamingDetector::new(config.semantic.streaming.clone());
    if streaming.enabled() {
        for (asset_id, (model, _)) in semantic_store.drift_state()? {
            if let Some(model) = model {
                streaming.restore(&asset_id, &model);
            }
        }
    }
    let publish_worker = PublishWorker {
        config: config.clone(),
        resolver: resolver.clone(),
        validator: validator.clone(),
        retained: RetainedPublisher::new(
            config.uns.clone(),
            hash_store,
        ),
        drift: DriftDetector::new(config.semantic.drift.clone()),
        streaming,
        lifecycle: LifecycleTracker::new(config.semantic.lifecycle.clone(), &semantic_store)?,
        fidelity: FidelityCalculator::new(config.semantic.fidelity.clone()),
        pointer_cache: PointerCache::new(&semantic_store)?,
        semantic_store,
        router: router.clone(),
        broker_tx: broker_tx.clone(),
    };
    let publish_handle = tokio::spawn(publish_worker.run(work_rx));

    // Command dispatcher.
    let repo_client = if config.repo_client.enabled || config.sync.enabled {
        Some(Arc::new(RepositoryClient::new(RepositoryClientConfig {
            base_url: config.repo_client.base_url.clone(),
            timeout: Duration::from_secs(config.repo_client.timeout_seconds),
            bearer_token: config.repo_client.auth_token.clone(),
            write_retries: config.repo_client.write_retries,
            write_backoff: Duration::from_millis(250),
        })?))
    } else {
        None
    };
    let dispatcher_handle = tokio::spawn(run_command_dispatcher(
        inbound_rx,
        scheme.clone(),
        router,
        validator,
        repo_client.clone(),
        broker_tx.clone(),
    ));

    // Ingress.
    let watcher_handle = tokio::spawn(run_file_watcher(
        config.file_watcher.clone(),
        ingress_tx.clone(),
    ));
    let poller_handle = tokio::spawn(run_repo_poller(config.clone(), ingress_tx.clone()));
    drop(ingress_tx);

    tracing::info!("Agent running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    let deadline = Duration::from_secs(config.shutdown_deadline_seconds.max(1));
    let shutdown = async {
        // Ingress closes first.
        watcher_handle.abort();
        poller_handle.abort();

        // Pipeline drains, then the publish worker sees its channel close.
        for handle in pipeline_handles {
            let _ = handle.await;
        }
        let _ = publish_handle.await;

        // The broker worker flushes queued work, then deaths and disconnect.
        let _ = broker_tx.send(BrokerCommand::Shutdown).await;
        let _ = broker_handle.await;
    };

    if tokio::time::timeout(deadline, shutdown).await.is_err() {
        tracing::warn!(
            deadline_seconds = deadline.as_secs(),
            "Shutdown deadline expired, leaving NDEATH to the last-will"
        );
    }

    dispatcher_handle.abort();
    health_handle.abort();
    tracing::info!("Agent stopped");
    Ok(())
}

/// Flatten incoming snapshots; one worker of a bounded pool.
async fn run_pipeline_worker(
    worker: usize,
    ingress: Arc<tokio::sync::Mutex<mpsc::Receiver<IngressEvent>>>,
    work_tx: mpsc::Sender<SnapshotWork>,
    resolver: Arc<AddressResolver>,
    preferred_lang: String,
) {
    loop {
        let event = { ingress.lock().await.recv().await };
        let Some(event) = event else { break };

        let mut submodels = Vec::new();
        for (submodel, asset_uri) in iter_submodels(&event.env) {
            // Submodels without a shell reference keep their own identity
            // as the mapping key.
            let asset_uri = asset_uri.unwrap_or(&submodel.id).to_string();
            let stream = flatten_submodel(
                submodel,
                &asset_uri,
                &event.origin,
                now_ms(),
                &preferred_lang,
            );

            record_flattened(stream.records.len());
            for error in &stream.errors {
                tracing::warn!(worker, error = %error, "Malformed element skipped");
                record_error("ingress_element");
            }
            // Resolution here warms the memoised address cache off the
            // publish worker's path.
            let _ = resolver.resolve(&asset_uri);

            let source_count = stream.records.len() + stream.errors.len();
            submodels.push(SubmodelWork {
                asset_uri,
                records: stream.records,
                source_count,
            });
        }

        if work_tx
            .send(SnapshotWork {
                origin: event.origin,
                submodels,
            })
            .await
            .is_err()
        {
            break;
        }
    }
    tracing::debug!(worker, "Pipeline worker stopped");
}

/// Poll the AAS repository on its configured interval.
async fn run_repo_poller(config: AgentConfig, ingress: mpsc::Sender<IngressEvent>) -> Result<()> {
    if !config.repo_client.enabled {
        return Ok(());
    }
    let mut client = RepositoryClient::new(RepositoryClientConfig {
        base_url: config.repo_client.base_url.clone(),
        timeout: Duration::from_secs(config.repo_client.timeout_seconds),
        bearer_token: config.repo_client.auth_token.clone(),
        write_retries: config.repo_client.write_retries,
        write_backoff: Duration::from_millis(250),
    })?;

    let mut interval = tokio::time::interval(Duration::from_secs(
        config.repo_client.poll_interval_seconds.max(1),
    ));
    loop {
        interval.tick().await;
        match client.fetch_environment().await {
            Ok((_, false)) => {}
            Ok((env, true)) => {
                tracing::info!("Repository content changed");
                let event = IngressEvent {
                    env,
                    origin: config.repo_client.base_url.clone(),
                };
                if ingress.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Repository poll failed");
                record_error("repository");
            }
        }
    }
}

/// Single-writer stage between the pipeline and the broker: dedupe, semantic
/// machinery, device batching.
struct PublishWorker {
    config: AgentConfig,
    resolver: Arc<AddressResolver>,
    validator: Arc<Validator>,
    retained: RetainedPublisher,
    drift: DriftDetector,
    streaming: StreamingDetector,
    lifecycle: LifecycleTracker,
    fidelity: FidelityCalculator,
    pointer_cache: PointerCache,
    semantic_store: SemanticStore,
    router: Arc<Mutex<CommandRouter>>,
    broker_tx: mpsc::Sender<BrokerCommand>,
}

impl PublishWorker {
    async fn run(mut self, mut work_rx: mpsc::Receiver<SnapshotWork>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                work = work_rx.recv() => {
                    match work {
                        Some(work) => self.process_snapshot(work).await,
                        None => break,
                    }
                }
                _ = tick.tick() => self.lifecycle_tick().await,
            }
        }
        tracing::debug!("Publish worker stopped");
    }

    async fn process_snapshot(&mut self, work: SnapshotWork) {
        // Aggregate per asset: drift, fidelity and the device batch span
        // every submodel of the asset within one snapshot.
        let mut per_asset: HashMap<String, AssetBatch> = HashMap::new();

        for submodel in work.submodels {
            let batch = per_asset.entry(submodel.asset_uri.clone()).or_default();
            batch.source_count += submodel.source_count;

            for record in submodel.records {
                match self.validator.validate(&record) {
                    outcome if outcome.is_reject() => {
                        tracing::info!(
                            path = %record.qualified_name(),
                            "Record rejected by validation"
                        );
                        record_error("validation_reject");
                        continue;
                    }
                    aas_uplink_semantic::ValidationOutcome::Warn(violations) => {
                        tracing::warn!(
                            path = %record.qualified_name(),
                            violations = violations.len(),
                            "Record failed validation, passing with warning"
                        );
                        record_error("validation_warn");
                    }
                    _ => {}
                }
                batch.records.push(record);
            }
        }

        for (asset_uri, batch) in per_asset {
            self.process_asset(&asset_uri, batch).await;
        }
        tracing::debug!(origin = %work.origin, "Snapshot processed");
    }

    async fn process_asset(&mut self, asset_uri: &str, batch: AssetBatch) {
        let address = self.resolver.resolve(asset_uri);
        let mut published: Vec<LeafRecord> = Vec::new();
        let mut topics: Vec<String> = Vec::new();

        // Streaming anomaly scoring observes the full record stream.
        if self.streaming.enabled() {
            for record in &batch.records {
                if let Some(event) = self.streaming.observe(asset_uri, record) {
                    self.send_system(drift_topic(asset_uri), event.to_payload(), false).await;
                }
            }
            // The learned model is persisted after each snapshot and
            // restored at startup, so a restart does not repeat warm-up or
            // raise a spurious anomaly storm.
            if let Err(e) = self.semantic_store.upsert_drift_state(
                asset_uri,
                self.streaming.export(asset_uri).as_deref(),
                self.streaming.observations(asset_uri),
            ) {
                tracing::error!(asset_uri, error = %e, "Drift state store failed");
                record_error("persistence");
            }
        }

        // Schema drift against the stored fingerprint.
        match self
            .drift
            .observe_snapshot(&mut self.semantic_store, asset_uri, &batch.records, now_ms())
        {
            Ok(events) => {
                for event in events {
                    self.send_system(drift_topic(asset_uri), event.to_payload(), false).await;
                }
            }
            Err(e) => {
                tracing::error!(asset_uri, error = %e, "Drift detection failed");
                record_error("persistence");
            }
        }

        // Retained plane, in traversal order.
        let pointer_mode = !matches!(self.config.uns.payload_mode, PayloadMode::Inline);
        for record in &batch.records {
            let topic = self.retained.topic(&address, record);

            let pointer = if pointer_mode && record.semantic_id.is_some() {
                match self.pointer_cache.resolve(
                    &mut self.semantic_store,
                    record,
                    crate::retained::SOURCE_NAME,
                ) {
                    Ok((pointer, announce)) => {
                        if let Some(bundle) = announce {
                            self.send_system(
                                context_topic(&pointer.dictionary, &pointer.hash),
                                bundle,
                                true,
                            )
                            .await;
                        }
                        Some(pointer)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Context dictionary failed");
                        record_error("persistence");
                        None
                    }
                }
            } else {
                None
            };

            // Commands must resolve targets even for deduplicated topics.
            if self.config.sync.enabled {
                if let Ok(mut router) = self.router.lock() {
                    router.register_target(&topic, record);
                }
            }
            topics.push(topic.clone());

            match self.retained.publish(&topic, record, pointer.as_ref()) {
                Ok(Some(publish)) => {
                    published.push(record.clone());
                    if self
                        .broker_tx
                        .send(BrokerCommand::Retained(publish))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(topic, error = %e, "Hash store failed");
                    record_error("persistence");
                }
            }
        }

        // Lifecycle plane: one device per asset.
        if self.config.sparkplug.enabled && !batch.records.is_empty() {
            let changed = if self.config.uns.enabled {
                published.clone()
            } else {
                batch.records.clone()
            };
            let command = BrokerCommand::DeviceData {
                device_id: address.asset.clone(),
                all: batch.records.clone(),
                changed,
            };
            if self.broker_tx.send(command).await.is_err() {
                return;
            }
        }

        // Lifecycle tracking.
        if self.lifecycle.enabled() {
            match self
                .lifecycle
                .mark_seen(&mut self.semantic_store, asset_uri, &topics, now_ms())
            {
                Ok(Some(event)) if self.config.semantic.lifecycle.publish_events => {
                    self.send_system(lifecycle_topic(asset_uri), event.to_payload(), false).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(asset_uri, error = %e, "Lifecycle store failed");
                    record_error("persistence");
                }
            }
            record_asset_states(
                self.lifecycle.count(AssetState::Online),
                self.lifecycle.count(AssetState::Stale),
                self.lifecycle.count(AssetState::Offline),
            );
        }

        // Fidelity scoring.
        if self.fidelity.enabled() {
            match self.fidelity.score_snapshot(
                &mut self.semantic_store,
                asset_uri,
                batch.source_count,
                &published,
            ) {
                Ok(report) if report.alert => {
                    self.send_system(fidelity_topic(asset_uri), report.to_payload(), false).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(asset_uri, error = %e, "Fidelity store failed");
                    record_error("persistence");
                }
            }
        }

        record_evictions("hashes", self.retained.evictions());
        record_evictions("semantic", self.semantic_store.evictions());
    }

    async fn lifecycle_tick(&mut self) {
        if !self.lifecycle.enabled() {
            return;
        }
        let events = match self.lifecycle.tick(&mut self.semantic_store, now_ms()) {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "Lifecycle tick failed");
                record_error("persistence");
                return;
            }
        };

        for event in events {
            if self.config.semantic.lifecycle.publish_events {
                self.send_system(lifecycle_topic(&event.asset_id), event.to_payload(), false)
                    .await;
            }

            if event.state == AssetState::Offline {
                // The Sparkplug device dies with the asset.
                let device_id = self.resolver.resolve(&event.asset_id).asset;
                let _ = self
                    .broker_tx
                    .send(BrokerCommand::DeviceOffline { device_id })
                    .await;

                for topic in event.topics_to_clear {
                    if let Err(e) = self.retained.forget(&topic) {
                        tracing::error!(topic, error = %e, "Hash store failed");
                    }
                    let _ = self
                        .broker_tx
                        .send(BrokerCommand::ClearRetained { topic })
                        .await;
                }
            }
        }

        record_asset_states(
            self.lifecycle.count(AssetState::Online),
            self.lifecycle.count(AssetState::Stale),
            self.lifecycle.count(AssetState::Offline),
        );
    }

    async fn send_system(&mut self, topic: String, payload: Vec<u8>, retain: bool) {
        if self
            .broker_tx
            .send(BrokerCommand::System { topic, payload, retain })
            .await
            .is_err()
        {
            tracing::debug!("Broker channel closed");
        }
    }
}

#[derive(Default)]
struct AssetBatch {
    records: Vec<LeafRecord>,
    source_count: usize,
}

/// Dispatch inbound commands with at-most-one in-flight write per
/// `(asset, submodel, path)`; distinct paths proceed in parallel.
async fn run_command_dispatcher(
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    scheme: RetainedTopicScheme,
    router: Arc<Mutex<CommandRouter>>,
    validator: Arc<Validator>,
    repo: Option<Arc<RepositoryClient>>,
    broker_tx: mpsc::Sender<BrokerCommand>,
) {
    let (done_tx, mut done_rx) = mpsc::channel::<String>(64);
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut queued: HashMap<String, VecDeque<(WriteTarget, WriteCommand, String)>> = HashMap::new();

    loop {
        tokio::select! {
            message = inbound_rx.recv() => {
                let Some(message) = message else { break };
                let Some(topic) = scheme.parse_command(&message.topic) else {
                    continue;
                };

                let decision = {
                    let Ok(router) = router.lock() else { continue };
                    if !router.enabled() {
                        continue;
                    }
                    router.route(&topic, &message.payload, &validator)
                };

                match decision {
                    CommandDecision::Reject { response_topic, payload, error } => {
                        record_command(error);
                        let _ = broker_tx
                            .send(BrokerCommand::System {
                                topic: response_topic,
                                payload,
                                retain: false,
                            })
                            .await;
                    }
                    CommandDecision::Execute { target, command, response_topic } => {
                        let key = format!(
                            "{}|{}|{}",
                            target.asset_uri, target.submodel_id, target.id_short_path
                        );
                        if in_flight.contains(&key) {
                            // Serialised in arrival order per path.
                            queued.entry(key).or_default().push_back((
                                target,
                                command,
                                response_topic,
                            ));
                        } else {
                            in_flight.insert(key.clone());
                            spawn_write(
                                key,
                                target,
                                command,
                                response_topic,
                                repo.clone(),
                                broker_tx.clone(),
                                done_tx.clone(),
                            );
                        }
                    }
                }
            }

            key = done_rx.recv() => {
                let Some(key) = key else { break };
                if let Some(queue) = queued.get_mut(&key) {
                    if let Some((target, command, response_topic)) = queue.pop_front() {
                        spawn_write(
                            key.clone(),
                            target,
                            command,
                            response_topic,
                            repo.clone(),
                            broker_tx.clone(),
                            done_tx.clone(),
                        );
                        continue;
                    }
                }
                queued.remove(&key);
                in_flight.remove(&key);
            }
        }
    }
    tracing::debug!("Command dispatcher stopped");
}

fn spawn_write(
    key: String,
    target: WriteTarget,
    command: WriteCommand,
    response_topic: String,
    repo: Option<Arc<RepositoryClient>>,
    broker_tx: mpsc::Sender<BrokerCommand>,
    done_tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let payload = match &repo {
            Some(repo) => {
                let result = repo
                    .write_property(&target.submodel_id, &target.id_short_path, &command.value_json)
                    .await;
                match result {
                    Ok(()) => {
                        tracing::info!(
                            submodel_id = %target.submodel_id,
                            path = %target.id_short_path,
                            "Command write applied"
                        );
                        record_command("success");
                        ack_payload(command.correlation_id.as_deref(), now_ms())
                    }
                    Err(e) => {
                        tracing::error!(
                            submodel_id = %target.submodel_id,
                            path = %target.id_short_path,
                            error = %e,
                            "Command write failed"
                        );
                        record_command("write_failed");
                        nack_payload("write_failed", command.correlation_id.as_deref())
                    }
                }
            }
            None => {
                tracing::warn!("Command received but no repository client is configured");
                record_command("write_failed");
                nack_payload("write_failed", command.correlation_id.as_deref())
            }
        };

        let _ = broker_tx
            .send(BrokerCommand::System {
                topic: response_topic,
                payload,
                retain: false,
            })
            .await;
        let _ = done_tx.send(key).await;
    });
}
