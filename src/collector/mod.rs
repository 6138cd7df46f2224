use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alarm::AlarmRules;
use crate::cache::{CacheManager, RegisterService, SpanExchanger};
use crate::clock::Granularity;
use crate::cluster::{NodeDirectory, RingRouter, StaticDirectory};
use crate::config::{AlarmConfig, Config};
use crate::entity::{Alarm, Entity, InstanceHeartbeat, NodeReferenceMetric, ServiceMetric};
use crate::error::GraphBuildError;
use crate::health::HealthMetrics;
use crate::ingest::{IngestHandles, RetryQueue, SegmentIngestor};
use crate::remote::{HttpRemoteClient, RemoteServer, SegmentSink};
use crate::storage::ttl::TtlSweeper;
use crate::storage::Storage;
use crate::stream::{GraphId, StageKind, StreamOptions, StreamRuntime};

pub const NODE_REFERENCE_GRAPH: GraphId = GraphId(1);
pub const SERVICE_METRIC_GRAPH: GraphId = GraphId(2);
pub const INSTANCE_HEARTBEAT_GRAPH: GraphId = GraphId(3);
pub const ALARM_GRAPH: GraphId = GraphId(4);

/// Builds the collector's graphs on `runtime` and returns the entries fed by
/// ingestion.
///
/// Every graph aggregates locally, dispatches to the owning node and
/// persists there. Service metrics feed the alarm graph after each flush
/// when alarms are enabled.
pub fn build_graphs<S: Storage>(
    runtime: &mut StreamRuntime<S>,
    alarm: &AlarmConfig,
    health: &Arc<HealthMetrics>,
) -> Result<IngestHandles, GraphBuildError> {
    let alarms = runtime
        .create_graph::<Alarm>(ALARM_GRAPH)
        .add_node(StageKind::Aggregate)
        .add_next(StageKind::Dispatch)
        .add_next(StageKind::Persist)
        .build()?;

    let mut services = runtime
        .create_graph::<ServiceMetric>(SERVICE_METRIC_GRAPH)
        .add_node(StageKind::Aggregate)
        .add_next(StageKind::Dispatch)
        .add_next(StageKind::Persist);
    if alarm.enabled {
        let rules = Arc::new(AlarmRules::new(alarm));
        services = services.on_persisted(rules.hook(alarms, Arc::clone(health)));
    }
    let services = services.build()?;

    let references = runtime
        .create_graph::<NodeReferenceMetric>(NODE_REFERENCE_GRAPH)
        .add_node(StageKind::Aggregate)
        .add_next(StageKind::Dispatch)
        .add_next(StageKind::Persist)
        .build()?;

    let heartbeats = runtime
        .create_graph::<InstanceHeartbeat>(INSTANCE_HEARTBEAT_GRAPH)
        .add_node(StageKind::Aggregate)
        .add_next(StageKind::Dispatch)
        .add_next(StageKind::Persist)
        .build()?;

    Ok(IngestHandles {
        references,
        services,
        heartbeats,
    })
}

/// Collector orchestrates all components: graphs, ingestion, remote
/// endpoint, TTL sweeping and health metrics.
pub struct Collector<S: Storage> {
    cfg: Config,
    storage: Arc<S>,
    health: Arc<HealthMetrics>,
    directory: Arc<StaticDirectory>,
    runtime: Option<StreamRuntime<S>>,
    server: Option<RemoteServer>,
    ingestor: Option<Arc<SegmentIngestor<S>>>,
    remote_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<S: Storage> Collector<S> {
    pub fn new(cfg: Config, storage: Arc<S>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let directory = Arc::new(StaticDirectory::new(cfg.cluster_nodes()));

        Ok(Self {
            cfg,
            storage,
            health,
            directory,
            runtime: None,
            server: None,
            ingestor: None,
            remote_addr: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Membership list used for routing; replace it as nodes come and go.
    pub fn directory(&self) -> &Arc<StaticDirectory> {
        &self.directory
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Address the remote endpoint bound to, once started.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn ingestor(&self) -> Option<&Arc<SegmentIngestor<S>>> {
        self.ingestor.as_ref()
    }

    /// Start all components and begin accepting segments.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Routing and transport.
        let router = Arc::new(RingRouter::new(
            Arc::clone(&self.directory) as Arc<dyn NodeDirectory>,
            self.cfg.cluster.virtual_nodes,
            Some(Arc::clone(&self.health)),
        ));
        let transport = HttpRemoteClient::new(&self.cfg.remote).context("creating remote client")?;

        // 2. Graphs.
        let mut runtime = StreamRuntime::new(
            StreamOptions::from_config(&self.cfg),
            Arc::clone(&self.storage),
            &self.cfg.cluster.self_address,
            router,
            Arc::new(transport),
            Arc::clone(&self.health),
        );
        let handles = build_graphs(&mut runtime, &self.cfg.alarm, &self.health)
            .context("building stream graphs")?;

        // 3. Ingestion with name exchange and retry.
        let register = Arc::new(RegisterService::new(
            Arc::clone(&self.storage),
            Arc::new(CacheManager::new()),
        ));
        let ingestor = Arc::new(SegmentIngestor::new(
            SpanExchanger::new(register),
            handles,
            RetryQueue::new(self.cfg.exchange.max_retries, self.cfg.exchange.max_pending),
            Arc::clone(&self.health),
        ));
        let retry = Arc::clone(&ingestor);
        self.tasks
            .push(retry.spawn_retry(self.cfg.exchange.retry_interval, self.cancel.clone()));

        // 4. Storage TTL.
        if self.cfg.ttl.enabled {
            let sweeper = TtlSweeper::new(
                Arc::clone(&self.storage),
                self.cfg.ttl.metric_retention,
                Some(Arc::clone(&self.health)),
            )
            .with_target(NodeReferenceMetric::TYPE_TAG, Granularity::Minute)
            .with_target(ServiceMetric::TYPE_TAG, Granularity::Minute)
            .with_target(Alarm::TYPE_TAG, Granularity::Minute)
            .with_target(InstanceHeartbeat::TYPE_TAG, Granularity::Day);
            self.tasks
                .push(sweeper.spawn(self.cfg.ttl.sweep_interval, self.cancel.clone()));
        }

        // 5. Flush timer.
        runtime.start();

        // 6. Remote endpoint last, once every graph can take records.
        let server = RemoteServer::new(
            &self.cfg.remote.listen_addr,
            Arc::clone(runtime.registry()),
            Arc::clone(&self.health),
        )
        .with_segments(Arc::clone(&ingestor) as Arc<dyn SegmentSink>);
        let addr = server.start().await.context("starting remote server")?;

        info!(
            self_address = %self.cfg.cluster.self_address,
            nodes = self.directory.current_nodes().len(),
            remote_addr = %addr,
            storage = self.storage.name(),
            "collector started",
        );

        self.remote_addr = Some(addr);
        self.server = Some(server);
        self.ingestor = Some(ingestor);
        self.runtime = Some(runtime);

        Ok(())
    }

    /// Stops intake, drains the graphs, runs a final flush and stops the
    /// servers.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop taking segments and remote records first.
        if let Some(server) = &self.server {
            server.stop();
        }

        // The retry task makes its last pass before the graphs drain.
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "background task failed");
            }
        }

        if let Some(runtime) = self.runtime.take() {
            let report = runtime.shutdown().await;
            if report.failed_targets > 0 {
                error!(
                    failed_targets = report.failed_targets,
                    "final flush incomplete"
                );
            }
        }

        self.health.stop();
        info!("collector stopped");

        Ok(())
    }
}
