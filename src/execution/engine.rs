use crate::prelude::*;

use crate::client::GraphClient;
use crate::compiler::plan::{CompiledSchema, EntityPlan};
use crate::graph::model::Subgraph;
use crate::ops::factory::{ConstructContext, Product};
use crate::ops::interface::{Resource, ResourceIterator};
use crate::ops::registry::RegistrySnapshot;
use crate::settings::{EngineOptions, ProgressFn, ProgressUpdate};
use crate::shared_state::{GRAPH_DRIVER_SLOT, SharedState};

use super::Phase;
use super::checkpoint::Checkpoint;
use super::stats::{ConversionStats, StatsSnapshot};
use super::writer::GraphWriter;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Result of a completed (or cancelled) conversion run.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub stats: StatsSnapshot,
    pub node_batches_committed: usize,
    pub relationship_batches_committed: usize,
    pub duration: std::time::Duration,
    pub cancelled: bool,
}

/// The conversion engine: compiles the schema once, then drives the
/// two-phase pipeline over the resource iterator, batching writes to the
/// graph client.
pub struct Converter {
    schema: Arc<CompiledSchema>,
    iterator: Option<Box<dyn ResourceIterator>>,
    client: Arc<dyn GraphClient>,
    options: EngineOptions,
    shared: Arc<SharedState>,
    checkpoint: Arc<Checkpoint>,
    writer: Arc<GraphWriter>,
    stats: Arc<ConversionStats>,
    cancel: Mutex<CancellationToken>,
}

impl Converter {
    /// Compile `schema_text` against the process-wide wrapper registry and
    /// build an engine over `iterator` and `client`.
    pub fn new(
        schema_text: &str,
        iterator: Box<dyn ResourceIterator>,
        client: Arc<dyn GraphClient>,
        options: EngineOptions,
    ) -> Result<Self> {
        Self::with_registry(
            schema_text,
            &crate::ops::registry::global_snapshot(),
            iterator,
            client,
            options,
        )
    }

    /// Like [`Converter::new`] but against an explicit registry snapshot.
    pub fn with_registry(
        schema_text: &str,
        snapshot: &RegistrySnapshot,
        iterator: Box<dyn ResourceIterator>,
        client: Arc<dyn GraphClient>,
        options: EngineOptions,
    ) -> Result<Self> {
        options.validate()?;
        let schema = Arc::new(crate::compiler::compile_with_snapshot(
            schema_text,
            snapshot,
        )?);
        let shared = Arc::new(SharedState::new());
        shared.insert::<Arc<dyn GraphClient>>(GRAPH_DRIVER_SLOT, client.clone());
        let stats = Arc::new(ConversionStats::default());
        let writer = Arc::new(GraphWriter::new(client.clone(), &options, stats.clone()));
        Ok(Self {
            schema,
            iterator: Some(iterator),
            client,
            options,
            shared,
            checkpoint: Arc::new(Checkpoint::new()),
            writer,
            stats,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Slots registered here are visible to wrapper code during the run.
    pub fn shared_state(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn client(&self) -> Arc<dyn GraphClient> {
        self.client.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Request cooperative cancellation of the run in progress. In-flight
    /// batches drain; no new batches are claimed.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Recompile the schema against a fresh registry snapshot. Clears the
    /// checkpoint: the next run starts from the first batch.
    pub fn reload_schema(&mut self, schema_text: &str) -> Result<()> {
        let schema = Arc::new(crate::compiler::compile(schema_text)?);
        self.schema = schema;
        self.checkpoint.clear();
        self.writer.clear_handles();
        Ok(())
    }

    /// Replace the resource iterator. Clears the checkpoint.
    pub fn set_iterator(&mut self, iterator: Box<dyn ResourceIterator>) {
        self.iterator = Some(iterator);
        self.checkpoint.clear();
        self.writer.clear_handles();
    }

    /// Run both phases to completion. On failure or cancellation the
    /// checkpoint is preserved; calling `run` again resumes with the batches
    /// that did not commit.
    pub async fn run(&mut self) -> Result<ConversionReport> {
        let started = std::time::Instant::now();
        let cancel = {
            let mut guard = self.cancel.lock().unwrap();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        for phase in Phase::ALL {
            if cancel.is_cancelled() {
                break;
            }
            let iterator = self
                .iterator
                .as_mut()
                .ok_or_else(|| Error::config("no resource iterator installed"))?;
            iterator.reset()?;
            let env = PhaseEnv {
                schema: self.schema.clone(),
                shared: self.shared.clone(),
                writer: self.writer.clone(),
                checkpoint: self.checkpoint.clone(),
                stats: self.stats.clone(),
                progress: self.options.progress.clone(),
                total_hint: iterator.len_hint(),
                phase,
                cancel: cancel.clone(),
            };
            run_phase(iterator.as_mut(), env, &self.options).await?;
        }

        Ok(ConversionReport {
            stats: self.stats.snapshot(),
            node_batches_committed: self.checkpoint.committed_count(Phase::Nodes),
            relationship_batches_committed: self.checkpoint.committed_count(Phase::Relationships),
            duration: started.elapsed(),
            cancelled: cancel.is_cancelled(),
        })
    }
}

struct WorkBatch {
    index: usize,
    resources: Vec<(u64, Box<dyn Resource>)>,
}

#[derive(Clone)]
struct PhaseEnv {
    schema: Arc<CompiledSchema>,
    shared: Arc<SharedState>,
    writer: Arc<GraphWriter>,
    checkpoint: Arc<Checkpoint>,
    stats: Arc<ConversionStats>,
    progress: Option<ProgressFn>,
    total_hint: Option<usize>,
    phase: Phase,
    cancel: CancellationToken,
}

/// One full traversal of the iterator: the coordinator reads resources
/// serially into batches; a static pool of workers evaluates them and hands
/// the results to the writer.
async fn run_phase(
    iterator: &mut dyn ResourceIterator,
    env: PhaseEnv,
    options: &EngineOptions,
) -> Result<()> {
    let worker_count = options.effective_workers();
    let batch_size = options.effective_batch_size();

    let (batch_tx, batch_rx) = mpsc::channel::<WorkBatch>(worker_count * 2);
    let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));

    let mut workers = JoinSet::new();
    for _ in 0..worker_count {
        let env = env.clone();
        let batch_rx = batch_rx.clone();
        workers.spawn(worker_loop(env, batch_rx));
    }

    let mut coordinator_err: Option<Error> = None;
    let mut batch_index: usize = 0;
    let mut ordinal: u64 = 0;
    let mut current: Vec<(u64, Box<dyn Resource>)> = Vec::with_capacity(batch_size);

    loop {
        if env.cancel.is_cancelled() {
            break;
        }
        match iterator.next() {
            Ok(Some(resource)) => {
                current.push((ordinal, resource));
                ordinal += 1;
                if current.len() == batch_size {
                    let resources = std::mem::replace(&mut current, Vec::with_capacity(batch_size));
                    if !dispatch(&env, &batch_tx, batch_index, resources).await {
                        break;
                    }
                    batch_index += 1;
                }
            }
            Ok(None) => break,
            Err(err) => {
                env.cancel.cancel();
                coordinator_err = Some(err);
                break;
            }
        }
    }
    if !current.is_empty() && coordinator_err.is_none() && !env.cancel.is_cancelled() {
        dispatch(&env, &batch_tx, batch_index, current).await;
    }
    drop(batch_tx);

    let mut first_err = coordinator_err;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                env.cancel.cancel();
                first_err.get_or_insert(err);
            }
            Err(join_err) => {
                env.cancel.cancel();
                first_err.get_or_insert_with(|| {
                    Error::ConversionFailed {
                        phase: env.phase.as_str(),
                        batch_index: 0,
                        source: Box::new(Error::user(anyhow::anyhow!(
                            "worker panicked: {join_err}"
                        ))),
                    }
                });
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Send one batch to the pool, unless the checkpoint already covers it.
/// Returns false when the workers are gone and the phase should stop.
async fn dispatch(
    env: &PhaseEnv,
    batch_tx: &mpsc::Sender<WorkBatch>,
    index: usize,
    resources: Vec<(u64, Box<dyn Resource>)>,
) -> bool {
    if env.checkpoint.is_committed(env.phase, index) {
        trace!(phase = %env.phase, batch_index = index, "batch already committed, skipping");
        return true;
    }
    batch_tx
        .send(WorkBatch { index, resources })
        .await
        .is_ok()
}

async fn worker_loop(
    env: PhaseEnv,
    batch_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkBatch>>>,
) -> Result<()> {
    loop {
        let batch = {
            let mut rx = batch_rx.lock().await;
            rx.recv().await
        };
        let Some(batch) = batch else {
            return Ok(());
        };
        // No new batches are claimed once cancellation is signalled.
        if env.cancel.is_cancelled() {
            return Ok(());
        }
        if let Err(err) = process_batch(&env, batch).await {
            env.cancel.cancel();
            return Err(err);
        }
    }
}

async fn process_batch(env: &PhaseEnv, batch: WorkBatch) -> Result<()> {
    let mut subgraphs = Vec::with_capacity(batch.resources.len());
    for (ordinal, mut resource) in batch.resources {
        if env.cancel.is_cancelled() {
            // Abandon without committing; the batch stays uncheckpointed.
            return Ok(());
        }
        let Some(plan) = env.schema.entity(resource.entity_type()) else {
            env.stats.resources_skipped.inc(1);
            trace!(entity = %resource.entity_type(), "no plan for entity type, skipping resource");
            continue;
        };
        let subgraph = evaluate_resource(plan, resource.as_mut(), env, ordinal)?;
        env.stats.resources_evaluated.inc(1);
        if !subgraph.is_empty() {
            subgraphs.push(subgraph);
        }
    }

    let outcome = env
        .writer
        .write_batch(env.phase, batch.index, subgraphs)
        .await
        .map_err(|err| Error::ConversionFailed {
            phase: env.phase.as_str(),
            batch_index: batch.index,
            source: Box::new(err),
        })?;

    env.checkpoint.mark_committed(env.phase, batch.index);
    env.stats.batches_committed.inc(1);
    env.stats.nodes_written.inc(outcome.nodes as i64);
    env.stats
        .relationships_written
        .inc(outcome.relationships as i64);
    if let Some(progress) = &env.progress {
        progress(ProgressUpdate {
            phase: env.phase,
            batch_index: batch.index,
            resources_done: env.stats.resources_evaluated.get(),
            total_hint: env.total_hint,
        });
    }
    Ok(())
}

/// Apply the entity plan to one resource for the given phase.
///
/// Nodes phase: node sub-plans run and their nodes are emitted. The
/// relationships phase re-runs node sub-plans purely to rebuild local
/// identifiers and supplies, discards their output, then runs relationship
/// sub-plans.
fn evaluate_resource(
    plan: &EntityPlan,
    resource: &mut dyn Resource,
    env: &PhaseEnv,
    ordinal: u64,
) -> Result<Subgraph> {
    let mut ctx = ConstructContext::new(env.shared.clone(), env.phase, ordinal);
    let mut out = Subgraph::default();

    for (idx, node_plan) in plan.nodes.iter().enumerate() {
        ctx.subplan_idx = idx as u32;
        let product = node_plan.construct(resource, &mut ctx)?;
        if env.phase == Phase::Nodes {
            match product {
                Some(Product::Subgraph(subgraph)) => {
                    for node in subgraph.nodes {
                        out.add_node(node);
                    }
                }
                Some(Product::Attribute(attribute)) => {
                    warn!(
                        entity = %plan.entity_type,
                        attribute = %attribute,
                        "node sub-plan produced an attribute, ignoring"
                    );
                }
                None => {}
            }
        }
    }

    if env.phase == Phase::Relationships {
        for rel_plan in &plan.relationships {
            let product = rel_plan.construct(resource, &mut ctx)?;
            match product {
                Some(Product::Subgraph(subgraph)) => {
                    for rel in subgraph.relationships {
                        out.add_relationship(rel);
                    }
                }
                Some(Product::Attribute(attribute)) => {
                    warn!(
                        entity = %plan.entity_type,
                        attribute = %attribute,
                        "relationship sub-plan produced an attribute, ignoring"
                    );
                }
                None => {}
            }
        }
    }

    Ok(out)
}
