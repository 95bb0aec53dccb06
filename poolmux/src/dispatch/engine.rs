use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use slotmap::SlotMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt, StreamMap};

use super::{
    ChainPhase, ChainSnapshot, DispatchStats, EngineCommand, LifecycleEvent, NodeSettings,
};
use crate::backoff::Backoff;
use crate::chain::ChainTracker;
use crate::config::{validate_node, Config, EngineConfig, NodeConfig, SourceConfig};
use crate::error::{DispatchError, Result, SourceError};
use crate::job_source::{
    FetchId, Job, JobId, JobTemplate, Liveness, Solution, SourceCommand, SourceEvent,
    SourceSpawner, Submission, SubmissionId, SubmitOutcome, WorkPayload,
};
use crate::tracing::prelude::*;
use crate::tree::{NodeId, SourceTree};
use crate::types::Target;
use crate::worker::{WorkerId, WorkerNotice};

/// Dispatched jobs remembered for routing and invalidation.
const MAX_TRACKED_JOBS: usize = 4096;

const NOTICE_CAPACITY: usize = 64;

/// Events of one source; the trailing `None` marks the end of its task.
type SourceStream = Pin<Box<dyn Stream<Item = Option<SourceEvent>> + Send>>;

fn source_stream(event_rx: mpsc::Receiver<SourceEvent>) -> SourceStream {
    Box::pin(
        ReceiverStream::new(event_rx)
            .map(Some)
            .chain(tokio_stream::once(None)),
    )
}

struct SourceEntry {
    /// Tree path, for logging
    name: String,

    command_tx: mpsc::Sender<SourceCommand>,

    /// Newest epoch the source announced
    epoch: u64,
}

/// A template being handed out to idle workers.
struct CachedJob {
    template: Arc<JobTemplate>,
    source: NodeId,
    /// Hand-outs left before a fresh fetch is needed
    remaining: u32,
    generation: u64,
}

struct Waiter {
    worker: WorkerId,
    reply: oneshot::Sender<Result<Job>>,
}

struct ChainState {
    tracker: ChainTracker,
    active: Option<NodeId>,
    active_name: Option<String>,
    cache: Option<CachedJob>,
    waiting: VecDeque<Waiter>,
    fetch: Option<FetchId>,
    /// Consecutive failed fetches, across sources
    failures: u32,
    /// `NoSourceAvailable` has been surfaced and not yet cleared
    exhausted: bool,
    retry_at: Option<Instant>,
    backoff: Backoff,
}

struct PendingFetch {
    chain: String,
    source: NodeId,
    deadline: Instant,
}

struct JobRecord {
    job: Job,
    workers: Vec<WorkerId>,
}

struct PendingSubmission {
    submission: Submission,
    /// Source the submission was last sent to
    target: NodeId,
    failures: u32,
    reply: oneshot::Sender<Result<SubmitOutcome>>,
}

struct Drain {
    fetch_deadline: Instant,
    submit_deadline: Instant,
    reply: Option<oneshot::Sender<DispatchStats>>,
}

pub(super) struct Engine {
    options: EngineConfig,

    tree: SourceTree,

    spawner: Box<dyn SourceSpawner>,

    sources: HashMap<NodeId, SourceEntry>,

    source_events: StreamMap<NodeId, SourceStream>,

    chains: BTreeMap<String, ChainState>,

    workers: SlotMap<WorkerId, mpsc::Sender<WorkerNotice>>,

    /// Dispatched jobs by id; oldest are pruned first
    jobs: BTreeMap<JobId, JobRecord>,

    /// Job ids below this were pruned from `jobs`
    pruned_below: u64,

    fetches: HashMap<FetchId, PendingFetch>,

    submissions: HashMap<SubmissionId, PendingSubmission>,

    next_job: u64,
    next_fetch: u64,
    next_submission: u64,

    commands: mpsc::Receiver<EngineCommand>,

    commands_closed: bool,

    lifecycle: mpsc::Sender<LifecycleEvent>,

    stats: DispatchStats,

    drain: Option<Drain>,
}

impl Engine {
    pub(super) fn new(
        config: &Config,
        spawner: Box<dyn SourceSpawner>,
        commands: mpsc::Receiver<EngineCommand>,
        lifecycle: mpsc::Sender<LifecycleEvent>,
    ) -> Result<Self> {
        let tree = SourceTree::build(&config.chains)?;
        let options = config.engine.clone();

        let chains = tree
            .chains()
            .map(|(name, _)| {
                let state = ChainState {
                    tracker: ChainTracker::new(name),
                    active: None,
                    active_name: None,
                    cache: None,
                    waiting: VecDeque::new(),
                    fetch: None,
                    failures: 0,
                    exhausted: false,
                    retry_at: None,
                    backoff: Backoff::new(
                        options.no_source_backoff_min,
                        options.no_source_backoff_max,
                    ),
                };
                (name.to_string(), state)
            })
            .collect();

        let mut engine = Self {
            options,
            tree,
            spawner,
            sources: HashMap::new(),
            source_events: StreamMap::new(),
            chains,
            workers: SlotMap::with_key(),
            jobs: BTreeMap::new(),
            pruned_below: 0,
            fetches: HashMap::new(),
            submissions: HashMap::new(),
            next_job: 1,
            next_fetch: 1,
            next_submission: 1,
            commands,
            commands_closed: false,
            lifecycle,
            stats: DispatchStats::default(),
            drain: None,
        };

        for (id, config) in engine.tree.leaves() {
            engine.spawn_source(id, config);
        }
        Ok(engine)
    }

    fn spawn_source(&mut self, id: NodeId, config: Arc<SourceConfig>) {
        let registration = self.spawner.spawn(config);
        let name = self.tree.path(id);
        debug!(source = %name, task = %registration.name, "Source registered");

        self.source_events
            .insert(id, source_stream(registration.event_rx));
        self.sources.insert(
            id,
            SourceEntry {
                name,
                command_tx: registration.command_tx,
                epoch: 0,
            },
        );
    }

    fn source_name(&self, id: NodeId) -> String {
        match self.sources.get(&id) {
            Some(entry) => entry.name.clone(),
            None => self.tree.path(id),
        }
    }

    fn refresh_names(&mut self) {
        for (id, entry) in self.sources.iter_mut() {
            entry.name = self.tree.path(*id);
        }
    }

    fn surface(&self, event: LifecycleEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.lifecycle.try_send(event) {
            warn!(event = ?event, "Lifecycle event dropped (receiver not keeping up)");
        }
    }

    fn notify(&self, worker: WorkerId, notice: WorkerNotice) {
        if let Some(notices) = self.workers.get(worker) {
            if notices.try_send(notice).is_err() {
                debug!(worker = ?worker, "Worker notice dropped");
            }
        }
    }

    pub(super) async fn run(mut self) {
        let mut health = time::interval(self.options.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut status = time::interval(self.options.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut first_tick = true;

        info!(
            chains = self.chains.len(),
            sources = self.sources.len(),
            "Dispatch engine started."
        );

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                cmd = self.commands.recv(), if !self.commands_closed => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            // Every handle is gone; nobody can stop us explicitly
                            self.commands_closed = true;
                            self.begin_drain(None);
                        }
                    }
                }

                Some((node, event)) = self.source_events.next() => {
                    match event {
                        Some(event) => self.handle_source_event(node, event),
                        None => self.source_stopped(node),
                    }
                }

                _ = sleep_until(deadline) => self.handle_deadlines(),

                _ = health.tick() => self.health_check(),

                _ = status.tick() => {
                    if first_tick {
                        first_tick = false;
                    } else {
                        self.stats.log_summary();
                    }
                }
            }

            if self.drain_finished() {
                break;
            }
        }

        self.finish_drain();
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::RegisterWorker { reply } => {
                let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);
                let id = self.workers.insert(notice_tx);
                if reply.send((id, notice_rx)).is_err() {
                    self.workers.remove(id);
                    return;
                }
                debug!(worker = ?id, "Worker registered");
            }

            EngineCommand::UnregisterWorker(id) => {
                if self.workers.remove(id).is_some() {
                    for state in self.chains.values_mut() {
                        state.waiting.retain(|waiter| waiter.worker != id);
                    }
                    debug!(worker = ?id, "Worker unregistered");
                }
            }

            EngineCommand::RequestJob {
                worker,
                chain,
                reply,
            } => self.request_job(worker, chain, reply),

            EngineCommand::SubmitResult {
                worker,
                job,
                solution,
                reply,
            } => self.submit_result(worker, job, solution, reply),

            EngineCommand::ApplySettings {
                node,
                settings,
                reply,
            } => {
                reply.send(self.apply_settings(node, settings)).ok();
            }

            EngineCommand::AddNode {
                parent,
                config,
                reply,
            } => {
                reply.send(self.add_node(parent, config)).ok();
            }

            EngineCommand::RemoveNode { node, reply } => {
                reply.send(self.remove_node(node)).ok();
            }

            EngineCommand::Snapshot { reply } => {
                reply.send(self.snapshot()).ok();
            }

            EngineCommand::Stop { reply } => self.begin_drain(Some(reply)),
        }
    }

    // ---- Jobs ------------------------------------------------------------

    fn request_job(&mut self, worker: WorkerId, chain: String, reply: oneshot::Sender<Result<Job>>) {
        if self.drain.is_some() {
            reply.send(Err(DispatchError::ShuttingDown)).ok();
            return;
        }
        if !self.chains.contains_key(&chain) {
            reply.send(Err(DispatchError::UnknownChain(chain))).ok();
            return;
        }

        if let Some(job) = self.mint_from_cache(&chain, worker) {
            reply.send(Ok(job)).ok();
            return;
        }

        if let Some(state) = self.chains.get_mut(&chain) {
            state.waiting.push_back(Waiter { worker, reply });
        }
        self.ensure_fetch(&chain);
    }

    /// Mint a job from the chain's cached template, if it is still usable.
    fn mint_from_cache(&mut self, chain: &str, worker: WorkerId) -> Option<Job> {
        let state = self.chains.get_mut(chain)?;
        let cache = state.cache.as_mut()?;

        let source_epoch = self.sources.get(&cache.source).map(|s| s.epoch);
        let generation = state.tracker.current_generation();
        let usable = state.active == Some(cache.source)
            && source_epoch.is_some_and(|epoch| cache.template.epoch >= epoch)
            && cache.generation == generation
            && cache.remaining > 0;
        if !usable {
            state.cache = None;
            return None;
        }

        cache.remaining -= 1;
        let template = cache.template.clone();
        let source = cache.source;
        if cache.remaining == 0 {
            state.cache = None;
        }

        let id = JobId(self.next_job);
        self.next_job += 1;
        let job = Job {
            id,
            chain: chain.to_string(),
            generation,
            source,
            template,
            invalidated: false,
        };
        trace!(
            chain = %chain,
            job_id = %id,
            template = %job.template.id,
            worker = ?worker,
            "Job dispatched"
        );

        self.jobs.insert(
            id,
            JobRecord {
                job: job.clone(),
                workers: vec![worker],
            },
        );
        self.stats.chain_mut(chain).jobs += 1;
        self.prune_jobs();
        Some(job)
    }

    fn prune_jobs(&mut self) {
        while self.jobs.len() > MAX_TRACKED_JOBS {
            match self.jobs.pop_first() {
                Some((id, _)) => self.pruned_below = id.0 + 1,
                None => break,
            }
        }
    }

    /// Hand the cached job to waiting workers; fetch again if some remain.
    fn serve_waiters(&mut self, chain: &str) {
        loop {
            let Some(state) = self.chains.get_mut(chain) else {
                return;
            };
            while state
                .waiting
                .front()
                .is_some_and(|waiter| waiter.reply.is_closed())
            {
                state.waiting.pop_front();
            }
            let Some(worker) = state.waiting.front().map(|waiter| waiter.worker) else {
                return;
            };

            let Some(job) = self.mint_from_cache(chain, worker) else {
                break;
            };
            if let Some(waiter) = self
                .chains
                .get_mut(chain)
                .and_then(|state| state.waiting.pop_front())
            {
                waiter.reply.send(Ok(job)).ok();
            }
        }
        self.ensure_fetch(chain);
    }

    // ---- Selection and fetching -------------------------------------------

    /// Re-run selection; on a change, stop handing out the old leaf's job.
    fn reselect(&mut self, chain: &str) {
        let selected = self.tree.select_active(chain);
        let Some(state) = self.chains.get_mut(chain) else {
            return;
        };
        if state.active == selected {
            return;
        }

        state.active = selected;
        state.cache = None;
        // A fetch in flight to the old leaf is discarded when it lands
        state.fetch = None;
        let from = state.active_name.take();
        let to = selected.map(|id| self.tree.path(id));
        state.active_name = to.clone();

        match (from, to) {
            (Some(from), Some(to)) => {
                self.stats.chain_mut(chain).failovers += 1;
                info!(chain = %chain, from = %from, to = %to, "Failover.");
                self.surface(LifecycleEvent::Failover {
                    chain: chain.to_string(),
                    from,
                    to,
                });
            }
            (None, Some(to)) => info!(chain = %chain, source = %to, "Active source selected."),
            (Some(from), None) => debug!(chain = %chain, from = %from, "No eligible source"),
            (None, None) => {}
        }
    }

    /// Start a fetch from the active leaf unless one is running or the
    /// chain is backing off.
    fn ensure_fetch(&mut self, chain: &str) {
        if self.drain.is_some() {
            return;
        }
        self.reselect(chain);

        let Some(state) = self.chains.get(chain) else {
            return;
        };
        if state.fetch.is_some() || state.retry_at.is_some() {
            return;
        }
        let Some(leaf) = state.active else {
            self.chain_exhausted(chain);
            return;
        };
        let Some(timeout) = self.tree.leaf(leaf).map(|l| l.config.fetch_timeout) else {
            return;
        };

        let request = FetchId(self.next_fetch);
        self.next_fetch += 1;
        self.stats.chain_mut(chain).fetches += 1;

        let sent = self.sources.get(&leaf).is_some_and(|source| {
            source
                .command_tx
                .try_send(SourceCommand::Fetch(request))
                .is_ok()
        });
        if !sent {
            self.fetch_failed(
                chain,
                leaf,
                SourceError::Unreachable("source is not accepting commands".to_string()),
            );
            return;
        }

        trace!(chain = %chain, source = %self.source_name(leaf), request = request.0, "Fetching");
        self.fetches.insert(
            request,
            PendingFetch {
                chain: chain.to_string(),
                source: leaf,
                deadline: Instant::now() + timeout,
            },
        );
        if let Some(state) = self.chains.get_mut(chain) {
            state.fetch = Some(request);
        }
    }

    fn clear_fetch(&mut self, chain: &str, request: FetchId) {
        if let Some(state) = self.chains.get_mut(chain) {
            if state.fetch == Some(request) {
                state.fetch = None;
            }
        }
    }

    fn fetch_failed(&mut self, chain: &str, leaf: NodeId, error: SourceError) {
        self.stats.chain_mut(chain).fetch_failures += 1;
        if error.is_auth() {
            self.tree.set_liveness(leaf, Liveness::Dead);
        }
        let source = self.source_name(leaf);

        let Some(state) = self.chains.get_mut(chain) else {
            return;
        };
        if state.active != Some(leaf) {
            debug!(chain = %chain, source = %source, error = %error, "Ignoring failure of inactive source");
            if !state.waiting.is_empty() {
                self.ensure_fetch(chain);
            }
            return;
        }

        state.failures += 1;
        debug!(
            chain = %chain,
            source = %source,
            error = %error,
            failures = state.failures,
            "Fetch failed"
        );
        if state.failures >= self.options.max_fetch_attempts {
            self.chain_exhausted(chain);
        } else {
            self.ensure_fetch(chain);
        }
    }

    /// No source could deliver: surface it once and retry on backoff.
    fn chain_exhausted(&mut self, chain: &str) {
        let Some(state) = self.chains.get_mut(chain) else {
            return;
        };
        let delay = state.backoff.next_delay();
        state.retry_at = Some(Instant::now() + delay);
        state.cache = None;

        if state.exhausted {
            debug!(chain = %chain, retry_ms = delay.as_millis() as u64, "Still no work source");
            return;
        }
        state.exhausted = true;
        self.stats.chain_mut(chain).exhausted += 1;
        warn!(
            chain = %chain,
            retry_ms = delay.as_millis() as u64,
            "No work source available."
        );
        self.surface(LifecycleEvent::NoSourceAvailable {
            chain: chain.to_string(),
        });
    }

    // ---- Source events ----------------------------------------------------

    fn handle_source_event(&mut self, node: NodeId, event: SourceEvent) {
        if !self.sources.contains_key(&node) {
            return;
        }

        match event {
            SourceEvent::Work { request, template } => self.work_received(node, request, template),

            SourceEvent::FetchFailed { request, error } => {
                // Already timed out
                let Some(fetch) = self.fetches.remove(&request) else {
                    return;
                };
                self.clear_fetch(&fetch.chain, request);
                self.fetch_failed(&fetch.chain, node, error);
            }

            SourceEvent::Liveness(liveness) => self.liveness_changed(node, liveness),

            SourceEvent::EpochAdvanced(epoch) => self.epoch_advanced(node, epoch),

            SourceEvent::SubmitResult {
                submission,
                outcome,
            } => self.submission_answered(node, submission, outcome),

            SourceEvent::AuthFailed(reason) => {
                let source = self.source_name(node);
                error!(source = %source, reason = %reason, "Credentials rejected.");
                self.surface(LifecycleEvent::AuthFailed { source, reason });
            }
        }
    }

    fn work_received(&mut self, node: NodeId, request: Option<FetchId>, template: Arc<JobTemplate>) {
        let Some(chain) = self.tree.chain_of(node).map(str::to_string) else {
            return;
        };

        if let Some(request) = request {
            if self.fetches.remove(&request).is_none() {
                debug!(source = %self.source_name(node), request = request.0, "Discarding late fetch result");
                return;
            }
            self.clear_fetch(&chain, request);
        }

        self.accept_work(&chain, node, template);
        self.serve_waiters(&chain);
    }

    fn accept_work(&mut self, chain: &str, node: NodeId, template: Arc<JobTemplate>) {
        let Some(entry) = self.sources.get_mut(&node) else {
            return;
        };
        if template.epoch < entry.epoch {
            debug!(source = %entry.name, "Discarding work from a superseded epoch");
            return;
        }
        entry.epoch = template.epoch;
        let source = entry.name.clone();

        let is_active = self
            .chains
            .get(chain)
            .is_some_and(|state| state.active == Some(node));

        // Heights are trusted from any leaf; a bare previous-block hash only
        // from the active one.
        if let Some(block) = template.block {
            if block.height.is_some() || is_active {
                let advanced = self
                    .chains
                    .get_mut(chain)
                    .is_some_and(|state| state.tracker.observe_block(&block));
                if advanced {
                    self.chain_advanced(chain);
                }
            }
        }

        if !is_active {
            debug!(chain = %chain, source = %source, "Discarding work from inactive source");
            return;
        }

        let reuse = self
            .tree
            .leaf(node)
            .map(|leaf| leaf.config.effective_job_reuse())
            .unwrap_or(1);
        let Some(state) = self.chains.get_mut(chain) else {
            return;
        };
        if let WorkPayload::Stratum(work) = &template.payload {
            state.tracker.observe_target(Target::from_compact(work.nbits));
        }

        trace!(chain = %chain, source = %source, template = %template.id, "Work cached");
        state.failures = 0;
        state.cache = Some(CachedJob {
            template,
            source: node,
            remaining: reuse,
            generation: state.tracker.current_generation(),
        });

        if state.exhausted {
            state.exhausted = false;
            state.retry_at = None;
            state.backoff.reset();
            info!(chain = %chain, source = %source, "Work source restored.");
            self.surface(LifecycleEvent::SourceRestored {
                chain: chain.to_string(),
                source,
            });
        }
    }

    /// The chain's generation moved on: every older job is stale.
    fn chain_advanced(&mut self, chain: &str) {
        let Some(state) = self.chains.get_mut(chain) else {
            return;
        };
        let generation = state.tracker.current_generation();
        let height = state.tracker.height();
        if state
            .cache
            .as_ref()
            .is_some_and(|cache| cache.generation < generation)
        {
            state.cache = None;
        }

        let mut invalidated = 0u64;
        for record in self.jobs.values_mut() {
            let job = &mut record.job;
            if job.chain == chain && job.generation < generation && !job.invalidated {
                job.invalidated = true;
                invalidated += 1;
            }
        }
        self.stats.chain_mut(chain).blocks += 1;
        info!(chain = %chain, height, generation, invalidated, "New block.");

        let notice = WorkerNotice::Invalidate {
            chain: chain.to_string(),
            generation,
        };
        for worker in self.workers.keys() {
            self.notify(worker, notice.clone());
        }
    }

    fn liveness_changed(&mut self, node: NodeId, liveness: Liveness) {
        if !self.tree.set_liveness(node, liveness) {
            return;
        }
        let Some(chain) = self.tree.chain_of(node).map(str::to_string) else {
            return;
        };
        debug!(chain = %chain, source = %self.source_name(node), %liveness, "Source liveness changed");

        if let Some(state) = self.chains.get_mut(&chain) {
            if liveness == Liveness::Alive && state.exhausted {
                // Retry at once rather than waiting out the backoff
                state.retry_at = None;
                state.failures = 0;
            }
        }

        self.reselect(&chain);
        let wants_work = self
            .chains
            .get(&chain)
            .is_some_and(|state| !state.waiting.is_empty() || state.exhausted);
        if wants_work {
            self.ensure_fetch(&chain);
        }
    }

    /// Revoke every job the source issued under an earlier epoch.
    fn epoch_advanced(&mut self, node: NodeId, epoch: u64) {
        let Some(entry) = self.sources.get_mut(&node) else {
            return;
        };
        if epoch <= entry.epoch {
            return;
        }
        entry.epoch = epoch;
        let source = entry.name.clone();

        let mut revoked: HashMap<WorkerId, Vec<JobId>> = HashMap::new();
        let mut count = 0u64;
        for (id, record) in self.jobs.iter_mut() {
            let job = &mut record.job;
            if job.source == node && job.epoch() < epoch && !job.invalidated {
                job.invalidated = true;
                count += 1;
                for worker in &record.workers {
                    revoked.entry(*worker).or_default().push(*id);
                }
            }
        }

        if let Some(chain) = self.tree.chain_of(node).map(str::to_string) {
            self.stats.chain_mut(&chain).revoked += count;
            if let Some(state) = self.chains.get_mut(&chain) {
                if state
                    .cache
                    .as_ref()
                    .is_some_and(|cache| cache.source == node && cache.template.epoch < epoch)
                {
                    state.cache = None;
                }
            }
        }

        debug!(source = %source, epoch, revoked = count, "Source epoch advanced");
        for (worker, jobs) in revoked {
            self.notify(worker, WorkerNotice::Revoke { jobs });
        }
    }

    fn source_stopped(&mut self, node: NodeId) {
        let Some(entry) = self.sources.remove(&node) else {
            return;
        };
        if self.drain.is_none() {
            warn!(source = %entry.name, "Source task stopped");
        }
        self.tree.set_liveness(node, Liveness::Dead);
        if let Some(chain) = self.tree.chain_of(node).map(str::to_string) {
            self.reselect(&chain);
        }
        self.abandon_source(node);
    }

    /// Fail fetches and re-route submissions that were waiting on `node`.
    fn abandon_source(&mut self, node: NodeId) {
        let fetches: Vec<FetchId> = self
            .fetches
            .iter()
            .filter(|(_, fetch)| fetch.source == node)
            .map(|(id, _)| *id)
            .collect();
        for request in fetches {
            if let Some(fetch) = self.fetches.remove(&request) {
                self.clear_fetch(&fetch.chain, request);
                self.fetch_failed(
                    &fetch.chain,
                    node,
                    SourceError::Unreachable("source stopped".to_string()),
                );
            }
        }

        let mut submissions: Vec<SubmissionId> = self
            .submissions
            .iter()
            .filter(|(_, pending)| pending.target == node)
            .map(|(id, _)| *id)
            .collect();
        submissions.sort();
        for id in submissions {
            self.submission_failed(id, "source stopped".to_string());
        }
    }

    // ---- Submissions ------------------------------------------------------

    fn submit_result(
        &mut self,
        worker: WorkerId,
        job_id: JobId,
        solution: Solution,
        reply: oneshot::Sender<Result<SubmitOutcome>>,
    ) {
        let Some(record) = self.jobs.get(&job_id) else {
            if job_id.0 < self.pruned_below {
                // Too old to still be tracked
                reply.send(Ok(SubmitOutcome::Stale)).ok();
            } else {
                reply.send(Err(DispatchError::UnknownJob)).ok();
            }
            return;
        };
        let job = record.job.clone();
        let stale = job.invalidated
            || self
                .chains
                .get(&job.chain)
                .is_some_and(|state| state.tracker.is_stale(&job));

        let id = SubmissionId(self.next_submission);
        self.next_submission += 1;
        let mut submission = Submission::new(id, job, solution);

        if stale {
            submission.resolve(SubmitOutcome::Stale);
            self.stats.chain_mut(&submission.job.chain).stale += 1;
            debug!(
                chain = %submission.job.chain,
                job_id = %job_id,
                submission = %id,
                "Solution for stale job"
            );
            reply.send(Ok(SubmitOutcome::Stale)).ok();
            return;
        }

        trace!(
            worker = ?worker,
            job_id = %job_id,
            submission = %id,
            nonce = submission.solution.nonce,
            "Solution received"
        );
        let target = submission.job.source;
        self.submissions.insert(
            id,
            PendingSubmission {
                submission,
                target,
                failures: 0,
                reply,
            },
        );
        self.send_submission(id);
    }

    fn send_submission(&mut self, id: SubmissionId) {
        let Some(pending) = self.submissions.get(&id) else {
            return;
        };
        let sent = self.sources.get(&pending.target).is_some_and(|source| {
            source
                .command_tx
                .try_send(SourceCommand::Submit(pending.submission.clone()))
                .is_ok()
        });
        if !sent {
            self.submission_failed(id, "source unavailable".to_string());
        }
    }

    fn submission_answered(&mut self, node: NodeId, id: SubmissionId, outcome: SubmitOutcome) {
        // Answers from a source the submission has since moved away from
        // are ignored.
        if self
            .submissions
            .get(&id)
            .map_or(true, |pending| pending.target != node)
        {
            return;
        }

        match outcome {
            SubmitOutcome::Pending => {}
            SubmitOutcome::Error(reason) => self.submission_failed(id, reason),
            outcome => self.finish_submission(id, outcome),
        }
    }

    /// Retry once on the same source, then once on the chain's active leaf
    /// if that is a different one, then give up.
    fn submission_failed(&mut self, id: SubmissionId, reason: String) {
        let Some(pending) = self.submissions.get_mut(&id) else {
            return;
        };
        pending.failures += 1;

        match pending.failures {
            1 => {
                debug!(submission = %id, reason = %reason, "Submission failed; retrying");
                self.send_submission(id);
            }
            2 => {
                let fallback = self
                    .chains
                    .get(&pending.submission.job.chain)
                    .and_then(|state| state.active);
                match fallback {
                    Some(active) if active != pending.target => {
                        pending.target = active;
                        debug!(
                            submission = %id,
                            reason = %reason,
                            source = %self.source_name(active),
                            "Submission failed again; re-dispatching to active source"
                        );
                        self.send_submission(id);
                    }
                    _ => self.finish_submission(id, SubmitOutcome::Error(reason)),
                }
            }
            _ => self.finish_submission(id, SubmitOutcome::Error(reason)),
        }
    }

    fn finish_submission(&mut self, id: SubmissionId, outcome: SubmitOutcome) {
        let Some(mut pending) = self.submissions.remove(&id) else {
            return;
        };
        pending.submission.resolve(outcome.clone());
        let job = &pending.submission.job;
        let source = self.source_name(pending.target);

        let stats = self.stats.chain_mut(&job.chain);
        match &outcome {
            SubmitOutcome::Accepted => {
                stats.accepted += 1;
                debug!(chain = %job.chain, source = %source, job_id = %job.id, submission = %id, "Solution accepted");
            }
            SubmitOutcome::Rejected(reason) => {
                stats.rejected += 1;
                info!(chain = %job.chain, source = %source, job_id = %job.id, reason = %reason, "Solution rejected.");
            }
            SubmitOutcome::Stale => {
                stats.stale += 1;
                debug!(chain = %job.chain, source = %source, job_id = %job.id, "Solution stale");
            }
            SubmitOutcome::Error(reason) => {
                stats.errors += 1;
                warn!(chain = %job.chain, source = %source, job_id = %job.id, reason = %reason, "Submission failed.");
            }
            SubmitOutcome::Pending => {}
        }

        pending.reply.send(Ok(outcome)).ok();
    }

    // ---- Settings and topology ----------------------------------------------

    fn apply_settings(&mut self, node: NodeId, settings: NodeSettings) -> Result<()> {
        match settings {
            NodeSettings::Group(group) => {
                self.tree.apply_group_settings(node, &group)?;
                info!(node = %self.tree.path(node), enabled = group.enabled, priority = group.priority, "Group settings applied.");
            }
            NodeSettings::Source(config) => {
                validate_node(&NodeConfig::Source(config.clone()))
                    .map_err(|e| DispatchError::InvalidSettings(e.to_string()))?;
                let config = Arc::new(config);
                self.tree.apply_source_config(node, config.clone())?;

                if self.sources.contains_key(&node) {
                    if let Some(entry) = self.sources.get(&node) {
                        if entry
                            .command_tx
                            .try_send(SourceCommand::Reconfigure(config))
                            .is_err()
                        {
                            warn!(source = %entry.name, "Source did not take new settings");
                        }
                    }
                } else {
                    // The task ended earlier; start a fresh one
                    self.spawn_source(node, config);
                }
                info!(source = %self.tree.path(node), "Source settings applied.");
            }
        }

        self.refresh_names();
        self.tree_changed(node);
        Ok(())
    }

    fn add_node(&mut self, parent: NodeId, config: NodeConfig) -> Result<NodeId> {
        if self.drain.is_some() {
            return Err(DispatchError::ShuttingDown);
        }
        validate_node(&config).map_err(|e| DispatchError::InvalidSettings(e.to_string()))?;

        let id = self.tree.add_node(parent, &config)?;
        for leaf in self.tree.leaves_under(id) {
            if let Some(config) = self.tree.leaf(leaf).map(|l| l.config.clone()) {
                self.spawn_source(leaf, config);
            }
        }
        info!(node = %self.tree.path(id), "Node added.");

        self.tree_changed(id);
        Ok(id)
    }

    fn remove_node(&mut self, node: NodeId) -> Result<()> {
        let chain = self
            .tree
            .chain_of(node)
            .map(str::to_string)
            .ok_or(DispatchError::UnknownNode)?;
        let path = self.tree.path(node);
        let leaves = self.tree.remove(node)?;

        // Dropping the command channel stops the source task
        for leaf in &leaves {
            self.sources.remove(leaf);
            self.source_events.remove(leaf);
        }
        info!(chain = %chain, node = %path, sources = leaves.len(), "Node removed.");

        self.reselect(&chain);
        for leaf in leaves {
            self.abandon_source(leaf);
        }
        self.refresh_names();
        self.serve_waiters(&chain);
        Ok(())
    }

    /// Re-select after an edit of the tree containing `node`.
    fn tree_changed(&mut self, node: NodeId) {
        let Some(chain) = self.tree.chain_of(node).map(str::to_string) else {
            return;
        };
        trace!(chain = %chain, revision = self.tree.revision(), "Source tree changed");
        self.reselect(&chain);
        self.serve_waiters(&chain);
    }

    fn snapshot(&self) -> Vec<ChainSnapshot> {
        self.chains
            .iter()
            .filter_map(|(name, state)| {
                let root = self.tree.root(name)?;
                let root = self.tree.snapshot(root, state.active)?;
                Some(ChainSnapshot {
                    name: name.clone(),
                    height: state.tracker.height(),
                    generation: state.tracker.current_generation(),
                    phase: self.phase(state),
                    active: state.active,
                    waiting: state.waiting.len(),
                    root,
                })
            })
            .collect()
    }

    fn phase(&self, state: &ChainState) -> ChainPhase {
        if self.drain.is_some() {
            ChainPhase::Draining
        } else if state.fetch.is_some() {
            ChainPhase::Fetching
        } else if state.cache.is_some() {
            ChainPhase::Distributing
        } else {
            ChainPhase::Idle
        }
    }

    // ---- Timers -------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        let fetch = self.fetches.values().map(|fetch| fetch.deadline).min();
        let retry = self.chains.values().filter_map(|state| state.retry_at).min();
        let drain = self
            .drain
            .iter()
            .flat_map(|drain| [drain.fetch_deadline, drain.submit_deadline])
            .filter(|deadline| *deadline > now)
            .min();
        [fetch, retry, drain].into_iter().flatten().min()
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();

        let expired: Vec<FetchId> = self
            .fetches
            .iter()
            .filter(|(_, fetch)| fetch.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request in expired {
            if let Some(fetch) = self.fetches.remove(&request) {
                self.clear_fetch(&fetch.chain, request);
                self.fetch_failed(
                    &fetch.chain,
                    fetch.source,
                    SourceError::Unreachable("fetch timed out".to_string()),
                );
            }
        }

        let due: Vec<String> = self
            .chains
            .iter()
            .filter(|(_, state)| state.retry_at.is_some_and(|at| at <= now))
            .map(|(name, _)| name.clone())
            .collect();
        for chain in due {
            if let Some(state) = self.chains.get_mut(&chain) {
                state.retry_at = None;
                state.failures = 0;
            }
            debug!(chain = %chain, "Retrying work sources");
            self.ensure_fetch(&chain);
        }
    }

    fn health_check(&mut self) {
        let chains: Vec<String> = self.chains.keys().cloned().collect();
        for chain in chains {
            self.reselect(&chain);
            let waiting = self
                .chains
                .get(&chain)
                .is_some_and(|state| !state.waiting.is_empty());
            if waiting {
                self.ensure_fetch(&chain);
            }
        }
    }

    // ---- Shutdown -----------------------------------------------------------

    fn begin_drain(&mut self, reply: Option<oneshot::Sender<DispatchStats>>) {
        if let Some(drain) = &mut self.drain {
            if drain.reply.is_none() {
                drain.reply = reply;
            }
            return;
        }

        info!(
            fetches = self.fetches.len(),
            submissions = self.submissions.len(),
            "Draining."
        );
        let now = Instant::now();
        self.drain = Some(Drain {
            fetch_deadline: now + self.options.fetch_drain_timeout,
            submit_deadline: now + self.options.drain_deadline,
            reply,
        });

        for state in self.chains.values_mut() {
            state.retry_at = None;
            state.cache = None;
            for waiter in state.waiting.drain(..) {
                waiter.reply.send(Err(DispatchError::ShuttingDown)).ok();
            }
        }
    }

    fn drain_finished(&self) -> bool {
        let Some(drain) = &self.drain else {
            return false;
        };
        let now = Instant::now();
        (self.fetches.is_empty() || now >= drain.fetch_deadline)
            && (self.submissions.is_empty() || now >= drain.submit_deadline)
    }

    fn finish_drain(&mut self) {
        self.fetches.clear();

        let mut lost: Vec<_> = self.submissions.drain().collect();
        lost.sort_by_key(|(id, _)| *id);
        for (id, pending) in lost {
            let job = &pending.submission.job;
            warn!(chain = %job.chain, job_id = %job.id, submission = %id, "Submission lost at shutdown.");
            self.stats.chain_mut(&job.chain).lost += 1;
            pending.reply.send(Err(DispatchError::ShuttingDown)).ok();
        }

        // Closing the command channels stops the source tasks
        self.sources.clear();
        self.source_events = StreamMap::new();

        self.stats.log_summary();
        if let Some(reply) = self.drain.take().and_then(|drain| drain.reply) {
            reply.send(self.stats.clone()).ok();
        }
        info!("Dispatch engine stopped.");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
