//! Poll job source.
//!
//! Request/response sources (getwork) have no persistent connection. The
//! source polls on a fixed interval, which doubles as its liveness check, and
//! answers fetch requests with fresh work from the upstream. When the server
//! offers a long-poll channel, a response on that channel means a new block:
//! the source's epoch advances and the long-poll payload becomes the newest
//! work.
//!
//! The wire protocol sits behind [`PollProtocol`] so the source state machine
//! can be driven by a scripted protocol in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::getwork::{prev_hash_from_data, solved_data};
use super::{
    BlockInfo, FetchId, HeaderWork, JobTemplate, Liveness, SourceCommand, SourceEvent,
    Submission, SubmissionId, SubmitOutcome, WorkPayload,
};
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::tracing::prelude::*;
use crate::types::Target;

/// Pause before re-arming a long poll that failed without a verdict.
const LONG_POLL_RETRY: Duration = Duration::from_secs(5);

/// Work returned by a poll upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollWork {
    /// Header data in the upstream's wire layout
    pub data: Vec<u8>,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    Accepted,
    Rejected(String),
}

/// Request/response access to one upstream.
#[async_trait]
pub trait PollProtocol: Send + Sync {
    async fn fetch(&self) -> Result<PollWork, SourceError>;

    /// Submit solved header data.
    async fn submit(&self, data: &[u8]) -> Result<PollVerdict, SourceError>;

    /// Block until the upstream announces new work.
    async fn long_poll(&self) -> Result<PollWork, SourceError>;

    /// Whether the upstream has advertised a long-poll channel.
    fn long_poll_available(&self) -> bool;
}

/// Builds a protocol client from a configuration snapshot.
pub type ProtocolFactory =
    Arc<dyn Fn(&SourceConfig) -> Result<Arc<dyn PollProtocol>, SourceError> + Send + Sync>;

enum TaskDone {
    Fetch {
        epoch: u64,
        result: Result<PollWork, SourceError>,
    },
    Submit {
        id: SubmissionId,
        outcome: SubmitOutcome,
    },
    LongPoll {
        session: u64,
        result: Result<PollWork, SourceError>,
    },
}

pub struct PollSource {
    config: Arc<SourceConfig>,

    factory: ProtocolFactory,

    /// Built lazily, rebuilt when the endpoint changes
    protocol: Option<Arc<dyn PollProtocol>>,

    event_tx: mpsc::Sender<SourceEvent>,

    command_rx: mpsc::Receiver<SourceCommand>,

    shutdown: CancellationToken,

    poll: Interval,

    epoch: u64,

    liveness: Liveness,

    /// Consecutive failed fetches
    failures: u32,

    /// Credentials were rejected; no upstream traffic until reconfigured
    auth_blocked: bool,

    templates: u64,

    /// Fetches, submissions and the long poll in flight
    tasks: JoinSet<TaskDone>,

    fetch_in_flight: bool,

    /// Fetch requests not yet answered, oldest first
    waiting: Vec<FetchId>,

    long_poll: Option<AbortHandle>,

    /// Distinguishes the current long poll from aborted ones
    long_poll_session: u64,
}

impl PollSource {
    pub fn new(
        config: Arc<SourceConfig>,
        factory: ProtocolFactory,
        command_rx: mpsc::Receiver<SourceCommand>,
        event_tx: mpsc::Sender<SourceEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let poll = poll_interval(&config);
        Self {
            config,
            factory,
            protocol: None,
            event_tx,
            command_rx,
            shutdown,
            poll,
            epoch: 0,
            liveness: Liveness::Unknown,
            failures: 0,
            auth_blocked: false,
            templates: 0,
            tasks: JoinSet::new(),
            fetch_in_flight: false,
            waiting: Vec::new(),
            long_poll: None,
            long_poll_session: 0,
        }
    }

    pub fn name(&self) -> String {
        self.config.name.clone()
    }

    async fn emit(&self, event: SourceEvent) {
        // A closed channel means the engine is gone; the run loop notices
        // through the command channel.
        self.event_tx.send(event).await.ok();
    }

    async fn set_liveness(&mut self, liveness: Liveness) {
        if self.liveness == liveness {
            return;
        }
        debug!(source = %self.config.name, from = %self.liveness, to = %liveness, "Liveness changed");
        self.liveness = liveness;
        self.emit(SourceEvent::Liveness(liveness)).await;
    }

    fn protocol(&mut self) -> Result<Arc<dyn PollProtocol>, SourceError> {
        if let Some(protocol) = &self.protocol {
            return Ok(protocol.clone());
        }
        let protocol = (self.factory)(&self.config)?;
        self.protocol = Some(protocol.clone());
        Ok(protocol)
    }

    fn start_fetch(&mut self) {
        if self.fetch_in_flight {
            return;
        }
        self.fetch_in_flight = true;

        let epoch = self.epoch;
        let protocol = self.protocol();
        self.tasks.spawn(async move {
            let result = match protocol {
                Ok(protocol) => protocol.fetch().await,
                Err(e) => Err(e),
            };
            TaskDone::Fetch { epoch, result }
        });
    }

    fn start_long_poll(&mut self, delay: Duration) {
        if self.long_poll.is_some() || !self.config.longpoll_enabled || self.auth_blocked {
            return;
        }
        let Some(protocol) = self.protocol.clone() else {
            return;
        };
        if !protocol.long_poll_available() {
            return;
        }

        let session = self.long_poll_session;
        self.long_poll = Some(self.tasks.spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            TaskDone::LongPoll {
                session,
                result: protocol.long_poll().await,
            }
        }));
    }

    fn stop_long_poll(&mut self) {
        if let Some(handle) = self.long_poll.take() {
            handle.abort();
        }
        self.long_poll_session += 1;
    }

    fn make_template(&mut self, work: PollWork) -> Arc<JobTemplate> {
        self.templates += 1;
        let block = prev_hash_from_data(&work.data).map(|prev_hash| BlockInfo {
            prev_hash,
            height: None,
        });
        Arc::new(JobTemplate {
            id: self.templates.to_string(),
            payload: WorkPayload::Header(HeaderWork { data: work.data }),
            target: work.target,
            epoch: self.epoch,
            block,
        })
    }

    /// Hand fresh work to the oldest waiting request, or to the engine
    /// unsolicited when nobody is waiting.
    async fn deliver(&mut self, work: PollWork) {
        self.failures = 0;
        self.set_liveness(Liveness::Alive).await;

        let template = self.make_template(work);
        let request = if self.waiting.is_empty() {
            None
        } else {
            Some(self.waiting.remove(0))
        };
        trace!(source = %self.config.name, template = %template.id, ?request, "New work");
        self.emit(SourceEvent::Work { request, template }).await;

        // Each getwork header is handed out once, so every further request
        // needs its own round trip.
        if !self.waiting.is_empty() {
            self.start_fetch();
        }
        self.start_long_poll(Duration::ZERO);
    }

    async fn fail_waiting(&mut self, error: SourceError) {
        for request in std::mem::take(&mut self.waiting) {
            self.emit(SourceEvent::FetchFailed {
                request,
                error: error.clone(),
            })
            .await;
        }
    }

    async fn auth_failed(&mut self, error: SourceError) {
        warn!(
            source = %self.config.name,
            error = %error,
            "Credentials rejected; polling suspended until reconfigured"
        );
        self.auth_blocked = true;
        self.stop_long_poll();
        self.set_liveness(Liveness::Dead).await;
        self.emit(SourceEvent::AuthFailed(error.to_string())).await;
        self.fail_waiting(error).await;
    }

    async fn handle_fetch_result(&mut self, epoch: u64, result: Result<PollWork, SourceError>) {
        self.fetch_in_flight = false;

        if epoch != self.epoch {
            // Work from before an endpoint change or a long-poll fire
            if !self.waiting.is_empty() && !self.auth_blocked {
                self.start_fetch();
            }
            return;
        }

        match result {
            Ok(work) => self.deliver(work).await,
            Err(error) if error.is_auth() => self.auth_failed(error).await,
            Err(error) => {
                self.failures += 1;
                debug!(
                    source = %self.config.name,
                    error = %error,
                    failures = self.failures,
                    "Fetch failed"
                );
                if self.failures >= self.config.max_consecutive_failures {
                    self.set_liveness(Liveness::Dead).await;
                }
                self.fail_waiting(error).await;
            }
        }
    }

    async fn handle_long_poll(&mut self, session: u64, result: Result<PollWork, SourceError>) {
        if session != self.long_poll_session {
            return;
        }
        self.long_poll = None;

        match result {
            Ok(work) => {
                self.epoch += 1;
                info!(source = %self.config.name, epoch = self.epoch, "Long poll signalled new work");
                self.emit(SourceEvent::EpochAdvanced(self.epoch)).await;
                self.deliver(work).await;
            }
            Err(error) if error.is_auth() => self.auth_failed(error).await,
            Err(error) => {
                debug!(source = %self.config.name, error = %error, "Long poll failed");
                self.start_long_poll(LONG_POLL_RETRY);
            }
        }
    }

    async fn handle_fetch(&mut self, request: FetchId) {
        if self.auth_blocked {
            self.emit(SourceEvent::FetchFailed {
                request,
                error: SourceError::Auth("credentials rejected earlier".to_string()),
            })
            .await;
            return;
        }
        self.waiting.push(request);
        self.start_fetch();
    }

    async fn handle_submit(&mut self, submission: Submission) {
        let id = submission.id;

        if submission.job.epoch() < self.epoch {
            debug!(source = %self.config.name, %id, "Solution for superseded work");
            self.emit(SourceEvent::SubmitResult {
                submission: id,
                outcome: SubmitOutcome::Stale,
            })
            .await;
            return;
        }

        let WorkPayload::Header(work) = &submission.job.template.payload else {
            self.emit(SourceEvent::SubmitResult {
                submission: id,
                outcome: SubmitOutcome::Error("job was not issued by a poll source".to_string()),
            })
            .await;
            return;
        };
        let data = solved_data(&work.data, &submission.solution);

        let protocol = match self.protocol() {
            Ok(protocol) => protocol,
            Err(e) => {
                self.emit(SourceEvent::SubmitResult {
                    submission: id,
                    outcome: SubmitOutcome::Error(e.to_string()),
                })
                .await;
                return;
            }
        };

        let limit = self.config.submit_timeout;
        self.tasks.spawn(async move {
            let outcome = match time::timeout(limit, protocol.submit(&data)).await {
                Ok(Ok(PollVerdict::Accepted)) => SubmitOutcome::Accepted,
                Ok(Ok(PollVerdict::Rejected(reason))) if is_stale_reason(&reason) => {
                    SubmitOutcome::Stale
                }
                Ok(Ok(PollVerdict::Rejected(reason))) => SubmitOutcome::Rejected(reason),
                Ok(Err(e)) => SubmitOutcome::Error(e.to_string()),
                Err(_) => SubmitOutcome::Error("submission timed out".to_string()),
            };
            TaskDone::Submit { id, outcome }
        });
    }

    async fn handle_reconfigure(&mut self, config: Arc<SourceConfig>) {
        let old = &self.config;
        let endpoint_changed = old.host != config.host
            || old.port != config.port
            || old.username != config.username
            || old.password != config.password;
        let client_changed = endpoint_changed
            || old.user_agent != config.user_agent
            || old.fetch_timeout != config.fetch_timeout
            || old.submit_timeout != config.submit_timeout;
        let interval_changed = old.poll_interval != config.poll_interval;

        self.config = config;
        self.auth_blocked = false;

        if client_changed {
            self.protocol = None;
            self.stop_long_poll();
        }
        if !self.config.longpoll_enabled {
            self.stop_long_poll();
        }

        if endpoint_changed {
            self.epoch += 1;
            info!(
                source = %self.config.name,
                url = %self.config.url(),
                epoch = self.epoch,
                "Endpoint changed"
            );
            self.emit(SourceEvent::EpochAdvanced(self.epoch)).await;
            self.failures = 0;
            self.set_liveness(Liveness::Unknown).await;
        }

        if interval_changed || endpoint_changed {
            // First tick fires at once and probes the new settings
            self.poll = poll_interval(&self.config);
        }
    }

    async fn handle_task(&mut self, done: TaskDone) {
        match done {
            TaskDone::Fetch { epoch, result } => self.handle_fetch_result(epoch, result).await,
            TaskDone::LongPoll { session, result } => self.handle_long_poll(session, result).await,
            TaskDone::Submit { id, outcome } => {
                debug!(source = %self.config.name, submission = %id, %outcome, "Submission answered");
                self.emit(SourceEvent::SubmitResult {
                    submission: id,
                    outcome,
                })
                .await;
            }
        }
    }

    /// Run the source until shutdown or until the engine drops it.
    pub async fn run(mut self) {
        debug!(source = %self.config.name, url = %self.config.url(), "Poll source started");

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SourceCommand::Fetch(request)) => self.handle_fetch(request).await,
                        Some(SourceCommand::Submit(submission)) => self.handle_submit(submission).await,
                        Some(SourceCommand::Reconfigure(config)) => self.handle_reconfigure(config).await,
                        None => break,
                    }
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    // Aborted long polls surface as cancelled join errors
                    if let Ok(done) = joined {
                        self.handle_task(done).await;
                    }
                }

                _ = self.poll.tick() => {
                    if !self.auth_blocked {
                        self.start_fetch();
                    }
                }

                _ = self.shutdown.cancelled() => break,
            }
        }

        self.tasks.shutdown().await;
        debug!(source = %self.config.name, "Poll source stopped");
    }
}

fn poll_interval(config: &SourceConfig) -> Interval {
    let mut poll = time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll
}

fn is_stale_reason(reason: &str) -> bool {
    reason.to_ascii_lowercase().contains("stale")
}
