//! Push job source over Stratum v1.
//!
//! Wraps one [`StratumV1Client`] session at a time and bridges between the
//! Stratum protocol and the dispatch engine's source vocabulary: pushed
//! `mining.notify` jobs become [`JobTemplate`]s, engine submissions become
//! `mining.submit` requests, and acknowledgements are correlated back to
//! their submission ids. Reconnects are driven from here with jittered
//! exponential backoff; every established session is a new epoch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::{
    BlockInfo, FetchId, JobTemplate, Liveness, SourceCommand, SourceEvent, StratumWork,
    Submission, SubmissionId, SubmitOutcome, WorkPayload,
};
use crate::backoff::Backoff;
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::stratum_v1::{
    ClientCommand, ClientEvent, JobNotification, PoolConfig, StratumError, StratumResult,
    StratumV1Client, SubmitParams, JOB_NOT_FOUND,
};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Protocol state learned during one session.
#[derive(Debug, Clone)]
struct ProtocolState {
    extranonce1: Vec<u8>,

    extranonce2_size: usize,

    /// Current share difficulty (from mining.set_difficulty)
    share_difficulty: Option<Difficulty>,

    /// Version rolling mask (from mining.set_version_mask)
    version_mask: Option<u32>,
}

/// One running client and its channels.
struct Session {
    command_tx: mpsc::Sender<ClientCommand>,
    event_rx: mpsc::Receiver<ClientEvent>,
    handle: JoinHandle<StratumResult<()>>,
    cancel: CancellationToken,
    authorized: bool,
}

/// Stratum v1 job source.
pub struct StratumV1Source {
    config: Arc<SourceConfig>,

    /// Where to send events to the engine
    event_tx: mpsc::Sender<SourceEvent>,

    /// Where to receive commands from the engine
    command_rx: mpsc::Receiver<SourceCommand>,

    shutdown: CancellationToken,

    epoch: u64,

    liveness: Liveness,

    /// Protocol state from subscription
    state: Option<ProtocolState>,

    /// Newest job of the current session
    latest: Option<Arc<JobTemplate>>,

    /// Submissions awaiting an acknowledgement, with their deadlines
    pending: HashMap<SubmissionId, Instant>,

    session: Option<Session>,

    backoff: Backoff,

    reconnect_at: Option<Instant>,

    /// Credentials were rejected; no reconnects until reconfigured
    auth_blocked: bool,

    /// Fetch requests parked until the session delivers its first job
    waiting: Vec<FetchId>,

    /// Track if first accepted share has been logged
    first_share_logged: bool,
}

impl StratumV1Source {
    pub fn new(
        config: Arc<SourceConfig>,
        command_rx: mpsc::Receiver<SourceCommand>,
        event_tx: mpsc::Sender<SourceEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(config.reconnect_backoff_min, config.reconnect_backoff_max);
        Self {
            config,
            event_tx,
            command_rx,
            shutdown,
            epoch: 0,
            liveness: Liveness::Unknown,
            state: None,
            latest: None,
            pending: HashMap::new(),
            session: None,
            backoff,
            reconnect_at: None,
            auth_blocked: false,
            waiting: Vec::new(),
            first_share_logged: false,
        }
    }

    pub fn name(&self) -> String {
        self.config.name.clone()
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            url: self.config.url(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            user_agent: self.config.user_agent.clone(),
            suggested_difficulty: self.config.suggested_difficulty,
        }
    }

    async fn emit(&self, event: SourceEvent) {
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

    async fn advance_epoch(&mut self) {
        self.epoch += 1;
        self.latest = None;
        self.emit(SourceEvent::EpochAdvanced(self.epoch)).await;
    }

    fn connect(&mut self) {
        debug!(source = %self.config.name, pool = %self.config.url(), "Connecting to pool");

        let (client_event_tx, event_rx) = mpsc::channel(100);
        let (command_tx, client_command_rx) = mpsc::channel(100);
        let cancel = self.shutdown.child_token();

        let client = StratumV1Client::new(
            self.pool_config(),
            client_event_tx,
            client_command_rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(client.run());

        self.reconnect_at = None;
        self.session = Some(Session {
            command_tx,
            event_rx,
            handle,
            cancel,
            authorized: false,
        });
    }

    /// Drop the session's state: pending submissions fail, parked fetches
    /// fail, and the cached job is forgotten.
    async fn clear_session_state(&mut self, reason: &str) {
        self.state = None;
        self.latest = None;

        let mut lost: Vec<_> = self.pending.drain().map(|(id, _)| id).collect();
        lost.sort();
        for submission in lost {
            self.emit(SourceEvent::SubmitResult {
                submission,
                outcome: SubmitOutcome::Error(reason.to_string()),
            })
            .await;
        }

        let error = if self.auth_blocked {
            SourceError::Auth(reason.to_string())
        } else {
            SourceError::Unreachable(reason.to_string())
        };
        for request in std::mem::take(&mut self.waiting) {
            self.emit(SourceEvent::FetchFailed {
                request,
                error: error.clone(),
            })
            .await;
        }
    }

    /// The client task ended; find out why and plan the next attempt.
    async fn session_ended(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let result = match session.handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(source = %self.config.name, error = %e, "Stratum client task failed");
                Err(StratumError::Disconnected)
            }
        };

        if self.shutdown.is_cancelled() {
            return;
        }

        let reason = match result {
            Err(StratumError::AuthorizationFailed(reason)) => {
                warn!(
                    source = %self.config.name,
                    user = %self.config.username,
                    reason = %reason,
                    "Pool rejected credentials; not reconnecting until reconfigured"
                );
                self.auth_blocked = true;
                self.set_liveness(Liveness::Dead).await;
                self.emit(SourceEvent::AuthFailed(reason.clone())).await;
                format!("authorization failed: {}", reason)
            }
            Err(e) => {
                warn!(source = %self.config.name, error = %e, "Pool connection lost");
                self.set_liveness(Liveness::Dead).await;
                e.to_string()
            }
            Ok(()) => {
                self.set_liveness(Liveness::Dead).await;
                "session closed".to_string()
            }
        };
        self.clear_session_state(&reason).await;

        if !self.auth_blocked {
            let delay = self.backoff.next_delay();
            info!(
                source = %self.config.name,
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempt(),
                "Reconnecting after delay"
            );
            self.reconnect_at = Some(Instant::now() + delay);
        }
    }

    /// Tear the current session down on purpose.
    async fn end_session(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            session.handle.abort();
        }
        self.clear_session_state(reason).await;
    }

    fn job_to_template(&self, job: &JobNotification) -> Option<Arc<JobTemplate>> {
        let state = self.state.as_ref()?;
        let difficulty = state.share_difficulty.unwrap_or(Difficulty::new(1));

        Some(Arc::new(JobTemplate {
            id: job.job_id.clone(),
            payload: WorkPayload::Stratum(StratumWork {
                prev_hash: job.prev_hash,
                coinbase1: job.coinbase1.clone(),
                coinbase2: job.coinbase2.clone(),
                merkle_branches: job.merkle_branches.clone(),
                version: job.version,
                version_mask: state.version_mask,
                nbits: job.nbits,
                ntime: job.ntime,
                extranonce1: state.extranonce1.clone(),
                extranonce2_size: state.extranonce2_size,
            }),
            target: difficulty.to_target(),
            epoch: self.epoch,
            block: Some(BlockInfo {
                prev_hash: job.prev_hash,
                height: job.block_height(),
            }),
        }))
    }

    /// Send the newest job to every parked request, or unsolicited when
    /// nobody is waiting.
    async fn publish(&mut self, template: Arc<JobTemplate>) {
        if self.waiting.is_empty() {
            self.emit(SourceEvent::Work {
                request: None,
                template,
            })
            .await;
            return;
        }
        for request in std::mem::take(&mut self.waiting) {
            self.emit(SourceEvent::Work {
                request: Some(request),
                template: template.clone(),
            })
            .await;
        }
    }

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Subscribed {
                extranonce1,
                extranonce2_size,
            } => {
                self.state = Some(ProtocolState {
                    extranonce1,
                    extranonce2_size,
                    share_difficulty: None,
                    version_mask: None,
                });
                self.advance_epoch().await;
            }

            ClientEvent::Authorized => {
                info!(
                    source = %self.config.name,
                    pool = %self.config.url(),
                    user = %self.config.username,
                    epoch = self.epoch,
                    "Connected."
                );
                if let Some(session) = &mut self.session {
                    session.authorized = true;
                }
                self.backoff.reset();
                self.set_liveness(Liveness::Alive).await;
            }

            ClientEvent::NewJob(job) => {
                debug!(source = %self.config.name, job_id = %job.job_id, clean_jobs = job.clean_jobs, "Received job from pool");

                // Clean jobs means previous work of this session is invalid
                if job.clean_jobs && self.latest.is_some() {
                    self.advance_epoch().await;
                }

                match self.job_to_template(&job) {
                    Some(template) => {
                        self.latest = Some(template.clone());
                        self.publish(template).await;
                    }
                    None => warn!(source = %self.config.name, "Job before subscription"),
                }
            }

            ClientEvent::DifficultyChanged(diff) => {
                let difficulty = Difficulty::new(diff);
                debug!(source = %self.config.name, difficulty = %difficulty, "Pool difficulty changed");
                if let Some(state) = &mut self.state {
                    state.share_difficulty = Some(difficulty);
                }
            }

            ClientEvent::VersionMaskSet(mask) => {
                debug!(source = %self.config.name, mask = format!("{:#010x}", mask), "Version mask set");
                if let Some(state) = &mut self.state {
                    state.version_mask = Some(mask);
                }
            }

            ClientEvent::ShareAccepted { submission } => {
                if self.pending.remove(&submission).is_none() {
                    return;
                }
                if !self.first_share_logged {
                    self.first_share_logged = true;
                    info!(source = %self.config.name, %submission, "First share accepted.");
                }
                self.emit(SourceEvent::SubmitResult {
                    submission,
                    outcome: SubmitOutcome::Accepted,
                })
                .await;
            }

            ClientEvent::ShareRejected {
                submission,
                code,
                reason,
            } => {
                if self.pending.remove(&submission).is_none() {
                    return;
                }
                let outcome = if code == Some(JOB_NOT_FOUND)
                    || reason.to_ascii_lowercase().contains("stale")
                {
                    SubmitOutcome::Stale
                } else {
                    warn!(source = %self.config.name, %submission, ?code, reason = %reason, "Share rejected by pool");
                    SubmitOutcome::Rejected(reason)
                };
                self.emit(SourceEvent::SubmitResult {
                    submission,
                    outcome,
                })
                .await;
            }

            ClientEvent::Disconnected => {
                self.set_liveness(Liveness::Dead).await;
            }

            ClientEvent::Error(err) => {
                warn!(source = %self.config.name, error = %err, "Pool error");
            }
        }
    }

    async fn handle_fetch(&mut self, request: FetchId) {
        let authorized = self.session.as_ref().is_some_and(|s| s.authorized);
        match (&self.latest, &self.session) {
            (Some(template), Some(_)) if authorized => {
                let template = template.clone();
                self.emit(SourceEvent::Work {
                    request: Some(request),
                    template,
                })
                .await;
            }
            (_, Some(_)) => self.waiting.push(request),
            (_, None) => {
                let error = if self.auth_blocked {
                    SourceError::Auth("credentials rejected earlier".to_string())
                } else {
                    SourceError::Unreachable("not connected".to_string())
                };
                self.emit(SourceEvent::FetchFailed { request, error }).await;
            }
        }
    }

    /// Convert a submission to `mining.submit` parameters.
    fn submit_params(&self, submission: &Submission) -> Result<SubmitParams, String> {
        let WorkPayload::Stratum(work) = &submission.job.template.payload else {
            return Err("job was not issued by a push source".to_string());
        };
        let solution = &submission.solution;

        let extranonce2 = solution
            .extranonce2
            .clone()
            .unwrap_or_else(|| vec![0; work.extranonce2_size]);
        if extranonce2.len() != work.extranonce2_size {
            return Err(format!(
                "extranonce2 is {} bytes, pool expects {}",
                extranonce2.len(),
                work.extranonce2_size
            ));
        }

        // Pools that enabled version rolling expect the field even when no
        // bits were rolled.
        let version_bits = work.version_mask.map(|mask| {
            let rolled = solution.version.unwrap_or(work.version).to_consensus() as u32;
            rolled & mask
        });

        Ok(SubmitParams {
            username: self.config.username.clone(),
            job_id: submission.job.template.id.clone(),
            extranonce2,
            ntime: solution.ntime.unwrap_or(work.ntime),
            nonce: solution.nonce,
            version_bits,
        })
    }

    async fn handle_submit(&mut self, submission: Submission) {
        let id = submission.id;

        if submission.job.epoch() < self.epoch {
            debug!(source = %self.config.name, %id, job_epoch = submission.job.epoch(), epoch = self.epoch, "Solution for superseded work");
            self.emit(SourceEvent::SubmitResult {
                submission: id,
                outcome: SubmitOutcome::Stale,
            })
            .await;
            return;
        }

        let params = match self.submit_params(&submission) {
            Ok(params) => params,
            Err(reason) => {
                self.emit(SourceEvent::SubmitResult {
                    submission: id,
                    outcome: SubmitOutcome::Error(reason),
                })
                .await;
                return;
            }
        };

        let sent = match &self.session {
            Some(session) if session.authorized => session
                .command_tx
                .send(ClientCommand::SubmitShare {
                    submission: id,
                    params,
                })
                .await
                .is_ok(),
            _ => false,
        };

        if sent {
            trace!(source = %self.config.name, %id, nonce = format!("{:#x}", submission.solution.nonce), "Share sent to pool");
            self.pending
                .insert(id, Instant::now() + self.config.submit_timeout);
        } else {
            self.emit(SourceEvent::SubmitResult {
                submission: id,
                outcome: SubmitOutcome::Error("not connected".to_string()),
            })
            .await;
        }
    }

    async fn handle_reconfigure(&mut self, config: Arc<SourceConfig>) {
        let old = &self.config;
        let session_changed = old.host != config.host
            || old.port != config.port
            || old.username != config.username
            || old.password != config.password
            || old.user_agent != config.user_agent
            || old.suggested_difficulty != config.suggested_difficulty;

        self.backoff
            .set_bounds(config.reconnect_backoff_min, config.reconnect_backoff_max);
        self.config = config;
        self.auth_blocked = false;

        if session_changed && self.session.is_some() {
            info!(source = %self.config.name, pool = %self.config.url(), "Settings changed; reconnecting");
            self.end_session("source reconfigured").await;
            self.set_liveness(Liveness::Unknown).await;
        }
        if self.session.is_none() {
            self.backoff.reset();
            self.connect();
        }
    }

    /// Fail submissions whose acknowledgement is overdue.
    async fn expire_pending(&mut self) {
        let now = Instant::now();
        let mut expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();

        for submission in expired {
            self.pending.remove(&submission);
            warn!(source = %self.config.name, %submission, "No acknowledgement from pool");
            self.emit(SourceEvent::SubmitResult {
                submission,
                outcome: SubmitOutcome::Error("acknowledgement timed out".to_string()),
            })
            .await;
        }
    }

    /// Run the source (main event loop).
    pub async fn run(mut self) {
        self.connect();

        loop {
            let next_expiry = self.pending.values().min().copied();

            tokio::select! {
                event = recv_client_event(&mut self.session) => {
                    match event {
                        Some(event) => self.handle_client_event(event).await,
                        None => self.session_ended().await,
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SourceCommand::Fetch(request)) => self.handle_fetch(request).await,
                        Some(SourceCommand::Submit(submission)) => self.handle_submit(submission).await,
                        Some(SourceCommand::Reconfigure(config)) => self.handle_reconfigure(config).await,
                        None => break,
                    }
                }

                _ = sleep_until(self.reconnect_at) => self.connect(),

                _ = sleep_until(next_expiry) => self.expire_pending().await,

                _ = self.shutdown.cancelled() => break,
            }
        }

        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            session.handle.await.ok();
        }
        debug!(source = %self.config.name, "Push source stopped");
    }
}

async fn recv_client_event(session: &mut Option<Session>) -> Option<ClientEvent> {
    match session {
        Some(session) => session.event_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::job_source::{Job, JobId, Solution};
    use crate::tree::NodeId;
    use serde_json::{json, Value};
    use slotmap::KeyData;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct FakePool {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl FakePool {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            let (read, write) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn recv(&mut self) -> Value {
            let line = timeout(WAIT, self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        async fn handshake(&mut self, authorize: bool) {
            let subscribe = self.recv().await;
            assert_eq!(subscribe["method"], "mining.subscribe");
            self.send(json!({
                "id": subscribe["id"],
                "result": [[["mining.notify", "1"]], "f000000f", 4],
                "error": null
            }))
            .await;

            let auth = self.recv().await;
            assert_eq!(auth["method"], "mining.authorize");
            self.send(json!({"id": auth["id"], "result": authorize, "error": null}))
                .await;
        }

        async fn notify(&mut self, job_id: &str, clean_jobs: bool) {
            self.send(json!({
                "id": null,
                "method": "mining.notify",
                "params": [
                    job_id,
                    "00000000000000000000000000000000000000000000000000000000000000aa",
                    "aa", "bb", [], "20000000", "1d00ffff", "5a5a5a5a", clean_jobs
                ]
            }))
            .await;
        }
    }

    struct TestHarness {
        command_tx: mpsc::Sender<SourceCommand>,
        event_rx: mpsc::Receiver<SourceEvent>,
        shutdown: CancellationToken,
        listener: TcpListener,
    }

    impl TestHarness {
        async fn start(tune: impl FnOnce(&mut SourceConfig)) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let mut config = SourceConfig::new("pool", Protocol::Stratum, "127.0.0.1", port)
                .with_credentials("worker", "x");
            config.reconnect_backoff_min = Duration::from_millis(20);
            config.reconnect_backoff_max = Duration::from_millis(50);
            tune(&mut config);

            let (command_tx, command_rx) = mpsc::channel(16);
            let (event_tx, event_rx) = mpsc::channel(64);
            let shutdown = CancellationToken::new();
            let source =
                StratumV1Source::new(Arc::new(config), command_rx, event_tx, shutdown.clone());
            tokio::spawn(source.run());

            Self {
                command_tx,
                event_rx,
                shutdown,
                listener,
            }
        }

        async fn next_event(&mut self) -> SourceEvent {
            timeout(WAIT, self.event_rx.recv())
                .await
                .expect("timed out waiting for source event")
                .expect("source stopped")
        }

        async fn events_until(&mut self, done: impl Fn(&SourceEvent) -> bool) -> Vec<SourceEvent> {
            let mut events = Vec::new();
            loop {
                let event = self.next_event().await;
                let finished = done(&event);
                events.push(event);
                if finished {
                    return events;
                }
            }
        }

        async fn connected_with_job(&mut self) -> (FakePool, Arc<JobTemplate>) {
            let mut pool = FakePool::accept(&self.listener).await;
            pool.handshake(true).await;
            pool.notify("j1", true).await;
            let events = self
                .events_until(|e| matches!(e, SourceEvent::Work { .. }))
                .await;
            match events.last() {
                Some(SourceEvent::Work { template, .. }) => (pool, template.clone()),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        async fn submit(&self, id: u64, template: Arc<JobTemplate>) {
            let job = Job {
                id: JobId(id),
                chain: "Bitcoin".to_string(),
                generation: 0,
                source: NodeId::from(KeyData::from_ffi(1)),
                template,
                invalidated: false,
            };
            let submission = Submission::new(SubmissionId(id), job, Solution::with_nonce(0x42));
            self.command_tx
                .send(SourceCommand::Submit(submission))
                .await
                .unwrap();
        }

        async fn outcome(&mut self, id: u64) -> SubmitOutcome {
            let events = self
                .events_until(|e| matches!(e, SourceEvent::SubmitResult { submission, .. } if submission.0 == id))
                .await;
            match events.last() {
                Some(SourceEvent::SubmitResult { outcome, .. }) => outcome.clone(),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    #[tokio::test]
    async fn test_session_pushes_work_in_new_epoch() {
        let mut harness = TestHarness::start(|_| {}).await;
        let mut pool = FakePool::accept(&harness.listener).await;
        pool.handshake(true).await;
        pool.send(json!({"id": null, "method": "mining.set_difficulty", "params": [1024]}))
            .await;
        pool.notify("j1", true).await;

        assert!(matches!(
            harness.next_event().await,
            SourceEvent::EpochAdvanced(1)
        ));
        assert!(matches!(
            harness.next_event().await,
            SourceEvent::Liveness(Liveness::Alive)
        ));
        match harness.next_event().await {
            SourceEvent::Work { request, template } => {
                assert_eq!(request, None);
                assert_eq!(template.id, "j1");
                assert_eq!(template.epoch, 1);
                assert_eq!(template.target, Difficulty::new(1024).to_target());
                assert!(template.block.is_some());
                match &template.payload {
                    WorkPayload::Stratum(work) => {
                        assert_eq!(work.extranonce1, vec![0xf0, 0x00, 0x00, 0x0f]);
                        assert_eq!(work.extranonce2_size, 4);
                    }
                    other => panic!("unexpected payload: {:?}", other),
                }
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_is_answered_from_cache() {
        let mut harness = TestHarness::start(|_| {}).await;
        let (_pool, template) = harness.connected_with_job().await;

        harness
            .command_tx
            .send(SourceCommand::Fetch(FetchId(5)))
            .await
            .unwrap();
        match harness.next_event().await {
            SourceEvent::Work { request, template: cached } => {
                assert_eq!(request, Some(FetchId(5)));
                assert!(Arc::ptr_eq(&cached, &template));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_jobs_advances_epoch() {
        let mut harness = TestHarness::start(|_| {}).await;
        let (mut pool, first) = harness.connected_with_job().await;

        pool.notify("j2", false).await;
        let events = harness
            .events_until(|e| matches!(e, SourceEvent::Work { .. }))
            .await;
        assert_eq!(events.len(), 1);

        pool.notify("j3", true).await;
        assert!(matches!(
            harness.next_event().await,
            SourceEvent::EpochAdvanced(e) if e == first.epoch + 1
        ));
    }

    #[tokio::test]
    async fn test_acknowledgements_map_to_outcomes() {
        let mut harness = TestHarness::start(|_| {}).await;
        let (mut pool, template) = harness.connected_with_job().await;

        harness.submit(1, template.clone()).await;
        harness.submit(2, template).await;

        let first = pool.recv().await;
        assert_eq!(first["method"], "mining.submit");
        assert_eq!(first["params"][0], "worker");
        assert_eq!(first["params"][1], "j1");
        assert_eq!(first["params"][2], "00000000");
        let second = pool.recv().await;

        pool.send(json!({"id": second["id"], "result": null, "error": [21, "Job not found", null]}))
            .await;
        pool.send(json!({"id": first["id"], "result": true, "error": null}))
            .await;

        assert_eq!(harness.outcome(2).await, SubmitOutcome::Stale);
        assert_eq!(harness.outcome(1).await, SubmitOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_reconnect_answers_old_epoch_locally() {
        let mut harness = TestHarness::start(|_| {}).await;
        let (pool, old) = harness.connected_with_job().await;
        drop(pool);

        harness
            .events_until(|e| matches!(e, SourceEvent::Liveness(Liveness::Dead)))
            .await;

        let (mut pool, new) = harness.connected_with_job().await;
        assert!(new.epoch > old.epoch);

        harness.submit(7, old).await;
        assert_eq!(harness.outcome(7).await, SubmitOutcome::Stale);

        // Nothing reached the pool
        assert!(
            timeout(Duration::from_millis(200), pool.lines.next_line())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_rejected_credentials_stop_reconnecting() {
        let mut harness = TestHarness::start(|_| {}).await;
        let mut pool = FakePool::accept(&harness.listener).await;
        pool.handshake(false).await;

        let events = harness
            .events_until(|e| matches!(e, SourceEvent::AuthFailed(_)))
            .await;
        assert!(events
            .iter()
            .any(|e| matches!(e, SourceEvent::Liveness(Liveness::Dead))));

        assert!(
            timeout(Duration::from_millis(300), harness.listener.accept())
                .await
                .is_err()
        );

        harness
            .command_tx
            .send(SourceCommand::Fetch(FetchId(1)))
            .await
            .unwrap();
        match harness.next_event().await {
            SourceEvent::FetchFailed { error, .. } => assert!(error.is_auth()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unacknowledged_submission_times_out() {
        let mut harness =
            TestHarness::start(|config| config.submit_timeout = Duration::from_millis(100)).await;
        let (mut pool, template) = harness.connected_with_job().await;

        harness.submit(3, template).await;
        assert_eq!(pool.recv().await["method"], "mining.submit");

        assert!(matches!(
            harness.outcome(3).await,
            SubmitOutcome::Error(_)
        ));
    }
}
