//! Scripted job sources for driving the dispatch engine from tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use poolmux::config::{ChainConfig, Config, EngineConfig, GroupConfig, NodeConfig, Protocol, SourceConfig};
use poolmux::dispatch::LifecycleEvent;
use poolmux::job_source::{
    BlockInfo, FetchId, HeaderWork, JobTemplate, SourceCommand, SourceEvent, SourceRegistration,
    SourceSpawner, Submission, WorkPayload,
};
use poolmux::types::{block_hash_from_swapped_words, Target};

pub const CHAIN: &str = "Bitcoin";

const WAIT: Duration = Duration::from_secs(2);

/// Test end of one source task: the engine's commands arrive here and the
/// test answers with events.
pub struct ScriptedSource {
    pub config: Arc<SourceConfig>,
    events: mpsc::Sender<SourceEvent>,
    commands: mpsc::Receiver<SourceCommand>,
}

impl ScriptedSource {
    pub async fn next_command(&mut self) -> SourceCommand {
        timeout(WAIT, self.commands.recv())
            .await
            .unwrap_or_else(|_| panic!("{}: no command from engine", self.config.name))
            .expect("engine dropped source")
    }

    pub async fn expect_fetch(&mut self) -> FetchId {
        loop {
            match self.next_command().await {
                SourceCommand::Fetch(request) => return request,
                SourceCommand::Reconfigure(_) => continue,
                other => panic!("{}: expected fetch, got {:?}", self.config.name, other),
            }
        }
    }

    pub async fn expect_submit(&mut self) -> Submission {
        loop {
            match self.next_command().await {
                SourceCommand::Submit(submission) => return submission,
                SourceCommand::Reconfigure(_) => continue,
                other => panic!("{}: expected submit, got {:?}", self.config.name, other),
            }
        }
    }

    /// Assert the engine has sent nothing that is still queued.
    pub fn assert_no_command(&mut self) {
        if let Ok(command) = self.commands.try_recv() {
            panic!("{}: unexpected command {:?}", self.config.name, command);
        }
    }

    pub async fn send(&self, event: SourceEvent) {
        self.events.send(event).await.expect("engine stopped");
    }

    pub async fn work(&self, request: Option<FetchId>, template: JobTemplate) {
        self.send(SourceEvent::Work {
            request,
            template: Arc::new(template),
        })
        .await;
    }

    /// Answer the next fetch with `template`.
    pub async fn serve(&mut self, template: JobTemplate) {
        let request = self.expect_fetch().await;
        self.work(Some(request), template).await;
    }
}

/// Hands every spawned source to the test instead of running a client.
pub struct ScriptedSpawner {
    spawned: mpsc::UnboundedSender<ScriptedSource>,
}

impl SourceSpawner for ScriptedSpawner {
    fn spawn(&mut self, config: Arc<SourceConfig>) -> SourceRegistration {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(64);
        let name = config.name.clone();
        self.spawned
            .send(ScriptedSource {
                config,
                events: event_tx,
                commands: command_rx,
            })
            .ok();
        SourceRegistration {
            name,
            event_rx,
            command_tx,
        }
    }
}

/// Sources spawned so far, claimed by name.
pub struct Sources {
    spawned: mpsc::UnboundedReceiver<ScriptedSource>,
    unclaimed: HashMap<String, ScriptedSource>,
}

impl Sources {
    pub fn take(&mut self, name: &str) -> ScriptedSource {
        while let Ok(source) = self.spawned.try_recv() {
            self.unclaimed.insert(source.config.name.clone(), source);
        }
        self.unclaimed
            .remove(name)
            .unwrap_or_else(|| panic!("source {} was not spawned", name))
    }
}

pub fn scripted_spawner() -> (ScriptedSpawner, Sources) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ScriptedSpawner { spawned: tx },
        Sources {
            spawned: rx,
            unclaimed: HashMap::new(),
        },
    )
}

pub fn source(name: &str, priority: u32) -> SourceConfig {
    SourceConfig::new(name, Protocol::Getwork, "127.0.0.1", 8332).with_priority(priority)
}

/// Engine tuning that keeps tests fast.
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        max_fetch_attempts: 2,
        health_check_interval: Duration::from_secs(3600),
        status_interval: Duration::from_secs(3600),
        no_source_backoff_min: Duration::from_millis(50),
        no_source_backoff_max: Duration::from_millis(200),
        fetch_drain_timeout: Duration::from_millis(200),
        drain_deadline: Duration::from_millis(300),
    }
}

/// One chain whose root holds `children`.
pub fn config(children: Vec<NodeConfig>) -> Config {
    let mut root = GroupConfig::new("Work sources", 0);
    root.children = children;
    Config {
        engine: engine_config(),
        chains: vec![ChainConfig {
            name: CHAIN.to_string(),
            root,
        }],
    }
}

/// A getwork template building on the block identified by `block`.
pub fn template(id: &str, epoch: u64, block: u8, height: Option<u64>) -> JobTemplate {
    let prev_hash = block_hash_from_swapped_words(&[block; 32]).expect("32 bytes");
    JobTemplate {
        id: id.to_string(),
        payload: WorkPayload::Header(HeaderWork {
            data: vec![block; 128],
        }),
        target: Target::MAX,
        epoch,
        block: Some(BlockInfo { prev_hash, height }),
    }
}

pub async fn next_lifecycle(events: &mut mpsc::Receiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no lifecycle event")
        .expect("engine stopped")
}
