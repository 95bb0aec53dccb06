//! Stratum v1 client implementation.
//!
//! This module contains the client that runs one pool session: connect,
//! subscribe, authorize, then relay notifications and share submissions
//! until the connection ends. Reconnecting is the caller's job; every
//! session is a fresh client.

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::error::{StratumError, StratumResult};
use super::messages::{
    parse_error, ClientCommand, ClientEvent, JobNotification, JsonRpcMessage, SubmitParams,
};
use crate::job_source::SubmissionId;
use crate::tracing::prelude::*;

/// How long a setup request (subscribe, authorize) may wait for its
/// response.
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool connection configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port or host:port)
    pub url: String,

    /// Worker username
    pub username: String,

    /// Worker password
    pub password: String,

    /// User agent string
    pub user_agent: String,

    /// Suggested starting difficulty
    ///
    /// Sent via mining.suggest_difficulty after authorization. Left unset by
    /// default; some pools disconnect clients that suggest inappropriate
    /// values.
    pub suggested_difficulty: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            user_agent: crate::config::USER_AGENT.to_string(),
            suggested_difficulty: None,
        }
    }
}

/// Stratum v1 client.
///
/// Handles Stratum's interleaved message pattern where notifications can
/// arrive between request/response pairs. During setup we wait for each
/// response in turn while processing notifications inline. Once
/// established, share submissions are pipelined: each request id is mapped
/// to its submission, so acknowledgements may arrive late or out of order.
pub struct StratumV1Client {
    config: PoolConfig,

    event_tx: mpsc::Sender<ClientEvent>,

    command_rx: mpsc::Receiver<ClientCommand>,

    shutdown: CancellationToken,

    /// Auto-incrementing message ID
    next_id: u64,

    /// Outstanding `mining.submit` requests by message ID
    pending_submits: HashMap<u64, SubmissionId>,
}

impl StratumV1Client {
    pub fn new(
        config: PoolConfig,
        event_tx: mpsc::Sender<ClientEvent>,
        command_rx: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            command_rx,
            shutdown,
            next_id: 1,
            pending_submits: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn emit(&self, event: ClientEvent) -> StratumResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| StratumError::Disconnected)
    }

    /// Send a request and wait for its response.
    ///
    /// Notifications arriving in the meantime are handled as usual. Times
    /// out after [`SETUP_TIMEOUT`] and gives up at once on shutdown.
    async fn send_request(
        &mut self,
        conn: &mut Connection,
        method: &str,
        params: serde_json::Value,
    ) -> StratumResult<JsonRpcMessage> {
        let id = self.next_id();
        conn.write_message(&JsonRpcMessage::request(id, method, params))
            .await?;

        let shutdown = self.shutdown.clone();
        timeout(SETUP_TIMEOUT, async {
            loop {
                tokio::select! {
                    result = conn.read_message() => {
                        let msg = result?.ok_or(StratumError::Disconnected)?;
                        match msg {
                            JsonRpcMessage::Response { id: resp_id, .. } if resp_id == id => {
                                return Ok(msg);
                            }
                            JsonRpcMessage::Response { id: other_id, .. } => {
                                warn!(msg_id = other_id, "Received response for different request");
                            }
                            JsonRpcMessage::Request { id: None, method, params } => {
                                self.handle_notification(&method, &params).await?;
                            }
                            JsonRpcMessage::Request { id: Some(_), method, .. } => {
                                warn!(method = %method, "Server sent request during setup");
                            }
                        }
                    }

                    _ = shutdown.cancelled() => {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        })
        .await
        .map_err(|_| StratumError::Timeout)?
    }

    /// Send `mining.subscribe`; returns extranonce1 and extranonce2 size.
    async fn subscribe(&mut self, conn: &mut Connection) -> StratumResult<(Vec<u8>, usize)> {
        let user_agent = self.config.user_agent.clone();
        let response = self
            .send_request(conn, "mining.subscribe", json!([user_agent]))
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                // [[subscriptions...], extranonce1, extranonce2_size]
                let arr = result.as_array().ok_or_else(|| {
                    StratumError::InvalidMessage("subscribe result not an array".to_string())
                })?;
                if arr.len() < 3 {
                    return Err(StratumError::InvalidMessage(
                        "subscribe result too short".to_string(),
                    ));
                }

                let extranonce1 = arr[1].as_str().ok_or_else(|| {
                    StratumError::InvalidMessage("extranonce1 not a string".to_string())
                })?;
                let extranonce1 = hex::decode(extranonce1)
                    .map_err(|e| StratumError::InvalidMessage(format!("extranonce1: {}", e)))?;

                let extranonce2_size = arr[2].as_u64().ok_or_else(|| {
                    StratumError::InvalidMessage("extranonce2_size not a number".to_string())
                })? as usize;

                Ok((extranonce1, extranonce2_size))
            }
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::SubscriptionFailed(parse_error(&error).1)),
            _ => Err(StratumError::UnexpectedResponse(
                "Invalid subscribe response".to_string(),
            )),
        }
    }

    /// Send `mining.authorize` with the worker credentials.
    async fn authorize(&mut self, conn: &mut Connection) -> StratumResult<()> {
        let params = json!([&self.config.username, &self.config.password]);
        let response = self.send_request(conn, "mining.authorize", params).await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                if result.as_bool().unwrap_or(false) {
                    Ok(())
                } else {
                    Err(StratumError::AuthorizationFailed(
                        "Pool returned false".to_string(),
                    ))
                }
            }
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::AuthorizationFailed(parse_error(&error).1)),
            _ => Err(StratumError::UnexpectedResponse(
                "Invalid authorize response".to_string(),
            )),
        }
    }

    /// Send `mining.suggest_difficulty`. The pool answers with
    /// `mining.set_difficulty` if it takes the hint.
    async fn suggest_difficulty(
        &mut self,
        conn: &mut Connection,
        difficulty: u64,
    ) -> StratumResult<()> {
        let response = self
            .send_request(conn, "mining.suggest_difficulty", json!([difficulty]))
            .await?;

        if let JsonRpcMessage::Response { result, .. } = response {
            debug!(
                accepted = ?result.as_ref().and_then(|v| v.as_bool()),
                "Pool responded to difficulty suggestion"
            );
        }
        Ok(())
    }

    /// Write a `mining.submit` without waiting for the answer.
    async fn submit(
        &mut self,
        conn: &mut Connection,
        submission: SubmissionId,
        params: SubmitParams,
    ) -> StratumResult<()> {
        let id = self.next_id();
        let msg = JsonRpcMessage::request(id, "mining.submit", params.to_params());
        conn.write_message(&msg).await?;
        self.pending_submits.insert(id, submission);
        Ok(())
    }

    /// Match a response against the outstanding submissions.
    async fn handle_response(
        &mut self,
        id: u64,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> StratumResult<()> {
        let Some(submission) = self.pending_submits.remove(&id) else {
            debug!(msg_id = id, "Received unexpected response");
            return Ok(());
        };

        let event = match (result, error) {
            (_, Some(error)) if !error.is_null() => {
                let (code, reason) = parse_error(&error);
                ClientEvent::ShareRejected {
                    submission,
                    code,
                    reason,
                }
            }
            (Some(result), _) if result.as_bool() == Some(true) => {
                ClientEvent::ShareAccepted { submission }
            }
            _ => ClientEvent::ShareRejected {
                submission,
                code: None,
                reason: "rejected".to_string(),
            },
        };
        self.emit(event).await
    }

    /// Handle a notification from the pool.
    async fn handle_notification(
        &mut self,
        method: &str,
        params: &serde_json::Value,
    ) -> StratumResult<()> {
        match method {
            "mining.notify" => {
                let arr = params.as_array().ok_or_else(|| {
                    StratumError::InvalidMessage("mining.notify params not an array".to_string())
                })?;
                match JobNotification::from_stratum_params(arr) {
                    Ok(job) => self.emit(ClientEvent::NewJob(job)).await?,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed job");
                        self.emit(ClientEvent::Error(e)).await?;
                    }
                }
            }
            "mining.set_difficulty" => {
                let value = params.get(0).ok_or_else(|| {
                    StratumError::InvalidMessage("set_difficulty params empty".to_string())
                })?;
                // Some pools send fractional difficulties
                let difficulty = value
                    .as_u64()
                    .or_else(|| value.as_f64().map(|d| d.max(1.0).ceil() as u64))
                    .ok_or_else(|| {
                        StratumError::InvalidMessage("difficulty not a number".to_string())
                    })?;
                self.emit(ClientEvent::DifficultyChanged(difficulty)).await?;
            }
            "mining.set_version_mask" => {
                let mask_str = params.get(0).and_then(|v| v.as_str()).ok_or_else(|| {
                    StratumError::InvalidMessage("version_mask not a string".to_string())
                })?;
                let mask = u32::from_str_radix(mask_str.trim_start_matches("0x"), 16).map_err(
                    |_| StratumError::InvalidMessage("version_mask not valid hex".to_string()),
                )?;
                self.emit(ClientEvent::VersionMaskSet(mask)).await?;
            }
            "client.reconnect" => {
                info!("Pool requested reconnect");
                return Err(StratumError::Disconnected);
            }
            _ => {
                warn!(method = %method, "Unknown notification method");
            }
        }
        Ok(())
    }

    /// Run one session.
    ///
    /// Returns `Ok(())` only on shutdown. Any other end of the session
    /// (connection loss, protocol failure, rejected credentials) is an
    /// error, and `Disconnected` is emitted unless the handshake never
    /// completed.
    pub async fn run(mut self) -> StratumResult<()> {
        let mut conn = Connection::connect(&self.config.url).await?;

        let (extranonce1, extranonce2_size) = self.subscribe(&mut conn).await?;
        debug!(
            extranonce1 = hex::encode(&extranonce1),
            extranonce2_size, "Subscribed"
        );
        self.emit(ClientEvent::Subscribed {
            extranonce1,
            extranonce2_size,
        })
        .await?;

        debug!(username = %self.config.username, "Authorizing");
        self.authorize(&mut conn).await?;
        self.emit(ClientEvent::Authorized).await?;

        if let Some(difficulty) = self.config.suggested_difficulty {
            if let Err(e) = self.suggest_difficulty(&mut conn, difficulty).await {
                warn!(error = %e, "Failed to suggest difficulty (non-fatal)");
            }
        }

        let result = self.session(&mut conn).await;
        if result.is_err() {
            self.event_tx.send(ClientEvent::Disconnected).await.ok();
        }
        result
    }

    async fn session(&mut self, conn: &mut Connection) -> StratumResult<()> {
        loop {
            tokio::select! {
                msg = conn.read_message() => {
                    match msg? {
                        Some(JsonRpcMessage::Request { id: None, method, params }) => {
                            self.handle_notification(&method, &params).await?;
                        }
                        Some(JsonRpcMessage::Response { id, result, error }) => {
                            self.handle_response(id, result, error).await?;
                        }
                        Some(JsonRpcMessage::Request { id: Some(_), method, .. }) => {
                            warn!(method = %method, "Server sent request (not notification)");
                        }
                        None => {
                            info!("Connection closed by pool");
                            return Err(StratumError::Disconnected);
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::SubmitShare { submission, params }) => {
                            trace!(job_id = %params.job_id, %submission, "Submitting share");
                            self.submit(conn, submission, params).await?;
                        }
                        None => return Ok(()),
                    }
                }

                _ = self.shutdown.cancelled() => {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;

    /// Minimal scripted pool on a loopback socket.
    struct FakePool {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl FakePool {
        async fn accept(listener: TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        /// Answer subscribe and authorize.
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
            assert_eq!(auth["params"][0], "worker");
            self.send(json!({"id": auth["id"], "result": authorize, "error": null}))
                .await;
        }
    }

    async fn start() -> (
        TcpListener,
        PoolConfig,
        mpsc::Receiver<ClientEvent>,
        mpsc::Sender<ClientCommand>,
        StratumV1Client,
        CancellationToken,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = PoolConfig {
            url: format!("stratum+tcp://{}", listener.local_addr().unwrap()),
            username: "worker".to_string(),
            password: "x".to_string(),
            ..Default::default()
        };
        let (event_tx, event_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let client = StratumV1Client::new(config.clone(), event_tx, command_rx, shutdown.clone());
        (listener, config, event_rx, command_tx, client, shutdown)
    }

    fn submit_params(job_id: &str) -> SubmitParams {
        SubmitParams {
            username: "worker".to_string(),
            job_id: job_id.to_string(),
            extranonce2: vec![0, 0, 0, 1],
            ntime: 0x5a5a5a5a,
            nonce: 0x12345678,
            version_bits: None,
        }
    }

    #[tokio::test]
    async fn test_handshake_and_job() {
        let (listener, _config, mut events, _commands, client, shutdown) = start().await;
        let handle = tokio::spawn(client.run());
        let mut pool = FakePool::accept(listener).await;

        pool.handshake(true).await;
        pool.send(json!({"id": null, "method": "mining.set_difficulty", "params": [512.5]}))
            .await;
        pool.send(json!({
            "id": null,
            "method": "mining.notify",
            "params": [
                "j1",
                "0000000000000000000000000000000000000000000000000000000000000000",
                "aa", "bb", [], "20000000", "1d00ffff", "5a5a5a5a", true
            ]
        }))
        .await;

        match events.recv().await.unwrap() {
            ClientEvent::Subscribed {
                extranonce1,
                extranonce2_size,
            } => {
                assert_eq!(extranonce1, vec![0xf0, 0x00, 0x00, 0x0f]);
                assert_eq!(extranonce2_size, 4);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::Authorized));
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::DifficultyChanged(513)
        ));
        match events.recv().await.unwrap() {
            ClientEvent::NewJob(job) => assert_eq!(job.job_id, "j1"),
            other => panic!("unexpected event: {:?}", other),
        }

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_credentials_end_session() {
        let (listener, _config, mut events, _commands, client, _shutdown) = start().await;
        let handle = tokio::spawn(client.run());
        let mut pool = FakePool::accept(listener).await;

        pool.handshake(false).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::Subscribed { .. }
        ));
        assert!(matches!(
            handle.await.unwrap(),
            Err(StratumError::AuthorizationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_acknowledgements() {
        let (listener, _config, mut events, commands, client, shutdown) = start().await;
        let handle = tokio::spawn(client.run());
        let mut pool = FakePool::accept(listener).await;
        pool.handshake(true).await;

        commands
            .send(ClientCommand::SubmitShare {
                submission: SubmissionId(10),
                params: submit_params("j1"),
            })
            .await
            .unwrap();
        commands
            .send(ClientCommand::SubmitShare {
                submission: SubmissionId(11),
                params: submit_params("j2"),
            })
            .await
            .unwrap();

        let first = pool.recv().await;
        let second = pool.recv().await;
        assert_eq!(first["method"], "mining.submit");
        assert_eq!(second["params"][1], "j2");

        // Answer the second submission before the first
        pool.send(json!({"id": second["id"], "result": null, "error": [21, "Job not found", null]}))
            .await;
        pool.send(json!({"id": first["id"], "result": true, "error": null}))
            .await;

        let mut acks = Vec::new();
        while acks.len() < 2 {
            match events.recv().await.unwrap() {
                ClientEvent::ShareAccepted { submission } => acks.push((submission, None)),
                ClientEvent::ShareRejected {
                    submission, code, ..
                } => acks.push((submission, code)),
                _ => {}
            }
        }
        assert_eq!(
            acks,
            vec![(SubmissionId(11), Some(21)), (SubmissionId(10), None)]
        );

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connection_loss_emits_disconnected() {
        let (listener, _config, mut events, _commands, client, _shutdown) = start().await;
        let handle = tokio::spawn(client.run());
        let mut pool = FakePool::accept(listener).await;
        pool.handshake(true).await;
        drop(pool);

        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Disconnected => break,
                _ => continue,
            }
        }
        assert!(matches!(
            handle.await.unwrap(),
            Err(StratumError::Disconnected)
        ));
    }
}
