//! Getwork (JSON-RPC over HTTP) protocol client.
//!
//! Getwork pools hand out a complete block header per request. The header
//! travels as 128 bytes of hex (80 header bytes plus SHA-256 padding) with
//! every 32-bit word byte-swapped relative to the serialized header. A
//! solution is submitted by sending the same data back with the nonce (and
//! possibly ntime) patched in.
//!
//! Servers that support long-polling announce an `X-Long-Polling` path in
//! their response headers; a request to that path blocks until the pool has
//! work for a new block.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::poll::{PollProtocol, PollVerdict, PollWork};
use super::Solution;
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::tracing::prelude::*;
use crate::types::{block_hash_from_swapped_words, target_from_le_hex, BlockHash};

/// A long-poll request may legitimately block for a whole block interval.
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const HEADER_LEN: usize = 80;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

#[derive(Debug, Deserialize)]
struct GetworkResult {
    data: String,
    target: String,
}

pub struct GetworkClient {
    http: Client,
    url: String,
    username: String,
    password: String,
    long_poll_url: Mutex<Option<String>>,
}

impl GetworkClient {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let http = Client::builder()
            .connect_timeout(config.fetch_timeout)
            .timeout(config.fetch_timeout.max(config.submit_timeout))
            .user_agent(config.user_agent.clone())
            .tcp_nodelay(true)
            .build()
            .map_err(|e| SourceError::Protocol(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            url: config.url(),
            username: config.username.clone(),
            password: config.password.clone(),
            long_poll_url: Mutex::new(None),
        })
    }

    /// Long-poll URL announced by the server, if any.
    pub fn long_poll_url(&self) -> Option<String> {
        self.long_poll_url.lock().ok().and_then(|url| url.clone())
    }

    async fn call(
        &self,
        url: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<(HeaderMap, Value), SourceError> {
        let body = json!({"method": "getwork", "params": params, "id": 1});
        let mut request = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(classify)?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SourceError::Auth(format!(
                    "server answered {}",
                    response.status()
                )))
            }
            status if !status.is_success() => {
                return Err(SourceError::Protocol(format!("server answered {}", status)))
            }
            _ => {}
        }

        let headers = response.headers().clone();
        let rpc: RpcResponse = response.json().await.map_err(classify)?;
        if !rpc.error.is_null() {
            return Err(SourceError::Protocol(format!("RPC error: {}", rpc.error)));
        }
        Ok((headers, rpc.result))
    }

    fn remember_long_poll(&self, headers: &HeaderMap) {
        let Some(path) = headers
            .get("x-long-polling")
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };

        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.url.trim_end_matches('/'), path.trim_start_matches('/'))
        };

        if let Ok(mut slot) = self.long_poll_url.lock() {
            if slot.as_deref() != Some(url.as_str()) {
                debug!(url = %url, "Server supports long-polling");
                *slot = Some(url);
            }
        }
    }
}

#[async_trait]
impl PollProtocol for GetworkClient {
    async fn fetch(&self) -> Result<PollWork, SourceError> {
        let (headers, result) = self.call(&self.url, json!([]), None).await?;
        self.remember_long_poll(&headers);
        parse_work(result)
    }

    async fn submit(&self, data: &[u8]) -> Result<PollVerdict, SourceError> {
        let (headers, result) = self
            .call(&self.url, json!([hex::encode(data)]), None)
            .await?;

        if result.as_bool() == Some(true) {
            return Ok(PollVerdict::Accepted);
        }
        let reason = headers
            .get("x-reject-reason")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("rejected")
            .to_string();
        Ok(PollVerdict::Rejected(reason))
    }

    async fn long_poll(&self) -> Result<PollWork, SourceError> {
        let url = self
            .long_poll_url()
            .ok_or_else(|| SourceError::Protocol("no long-poll URL announced".to_string()))?;
        let (_, result) = self.call(&url, json!([]), Some(LONG_POLL_TIMEOUT)).await?;
        parse_work(result)
    }

    fn long_poll_available(&self) -> bool {
        self.long_poll_url().is_some()
    }
}

fn classify(err: reqwest::Error) -> SourceError {
    if err.is_decode() {
        SourceError::Protocol(format!("malformed response: {}", err))
    } else {
        SourceError::Unreachable(err.to_string())
    }
}

fn parse_work(result: Value) -> Result<PollWork, SourceError> {
    let work: GetworkResult = serde_json::from_value(result)
        .map_err(|e| SourceError::Protocol(format!("malformed work: {}", e)))?;
    let data = hex::decode(&work.data)
        .map_err(|e| SourceError::Protocol(format!("work data hex: {}", e)))?;
    if data.len() < HEADER_LEN {
        return Err(SourceError::Protocol(format!(
            "work data too short: {} bytes",
            data.len()
        )));
    }
    let target = target_from_le_hex(&work.target).map_err(SourceError::Protocol)?;
    Ok(PollWork { data, target })
}

/// Previous-block hash of getwork header data.
pub fn prev_hash_from_data(data: &[u8]) -> Option<BlockHash> {
    block_hash_from_swapped_words(data.get(4..36)?).ok()
}

/// Header data with the solution's nonce and ntime patched in.
pub fn solved_data(data: &[u8], solution: &Solution) -> Vec<u8> {
    let mut solved = data.to_vec();
    if solved.len() >= HEADER_LEN {
        if let Some(ntime) = solution.ntime {
            solved[68..72].copy_from_slice(&ntime.to_be_bytes());
        }
        solved[76..80].copy_from_slice(&solution.nonce.to_be_bytes());
    }
    solved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use bitcoin::block::{Header, Version};
    use bitcoin::consensus::encode::{deserialize, serialize};
    use bitcoin::hashes::Hash;
    use bitcoin::{CompactTarget, TxMerkleNode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn header() -> Header {
        Header {
            version: Version::from_consensus(0x2000_0000),
            prev_blockhash: BlockHash::from_byte_array([0x11; 32]),
            merkle_root: TxMerkleNode::from_byte_array([0x22; 32]),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: 0,
        }
    }

    /// Serialize a header the way getwork servers send it.
    fn getwork_data(header: &Header) -> Vec<u8> {
        let mut data = serialize(header);
        data.resize(128, 0);
        for word in data.chunks_mut(4) {
            word.reverse();
        }
        data
    }

    fn unswap(data: &[u8]) -> Vec<u8> {
        let mut bytes = data[..HEADER_LEN].to_vec();
        for word in bytes.chunks_mut(4) {
            word.reverse();
        }
        bytes
    }

    #[test]
    fn test_prev_hash_from_data() {
        let header = header();
        let data = getwork_data(&header);
        assert_eq!(prev_hash_from_data(&data), Some(header.prev_blockhash));
        assert_eq!(prev_hash_from_data(&data[..20]), None);
    }

    #[test]
    fn test_solved_data_patches_nonce_and_ntime() {
        let data = getwork_data(&header());
        let solution = Solution {
            nonce: 0xdeadbeef,
            ntime: Some(1_700_000_123),
            extranonce2: None,
            version: None,
        };

        let solved: Header = deserialize(&unswap(&solved_data(&data, &solution))).unwrap();
        assert_eq!(solved.nonce, 0xdeadbeef);
        assert_eq!(solved.time, 1_700_000_123);
        assert_eq!(solved.prev_blockhash, header().prev_blockhash);
    }

    /// Serve one HTTP request with a canned response.
    async fn serve_once(listener: TcpListener, response: String) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length || n == 0 {
                    break;
                }
            }
        }
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        String::from_utf8_lossy(&request).to_string()
    }

    fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut response = format!("HTTP/1.1 {}\r\n", status);
        for (name, value) in headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        response
    }

    async fn client_for(listener: &TcpListener) -> GetworkClient {
        let port = listener.local_addr().unwrap().port();
        let config = SourceConfig::new("test", Protocol::Getwork, "127.0.0.1", port)
            .with_credentials("worker", "secret");
        GetworkClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_parses_work_and_long_poll_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = client_for(&listener).await;

        let data = hex::encode(getwork_data(&header()));
        let target = format!("{}ffff0000", "00".repeat(28));
        let body = json!({"result": {"data": data, "target": target}, "error": null, "id": 1});
        let response = http_response("200 OK", &[("X-Long-Polling", "/lp")], &body.to_string());
        let server = tokio::spawn(serve_once(listener, response));

        let work = client.fetch().await.unwrap();
        assert_eq!(work.data.len(), 128);
        assert_eq!(prev_hash_from_data(&work.data), Some(header().prev_blockhash));
        assert!(client.long_poll_available());
        assert_eq!(
            client.long_poll_url(),
            Some(format!("http://127.0.0.1:{}/lp", port))
        );

        let request = server.await.unwrap();
        assert!(request.contains("\"method\":\"getwork\""));
        assert!(request.to_ascii_lowercase().contains("authorization: basic"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;
        let server = tokio::spawn(serve_once(
            listener,
            http_response("401 Unauthorized", &[], "{}"),
        ));

        assert!(matches!(client.fetch().await, Err(SourceError::Auth(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_reports_reject_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;
        let body = json!({"result": false, "error": null, "id": 1}).to_string();
        let server = tokio::spawn(serve_once(
            listener,
            http_response("200 OK", &[("X-Reject-Reason", "stale-prevblk")], &body),
        ));

        let verdict = client.submit(&[0u8; 128]).await.unwrap();
        assert_eq!(verdict, PollVerdict::Rejected("stale-prevblk".to_string()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;
        drop(listener);

        assert!(matches!(
            client.fetch().await,
            Err(SourceError::Unreachable(_))
        ));
    }
}
