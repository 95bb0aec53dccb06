//! Stratum v1 wire messages.
//!
//! Stratum frames are JSON-RPC-like objects, one per line. Pool-to-client
//! work arrives as positional parameter arrays of hex strings; this module
//! turns those into rust-bitcoin types and back.

use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::job_source::SubmissionId;
use crate::types::block_hash_from_swapped_words;

/// What a client session reports to its owner.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// `mining.subscribe` succeeded.
    Subscribed {
        extranonce1: Vec<u8>,
        extranonce2_size: usize,
    },

    /// Credentials accepted; shares may be submitted from now on.
    Authorized,

    NewJob(JobNotification),

    /// Share difficulty from `mining.set_difficulty`.
    DifficultyChanged(u64),

    /// Version-rolling mask from `mining.set_version_mask`.
    VersionMaskSet(u32),

    ShareAccepted {
        submission: SubmissionId,
    },

    ShareRejected {
        submission: SubmissionId,
        /// Stratum error code, if the pool sent one
        code: Option<i64>,
        reason: String,
    },

    Disconnected,

    /// Something the session survived, such as an unparseable notify.
    Error(String),
}

/// Requests from the owner to a running session.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Acknowledged later as `ShareAccepted`/`ShareRejected` with the same
    /// submission id.
    SubmitShare {
        submission: SubmissionId,
        params: SubmitParams,
    },
}

/// A `mining.notify` job.
#[derive(Debug, Clone)]
pub struct JobNotification {
    pub job_id: String,
    pub prev_hash: BlockHash,
    /// Coinbase bytes before the extranonces
    pub coinbase1: Vec<u8>,
    /// Coinbase bytes after the extranonces
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<TxMerkleNode>,
    pub version: Version,
    pub nbits: CompactTarget,
    pub ntime: u32,
    /// Earlier jobs are void
    pub clean_jobs: bool,
}

/// Positional reader over a notify parameter array, naming each field in
/// its errors.
struct Params<'a> {
    values: std::slice::Iter<'a, Value>,
}

impl<'a> Params<'a> {
    fn next(&mut self, field: &str) -> Result<&'a Value, String> {
        self.values
            .next()
            .ok_or_else(|| format!("mining.notify: missing {}", field))
    }

    fn str(&mut self, field: &str) -> Result<&'a str, String> {
        self.next(field)?
            .as_str()
            .ok_or_else(|| format!("mining.notify: {} is not a string", field))
    }

    fn bytes(&mut self, field: &str) -> Result<Vec<u8>, String> {
        hex::decode(self.str(field)?).map_err(|e| format!("mining.notify: {}: {}", field, e))
    }

    fn word(&mut self, field: &str) -> Result<u32, String> {
        u32::from_str_radix(self.str(field)?, 16)
            .map_err(|e| format!("mining.notify: {}: {}", field, e))
    }

    fn flag(&mut self, field: &str) -> Result<bool, String> {
        self.next(field)?
            .as_bool()
            .ok_or_else(|| format!("mining.notify: {} is not a bool", field))
    }

    fn list(&mut self, field: &str) -> Result<&'a [Value], String> {
        self.next(field)?
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| format!("mining.notify: {} is not an array", field))
    }
}

impl JobNotification {
    /// Decode the nine positional parameters of `mining.notify`.
    pub fn from_stratum_params(params: &[Value]) -> Result<Self, String> {
        let mut params = Params {
            values: params.iter(),
        };

        let job_id = params.str("job_id")?.to_string();
        // Word-swapped, like getwork header data
        let prev_hash = block_hash_from_swapped_words(&params.bytes("prev_hash")?)?;
        let coinbase1 = params.bytes("coinbase1")?;
        let coinbase2 = params.bytes("coinbase2")?;
        let merkle_branches = params
            .list("merkle_branches")?
            .iter()
            .map(merkle_node)
            .collect::<Result<Vec<_>, _>>()?;
        let version = Version::from_consensus(params.word("version")? as i32);
        let nbits = CompactTarget::from_consensus(params.word("nbits")?);
        let ntime = params.word("ntime")?;
        let clean_jobs = params.flag("clean_jobs")?;

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }

    /// Block height from the BIP34 prefix of the coinbase script.
    ///
    /// coinbase1 starts with the transaction version (4 bytes), the input
    /// count (1), the null prevout (36) and the script length varint; the
    /// script then begins with a push of the little-endian height.
    pub fn block_height(&self) -> Option<u64> {
        let cb = &self.coinbase1;
        let mut pos = 41;
        pos += match *cb.get(pos)? {
            0xfd => 3,
            0xfe => 5,
            0xff => 9,
            _ => 1,
        };

        let len = *cb.get(pos)? as usize;
        if !(1..=8).contains(&len) {
            return None;
        }
        let bytes = cb.get(pos + 1..pos + 1 + len)?;
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }
}

/// Merkle branches are sent in internal byte order, unlike the prev hash.
fn merkle_node(value: &Value) -> Result<TxMerkleNode, String> {
    let hex_str = value
        .as_str()
        .ok_or("mining.notify: merkle branch is not a string")?;
    let bytes: [u8; 32] = hex::decode(hex_str)
        .map_err(|e| format!("mining.notify: merkle branch: {}", e))?
        .try_into()
        .map_err(|b: Vec<u8>| format!("mining.notify: merkle branch is {} bytes", b.len()))?;
    Ok(TxMerkleNode::from_byte_array(bytes))
}

/// Parse a Stratum error value, either `[code, message, data]` or
/// `{"code": .., "message": ..}`.
pub fn parse_error(error: &Value) -> (Option<i64>, String) {
    let (code, message) = match error {
        Value::Array(parts) => (parts.first(), parts.get(1)),
        Value::Object(fields) => (fields.get("code"), fields.get("message")),
        Value::String(message) => return (None, message.clone()),
        other => return (None, other.to_string()),
    };
    (
        code.and_then(Value::as_i64),
        message
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    )
}

/// Everything `mining.submit` needs for one share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    /// Rolled version bits, sent only when the pool enabled version rolling
    pub version_bits: Option<u32>,
}

impl SubmitParams {
    /// The positional `mining.submit` parameter array.
    pub fn to_params(&self) -> Value {
        let mut params = vec![
            json!(self.username),
            json!(self.job_id),
            json!(hex::encode(&self.extranonce2)),
            json!(format!("{:08x}", self.ntime)),
            json!(format!("{:08x}", self.nonce)),
        ];
        if let Some(bits) = self.version_bits {
            params.push(json!(format!("{:08x}", bits)));
        }
        Value::Array(params)
    }
}

/// One line on the wire.
///
/// Requests from either side carry a method; notifications are requests
/// with a null id. Responses carry the id of the request they answer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request {
        id: Option<u64>,
        method: String,
        params: Value,
    },

    Response {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    fn notify(coinbase1: &str, clean_jobs: bool) -> Value {
        json!([
            "job1",
            ZERO_HASH,
            coinbase1,
            "bb",
            [],
            "20000000",
            "1d00ffff",
            "5a5a5a5a",
            clean_jobs
        ])
    }

    #[test]
    fn test_frames_classify_by_shape() {
        let notification: JsonRpcMessage = serde_json::from_value(json!({
            "id": null,
            "method": "mining.notify",
            "params": notify("aa", true),
        }))
        .unwrap();
        assert!(matches!(
            notification,
            JsonRpcMessage::Request { id: None, ref method, .. } if method == "mining.notify"
        ));

        let response: JsonRpcMessage =
            serde_json::from_value(json!({"id": 4, "result": true, "error": null})).unwrap();
        assert!(matches!(
            response,
            JsonRpcMessage::Response { id: 4, result: Some(Value::Bool(true)), error: None }
        ));
    }

    #[test]
    fn test_request_serializes_with_id() {
        let line =
            serde_json::to_string(&JsonRpcMessage::request(1, "mining.subscribe", json!([])))
                .unwrap();
        assert_eq!(line, r#"{"id":1,"method":"mining.subscribe","params":[]}"#);
    }

    #[test]
    fn test_notify_fields_decode() {
        let params = json!([
            "4f2a",
            "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000",
            "aa",
            "bbcc",
            ["d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6"],
            "20000000",
            "1703a30c",
            "504e86b9",
            false
        ]);
        let job = JobNotification::from_stratum_params(params.as_array().unwrap()).unwrap();

        assert_eq!(job.job_id, "4f2a");
        assert_eq!(
            job.prev_hash.to_string(),
            "000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd"
        );
        assert_eq!(job.coinbase2, vec![0xbb, 0xcc]);
        assert_eq!(job.merkle_branches.len(), 1);
        assert_eq!(job.merkle_branches[0].to_byte_array()[0], 0xd5);
        assert_eq!(job.version, Version::from_consensus(0x2000_0000));
        assert_eq!(job.nbits, CompactTarget::from_consensus(0x1703_a30c));
        assert_eq!(job.ntime, 0x504e_86b9);
        assert!(!job.clean_jobs);
    }

    #[test_case(json!(["job1"]), "missing prev_hash" ; "truncated")]
    #[test_case(json!([1, ZERO_HASH]), "job_id is not a string" ; "numeric job id")]
    #[test_case(json!(["job1", "deadbeef"]), "block hash wrong length" ; "short prev hash")]
    #[test_case(json!(["job1", ZERO_HASH, "zz"]), "coinbase1" ; "bad hex")]
    #[test_case(json!(["job1", ZERO_HASH, "aa", "bb", ["00"]]), "merkle branch is 1 bytes" ; "short branch")]
    fn test_malformed_notify_is_rejected(params: Value, expected: &str) {
        let err = JobNotification::from_stratum_params(params.as_array().unwrap()).unwrap_err();
        assert!(err.contains(expected), "{}", err);
    }

    #[test]
    fn test_block_height_from_coinbase1() {
        // version, one input, null prevout, script length 0x20, push of 3
        // bytes holding 800000 (0x0c3500) little-endian
        let mut coinbase1 = hex::decode("01000000").unwrap();
        coinbase1.push(0x01);
        coinbase1.extend_from_slice(&[0u8; 32]);
        coinbase1.extend_from_slice(&[0xff; 4]);
        coinbase1.push(0x20);
        coinbase1.extend_from_slice(&[0x03, 0x00, 0x35, 0x0c]);
        coinbase1.extend_from_slice(b"/poolmux/");

        let params = notify(&hex::encode(&coinbase1), true);
        let job = JobNotification::from_stratum_params(params.as_array().unwrap()).unwrap();
        assert_eq!(job.block_height(), Some(800_000));
        assert!(job.clean_jobs);

        let params = notify("aa", false);
        let job = JobNotification::from_stratum_params(params.as_array().unwrap()).unwrap();
        assert_eq!(job.block_height(), None);
    }

    #[test_case(Some(0x2000_0000), json!(["w", "j", "deadbeef", "65432100", "12345678", "20000000"]) ; "version rolling")]
    #[test_case(None, json!(["w", "j", "deadbeef", "65432100", "12345678"]) ; "plain")]
    fn test_submit_params(version_bits: Option<u32>, expected: Value) {
        let params = SubmitParams {
            username: "w".to_string(),
            job_id: "j".to_string(),
            extranonce2: vec![0xde, 0xad, 0xbe, 0xef],
            ntime: 0x6543_2100,
            nonce: 0x1234_5678,
            version_bits,
        };
        assert_eq!(params.to_params(), expected);
    }

    #[test_case(json!([21, "Job not found", null]), Some(21), "Job not found" ; "array")]
    #[test_case(json!({"code": 23, "message": "Low difficulty share"}), Some(23), "Low difficulty share" ; "object")]
    #[test_case(json!("nope"), None, "nope" ; "bare string")]
    #[test_case(json!([null, null]), None, "unknown" ; "empty array")]
    fn test_parse_error_shapes(error: Value, code: Option<i64>, message: &str) {
        assert_eq!(parse_error(&error), (code, message.to_string()));
    }
}
