//! Stratum pool client: line-delimited JSON over TCP.
//!
//! The protocol logic lives in [`StratumState`], which consumes one inbound
//! line at a time and never touches a socket, so the whole state machine is
//! testable from string transcripts. [`run_client`] wraps it with the actual
//! connection, reconnecting with capped exponential backoff.

use std::collections::HashSet;
use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::trailer::BlockTrailer;

#[derive(Debug, Error)]
pub enum StratumError {
    #[error("invalid JSON line: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad {method} params: {reason}")]
    BadParams {
        method: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumStage {
    Connecting,
    Authorizing,
    Connected,
}

#[derive(Debug, Clone)]
pub struct PoolJob {
    pub job_id: String,
    pub trailer: BlockTrailer,
}

#[derive(Debug, Clone)]
pub struct Share {
    pub job_id: String,
    pub nonce: [u8; 32],
    pub hash: [u8; 32],
}

#[derive(Debug)]
pub enum StratumEvent {
    Authorized,
    AuthorizeFailed,
    Job(PoolJob),
    Difficulty(u8),
    Share { accepted: bool },
}

pub struct ShareCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
}

impl ShareCounters {
    pub fn new() -> Self {
        ShareCounters {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

impl Default for ShareCounters {
    fn default() -> Self {
        ShareCounters::new()
    }
}

#[derive(Deserialize)]
struct RpcLine {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
}

/// Accepts decimal or hex; bare hex (no `0x`) is only tried when the decimal
/// parse fails, which covers pools that send values like `"1c"`.
fn parse_number(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    if let Some(hexpart) = s.strip_prefix("0x") {
        return u64::from_str_radix(hexpart, 16).ok();
    }
    s.parse::<u64>()
        .ok()
        .or_else(|| u64::from_str_radix(s, 16).ok())
}

fn parse_hex32(value: &Value) -> Option<[u8; 32]> {
    hex::decode(value.as_str()?).ok()?.as_slice().try_into().ok()
}

pub struct StratumState {
    stage: StratumStage,
    user: String,
    next_id: u64,
    authorize_id: Option<u64>,
    pending_shares: HashSet<u64>,
    pub share_difficulty: u8,
    pub job: Option<PoolJob>,
}

impl StratumState {
    pub fn new(user: String) -> Self {
        StratumState {
            stage: StratumStage::Connecting,
            user,
            next_id: 1,
            authorize_id: None,
            pending_shares: HashSet::new(),
            share_difficulty: 0,
            job: None,
        }
    }

    pub fn stage(&self) -> StratumStage {
        self.stage
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn authorize_request(&mut self, password: &str) -> String {
        let id = self.take_id();
        self.authorize_id = Some(id);
        self.stage = StratumStage::Authorizing;
        json!({
            "id": id,
            "method": "mining.authorize",
            "params": [self.user, password],
        })
        .to_string()
    }

    pub fn submit_request(&mut self, share: &Share) -> String {
        let id = self.take_id();
        self.pending_shares.insert(id);
        json!({
            "id": id,
            "method": "mining.submit",
            "params": [
                self.user,
                share.job_id,
                hex::encode(&share.nonce),
                hex::encode(&share.hash),
            ],
        })
        .to_string()
    }

    pub fn handle_line(&mut self, line: &str) -> Result<Option<StratumEvent>, StratumError> {
        let msg: RpcLine = serde_json::from_str(line)?;
        if let Some(method) = msg.method.as_deref() {
            return match method {
                "mining.notify" => self.handle_notify(msg.params.as_ref()),
                "mining.set_difficulty" => self.handle_set_difficulty(msg.params.as_ref()),
                _ => Ok(None),
            };
        }
        let id = match msg.id {
            Some(id) => id,
            None => return Ok(None),
        };
        if self.stage == StratumStage::Authorizing && self.authorize_id == Some(id) {
            self.authorize_id = None;
            // `result: true`, or a response whose error is null and whose
            // result is not an explicit rejection, means authorized
            let rejected = matches!(msg.result, Some(Value::Bool(false)))
                || !matches!(msg.error, None | Some(Value::Null));
            return if rejected {
                Ok(Some(StratumEvent::AuthorizeFailed))
            } else {
                self.stage = StratumStage::Connected;
                Ok(Some(StratumEvent::Authorized))
            };
        }
        if self.pending_shares.remove(&id) {
            let accepted = matches!(msg.result, Some(Value::Bool(true)));
            return Ok(Some(StratumEvent::Share { accepted }));
        }
        Ok(None)
    }

    fn handle_notify(&mut self, params: Option<&Value>) -> Result<Option<StratumEvent>, StratumError> {
        let bad = |reason| StratumError::BadParams {
            method: "mining.notify",
            reason,
        };
        let params = params
            .and_then(Value::as_array)
            .ok_or_else(|| bad("params is not an array"))?;
        if params.len() < 6 {
            return Err(bad("expected at least 6 params"));
        }
        let job_id = params[0]
            .as_str()
            .ok_or_else(|| bad("job id is not a string"))?
            .to_string();
        let phash = parse_hex32(&params[1]).ok_or_else(|| bad("phash is not 32 hex bytes"))?;
        let bnum = params[2]
            .as_str()
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .ok_or_else(|| bad("bnum is not a hex integer"))?;
        let diff = parse_number(&params[3]).ok_or_else(|| bad("difficulty is not a number"))?;
        let time0 = parse_number(&params[4]).ok_or_else(|| bad("time0 is not a number"))?;
        let mroot = parse_hex32(&params[5]).ok_or_else(|| bad("mroot is not 32 hex bytes"))?;

        let mut trailer = BlockTrailer::default();
        trailer.set_phash(&phash);
        trailer.set_bnum(bnum);
        // the wire format carries no tcount or mfee; a pool job is always
        // workable, so the trailer gets the neutral values
        trailer.set_tcount(1);
        trailer.set_time0(time0 as u32);
        trailer.set_difficulty((diff & 0xff) as u8);
        trailer.set_mroot(&mroot);

        let job = PoolJob { job_id, trailer };
        self.job = Some(job.clone());
        Ok(Some(StratumEvent::Job(job)))
    }

    fn handle_set_difficulty(
        &mut self,
        params: Option<&Value>,
    ) -> Result<Option<StratumEvent>, StratumError> {
        let diff = params
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(parse_number)
            .ok_or(StratumError::BadParams {
                method: "mining.set_difficulty",
                reason: "expected one integer param",
            })?;
        let diff = diff.min(255) as u8;
        self.share_difficulty = diff;
        Ok(Some(StratumEvent::Difficulty(diff)))
    }
}

/// Connect to the pool, authorize, pump jobs out and shares in; reconnect
/// forever on failure.
pub async fn run_client(
    pool_url: String,
    user: String,
    password: String,
    job_tx: watch::Sender<Option<PoolJob>>,
    share_diff_tx: watch::Sender<u8>,
    mut share_rx: mpsc::UnboundedReceiver<Share>,
    counters: Arc<ShareCounters>,
) {
    let mut attempt = 0u32;
    loop {
        match session(
            &pool_url,
            &user,
            &password,
            &job_tx,
            &share_diff_tx,
            &mut share_rx,
            &counters,
        )
        .await
        {
            Ok(()) => attempt = 0,
            Err(err) => {
                attempt = attempt.saturating_add(1);
                log::error!("pool connection failed: {:#}", err);
            }
        }
        let delay = std::cmp::min(2u64.saturating_pow(attempt), 30);
        log::info!("reconnecting to {} in {}s", pool_url, delay);
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }
}

async fn session(
    pool_url: &str,
    user: &str,
    password: &str,
    job_tx: &watch::Sender<Option<PoolJob>>,
    share_diff_tx: &watch::Sender<u8>,
    share_rx: &mut mpsc::UnboundedReceiver<Share>,
    counters: &ShareCounters,
) -> eyre::Result<()> {
    let addr = pool_url
        .strip_prefix("stratum+tcp://")
        .unwrap_or(pool_url)
        .trim();
    log::info!("connecting to pool {}", addr);
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut state = StratumState::new(user.to_string());
    let authorize = state.authorize_request(password);
    write_half.write_all(authorize.as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line?.ok_or_else(|| eyre::eyre!("pool closed the connection"))?;
                match state.handle_line(&line) {
                    Ok(Some(StratumEvent::Authorized)) => {
                        log::info!("authorized as {}", state.user());
                    }
                    Ok(Some(StratumEvent::AuthorizeFailed)) => {
                        eyre::bail!("pool rejected authorization for {}", state.user());
                    }
                    Ok(Some(StratumEvent::Job(job))) => {
                        log::info!(
                            "job {}: bnum {} diff {}",
                            job.job_id,
                            job.trailer.bnum(),
                            job.trailer.difficulty()
                        );
                        job_tx.send(Some(job)).ok();
                    }
                    Ok(Some(StratumEvent::Difficulty(diff))) => {
                        log::info!("pool share difficulty set to {}", diff);
                        share_diff_tx.send(diff).ok();
                    }
                    Ok(Some(StratumEvent::Share { accepted })) => {
                        if accepted {
                            counters.accepted.fetch_add(1, Ordering::AcqRel);
                            log::info!("share accepted");
                        } else {
                            counters.rejected.fetch_add(1, Ordering::AcqRel);
                            log::warn!("share rejected");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("dropping stratum line: {}", err),
                }
            }
            share = share_rx.recv() => {
                let share = share.ok_or_else(|| eyre::eyre!("share channel closed"))?;
                let request = state.submit_request(&share);
                write_half.write_all(request.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_roundtrip() {
        let mut state = StratumState::new("wallet.rig1".to_string());
        let request = state.authorize_request("x");
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["method"], "mining.authorize");
        assert_eq!(parsed["params"][0], "wallet.rig1");
        assert_eq!(state.stage(), StratumStage::Authorizing);

        let event = state
            .handle_line(r#"{"id":1,"result":true,"error":null}"#)
            .unwrap();
        assert!(matches!(event, Some(StratumEvent::Authorized)));
        assert_eq!(state.stage(), StratumStage::Connected);
    }

    #[test]
    fn authorize_rejected() {
        // an explicit false rejects even though the error is null
        let mut state = StratumState::new("wallet.rig1".to_string());
        state.authorize_request("x");
        let event = state
            .handle_line(r#"{"id":1,"result":false,"error":null}"#)
            .unwrap();
        assert!(matches!(event, Some(StratumEvent::AuthorizeFailed)));
        assert_eq!(state.stage(), StratumStage::Authorizing);

        // a non-null error rejects even though the result claims true
        let mut state = StratumState::new("wallet.rig1".to_string());
        state.authorize_request("x");
        let event = state
            .handle_line(r#"{"id":1,"result":true,"error":{"code":24,"message":"unauthorized"}}"#)
            .unwrap();
        assert!(matches!(event, Some(StratumEvent::AuthorizeFailed)));
        assert_eq!(state.stage(), StratumStage::Authorizing);

        // a null result with a null error still authorizes
        let mut state = StratumState::new("wallet.rig1".to_string());
        state.authorize_request("x");
        let event = state
            .handle_line(r#"{"id":1,"result":null,"error":null}"#)
            .unwrap();
        assert!(matches!(event, Some(StratumEvent::Authorized)));
        assert_eq!(state.stage(), StratumStage::Connected);
    }

    #[test]
    fn notify_builds_trailer() {
        let mut state = StratumState::new("w.r".to_string());
        let zeros64 = "0".repeat(64);
        let line = format!(
            r#"{{"method":"mining.notify","params":["j1","{}","0000000000000000","1c","0","{}",true]}}"#,
            zeros64, zeros64
        );
        let event = state.handle_line(&line).unwrap();
        let job = match event {
            Some(StratumEvent::Job(job)) => job,
            other => panic!("expected job event, got {:?}", other),
        };
        assert_eq!(job.job_id, "j1");
        assert_eq!(job.trailer.difficulty(), 0x1c);
        assert_eq!(job.trailer.time0(), 0);
        assert_eq!(job.trailer.bnum(), 0);
        assert_eq!(job.trailer.tcount(), 1);
        assert_eq!(job.trailer.phash(), [0u8; 32]);
        assert!(state.job.is_some());
    }

    #[test]
    fn notify_accepts_decimal_and_hex_numbers() {
        let zeros64 = "0".repeat(64);
        for (raw, expected) in [("\"28\"", 28u8), ("\"0x1c\"", 0x1c), ("28", 28), ("\"1c\"", 0x1c)] {
            let mut state = StratumState::new("w.r".to_string());
            let line = format!(
                r#"{{"method":"mining.notify","params":["j1","{}","00ff",{},"1617181920","{}",false]}}"#,
                zeros64, raw, zeros64
            );
            let job = match state.handle_line(&line).unwrap() {
                Some(StratumEvent::Job(job)) => job,
                other => panic!("expected job event, got {:?}", other),
            };
            assert_eq!(job.trailer.difficulty(), expected, "raw {}", raw);
            assert_eq!(job.trailer.bnum(), 0xff);
            assert_eq!(job.trailer.time0(), 1617181920);
        }
    }

    #[test]
    fn malformed_notify_is_an_error_not_a_panic() {
        let mut state = StratumState::new("w.r".to_string());
        let line = r#"{"method":"mining.notify","params":["j1","zz","0","1c","0","00",true]}"#;
        assert!(state.handle_line(line).is_err());
        assert!(state.handle_line("not json at all").is_err());
    }

    #[test]
    fn set_difficulty_clamps_to_byte() {
        let mut state = StratumState::new("w.r".to_string());
        let event = state
            .handle_line(r#"{"method":"mining.set_difficulty","params":[4]}"#)
            .unwrap();
        assert!(matches!(event, Some(StratumEvent::Difficulty(4))));
        assert_eq!(state.share_difficulty, 4);
        state
            .handle_line(r#"{"method":"mining.set_difficulty","params":[1000]}"#)
            .unwrap();
        assert_eq!(state.share_difficulty, 255);
    }

    #[test]
    fn share_responses_update_counts() {
        let mut state = StratumState::new("w.r".to_string());
        let share = Share {
            job_id: "j1".to_string(),
            nonce: [0u8; 32],
            hash: [0u8; 32],
        };
        let request = state.submit_request(&share);
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed["method"], "mining.submit");
        assert_eq!(parsed["params"][2].as_str().unwrap().len(), 64);
        let id = parsed["id"].as_u64().unwrap();

        let event = state
            .handle_line(&format!(r#"{{"id":{},"result":true,"error":null}}"#, id))
            .unwrap();
        assert!(matches!(event, Some(StratumEvent::Share { accepted: true })));
        // a second response with the same id no longer matches
        let event = state
            .handle_line(&format!(r#"{{"id":{},"result":true,"error":null}}"#, id))
            .unwrap();
        assert!(event.is_none());
    }
}
