//! Shared fixtures for unit tests

use crate::audit::{AuditConfig, AuditLogger};
use crate::bundle::{signature_path, SignatureFile};
use crate::error::{ControlError, ControlResult};
use crate::wg::{InterfaceControl, LiveState};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use wgbridge_protocol::{ExchangeCrypto, ExchangePublicKey, Parser, SigningSecretKey};

/// One recorded `sync` call
#[derive(Debug, Clone)]
pub(crate) struct SyncCall {
    pub interface: String,
    pub content: String,
}

#[derive(Default)]
struct FakeState {
    live: HashMap<String, LiveState>,
    syncs: Vec<SyncCall>,
    fail_next: usize,
    time_out_next: usize,
    time_out_live_state: bool,
    drop_peer: bool,
    delay: Duration,
}

/// In-memory interface: live state is whatever the last successful sync
/// pushed. Failures and misbehaviour are injected per test.
#[derive(Default)]
pub(crate) struct FakeInterface {
    state: Mutex<FakeState>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sync calls
    pub fn fail_next_syncs(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Report the next `n` sync calls as timed out
    pub fn time_out_next_syncs(&self, n: usize) {
        self.state.lock().unwrap().time_out_next = n;
    }

    /// Report every live-state query as timed out
    pub fn time_out_live_state(&self, enabled: bool) {
        self.state.lock().unwrap().time_out_live_state = enabled;
    }

    /// Pretend the interface silently ignores the last peer
    pub fn drop_last_peer(&self, enabled: bool) {
        self.state.lock().unwrap().drop_peer = enabled;
    }

    pub fn set_sync_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn syncs(&self) -> Vec<SyncCall> {
        self.state.lock().unwrap().syncs.clone()
    }

    pub fn live(&self, interface: &str) -> LiveState {
        self.state
            .lock()
            .unwrap()
            .live
            .get(interface)
            .cloned()
            .unwrap_or_default()
    }

    pub fn max_concurrent_syncs(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl InterfaceControl for FakeInterface {
    fn sync(&self, interface: &str, config_path: &Path) -> ControlResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let delay = self.state.lock().unwrap().delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let result = (|| -> ControlResult<()> {
            let content = std::fs::read_to_string(config_path)?;
            let mut state = self.state.lock().unwrap();
            state.syncs.push(SyncCall {
                interface: interface.to_string(),
                content: content.clone(),
            });

            if state.time_out_next > 0 {
                state.time_out_next -= 1;
                return Err(ControlError::Timeout {
                    tool: "wg syncconf".into(),
                    secs: 15,
                });
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(ControlError::ExternalTool {
                    tool: "wg syncconf".into(),
                    detail: "injected failure".into(),
                });
            }

            let summary = Parser::new(false)
                .parse(&content)
                .map_err(|e| ControlError::ExternalTool {
                    tool: "wg syncconf".into(),
                    detail: e.to_string(),
                })?;
            let mut peers = summary.peer_public_keys();
            if state.drop_peer {
                if let Some(last) = peers.iter().next_back().cloned() {
                    peers.remove(&last);
                }
            }
            state.live.insert(
                interface.to_string(),
                LiveState {
                    listen_port: summary.listen_port(),
                    peers,
                },
            );
            Ok(())
        })();

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn live_state(&self, interface: &str) -> ControlResult<LiveState> {
        if self.state.lock().unwrap().time_out_live_state {
            return Err(ControlError::Timeout {
                tool: "wg show".into(),
                secs: 15,
            });
        }
        Ok(self.live(interface))
    }
}

/// Deterministic, well-formed WireGuard key
pub(crate) fn wg_key(n: u8) -> String {
    base64::encode([n; 32])
}

/// A valid configuration with one /32 peer per entry of `peers`
pub(crate) fn sample_config(listen_port: u16, peers: &[u8]) -> String {
    let mut text = format!(
        "[Interface]\nPrivateKey = {}\nAddress = 10.9.0.1/24\nListenPort = {}\n",
        wg_key(1),
        listen_port
    );
    for n in peers {
        text.push_str(&format!(
            "\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.9.0.{}/32\n",
            wg_key(*n),
            n
        ));
    }
    text
}

pub(crate) fn test_audit(path: &Path) -> AuditLogger {
    AuditLogger::new(AuditConfig {
        enabled: true,
        path: path.to_path_buf(),
        ..AuditConfig::default()
    })
}

/// Parsed audit records
pub(crate) fn read_audit(path: &Path) -> Vec<Value> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Actions of every audit record, in order
pub(crate) fn audit_actions(path: &Path) -> Vec<String> {
    read_audit(path)
        .iter()
        .map(|v| v["action"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Seal `plaintext` to `recipient` at `path` and write its signature
pub(crate) fn write_sealed_bundle(
    path: &Path,
    backend: &dyn ExchangeCrypto,
    recipient: &ExchangePublicKey,
    signer: &SigningSecretKey,
    plaintext: &[u8],
) {
    let sealed = backend.seal(recipient, plaintext).unwrap();
    std::fs::write(path, &sealed).unwrap();
    let sig = SignatureFile::sign(backend, signer, &sealed).unwrap();
    std::fs::write(signature_path(path), sig.to_json().unwrap()).unwrap();
}
