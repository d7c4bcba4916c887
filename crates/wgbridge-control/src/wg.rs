//! Reconciliation with the running interface
//!
//! [`InterfaceControl`] is the seam between the apply engine and the
//! kernel: push a configuration file into a live interface, and read back
//! what the interface is actually running. [`WgTool`] implements it with
//! the `wg` utility; every invocation is bounded by a timeout.

use crate::error::{ControlError, ControlResult};
use crate::fsutil;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// `wg-quick` properties that `wg syncconf` does not understand
const QUICK_ONLY_FIELDS: [&str; 9] = [
    "Address", "DNS", "MTU", "Table", "PreUp", "PostUp", "PreDown", "PostDown", "SaveConfig",
];

/// What a running interface reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
    /// Listen port, if the interface has one
    pub listen_port: Option<u16>,
    /// Public keys of configured peers
    pub peers: BTreeSet<String>,
}

/// Push configuration into, and read state back from, a live interface
pub trait InterfaceControl: Send + Sync {
    /// Reconcile the running interface with the configuration file at
    /// `config_path` without restarting it
    fn sync(&self, interface: &str, config_path: &Path) -> ControlResult<()>;

    /// Read the interface's current listen port and peer set
    fn live_state(&self, interface: &str) -> ControlResult<LiveState>;
}

/// [`InterfaceControl`] backed by the `wg` command line tool
#[derive(Debug, Clone)]
pub struct WgTool {
    binary: String,
    timeout: Duration,
}

impl WgTool {
    /// Use `binary` (usually `wg`) with a per-invocation timeout
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn run(&self, args: &[&str]) -> ControlResult<Output> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        let output = run_with_timeout(cmd, &self.binary, self.timeout)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::ExternalTool {
                tool: format!("{} {}", self.binary, args.first().copied().unwrap_or("")),
                detail: format!("{}: {}", output.status, sanitize_output(stderr.trim())),
            });
        }
        Ok(output)
    }
}

impl InterfaceControl for WgTool {
    fn sync(&self, interface: &str, config_path: &Path) -> ControlResult<()> {
        let text = std::fs::read_to_string(config_path)?;
        let stripped = strip_quick_fields(&text);

        if stripped == text {
            let path = config_path.to_string_lossy().into_owned();
            self.run(&["syncconf", interface, path.as_str()])?;
            return Ok(());
        }

        // syncconf rejects wg-quick properties; feed it a stripped copy
        let staged = fsutil::stage_file(fsutil::parent_dir(config_path), interface, stripped.as_bytes())?;
        let path = staged.to_string_lossy().into_owned();
        let result = self.run(&["syncconf", interface, path.as_str()]);
        let _ = fsutil::remove_if_exists(&staged);
        result.map(|_| ())
    }

    fn live_state(&self, interface: &str) -> ControlResult<LiveState> {
        let output = self.run(&["show", interface, "dump"])?;
        parse_dump(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `wg show <iface> dump`: one tab-separated interface line, then
/// one line per peer starting with its public key
pub fn parse_dump(dump: &str) -> ControlResult<LiveState> {
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| ControlError::Verification("empty interface dump".into()))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 3 {
        return Err(ControlError::Verification(format!(
            "malformed interface line ({} fields)",
            fields.len()
        )));
    }
    let listen_port = match fields[2].trim() {
        "0" | "" | "(none)" => None,
        port => Some(port.parse::<u16>().map_err(|_| {
            ControlError::Verification(format!("bad listen port {:?} in dump", port))
        })?),
    };

    let peers = lines
        .filter_map(|line| line.split('\t').next())
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect();

    Ok(LiveState { listen_port, peers })
}

/// Drop `wg-quick` only properties from the `[Interface]` section
pub fn strip_quick_fields(text: &str) -> String {
    let mut in_interface = false;
    let mut out = String::with_capacity(text.len());
    let mut changed = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            in_interface = trimmed[1..trimmed.len() - 1].trim() == "Interface";
        } else if in_interface {
            if let Some((key, _)) = trimmed.split_once('=') {
                if QUICK_ONLY_FIELDS.contains(&key.trim()) {
                    changed = true;
                    continue;
                }
            }
        }
        out.push_str(line);
        out.push('\n');
    }

    if changed {
        out
    } else {
        text.to_string()
    }
}

/// Replace key material in tool output before it reaches logs or errors
pub fn sanitize_output(output: &str) -> String {
    output
        .lines()
        .map(|line| {
            let lower = line.to_ascii_lowercase();
            if lower.contains("privatekey") || lower.contains("presharedkey") {
                match line.split_once('=') {
                    Some((field, _)) => format!("{}= <redacted>", field),
                    None => "<redacted>".to_string(),
                }
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run a command, killing it if it outlives `timeout`
pub fn run_with_timeout(mut cmd: Command, tool: &str, timeout: Duration) -> ControlResult<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| ControlError::ExternalTool {
        tool: tool.to_string(),
        detail: format!("failed to start: {}", e),
    })?;

    // drain pipes concurrently so a chatty child cannot block on a full pipe
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let start = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(tool, timeout = ?timeout, "external tool timed out and was killed");
                return Err(ControlError::Timeout {
                    tool: tool.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            None => thread::sleep(WAIT_POLL),
        }
    };

    Ok(Output {
        status,
        stdout: stdout.map(collect).unwrap_or_default(),
        stderr: stderr.map(collect).unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}
