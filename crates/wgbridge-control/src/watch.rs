//! Inbox watcher
//!
//! A dedicated thread turns filesystem events in the inbox into bundle
//! paths on a channel. A dispatcher task runs each path through the
//! [`IngestPipeline`] on the blocking pool, at most `workers` at a time,
//! and broadcasts every [`IngestReport`].
//!
//! A bundle is dispatched when it is written or moved into the inbox, and
//! again when its signature lands. A path that is already being ingested
//! is not queued twice; it is re-run once the current attempt finishes.

use crate::audit::{AuditLogger, EventAction};
use crate::bundle::{bundle_for_signature, is_bundle_path};
use crate::error::{ControlError, ControlResult};
use crate::ingest::{IngestPipeline, IngestReport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};

/// Sleep between polls of the non-blocking event source
const WATCH_POLL: Duration = Duration::from_millis(100);

/// Paths buffered between the watcher thread and the dispatcher
const QUEUE_DEPTH: usize = 256;

/// Reports buffered for slow subscribers
const REPORT_BUFFER: usize = 256;

/// Running inbox watcher
pub struct InboxWatcher {
    shutdown: Arc<AtomicBool>,
    reports: broadcast::Sender<IngestReport>,
    watcher: Option<JoinHandle<()>>,
    dispatcher: Option<tokio::task::JoinHandle<()>>,
    audit: AuditLogger,
    inbox: PathBuf,
}

impl InboxWatcher {
    /// Start watching the pipeline's inbox with `workers` concurrent
    /// ingests. Must be called from within a Tokio runtime.
    pub fn start(pipeline: IngestPipeline, workers: usize) -> ControlResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ControlError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        pipeline.ensure_inbox()?;

        let inbox = pipeline.inbox_dir().to_path_buf();
        let audit = pipeline.audit().clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (paths_tx, paths_rx) = mpsc::channel(QUEUE_DEPTH);
        let (reports, _) = broadcast::channel(REPORT_BUFFER);

        let watcher = spawn_watch_thread(&inbox, paths_tx, Arc::clone(&shutdown))?;
        let dispatcher = runtime.spawn(dispatch(
            pipeline,
            paths_rx,
            reports.clone(),
            workers.max(1),
        ));

        tracing::info!("Watching inbox {} with {} workers", inbox.display(), workers.max(1));
        audit.log_system(
            EventAction::WatchStarted,
            &format!("Watching {} with {} workers", inbox.display(), workers.max(1)),
        );

        Ok(Self {
            shutdown,
            reports,
            watcher: Some(watcher),
            dispatcher: Some(dispatcher),
            audit,
            inbox,
        })
    }

    /// Receive every ingest report from now on
    pub fn subscribe(&self) -> broadcast::Receiver<IngestReport> {
        self.reports.subscribe()
    }

    /// Stop watching and wait for in-flight ingests to finish
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
        tracing::info!("Stopped watching {}", self.inbox.display());
        self.audit.log_system(
            EventAction::WatchStopped,
            &format!("Stopped watching {}", self.inbox.display()),
        );
    }
}

impl Drop for InboxWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

async fn dispatch(
    pipeline: IngestPipeline,
    mut paths: mpsc::Receiver<PathBuf>,
    reports: broadcast::Sender<IngestReport>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    // in-flight bundle -> re-run requested while in flight
    let in_flight: Arc<DashMap<PathBuf, bool>> = Arc::new(DashMap::new());

    while let Some(path) = paths.recv().await {
        match in_flight.entry(path.clone()) {
            Entry::Occupied(mut rerun) => {
                *rerun.get_mut() = true;
                continue;
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
            }
        }

        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let pipeline = pipeline.clone();
        let reports = reports.clone();
        let in_flight = Arc::clone(&in_flight);

        tokio::spawn(async move {
            let _permit = permit;
            loop {
                let worker = pipeline.clone();
                let target = path.clone();
                match tokio::task::spawn_blocking(move || worker.handle_bundle(&target)).await {
                    Ok(report) => {
                        let _ = reports.send(report);
                    }
                    Err(e) => tracing::error!("Ingest of {} panicked: {}", path.display(), e),
                }

                if in_flight.remove_if(&path, |_, rerun| !*rerun).is_some() {
                    break;
                }
                if let Some(mut rerun) = in_flight.get_mut(&path) {
                    *rerun = false;
                }
                if !path.exists() {
                    in_flight.remove(&path);
                    break;
                }
            }
        });
    }

    // wait for every worker to hand its permit back
    let _ = permits.acquire_many(workers as u32).await;
}

/// Bundle to ingest for a filesystem event on `path`, if any
fn route(path: PathBuf) -> Option<PathBuf> {
    if is_bundle_path(&path) {
        return Some(path);
    }
    bundle_for_signature(&path).filter(|bundle| bundle.exists())
}

#[cfg(target_os = "linux")]
fn spawn_watch_thread(
    inbox: &Path,
    paths: mpsc::Sender<PathBuf>,
    shutdown: Arc<AtomicBool>,
) -> ControlResult<JoinHandle<()>> {
    use nix::errno::Errno;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
        .map_err(|e| ControlError::Io(io::Error::from(e)))?;
    inotify
        .add_watch(inbox, AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO)
        .map_err(|e| ControlError::Io(io::Error::from(e)))?;

    let inbox = inbox.to_path_buf();
    let handle = std::thread::Builder::new()
        .name("inbox-watch".into())
        .spawn(move || {
            let inotify = inotify;
            while !shutdown.load(Ordering::SeqCst) {
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(Errno::EAGAIN) => {
                        std::thread::sleep(WATCH_POLL);
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("inotify read failed on {}: {}", inbox.display(), e);
                        break;
                    }
                };

                for event in events {
                    let targets = if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                        tracing::warn!("inotify queue overflow; rescanning {}", inbox.display());
                        crate::bundle::list_bundles(&inbox).unwrap_or_default()
                    } else {
                        event
                            .name
                            .and_then(|name| route(inbox.join(name)))
                            .into_iter()
                            .collect()
                    };
                    for target in targets {
                        if paths.blocking_send(target).is_err() {
                            return;
                        }
                    }
                }
            }
        })?;
    Ok(handle)
}

#[cfg(not(target_os = "linux"))]
fn spawn_watch_thread(
    inbox: &Path,
    paths: mpsc::Sender<PathBuf>,
    shutdown: Arc<AtomicBool>,
) -> ControlResult<JoinHandle<()>> {
    use std::collections::HashMap;
    use std::time::SystemTime;

    type Snapshot = HashMap<PathBuf, (Option<SystemTime>, bool)>;

    fn snapshot(inbox: &Path) -> Snapshot {
        crate::bundle::list_bundles(inbox)
            .unwrap_or_default()
            .into_iter()
            .map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                let signed = crate::bundle::signature_path(&path).exists();
                (path, (modified, signed))
            })
            .collect()
    }

    let inbox = inbox.to_path_buf();
    let handle = std::thread::Builder::new()
        .name("inbox-poll".into())
        .spawn(move || {
            let mut seen = snapshot(&inbox);
            while !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(WATCH_POLL * 5);
                let current = snapshot(&inbox);
                for (path, state) in &current {
                    if seen.get(path) != Some(state) && paths.blocking_send(path.clone()).is_err() {
                        return;
                    }
                }
                seen = current;
            }
        })?;
    Ok(handle)
}
