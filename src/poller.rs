//! Single-threaded event reactor.
//!
//! Sources hand readiness to the poller through a [`Notifier`]; the matching
//! callback then runs on the poller thread. Timers and one-shot wakeups run on
//! the same thread, so everything registered with one poller is serialized.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::error::{RdmaError, Result};

/// Upper bound on how long the loop sleeps without checking for abort.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Identifies a registered watcher.
pub type Token = u64;

type IoCallback = Box<dyn FnMut() + Send>;
type WakeCallback = Box<dyn FnOnce() + Send>;

enum PollerTask {
    Ready(Token),
    WatchIo {
        token: Token,
        callback: IoCallback,
    },
    WatchTimer {
        token: Token,
        interval: Duration,
        callback: IoCallback,
    },
    Wake(WakeCallback),
    Stop(Token),
}

/// Readiness handle given to an event source.
#[derive(Clone)]
pub struct Notifier {
    token: Token,
    tx: flume::Sender<PollerTask>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("token", &self.token)
            .finish()
    }
}

impl Notifier {
    /// Signals readiness; the watcher callback runs on the poller thread.
    pub fn notify(&self) {
        // The poller may already be gone during teardown.
        let _ignore = self.tx.send(PollerTask::Ready(self.token));
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AbortSignal {
    inner: Arc<AtomicBool>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn should_abort(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    pub(crate) fn abort(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }
}

struct TimerWatch {
    interval: Duration,
    next: Instant,
    callback: IoCallback,
}

#[derive(Default)]
struct Watchers {
    io: HashMap<Token, IoCallback>,
    timers: HashMap<Token, TimerWatch>,
}

impl Watchers {
    fn process(&mut self, task: PollerTask) {
        match task {
            PollerTask::Ready(token) => {
                if let Some(callback) = self.io.get_mut(&token) {
                    callback();
                } else {
                    debug!("readiness for stopped watcher {token}");
                }
            }
            PollerTask::WatchIo { token, callback } => {
                let _ignore = self.io.insert(token, callback);
            }
            PollerTask::WatchTimer {
                token,
                interval,
                callback,
            } => {
                let watch = TimerWatch {
                    interval,
                    next: Instant::now() + interval,
                    callback,
                };
                let _ignore = self.timers.insert(token, watch);
            }
            PollerTask::Wake(callback) => callback(),
            PollerTask::Stop(token) => {
                let _io = self.io.remove(&token);
                let _timer = self.timers.remove(&token);
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for watch in self.timers.values_mut() {
            if watch.next <= now {
                (watch.callback)();
                watch.next = now + watch.interval;
            }
        }
    }

    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.timers
            .values()
            .map(|w| w.next.saturating_duration_since(now))
            .min()
            .map_or(IDLE_WAIT, |d| d.min(IDLE_WAIT))
    }
}

pub struct Poller {
    tx: flume::Sender<PollerTask>,
    next_token: AtomicU64,
    abort: AbortSignal,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Spawns the reactor thread.
    pub fn spawn(name: &str) -> Result<Arc<Self>> {
        let (tx, rx) = flume::unbounded::<PollerTask>();
        let abort = AbortSignal::new();
        let abort_c = abort.clone();
        let name = name.to_owned();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!("worker {name} running");
                let mut watchers = Watchers::default();
                loop {
                    if abort_c.should_abort() {
                        break;
                    }
                    match rx.recv_timeout(watchers.next_wait()) {
                        Ok(task) => watchers.process(task),
                        Err(flume::RecvTimeoutError::Timeout) => {}
                        Err(flume::RecvTimeoutError::Disconnected) => {
                            error!("poller channel closed");
                            break;
                        }
                    }
                    watchers.fire_timers();
                }
                info!("worker {name} exited");
            })
            .map_err(RdmaError::IoError)?;

        Ok(Arc::new(Self {
            tx,
            next_token: AtomicU64::new(1),
            abort,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Registers a readiness watcher.
    pub fn start_io<F>(&self, callback: F) -> (Token, Notifier)
    where
        F: FnMut() + Send + 'static,
    {
        let token = self.next_token();
        self.submit(PollerTask::WatchIo {
            token,
            callback: Box::new(callback),
        });
        let notifier = Notifier {
            token,
            tx: self.tx.clone(),
        };
        (token, notifier)
    }

    /// Registers a periodic timer.
    pub fn start_timer<F>(&self, interval: Duration, callback: F) -> Token
    where
        F: FnMut() + Send + 'static,
    {
        let token = self.next_token();
        self.submit(PollerTask::WatchTimer {
            token,
            interval,
            callback: Box::new(callback),
        });
        token
    }

    /// Runs `f` once on the poller thread.
    pub fn wake<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(PollerTask::Wake(Box::new(f)));
    }

    /// Unregisters a watcher. Readiness already queued for it is dropped.
    pub fn stop(&self, token: Token) {
        self.submit(PollerTask::Stop(token));
    }

    pub fn is_poller_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stops the reactor thread and waits for it unless called from it.
    pub fn shutdown(&self) {
        self.abort.abort();
        self.submit(PollerTask::Wake(Box::new(|| {})));
        if self.is_poller_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("poller thread panicked");
            }
        }
    }

    fn next_token(&self) -> Token {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, task: PollerTask) {
        if self.tx.send(task).is_err() {
            debug!("poller already stopped");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
