//! `CommandPool` on OS threads.
//!
//! Workers block on `recv`; dropping the sender lets them drain the queue
//! and exit. Idle waiting uses a Condvar over the outstanding count.
//!
//! A dedup key stays claimed from submission until its command finishes.
//! A submission arriving while its key runs is held back and runs on the
//! same worker right after, so two commands with one key never overlap.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::{CommandExecutor, PoolCommand, PoolCounters, PoolStats, Submission};
use crate::config::PoolConfig;
use crate::core::error::PoolError;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct QueuedCommand<C> {
    command: C,
    dedup_key: Option<String>,
    enqueued_at: Instant,
}

/// Where the command holding a dedup key is.
enum KeyState<C> {
    Queued,
    Running { deferred: Option<QueuedCommand<C>> },
}

/// State shared between the pool handle and its workers.
struct Shared<C> {
    name: String,
    counters: PoolCounters,
    keys: Mutex<HashMap<String, KeyState<C>>>,
    outstanding: Mutex<u64>,
    idle: Condvar,
}

impl<C> Shared<C> {
    fn release_key(&self, key: Option<&String>) {
        if let Some(key) = key {
            self.keys.lock().remove(key);
        }
    }

    fn mark_running(&self, key: Option<&String>) {
        if let Some(key) = key {
            self.keys
                .lock()
                .insert(key.clone(), KeyState::Running { deferred: None });
        }
    }

    /// Release `key` after its command finished, handing back a command
    /// held while it ran. The key stays claimed for that command.
    fn finish_key(&self, key: Option<&String>) -> Option<QueuedCommand<C>> {
        let key = key?;
        let mut keys = self.keys.lock();
        match keys.remove(key) {
            Some(KeyState::Running { deferred: Some(next) }) => {
                keys.insert(key.clone(), KeyState::Queued);
                Some(next)
            }
            _ => None,
        }
    }

    fn begin(&self) {
        *self.outstanding.lock() += 1;
    }

    fn finish(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// A bounded pool of worker threads running one kind of command.
pub struct CommandPool<C, E>
where
    C: PoolCommand,
    E: CommandExecutor<C>,
{
    config: PoolConfig,
    sender: Mutex<Option<Sender<QueuedCommand<C>>>>,
    shared: Arc<Shared<C>>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    _executor: PhantomData<fn() -> E>,
}

impl<C, E> CommandPool<C, E>
where
    C: PoolCommand,
    E: CommandExecutor<C>,
{
    /// Start `config.worker_count` threads named `<name>-<n>`.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfig`] for an invalid configuration and
    /// [`PoolError::Internal`] when a thread cannot be spawned.
    pub fn new(name: impl Into<String>, config: PoolConfig, executor: Arc<E>) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let name = name.into();

        let (sender, receiver) = bounded::<QueuedCommand<C>>(config.queue_capacity);
        let shared = Arc::new(Shared {
            name: name.clone(),
            counters: PoolCounters::default(),
            keys: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                &name,
                worker_id,
                receiver.clone(),
                Arc::clone(&shared),
                Arc::clone(&executor),
                config.thread_stack_size,
            )?;
            workers.push(worker);
        }

        info!(
            pool = %name,
            worker_count = config.worker_count,
            queue_capacity = config.queue_capacity,
            "command pool started"
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            shared,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
            _executor: PhantomData,
        })
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a command without blocking.
    ///
    /// # Errors
    /// [`PoolError::PoolShutdown`] after [`CommandPool::shutdown`].
    pub fn submit(&self, command: C) -> Result<Submission, PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }

        let name = command.name();
        let dedup_key = command.dedup_key();
        if let Some(key) = &dedup_key {
            let mut keys = self.shared.keys.lock();
            match keys.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(KeyState::Queued);
                }
                Entry::Occupied(mut slot) => match slot.get_mut() {
                    KeyState::Running { deferred } if deferred.is_none() => {
                        self.shared.begin();
                        *deferred = Some(QueuedCommand {
                            command,
                            dedup_key: dedup_key.clone(),
                            enqueued_at: Instant::now(),
                        });
                        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                        self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
                        debug!(pool = %self.shared.name, command = name, key = %key, "held until running command finishes");
                        return Ok(Submission::Queued);
                    }
                    _ => {
                        self.shared.counters.collapsed.fetch_add(1, Ordering::Relaxed);
                        debug!(pool = %self.shared.name, command = name, key = %key, "collapsed duplicate command");
                        return Ok(Submission::Collapsed);
                    }
                },
            }
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            self.shared.release_key(dedup_key.as_ref());
            return Err(PoolError::PoolShutdown);
        };

        self.shared.begin();
        let queued = QueuedCommand {
            command,
            dedup_key,
            enqueued_at: Instant::now(),
        };
        match sender.try_send(queued) {
            Ok(()) => {
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(Submission::Queued)
            }
            Err(TrySendError::Full(queued)) => {
                self.shared.release_key(queued.dedup_key.as_ref());
                self.shared.finish();
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %self.shared.name, command = name, "queue full, command rejected");
                Ok(Submission::Rejected)
            }
            Err(TrySendError::Disconnected(queued)) => {
                self.shared.release_key(queued.dedup_key.as_ref());
                self.shared.finish();
                Err(PoolError::PoolShutdown)
            }
        }
    }

    /// Block until every accepted command has finished or `timeout` passes.
    /// Returns true if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            if self.shared.idle.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }
        true
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot(&self.shared.name, self.config.worker_count)
    }

    /// Stop accepting commands, let workers drain the queue, and join them.
    ///
    /// Workers still busy after the join timeout are detached.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.shared.name, "shutting down command pool");
        self.sender.lock().take();

        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (worker_id, worker) in workers.drain(..).enumerate() {
            let (done_tx, done_rx) = bounded(1);
            let joiner = thread::spawn(move || {
                let _ = done_tx.send(worker.join().is_ok());
            });
            match done_rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => debug!(pool = %self.shared.name, worker_id, "worker joined"),
                Ok(false) => warn!(pool = %self.shared.name, worker_id, "worker panicked"),
                Err(_) => {
                    warn!(pool = %self.shared.name, worker_id, "worker did not exit in time, detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }
        info!(pool = %self.shared.name, worker_count, "command pool shut down");
    }
}

impl<C, E> Drop for CommandPool<C, E>
where
    C: PoolCommand,
    E: CommandExecutor<C>,
{
    fn drop(&mut self) {
        // workers are not joined here; call shutdown() for that
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.sender.lock().take();
            debug!(pool = %self.shared.name, "command pool dropped without shutdown");
        }
    }
}

fn spawn_worker<C, E>(
    pool: &str,
    worker_id: usize,
    receiver: Receiver<QueuedCommand<C>>,
    shared: Arc<Shared<C>>,
    executor: Arc<E>,
    stack_size: usize,
) -> Result<JoinHandle<()>, PoolError>
where
    C: PoolCommand,
    E: CommandExecutor<C>,
{
    thread::Builder::new()
        .name(format!("{pool}-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(pool = %shared.name, worker_id, "worker started");
            while let Ok(queued) = receiver.recv() {
                let mut next = Some(queued);
                while let Some(queued) = next.take() {
                    next = run_command(&shared, executor.as_ref(), worker_id, queued);
                }
            }
            debug!(pool = %shared.name, worker_id, "worker exiting");
        })
        .map_err(|e| PoolError::Internal(format!("failed to spawn worker {pool}-{worker_id}: {e}")))
}

/// Run one command. Returns a command that was held back on its key.
fn run_command<C, E>(
    shared: &Shared<C>,
    executor: &E,
    worker_id: usize,
    queued: QueuedCommand<C>,
) -> Option<QueuedCommand<C>>
where
    C: PoolCommand,
    E: CommandExecutor<C>,
{
    let QueuedCommand {
        command,
        dedup_key,
        enqueued_at,
    } = queued;
    shared.mark_running(dedup_key.as_ref());
    shared.counters.queued.fetch_sub(1, Ordering::Relaxed);
    shared.counters.active.fetch_add(1, Ordering::Relaxed);

    let name = command.name();
    let started = Instant::now();
    let waited_ms = started.duration_since(enqueued_at).as_millis();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(command)));
    let elapsed_ms = started.elapsed().as_millis();

    match outcome {
        Ok(Ok(output)) => {
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %shared.name, worker_id, command = name, waited_ms, elapsed_ms, ?output, "command completed");
        }
        Ok(Err(e)) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(pool = %shared.name, worker_id, command = name, elapsed_ms, error = %e, "command failed");
        }
        Err(panic) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                pool = %shared.name,
                worker_id,
                command = name,
                elapsed_ms,
                panic = panic_message(panic.as_ref()),
                "command panicked"
            );
        }
    }

    shared.counters.active.fetch_sub(1, Ordering::Relaxed);
    let next = shared.finish_key(dedup_key.as_ref());
    shared.finish();
    next
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
