//! Commands run by the dispatch pools and the context that executes them.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::{BookingTarget, Dispatcher, CORE_POINTS_RESERVED_MIN, GPU_RESERVED_MIN, MEM_RESERVED_MIN};
use super::entity::{JobLaunch, JobRef, LayerRef};
use super::error::DispatchError;
use super::ledger::{DispatchHost, LockState, ResourceLedger};
use super::local::LocalDispatcher;
use super::proc::VirtualProc;
use super::worker_pool::{CommandExecutor, PoolCommand};
use crate::depend::{Completion, DependencyGraph};
use crate::frames::FrameSet;

const EAT_KILL_REASON: &str = "Frame was eaten.";

/// Book a host. Two bookings are the same command when they name the same
/// host, whatever their targets.
#[derive(Debug, Clone)]
pub struct BookHost {
    /// Host snapshot to book; the pass works on this copy.
    pub host: DispatchHost,
    /// Where to look for work first.
    pub target: BookingTarget,
}

impl BookHost {
    /// Book `host` with any job it may run.
    #[must_use]
    pub const fn new(host: DispatchHost) -> Self {
        Self {
            host,
            target: BookingTarget::Host,
        }
    }

    /// Book `host` from `target` first.
    #[must_use]
    pub const fn with_target(host: DispatchHost, target: BookingTarget) -> Self {
        Self { host, target }
    }
}

impl PartialEq for BookHost {
    fn eq(&self, other: &Self) -> bool {
        self.host.name == other.host.name
    }
}

impl Eq for BookHost {}

impl Hash for BookHost {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.name.hash(state);
    }
}

/// Which pool a command runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Host booking.
    Booking,
    /// Frame kills.
    Kill,
    /// Everything else.
    Manage,
}

/// Work submitted to the dispatch pools.
#[derive(Debug, Clone)]
pub enum DispatchCommand {
    /// Fill a host with frames.
    BookHost(BookHost),
    /// Fill a host's local assignments.
    BookLocal {
        /// Host the assignments are carved from.
        host: DispatchHost,
    },
    /// Release dependents of completed work.
    SatisfyDepends(Completion),
    /// Mark frames eaten, release their dependents and kill what was running.
    EatFrames {
        /// Layer of the frames.
        layer: LayerRef,
        /// Frame numbers to eat.
        frames: FrameSet,
    },
    /// Kill running frames.
    KillFrames {
        /// Procs running the frames.
        procs: Vec<VirtualProc>,
        /// Reason sent to the agent.
        reason: String,
    },
    /// Insert a job and register its dependencies.
    LaunchJob(JobLaunch),
    /// Move hosts to another allocation.
    ReparentHosts {
        /// Host names.
        hosts: Vec<String>,
        /// New allocation.
        allocation_id: Uuid,
    },
    /// Reboot a host.
    RebootHost {
        /// Host name.
        host: String,
        /// Wait for running frames to finish first.
        when_idle: bool,
    },
    /// Lock or unlock a host.
    SetHostLock {
        /// Host name.
        host: String,
        /// Lock state to apply.
        state: LockState,
    },
}

impl DispatchCommand {
    /// Pool the command belongs on.
    #[must_use]
    pub const fn lane(&self) -> Lane {
        match self {
            Self::BookHost(_) | Self::BookLocal { .. } => Lane::Booking,
            Self::KillFrames { .. } => Lane::Kill,
            Self::SatisfyDepends(_)
            | Self::EatFrames { .. }
            | Self::LaunchJob(_)
            | Self::ReparentHosts { .. }
            | Self::RebootHost { .. }
            | Self::SetHostLock { .. } => Lane::Manage,
        }
    }
}

impl PoolCommand for DispatchCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::BookHost(_) => "book_host",
            Self::BookLocal { .. } => "book_local",
            Self::SatisfyDepends(_) => "satisfy_depends",
            Self::EatFrames { .. } => "eat_frames",
            Self::KillFrames { .. } => "kill_frames",
            Self::LaunchJob(_) => "launch_job",
            Self::ReparentHosts { .. } => "reparent_hosts",
            Self::RebootHost { .. } => "reboot_host",
            Self::SetHostLock { .. } => "set_host_lock",
        }
    }

    fn dedup_key(&self) -> Option<String> {
        match self {
            Self::BookHost(book) => Some(format!("book:{}", book.host.name)),
            Self::BookLocal { host } => Some(format!("book-local:{}", host.name)),
            _ => None,
        }
    }
}

/// What a command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Procs booked.
    Booked(usize),
    /// Dependency edges released.
    Satisfied {
        /// Whole edges satisfied.
        edges: usize,
        /// Composite edges released for single frames.
        frames: usize,
    },
    /// Frames eaten.
    Eaten {
        /// Frames moved to eaten.
        frames: usize,
        /// Running frames killed.
        killed: usize,
        /// Running frames whose kill failed.
        failed: usize,
    },
    /// Kill requests sent.
    Killed {
        /// Kills the agents accepted.
        killed: usize,
        /// Kills that failed.
        failed: usize,
    },
    /// A job was inserted.
    Launched {
        /// New dependency edges.
        depends: usize,
    },
    /// Hosts moved.
    Reparented(usize),
    /// A host admin request was sent.
    HostUpdated,
}

/// Executes [`DispatchCommand`]s against the dispatcher, its store and agent,
/// and the dependency graph.
pub struct CommandContext {
    dispatcher: Arc<Dispatcher>,
    local: LocalDispatcher,
    graph: Arc<DependencyGraph>,
}

impl CommandContext {
    /// Build a context around shared collaborators.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, graph: Arc<DependencyGraph>) -> Self {
        let local = LocalDispatcher::new(Arc::clone(&dispatcher));
        Self {
            dispatcher,
            local,
            graph,
        }
    }

    /// The dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The dependency graph.
    #[must_use]
    pub const fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    fn book_host(&self, book: BookHost) -> Result<CommandOutcome, DispatchError> {
        let BookHost { mut host, target } = book;
        if !host.is_bookable() {
            debug!(host = %host.name, lock = ?host.lock_state, state = ?host.hardware_state, "host not bookable");
            return Ok(CommandOutcome::Booked(0));
        }

        let mut booked = self.dispatcher.dispatch_host_to(&mut host, target)?.len();
        if target != BookingTarget::Host && has_room(&host) {
            booked += self.dispatcher.dispatch_host(&mut host)?.len();
        }
        if target != BookingTarget::AllShows && has_room(&host) {
            booked += self
                .dispatcher
                .dispatch_host_to(&mut host, BookingTarget::AllShows)?
                .len();
        }
        Ok(CommandOutcome::Booked(booked))
    }

    fn satisfy(&self, completion: &Completion) -> Result<CommandOutcome, DispatchError> {
        let result = self.graph.satisfy_dependents(completion);
        if !result.satisfied.is_empty() {
            self.dispatcher.store().deactivate_depends(&result.satisfied)?;
        }
        Ok(CommandOutcome::Satisfied {
            edges: result.satisfied.len(),
            frames: result.unlocked_frames.len(),
        })
    }

    fn eat(&self, layer: LayerRef, frames: &FrameSet) -> Result<CommandOutcome, DispatchError> {
        let eaten = self.dispatcher.store().eat_frames(layer.id, frames)?;
        info!(layer = %layer.name, requested = frames.size(), eaten = eaten.frames.len(), "ate frames");

        if !eaten.frames.is_empty() {
            let store = self.dispatcher.store();
            let numbers = eaten.frames.iter().map(|frame| frame.number).collect();
            let job_id = layer.job_id;
            let layer_id = layer.id;
            let layer_done = store.is_layer_complete(layer_id)?;
            self.satisfy(&Completion::Frames {
                layer: layer.clone(),
                frames: FrameSet::from_frames(numbers),
            })?;
            if layer_done {
                self.satisfy(&Completion::Layer(layer))?;
                if store.is_job_complete(job_id)? {
                    self.satisfy(&Completion::Job(JobRef {
                        id: job_id,
                        name: String::new(),
                    }))?;
                }
            }
        }
        let (killed, failed) = self.kill(&eaten.procs, EAT_KILL_REASON);
        Ok(CommandOutcome::Eaten {
            frames: eaten.frames.len(),
            killed,
            failed,
        })
    }

    fn kill(&self, procs: &[VirtualProc], reason: &str) -> (usize, usize) {
        let agent = self.dispatcher.agent();
        let mut killed = 0;
        let mut failed = 0;
        for proc in procs {
            match agent.kill_frame(proc, reason) {
                Ok(()) => killed += 1,
                Err(e) => {
                    failed += 1;
                    warn!(host = %proc.host_name, proc = %proc.id, error = %e, "failed to kill frame");
                }
            }
        }
        (killed, failed)
    }

    fn launch(&self, launch: JobLaunch) -> Result<CommandOutcome, DispatchError> {
        self.dispatcher.store().launch_job(&launch)?;
        let mut depends = 0;
        for dependency in launch.depends {
            if self.graph.register(dependency)?.is_created() {
                depends += 1;
            }
        }
        info!(job = %launch.job.name, layers = launch.layers.len(), depends, "launched job");
        Ok(CommandOutcome::Launched { depends })
    }
}

fn has_room(host: &DispatchHost) -> bool {
    host.has_additional_resources(CORE_POINTS_RESERVED_MIN, MEM_RESERVED_MIN, GPU_RESERVED_MIN)
}

impl CommandExecutor<DispatchCommand> for CommandContext {
    type Output = CommandOutcome;
    type Error = DispatchError;

    fn execute(&self, command: DispatchCommand) -> Result<CommandOutcome, DispatchError> {
        match command {
            DispatchCommand::BookHost(book) => self.book_host(book),
            DispatchCommand::BookLocal { host } => Ok(CommandOutcome::Booked(self.local.dispatch_host(&host)?.len())),
            DispatchCommand::SatisfyDepends(completion) => self.satisfy(&completion),
            DispatchCommand::EatFrames { layer, frames } => self.eat(layer, &frames),
            DispatchCommand::KillFrames { procs, reason } => {
                let (killed, failed) = self.kill(&procs, &reason);
                Ok(CommandOutcome::Killed { killed, failed })
            }
            DispatchCommand::LaunchJob(launch) => self.launch(launch),
            DispatchCommand::ReparentHosts { hosts, allocation_id } => {
                let moved = self.dispatcher.store().reparent_hosts(&hosts, allocation_id)?;
                info!(moved, allocation = %allocation_id, "reparented hosts");
                Ok(CommandOutcome::Reparented(moved))
            }
            DispatchCommand::RebootHost { host, when_idle } => {
                let agent = self.dispatcher.agent();
                if when_idle {
                    agent.reboot_when_idle(&host)?;
                } else {
                    agent.reboot_now(&host)?;
                }
                Ok(CommandOutcome::HostUpdated)
            }
            DispatchCommand::SetHostLock { host, state } => {
                self.dispatcher.agent().set_host_lock(&host, state)?;
                Ok(CommandOutcome::HostUpdated)
            }
        }
    }
}
