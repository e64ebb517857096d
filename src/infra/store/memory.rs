//! In-memory dispatch store for development and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::{DispatchStore, EatenFrames, JobScope};
use crate::core::entity::{DispatchFrame, DispatchJob, FrameRef, FrameState, JobLaunch};
use crate::core::error::StoreError;
use crate::core::ledger::{DispatchHost, LocalHostAssignment};
use crate::core::proc::VirtualProc;
use crate::depend::DependencyGraph;
use crate::frames::FrameSet;
use crate::util::now_millis;

#[derive(Debug)]
struct StoredFrame {
    frame: DispatchFrame,
    state: FrameState,
    proc_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, DispatchJob>,
    job_order: Vec<Uuid>,
    job_layers: HashMap<Uuid, Vec<Uuid>>,
    layer_frames: HashMap<Uuid, Vec<Uuid>>,
    frames: HashMap<Uuid, StoredFrame>,
    procs: HashMap<Uuid, VirtualProc>,
    hosts: HashMap<String, DispatchHost>,
    local: HashMap<Uuid, Vec<LocalHostAssignment>>,
    subscriptions: HashMap<Uuid, HashSet<Uuid>>,
    over_burst: HashSet<Uuid>,
    unbookable: HashSet<Uuid>,
    inactive_depends: HashSet<Uuid>,
    injected: HashMap<Uuid, StoreError>,
}

impl State {
    fn frame(&self, frame_id: Uuid) -> Result<&StoredFrame, StoreError> {
        self.frames
            .get(&frame_id)
            .ok_or_else(|| StoreError::NotFound(format!("frame {frame_id}")))
    }

    fn frame_mut(&mut self, frame_id: Uuid) -> Result<&mut StoredFrame, StoreError> {
        self.frames
            .get_mut(&frame_id)
            .ok_or_else(|| StoreError::NotFound(format!("frame {frame_id}")))
    }

    fn layer_candidates<'a>(
        &'a self,
        layer_id: Uuid,
        host: &'a DispatchHost,
        graph: Option<&'a DependencyGraph>,
    ) -> impl Iterator<Item = &'a DispatchFrame> + 'a {
        self.layer_frames
            .get(&layer_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.frames.get(id))
            .filter(move |stored| stored.state == FrameState::Waiting && fits(&stored.frame, host))
            .map(|stored| &stored.frame)
            .filter(move |frame| !graph.is_some_and(|g| g.is_blocked(&frame.frame_ref())))
    }

    fn job_candidates<'a>(
        &'a self,
        job_id: Uuid,
        host: &'a DispatchHost,
        graph: Option<&'a DependencyGraph>,
    ) -> impl Iterator<Item = &'a DispatchFrame> + 'a {
        self.job_layers
            .get(&job_id)
            .into_iter()
            .flatten()
            .flat_map(move |layer_id| self.layer_candidates(*layer_id, host, graph))
    }

    fn in_scope(&self, job: &DispatchJob, host: &DispatchHost, scope: JobScope) -> bool {
        match scope {
            JobScope::AllShows => true,
            JobScope::Show(show_id) => job.show_id == show_id,
            JobScope::Group(group_id) => job.group_id == group_id,
            JobScope::Host => self
                .subscriptions
                .get(&job.show_id)
                .is_none_or(|allocations| allocations.contains(&host.allocation_id)),
        }
    }
}

fn fits(frame: &DispatchFrame, host: &DispatchHost) -> bool {
    frame.min_cores <= host.idle_cores && frame.min_memory <= host.idle_memory && frame.min_gpus <= host.idle_gpus
}

/// A [`DispatchStore`] that keeps every record in process memory.
///
/// When constructed with a [`DependencyGraph`], frames blocked by active
/// dependencies are never offered for booking.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    graph: Option<Arc<DependencyGraph>>,
}

impl InMemoryStore {
    /// An empty store that ignores dependencies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store that consults `graph` before offering frames.
    #[must_use]
    pub fn with_graph(graph: Arc<DependencyGraph>) -> Self {
        Self {
            state: Mutex::default(),
            graph: Some(graph),
        }
    }

    fn search_jobs(
        &self,
        host: &DispatchHost,
        scope: JobScope,
        limit: usize,
        wanted: impl Fn(&DispatchFrame) -> bool,
    ) -> Vec<Uuid> {
        let state = self.state.lock();
        let graph = self.graph.as_deref();
        state
            .job_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| state.in_scope(job, host, scope))
            .filter(|job| state.job_candidates(job.id, host, graph).any(&wanted))
            .map(|job| job.id)
            .take(limit)
            .collect()
    }

    /// Register a host so it can be looked up and reparented. Counts as a
    /// host report.
    pub fn add_host(&self, host: &DispatchHost) {
        host.record_report(now_millis());
        self.state.lock().hosts.insert(host.name.clone(), host.clone());
    }

    /// Attach a local assignment to its host.
    pub fn add_local_assignment(&self, assignment: LocalHostAssignment) {
        self.state
            .lock()
            .local
            .entry(assignment.host_id)
            .or_default()
            .push(assignment);
    }

    /// Restrict a show to the given allocation (additive). Shows without
    /// subscriptions run anywhere.
    pub fn subscribe(&self, show_id: Uuid, allocation_id: Uuid) {
        self.state
            .lock()
            .subscriptions
            .entry(show_id)
            .or_default()
            .insert(allocation_id);
    }

    /// Flag a show as at or over its burst.
    pub fn set_show_over_burst(&self, show_id: Uuid, over: bool) {
        let mut state = self.state.lock();
        if over {
            state.over_burst.insert(show_id);
        } else {
            state.over_burst.remove(&show_id);
        }
    }

    /// Flag a job as unable to take more procs.
    pub fn set_job_bookable(&self, job_id: Uuid, bookable: bool) {
        let mut state = self.state.lock();
        if bookable {
            state.unbookable.remove(&job_id);
        } else {
            state.unbookable.insert(job_id);
        }
    }

    /// Make the next `start_frame` for `frame_id` fail with `error`.
    pub fn inject_failure(&self, frame_id: Uuid, error: StoreError) {
        self.state.lock().injected.insert(frame_id, error);
    }

    /// Mark a frame succeeded and release its proc.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown frames.
    pub fn complete_frame(&self, frame_id: Uuid) -> Result<FrameRef, StoreError> {
        let mut state = self.state.lock();
        let stored = state.frame_mut(frame_id)?;
        stored.state = FrameState::Succeeded;
        let proc_id = stored.proc_id.take();
        let frame_ref = stored.frame.frame_ref();
        if let Some(proc_id) = proc_id {
            state.procs.remove(&proc_id);
        }
        Ok(frame_ref)
    }

    /// Current state of a frame.
    #[must_use]
    pub fn frame_state(&self, frame_id: Uuid) -> Option<FrameState> {
        self.state.lock().frames.get(&frame_id).map(|stored| stored.state)
    }

    /// Frames of a layer in range order.
    #[must_use]
    pub fn layer_frames(&self, layer_id: Uuid) -> Vec<DispatchFrame> {
        let state = self.state.lock();
        state
            .layer_frames
            .get(&layer_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.frames.get(id))
            .map(|stored| stored.frame.clone())
            .collect()
    }

    /// Every reserved proc.
    #[must_use]
    pub fn procs(&self) -> Vec<VirtualProc> {
        self.state.lock().procs.values().cloned().collect()
    }

    /// Signatures persisted as satisfied.
    #[must_use]
    pub fn inactive_depends(&self) -> HashSet<Uuid> {
        self.state.lock().inactive_depends.clone()
    }
}

impl DispatchStore for InMemoryStore {
    fn find_dispatch_jobs(&self, host: &DispatchHost, scope: JobScope, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.search_jobs(host, scope, limit, |_| true))
    }

    fn find_gpu_dispatch_jobs(
        &self,
        host: &DispatchHost,
        scope: JobScope,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.search_jobs(host, scope, limit, |frame| frame.min_gpus > 0))
    }

    fn get_dispatch_job(&self, job_id: Uuid) -> Result<DispatchJob, StoreError> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    fn find_next_dispatch_frames(
        &self,
        job: &DispatchJob,
        host: &DispatchHost,
        limit: usize,
    ) -> Result<Vec<DispatchFrame>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .job_candidates(job.id, host, self.graph.as_deref())
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_next_layer_frames(
        &self,
        layer_id: Uuid,
        host: &DispatchHost,
        limit: usize,
    ) -> Result<Vec<DispatchFrame>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .layer_candidates(layer_id, host, self.graph.as_deref())
            .take(limit)
            .cloned()
            .collect())
    }

    fn get_dispatch_frame(&self, frame_id: Uuid) -> Result<DispatchFrame, StoreError> {
        self.state.lock().frame(frame_id).map(|stored| stored.frame.clone())
    }

    fn is_show_at_or_over_burst(&self, job: &DispatchJob, _host: &DispatchHost) -> Result<bool, StoreError> {
        Ok(self.state.lock().over_burst.contains(&job.show_id))
    }

    fn is_job_bookable(&self, job: &DispatchJob, _cores: i32, _memory: i64) -> Result<bool, StoreError> {
        Ok(!self.state.lock().unbookable.contains(&job.id))
    }

    fn is_layer_complete(&self, layer_id: Uuid) -> Result<bool, StoreError> {
        let state = self.state.lock();
        let ids = state
            .layer_frames
            .get(&layer_id)
            .ok_or_else(|| StoreError::NotFound(format!("layer {layer_id}")))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.frames.get(id))
            .all(|stored| stored.state.is_done()))
    }

    fn is_job_complete(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let state = self.state.lock();
        let layers = state
            .job_layers
            .get(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        Ok(layers
            .iter()
            .filter_map(|layer_id| state.layer_frames.get(layer_id))
            .flatten()
            .filter_map(|id| state.frames.get(id))
            .all(|stored| stored.state.is_done()))
    }

    fn start_frame(&self, proc: &VirtualProc, frame: &DispatchFrame) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(err) = state.injected.remove(&frame.id) {
            return Err(err);
        }
        let stored = state.frame_mut(frame.id)?;
        if stored.state != FrameState::Waiting {
            return Err(StoreError::FrameReservation(format!(
                "frame {} is {:?}, not waiting",
                frame.name, stored.state
            )));
        }
        stored.state = FrameState::Running;
        stored.proc_id = Some(proc.id);
        Ok(())
    }

    fn reserve_proc(&self, proc: &VirtualProc, frame: &DispatchFrame) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.procs.contains_key(&proc.id) {
            return Err(StoreError::ResourceDuplication(format!("proc {} is already reserved", proc.id)));
        }
        if state.procs.values().any(|p| p.frame_id == Some(frame.id)) {
            return Err(StoreError::ResourceDuplication(format!(
                "frame {} already has a proc",
                frame.name
            )));
        }
        let mut reserved = proc.clone();
        reserved.frame_id = Some(frame.id);
        state.procs.insert(reserved.id, reserved);
        Ok(())
    }

    fn unbook_proc(&self, proc: &VirtualProc) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(removed) = state.procs.remove(&proc.id) {
            if let Some(stored) = removed.frame_id.and_then(|id| state.frames.get_mut(&id)) {
                stored.proc_id = None;
            }
        }
        Ok(())
    }

    fn clear_frame(&self, frame: &DispatchFrame) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let stored = state.frame_mut(frame.id)?;
        if stored.state == FrameState::Running {
            stored.state = FrameState::Waiting;
        }
        stored.proc_id = None;
        Ok(())
    }

    fn fix_frame(&self, frame: &DispatchFrame) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.procs.retain(|_, p| p.frame_id != Some(frame.id));
        let stored = state.frame_mut(frame.id)?;
        stored.proc_id = None;
        stored.state = FrameState::Waiting;
        Ok(())
    }

    fn pickup_stranded_cores(&self, host: &DispatchHost) -> Result<(), StoreError> {
        if let Some(stored) = self.state.lock().hosts.get_mut(&host.name) {
            stored.stranded_cores = 0;
        }
        Ok(())
    }

    fn local_assignments(&self, host: &DispatchHost) -> Result<Vec<LocalHostAssignment>, StoreError> {
        Ok(self.state.lock().local.get(&host.id).cloned().unwrap_or_default())
    }

    fn update_local_assignment(&self, assignment: &LocalHostAssignment) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let stored = state
            .local
            .get_mut(&assignment.host_id)
            .and_then(|list| list.iter_mut().find(|a| a.id == assignment.id))
            .ok_or_else(|| StoreError::NotFound(format!("local assignment {}", assignment.id)))?;
        *stored = assignment.clone();
        Ok(())
    }

    fn remove_local_assignment(&self, assignment: &LocalHostAssignment) -> Result<(), StoreError> {
        if let Some(list) = self.state.lock().local.get_mut(&assignment.host_id) {
            list.retain(|a| a.id != assignment.id);
        }
        Ok(())
    }

    fn eat_frames(&self, layer_id: Uuid, frames: &FrameSet) -> Result<EatenFrames, StoreError> {
        let mut state = self.state.lock();
        let ids = state
            .layer_frames
            .get(&layer_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("layer {layer_id}")))?;

        let mut eaten = EatenFrames::default();
        for id in ids {
            let Some(stored) = state.frames.get_mut(&id) else {
                continue;
            };
            if !frames.contains(stored.frame.number) || stored.state.is_done() {
                continue;
            }
            stored.state = FrameState::Eaten;
            let proc_id = stored.proc_id.take();
            eaten.frames.push(stored.frame.frame_ref());
            if let Some(proc) = proc_id.and_then(|p| state.procs.remove(&p)) {
                eaten.procs.push(proc);
            }
        }
        Ok(eaten)
    }

    fn launch_job(&self, launch: &JobLaunch) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let job_id = launch.job.id;
        if state.jobs.contains_key(&job_id) {
            return Err(StoreError::Backend(format!("job {} already exists", launch.job.name)));
        }

        state.jobs.insert(
            job_id,
            DispatchJob {
                id: job_id,
                name: launch.job.name.clone(),
                show_id: launch.show_id,
                group_id: launch.group_id,
                os: launch.os.clone(),
            },
        );
        state.job_order.push(job_id);

        let mut layer_ids = Vec::with_capacity(launch.layers.len());
        for spec in &launch.layers {
            let mut seen = HashSet::new();
            let mut frame_ids = Vec::with_capacity(spec.frames.size());
            for number in spec.frames.iter().filter(|n| seen.insert(*n)) {
                let frame = DispatchFrame {
                    id: Uuid::new_v4(),
                    number,
                    name: format!("{number:04}-{}", spec.layer.name),
                    layer_id: spec.layer.id,
                    layer_name: spec.layer.name.clone(),
                    job_id,
                    job_name: launch.job.name.clone(),
                    show_id: launch.show_id,
                    command: spec.command.clone(),
                    min_cores: spec.min_cores,
                    max_cores: spec.max_cores,
                    min_memory: spec.min_memory,
                    min_gpus: spec.min_gpus,
                    threadable: spec.threadable,
                };
                frame_ids.push(frame.id);
                state.frames.insert(
                    frame.id,
                    StoredFrame {
                        frame,
                        state: FrameState::Waiting,
                        proc_id: None,
                    },
                );
            }
            state.layer_frames.insert(spec.layer.id, frame_ids);
            layer_ids.push(spec.layer.id);
        }
        state.job_layers.insert(job_id, layer_ids);
        Ok(())
    }

    fn reparent_hosts(&self, hosts: &[String], allocation_id: Uuid) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let mut moved = 0;
        for name in hosts {
            if let Some(host) = state.hosts.get_mut(name) {
                host.allocation_id = allocation_id;
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn get_host(&self, name: &str) -> Result<DispatchHost, StoreError> {
        self.state
            .lock()
            .hosts
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("host {name}")))
    }

    fn deactivate_depends(&self, signatures: &[Uuid]) -> Result<(), StoreError> {
        self.state.lock().inactive_depends.extend(signatures.iter().copied());
        Ok(())
    }
}
