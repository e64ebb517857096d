//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use farm_dispatch::config::DispatcherConfig;
use farm_dispatch::core::error::RemoteAgentError;
use farm_dispatch::core::{Dispatcher, JobLaunch, JobRef, LayerLaunch, LayerRef, VirtualProc};
use farm_dispatch::depend::DependencyGraph;
use farm_dispatch::frames::FrameSet;
use farm_dispatch::infra::agent::{RunFrame, RunningFrameInfo};
use farm_dispatch::infra::store::InMemoryStore;
use farm_dispatch::infra::{DispatchStore, RemoteAgentClient};
use farm_dispatch::util::GB;

/// Agent that records every call instead of reaching a host.
#[derive(Default)]
pub struct RecordingAgent {
    pub launches: Mutex<Vec<RunFrame>>,
    pub kills: Mutex<Vec<(String, Uuid, String)>>,
    pub admin: Mutex<Vec<(String, &'static str)>>,
    pub fail_launch: AtomicBool,
    pub fail_kill: AtomicBool,
    test_mode: AtomicBool,
}

impl RecordingAgent {
    pub fn launched(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn killed(&self) -> usize {
        self.kills.lock().len()
    }

    fn admin(&self, host: &str, action: &'static str) -> Result<(), RemoteAgentError> {
        if !self.is_test_mode() {
            self.admin.lock().push((host.to_string(), action));
        }
        Ok(())
    }
}

impl RemoteAgentClient for RecordingAgent {
    fn launch_frame(&self, frame: &RunFrame, proc: &VirtualProc) -> Result<(), RemoteAgentError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(RemoteAgentError::new(format!("connection refused by {}", proc.host_name)));
        }
        self.launches.lock().push(frame.clone());
        Ok(())
    }

    fn kill_frame_on(&self, host: &str, frame_id: Uuid, reason: &str) -> Result<(), RemoteAgentError> {
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(RemoteAgentError::new(format!("{host} did not answer")));
        }
        self.kills.lock().push((host.to_string(), frame_id, reason.to_string()));
        Ok(())
    }

    fn get_frame_status(&self, proc: &VirtualProc) -> Result<RunningFrameInfo, RemoteAgentError> {
        Ok(RunningFrameInfo {
            frame_id: proc.frame_id.unwrap_or_default(),
            pid: Some(4242),
            rss: 0,
            max_rss: 0,
            elapsed_secs: 0,
        })
    }

    fn reboot_now(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.admin(host, "reboot_now")
    }

    fn reboot_when_idle(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.admin(host, "reboot_when_idle")
    }

    fn lock_host(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.admin(host, "lock")
    }

    fn unlock_host(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.admin(host, "unlock")
    }

    fn set_test_mode(&self, enabled: bool) {
        self.test_mode.store(enabled, Ordering::SeqCst);
    }

    fn is_test_mode(&self) -> bool {
        self.test_mode.load(Ordering::SeqCst)
    }
}

/// Store, graph, agent and dispatcher wired together.
pub struct Farm {
    pub store: Arc<InMemoryStore>,
    pub graph: Arc<DependencyGraph>,
    pub agent: Arc<RecordingAgent>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Farm {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        farm_dispatch::util::init_tracing();
        let graph = Arc::new(DependencyGraph::new());
        let store = Arc::new(InMemoryStore::with_graph(Arc::clone(&graph)));
        let agent = Arc::new(RecordingAgent::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store) as Arc<dyn DispatchStore>,
            Arc::clone(&agent) as Arc<dyn RemoteAgentClient>,
            config,
        ));
        Self {
            store,
            graph,
            agent,
            dispatcher,
        }
    }

    /// Launch a single-layer job and return its layer.
    pub fn launch(&self, name: &str, range: &str) -> (JobLaunch, LayerRef) {
        let (launch, layer) = single_layer_job(name, range, 100, GB);
        self.store.launch_job(&launch).unwrap();
        (launch, layer)
    }
}

/// A job with one non-threadable layer.
pub fn single_layer_job(name: &str, range: &str, min_cores: i32, min_memory: i64) -> (JobLaunch, LayerRef) {
    let job = JobRef::new(name);
    let layer = LayerRef::new(&job, "render");
    let launch = JobLaunch {
        job,
        show_id: Uuid::new_v4(),
        group_id: Uuid::new_v4(),
        os: "linux".into(),
        layers: vec![layer_launch(&layer, range, min_cores, min_memory)],
        depends: Vec::new(),
    };
    (launch, layer)
}

pub fn layer_launch(layer: &LayerRef, range: &str, min_cores: i32, min_memory: i64) -> LayerLaunch {
    LayerLaunch {
        layer: layer.clone(),
        frames: FrameSet::parse(range).unwrap(),
        command: "render -s #IFRAME# -e #IFRAME#".into(),
        min_cores,
        max_cores: 0,
        min_memory,
        min_gpus: 0,
        threadable: false,
    }
}
