//! End-to-end booking against the in-memory store and a recording agent.

mod common;

use common::{layer_launch, single_layer_job, Farm};
use farm_dispatch::config::DispatcherConfig;
use farm_dispatch::core::error::StoreError;
use farm_dispatch::core::{
    BookingTarget, DispatchHost, FrameState, JobLaunch, JobRef, LayerRef, LocalDispatcher, LocalHostAssignment,
    ResourceLedger,
};
use farm_dispatch::depend::{Completion, Dependency};
use farm_dispatch::infra::DispatchStore;
use farm_dispatch::util::GB;
use uuid::Uuid;

// ============================================================================
// HELPERS
// ============================================================================

fn host() -> DispatchHost {
    DispatchHost::new("render-01", 800, 16 * GB, 0)
}

fn unlocked_config() -> DispatcherConfig {
    DispatcherConfig {
        job_lock_expire_secs: 0,
        ..DispatcherConfig::default()
    }
}

fn frame_id(farm: &Farm, layer: &LayerRef, number: i32) -> Uuid {
    farm.store
        .layer_frames(layer.id)
        .into_iter()
        .find(|frame| frame.number == number)
        .map(|frame| frame.id)
        .unwrap()
}

// ============================================================================
// BOOKING LIMITS
// ============================================================================

#[test]
fn test_books_at_most_two_frames_per_job() {
    let farm = Farm::new();
    let (launch, layer) = farm.launch("shot010_comp", "1-10");
    let mut host = host();

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert_eq!(procs.len(), 2);
    assert!(procs.iter().all(|proc| proc.job_id == launch.job.id));
    assert_eq!(host.idle_cores, 600);
    assert_eq!(host.idle_memory, 14 * GB);
    assert_eq!(farm.agent.launched(), 2);
    assert_eq!(farm.store.frame_state(frame_id(&farm, &layer, 1)), Some(FrameState::Running));
    assert_eq!(farm.store.frame_state(frame_id(&farm, &layer, 3)), Some(FrameState::Waiting));

    let launches = farm.agent.launches.lock();
    assert_eq!(launches[0].command, "render -s 1 -e 1");
    assert_eq!(launches[1].frame_number, 2);
}

#[test]
fn test_host_frame_cap_spans_jobs() {
    let farm = Farm::new();
    for i in 0..10 {
        farm.launch(&format!("job_{i}"), "1-10");
    }
    let mut host = DispatchHost::new("big-01", 3200, 128 * GB, 0);

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert_eq!(procs.len(), 12);
    assert_eq!(farm.dispatcher.stats().booked_procs, 12);
    assert_eq!(farm.dispatcher.stats().booked_cores, 1200);
}

#[test]
fn test_job_lock_skips_recently_booked_job() {
    let farm = Farm::new();
    farm.launch("locked", "1-10");

    assert_eq!(farm.dispatcher.dispatch_host(&mut host()).unwrap().len(), 2);
    assert!(farm.dispatcher.dispatch_host(&mut host()).unwrap().is_empty());
}

#[test]
fn test_expired_job_lock_allows_another_pass() {
    let farm = Farm::with_config(unlocked_config());
    farm.launch("unlocked", "1-10");

    assert_eq!(farm.dispatcher.dispatch_host(&mut host()).unwrap().len(), 2);
    assert_eq!(farm.dispatcher.dispatch_host(&mut host()).unwrap().len(), 2);
}

#[test]
fn test_stops_when_host_runs_dry() {
    let farm = Farm::new();
    farm.launch("a", "1-10");
    farm.launch("b", "1-10");
    let mut host = DispatchHost::new("small-01", 300, 16 * GB, 0);

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert_eq!(procs.len(), 3);
    assert_eq!(host.idle_cores, 0);
    assert!(!host.has_additional_resources(10, 0, 0));
}

#[test]
fn test_show_over_burst_books_nothing() {
    let farm = Farm::new();
    let (launch, _) = farm.launch("bursty", "1-10");
    farm.store.set_show_over_burst(launch.show_id, true);

    assert!(farm.dispatcher.dispatch_host(&mut host()).unwrap().is_empty());
}

#[test]
fn test_unbookable_job_books_nothing() {
    let farm = Farm::new();
    let (launch, _) = farm.launch("capped", "1-10");
    farm.store.set_job_bookable(launch.job.id, false);

    assert!(farm.dispatcher.dispatch_host(&mut host()).unwrap().is_empty());
}

#[test]
fn test_stranded_cores_end_the_job_after_one_frame() {
    let farm = Farm::new();
    farm.launch("stranded", "1-10");
    let mut host = host().with_stranded_cores(50);
    farm.store.add_host(&host);

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert_eq!(procs.len(), 1);
    assert_eq!(host.stranded_cores, 0);
    assert_eq!(farm.store.get_host("render-01").unwrap().stranded_cores, 0);
}

#[test]
fn test_gpu_reservation_is_restored_after_pass() {
    let farm = Farm::new();
    farm.launch("cpu_only", "1-10");
    let mut host = DispatchHost::new("gpu-01", 800, 32 * GB, 1);

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert_eq!(procs.len(), 2);
    assert!(host.gpu_reservation().is_none());
    assert_eq!(host.idle_gpus, 1);
}

#[test]
fn test_gpu_host_holds_back_a_core_and_memory_from_cpu_work() {
    let farm = Farm::with_config(DispatcherConfig {
        job_frame_dispatch_max: 10,
        ..unlocked_config()
    });
    farm.launch("cpu_only", "1-8");
    let mut host = DispatchHost::new("gpu-01", 800, 16 * GB, 1);

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    let cores: i32 = procs.iter().map(|proc| proc.cores_reserved).sum();
    let memory: i64 = procs.iter().map(|proc| proc.memory_reserved).sum();
    assert_eq!(procs.len(), 7);
    assert!(cores <= 700, "booked {cores} core units");
    assert!(memory <= 12 * GB);
    assert!(procs.iter().all(|proc| proc.gpus_reserved == 0));
    assert!(host.gpu_reservation().is_none());
    assert_eq!(host.idle_gpus, 1);
}

#[test]
fn test_gpu_host_prefers_gpu_work() {
    let farm = Farm::with_config(unlocked_config());
    farm.launch("cpu_first", "1-10");
    let (mut gpu_job, gpu_layer) = single_layer_job("gpu_second", "1-10", 100, GB);
    gpu_job.layers[0].min_gpus = 1;
    farm.store.launch_job(&gpu_job).unwrap();
    let mut host = DispatchHost::new("gpu-01", 800, 16 * GB, 1);

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].job_id, gpu_job.job.id);
    assert_eq!(procs[0].gpus_reserved, 1);
    assert_eq!(farm.store.frame_state(frame_id(&farm, &gpu_layer, 1)), Some(FrameState::Running));
}

#[test]
fn test_job_target_books_only_that_job() {
    let farm = Farm::new();
    farm.launch("other", "1-10");
    let (target, _) = farm.launch("wanted", "1-10");

    let procs = farm
        .dispatcher
        .dispatch_host_to(&mut host(), BookingTarget::Job(target.job.id))
        .unwrap();

    assert_eq!(procs.len(), 2);
    assert!(procs.iter().all(|proc| proc.job_id == target.job.id));
}

// ============================================================================
// TEST MODE
// ============================================================================

#[test]
fn test_test_mode_records_bookings_without_launching() {
    let farm = Farm::new();
    farm.launch("dry_run", "1-10");
    farm.dispatcher.set_test_mode(true);

    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();

    assert_eq!(procs.len(), 2);
    assert_eq!(farm.agent.launched(), 0);
    assert_eq!(farm.store.procs().len(), 2);
}

// ============================================================================
// FAILURE CLASSIFICATION
// ============================================================================

#[test]
fn test_taken_frame_is_skipped() {
    let farm = Farm::new();
    let (_, layer) = farm.launch("raced", "1-10");
    let first = frame_id(&farm, &layer, 1);
    farm.store
        .inject_failure(first, StoreError::FrameReservation("taken".into()));

    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();

    assert_eq!(procs.len(), 2);
    assert_eq!(farm.store.frame_state(first), Some(FrameState::Waiting));
    assert_eq!(farm.store.frame_state(frame_id(&farm, &layer, 2)), Some(FrameState::Running));
    assert_eq!(farm.store.frame_state(frame_id(&farm, &layer, 3)), Some(FrameState::Running));
    assert_eq!(farm.dispatcher.stats().frame_retries, 1);
}

#[test]
fn test_duplicated_proc_fixes_frame_and_moves_on() {
    let farm = Farm::new();
    let (_, layer) = farm.launch("dup", "1-10");
    let first = frame_id(&farm, &layer, 1);
    farm.store
        .inject_failure(first, StoreError::ResourceDuplication("proc exists".into()));

    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();

    assert_eq!(procs.len(), 2);
    assert_eq!(farm.store.frame_state(first), Some(FrameState::Waiting));
    assert_eq!(farm.agent.killed(), 0);
}

#[test]
fn test_reservation_failure_stops_host() {
    let farm = Farm::new();
    let (_, layer) = farm.launch("full", "1-10");
    farm.launch("second", "1-10");
    let first = frame_id(&farm, &layer, 1);
    farm.store
        .inject_failure(first, StoreError::ResourceReservation("no cores".into()));
    let mut host = host();

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert!(procs.is_empty());
    assert_eq!(host.idle_cores, 800);
    assert_eq!(farm.store.frame_state(first), Some(FrameState::Waiting));
    assert_eq!(farm.agent.killed(), 0);
}

#[test]
fn test_launch_failure_releases_frame_and_kills() {
    let farm = Farm::new();
    let (_, layer) = farm.launch("unreachable", "1-10");
    farm.agent.fail_launch.store(true, std::sync::atomic::Ordering::SeqCst);
    let mut host = host();

    let procs = farm.dispatcher.dispatch_host(&mut host).unwrap();

    assert!(procs.is_empty());
    assert_eq!(host.idle_cores, 800);
    assert!(farm.store.procs().is_empty());
    assert_eq!(farm.store.frame_state(frame_id(&farm, &layer, 1)), Some(FrameState::Waiting));
    assert_eq!(farm.agent.killed(), 1);
    assert_eq!(farm.dispatcher.stats().booking_errors, 1);
}

#[test]
fn test_backend_failure_stops_host() {
    let farm = Farm::new();
    let (_, layer) = farm.launch("broken", "1-10");
    let first = frame_id(&farm, &layer, 1);
    farm.store.inject_failure(first, StoreError::Backend("connection reset".into()));

    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();

    assert!(procs.is_empty());
    assert_eq!(farm.store.frame_state(first), Some(FrameState::Waiting));
    assert_eq!(farm.agent.killed(), 1);
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

#[test]
fn test_blocked_layer_waits_for_upstream_layer() {
    let farm = Farm::with_config(unlocked_config());
    let (upstream, up_layer) = farm.launch("sim", "1-2");
    let (downstream, down_layer) = farm.launch("light", "1-2");
    farm.graph
        .register(Dependency::layer_on_layer(&down_layer, &up_layer).unwrap())
        .unwrap();

    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();
    assert_eq!(procs.len(), 2);
    assert!(procs.iter().all(|proc| proc.job_id == upstream.job.id));
    assert!(farm.dispatcher.dispatch_host(&mut host()).unwrap().is_empty());

    farm.graph.satisfy_dependents(&Completion::Layer(up_layer));
    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();
    assert_eq!(procs.len(), 2);
    assert!(procs.iter().all(|proc| proc.job_id == downstream.job.id));
}

#[test]
fn test_previous_frame_unlocks_matching_frame_only() {
    let farm = Farm::with_config(DispatcherConfig {
        job_frame_dispatch_max: 10,
        ..unlocked_config()
    });
    let job = JobRef::new("fx");
    let sim = LayerRef::new(&job, "sim");
    let render = LayerRef::new(&job, "render");
    let launch = JobLaunch {
        job: job.clone(),
        show_id: Uuid::new_v4(),
        group_id: Uuid::new_v4(),
        os: "linux".into(),
        layers: vec![layer_launch(&sim, "1-3", 100, GB), layer_launch(&render, "1-3", 100, GB)],
        depends: Vec::new(),
    };
    farm.store.launch_job(&launch).unwrap();
    farm.graph
        .register(Dependency::previous_frame(&render, &sim).unwrap())
        .unwrap();

    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();
    assert_eq!(procs.len(), 3);
    assert!(procs.iter().all(|proc| proc.layer_id == sim.id));

    let done = farm.store.complete_frame(frame_id(&farm, &sim, 2)).unwrap();
    farm.graph.satisfy_dependents(&Completion::Frame(done));

    let procs = farm.dispatcher.dispatch_host(&mut host()).unwrap();
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].frame_id, Some(frame_id(&farm, &render, 2)));
    assert_eq!(farm.store.frame_state(frame_id(&farm, &render, 1)), Some(FrameState::Waiting));
    assert_eq!(farm.store.frame_state(frame_id(&farm, &render, 3)), Some(FrameState::Waiting));
}

// ============================================================================
// LOCAL ASSIGNMENTS
// ============================================================================

#[test]
fn test_local_job_assignment_books_within_its_cores() {
    let farm = Farm::new();
    let (launch, _) = farm.launch("desk_job", "1-10");
    let host = host();
    farm.store
        .add_local_assignment(LocalHostAssignment::for_job(host.id, launch.job.id, 200, 8 * GB, 0, 1));

    let procs = LocalDispatcher::new(farm.dispatcher.clone()).dispatch_host(&host).unwrap();

    assert_eq!(procs.len(), 2);
    assert!(procs.iter().all(|proc| proc.is_local_dispatch && proc.job_id == launch.job.id));
    let assignment = farm.store.local_assignments(&host).unwrap().remove(0);
    assert_eq!(assignment.idle_cores, 0);
    assert_eq!(assignment.idle_memory, 6 * GB);
}

#[test]
fn test_local_layer_assignment_books_its_layer() {
    let farm = Farm::new();
    let (launch, layer) = farm.launch("desk_layer", "1-10");
    let host = host();
    farm.store.add_local_assignment(LocalHostAssignment::for_layer(
        host.id,
        launch.job.id,
        layer.id,
        300,
        8 * GB,
        0,
        1,
    ));

    let procs = LocalDispatcher::new(farm.dispatcher.clone()).dispatch_host(&host).unwrap();

    assert_eq!(procs.len(), 3);
    assert!(procs.iter().all(|proc| proc.layer_id == layer.id));
}

#[test]
fn test_local_frame_assignment_books_one_frame() {
    let farm = Farm::new();
    let (launch, layer) = farm.launch("desk_frame", "1-10");
    let host = host();
    let fifth = frame_id(&farm, &layer, 5);
    farm.store.add_local_assignment(LocalHostAssignment::for_frame(
        host.id,
        launch.job.id,
        fifth,
        200,
        8 * GB,
        0,
        1,
    ));

    let procs = LocalDispatcher::new(farm.dispatcher.clone()).dispatch_host(&host).unwrap();

    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].frame_id, Some(fifth));
}

#[test]
fn test_local_assignment_for_finished_job_is_removed() {
    let farm = Farm::new();
    let (launch, layer) = farm.launch("finished", "1-2");
    for number in 1..=2 {
        farm.store.complete_frame(frame_id(&farm, &layer, number)).unwrap();
    }
    let host = host();
    farm.store
        .add_local_assignment(LocalHostAssignment::for_job(host.id, launch.job.id, 200, 8 * GB, 0, 1));

    let procs = LocalDispatcher::new(farm.dispatcher.clone()).dispatch_host(&host).unwrap();

    assert!(procs.is_empty());
    assert!(farm.store.local_assignments(&host).unwrap().is_empty());
}

#[test]
fn test_local_assignment_for_missing_job_is_removed() {
    let farm = Farm::new();
    let host = host();
    farm.store
        .add_local_assignment(LocalHostAssignment::for_job(host.id, Uuid::new_v4(), 200, 8 * GB, 0, 1));

    let procs = LocalDispatcher::new(farm.dispatcher.clone()).dispatch_host(&host).unwrap();

    assert!(procs.is_empty());
    assert!(farm.store.local_assignments(&host).unwrap().is_empty());
}

#[test]
fn test_full_local_assignment_is_kept_while_its_frame_runs() {
    let farm = Farm::with_config(unlocked_config());
    let (launch, _) = farm.launch("desk_busy", "1-2");
    let host = host();
    farm.store
        .add_local_assignment(LocalHostAssignment::for_job(host.id, launch.job.id, 100, 8 * GB, 0, 1));
    let local = LocalDispatcher::new(farm.dispatcher.clone());

    assert_eq!(local.dispatch_host(&host).unwrap().len(), 1);
    let second = local.dispatch_host(&host).unwrap();

    assert!(second.is_empty());
    assert_eq!(farm.store.local_assignments(&host).unwrap().len(), 1);
    assert_eq!(farm.store.procs().len(), 1);
}

#[test]
fn test_local_assignment_blocked_by_dependency_is_kept() {
    let farm = Farm::new();
    let (upstream, _) = farm.launch("desk_upstream", "1-2");
    let (launch, _) = farm.launch("desk_waiting", "1-2");
    farm.graph
        .register(Dependency::job_on_job(&launch.job, &upstream.job).unwrap())
        .unwrap();
    let host = host();
    farm.store
        .add_local_assignment(LocalHostAssignment::for_job(host.id, launch.job.id, 200, 8 * GB, 0, 1));

    let procs = LocalDispatcher::new(farm.dispatcher.clone()).dispatch_host(&host).unwrap();

    assert!(procs.is_empty());
    assert_eq!(farm.store.local_assignments(&host).unwrap().len(), 1);
}

#[test]
fn test_local_booking_leaves_caller_host_untouched() {
    let farm = Farm::new();
    let (launch, _) = single_layer_job("untouched", "1-4", 100, GB);
    farm.store.launch_job(&launch).unwrap();
    let host = host();
    farm.store
        .add_local_assignment(LocalHostAssignment::for_job(host.id, launch.job.id, 400, 8 * GB, 0, 2));

    let procs = LocalDispatcher::new(farm.dispatcher.clone()).dispatch_host(&host).unwrap();

    assert_eq!(procs.len(), 2);
    assert!(procs.iter().all(|proc| proc.cores_reserved == 200));
    assert_eq!(host.idle_cores, 800);
}
