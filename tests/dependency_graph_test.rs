//! Registration, blocking and satisfaction across the dependency kinds.

use farm_dispatch::core::{DependencyError, FrameRef, JobRef, LayerRef};
use farm_dispatch::depend::{
    Completion, DependKind, DependNode, DependTarget, Dependency, DependencyGraph,
};
use farm_dispatch::frames::FrameSet;

struct Shot {
    job: JobRef,
    sim: LayerRef,
    render: LayerRef,
}

impl Shot {
    fn new(name: &str) -> Self {
        let job = JobRef::new(name);
        let sim = LayerRef::new(&job, "sim");
        let render = LayerRef::new(&job, "render");
        Self { job, sim, render }
    }

    fn sim_frame(&self, number: i32) -> FrameRef {
        FrameRef::new(&self.sim, number)
    }

    fn render_frame(&self, number: i32) -> FrameRef {
        FrameRef::new(&self.render, number)
    }
}

// ============================================================================
// DECLARATION
// ============================================================================

#[test]
fn test_job_level_kinds_reject_same_job() {
    let shot = Shot::new("sh010");
    assert!(matches!(
        Dependency::job_on_job(&shot.job, &shot.job),
        Err(DependencyError::SameJob { .. })
    ));
    assert!(Dependency::job_on_layer(&shot.job, &shot.sim).is_err());
    assert!(Dependency::layer_on_job(&shot.render, &shot.job).is_err());
    assert!(Dependency::frame_on_job(&shot.render_frame(1), &shot.job).is_err());
}

#[test]
fn test_layer_and_frame_kinds_allow_same_job() {
    let shot = Shot::new("sh020");
    assert!(Dependency::layer_on_layer(&shot.render, &shot.sim).is_ok());
    assert!(Dependency::frame_on_frame(&shot.render_frame(3), &shot.sim_frame(3)).is_ok());
    assert!(Dependency::layer_on_frame(&shot.render, &shot.sim_frame(1)).is_ok());
    assert!(Dependency::previous_frame(&shot.render, &shot.render).is_ok());
}

#[test]
fn test_self_references_are_rejected() {
    let shot = Shot::new("sh030");
    assert!(matches!(
        Dependency::layer_on_layer(&shot.sim, &shot.sim),
        Err(DependencyError::SelfReference { .. })
    ));
    assert!(Dependency::layer_on_frame(&shot.sim, &shot.sim_frame(1)).is_err());
    assert!(Dependency::frame_on_layer(&shot.sim_frame(1), &shot.sim).is_err());
}

#[test]
fn test_target_is_derived_from_job_ids() {
    let a = Shot::new("sh040");
    let b = Shot::new("sh050");
    let internal = Dependency::previous_frame(&a.render, &a.sim).unwrap();
    let external = Dependency::previous_frame(&b.render, &a.sim).unwrap();
    assert_eq!(internal.target(), DependTarget::Internal);
    assert_eq!(external.target(), DependTarget::External);
    assert_eq!(internal.kind(), DependKind::PreviousFrame);
    assert!(internal.is_composite());
}

#[test]
fn test_registration_is_idempotent() {
    let a = Shot::new("sh060");
    let b = Shot::new("sh070");
    let graph = DependencyGraph::new();

    let first = graph.register(Dependency::job_on_job(&b.job, &a.job).unwrap()).unwrap();
    let second = graph.register(Dependency::job_on_job(&b.job, &a.job).unwrap()).unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.signature(), second.signature());
    assert_eq!(graph.len(), 1);
}

#[test]
fn test_concurrent_registration_creates_one_edge() {
    let a = Shot::new("sh062");
    let b = Shot::new("sh072");
    let graph = DependencyGraph::new();

    let registrations: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| scope.spawn(|| graph.register(Dependency::job_on_job(&b.job, &a.job).unwrap()).unwrap()))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(registrations.iter().filter(|r| r.is_created()).count(), 1);
    assert!(registrations.iter().all(|r| r.signature() == registrations[0].signature()));
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.active_count(), 1);
}

#[test]
fn test_inactive_declaration_registers_without_blocking() {
    let a = Shot::new("sh080");
    let b = Shot::new("sh090");
    let graph = DependencyGraph::new();
    graph
        .register(Dependency::job_on_job(&b.job, &a.job).unwrap().into_inactive())
        .unwrap();

    assert_eq!(graph.len(), 1);
    assert_eq!(graph.active_count(), 0);
    assert!(!graph.is_blocked(&b.render_frame(1)));
}

// ============================================================================
// SATISFACTION
// ============================================================================

#[test]
fn test_job_on_job_blocks_every_frame_until_job_completes() {
    let a = Shot::new("sh100");
    let b = Shot::new("sh110");
    let graph = DependencyGraph::new();
    graph.register(Dependency::job_on_job(&b.job, &a.job).unwrap()).unwrap();

    assert!(graph.is_blocked(&b.sim_frame(1)));
    assert!(graph.is_blocked(&b.render_frame(99)));
    assert!(!graph.is_blocked(&a.sim_frame(1)));

    assert!(graph.satisfy_dependents(&Completion::Layer(a.sim.clone())).is_empty());
    let result = graph.satisfy_dependents(&Completion::Job(a.job.clone()));
    assert_eq!(result.satisfied.len(), 1);
    assert!(!graph.is_blocked(&b.render_frame(99)));
}

#[test]
fn test_satisfaction_is_a_latch() {
    let a = Shot::new("sh120");
    let b = Shot::new("sh130");
    let graph = DependencyGraph::new();
    let sig = graph
        .register(Dependency::job_on_job(&b.job, &a.job).unwrap())
        .unwrap()
        .signature();

    assert_eq!(graph.satisfy_dependents(&Completion::Job(a.job.clone())).satisfied, vec![sig]);
    assert!(graph.satisfy_dependents(&Completion::Job(a.job.clone())).is_empty());
    assert!(!graph.satisfy(sig));
    assert!(graph.get(sig).is_some_and(|view| !view.dependency.is_active()));
}

#[test]
fn test_layer_on_layer_waits_for_whole_layer_unless_any_frame() {
    let shot = Shot::new("sh140");
    let graph = DependencyGraph::new();
    let strict = graph
        .register(Dependency::layer_on_layer(&shot.render, &shot.sim).unwrap())
        .unwrap()
        .signature();

    assert!(graph.satisfy_dependents(&Completion::Frame(shot.sim_frame(1))).is_empty());
    assert!(graph.is_blocked(&shot.render_frame(1)));

    let other = Shot::new("sh150");
    let loose = graph
        .register(
            Dependency::layer_on_layer(&other.render, &shot.sim)
                .unwrap()
                .with_any_frame(true),
        )
        .unwrap()
        .signature();
    let result = graph.satisfy_dependents(&Completion::Frame(shot.sim_frame(2)));
    assert_eq!(result.satisfied, vec![loose]);
    assert!(!graph.is_blocked(&other.render_frame(1)));

    let result = graph.satisfy_dependents(&Completion::Layer(shot.sim.clone()));
    assert_eq!(result.satisfied, vec![strict]);
    assert!(!graph.is_blocked(&shot.render_frame(1)));
}

#[test]
fn test_frame_on_frame_releases_only_its_frame() {
    let shot = Shot::new("sh160");
    let (waiting, upstream) = (shot.render_frame(5), shot.sim_frame(5));
    let graph = DependencyGraph::new();
    graph
        .register(Dependency::frame_on_frame(&waiting, &upstream).unwrap())
        .unwrap();

    assert!(graph.is_blocked(&waiting));
    assert!(!graph.is_blocked(&shot.render_frame(4)));

    assert!(graph.satisfy_dependents(&Completion::Frame(shot.sim_frame(5))).is_empty());
    graph.satisfy_dependents(&Completion::Frame(upstream));
    assert!(!graph.is_blocked(&waiting));
}

#[test]
fn test_previous_frame_unlocks_matching_numbers() {
    let shot = Shot::new("sh170");
    let graph = DependencyGraph::new();
    let sig = graph
        .register(Dependency::previous_frame(&shot.render, &shot.sim).unwrap())
        .unwrap()
        .signature();

    for n in 1..=4 {
        assert!(graph.is_blocked(&shot.render_frame(n)));
    }

    let result = graph.satisfy_dependents(&Completion::Frame(shot.sim_frame(2)));
    assert!(result.satisfied.is_empty());
    assert_eq!(result.unlocked_frames, vec![(sig, 2)]);
    assert!(!graph.is_blocked(&shot.render_frame(2)));
    assert!(graph.is_blocked(&shot.render_frame(1)));
    assert!(graph.is_blocked(&shot.render_frame(3)));

    let again = graph.satisfy_dependents(&Completion::Frame(shot.sim_frame(2)));
    assert!(again.is_empty());
    assert_eq!(graph.active_count(), 1);
}

#[test]
fn test_previous_frame_releases_ranges_and_whole_layer() {
    let shot = Shot::new("sh180");
    let graph = DependencyGraph::new();
    graph
        .register(Dependency::previous_frame(&shot.render, &shot.sim).unwrap())
        .unwrap();

    let result = graph.satisfy_dependents(&Completion::Frames {
        layer: shot.sim.clone(),
        frames: FrameSet::parse("1-3").unwrap(),
    });
    assert_eq!(result.unlocked_frames.len(), 3);
    assert!(!graph.is_blocked(&shot.render_frame(3)));
    assert!(graph.is_blocked(&shot.render_frame(4)));

    let result = graph.satisfy_dependents(&Completion::Layer(shot.sim.clone()));
    assert_eq!(result.satisfied.len(), 1);
    assert!(!graph.is_blocked(&shot.render_frame(40)));
}

#[test]
fn test_depend_count_sums_active_edges() {
    let a = Shot::new("sh190");
    let b = Shot::new("sh200");
    let graph = DependencyGraph::new();
    graph.register(Dependency::job_on_job(&b.job, &a.job).unwrap()).unwrap();
    graph
        .register(Dependency::layer_on_layer(&b.render, &b.sim).unwrap())
        .unwrap();

    assert_eq!(graph.depend_count(&b.render_frame(1)), 2);
    assert_eq!(graph.depend_count(&b.sim_frame(1)), 1);
}

// ============================================================================
// QUERIES
// ============================================================================

#[test]
fn test_queries_by_node_and_target() {
    let a = Shot::new("sh210");
    let b = Shot::new("sh220");
    let graph = DependencyGraph::new();
    graph
        .register(Dependency::layer_on_layer(&b.render, &a.sim).unwrap())
        .unwrap();
    graph
        .register(Dependency::layer_on_layer(&a.render, &a.sim).unwrap())
        .unwrap();

    assert_eq!(graph.what_depends_on(DependNode::Layer(a.sim.id), None).len(), 2);
    assert_eq!(
        graph
            .what_depends_on(DependNode::Job(a.job.id), Some(DependTarget::External))
            .len(),
        1
    );
    assert_eq!(graph.what_this_depends_on(DependNode::Job(b.job.id), None).len(), 1);
    assert!(graph
        .what_this_depends_on(DependNode::Layer(a.sim.id), None)
        .is_empty());
}

#[test]
fn test_removed_edges_stop_blocking() {
    let a = Shot::new("sh230");
    let b = Shot::new("sh240");
    let graph = DependencyGraph::new();
    let sig = graph
        .register(Dependency::job_on_job(&b.job, &a.job).unwrap())
        .unwrap()
        .signature();

    assert!(graph.remove(sig).is_some());
    assert!(graph.is_empty());
    assert!(!graph.is_blocked(&b.sim_frame(1)));
}

#[test]
fn test_dependencies_serialize_as_tagged_edges() {
    let a = Shot::new("sh250");
    let b = Shot::new("sh260");
    let dep = Dependency::layer_on_frame(&b.render, &a.sim_frame(7)).unwrap();

    let json = serde_json::to_value(&dep).unwrap();
    assert_eq!(json["edge"]["kind"], "layer_on_frame");
    let back: Dependency = serde_json::from_value(json).unwrap();
    assert_eq!(back.signature(), dep.signature());
}
