//! Integration tests for dependency tracking and the commitment protocol.
//!
//! Surfaces that sample each other form a graph per frame. Committing a root
//! must submit every reached generation exactly once, dependencies first.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rstest::rstest;

use common::{Backend, TestContext, pixel, record_clear, record_sampling};
use vellum_graphics::backend::{DescriptorLayout, GpuDescriptorSet};
use vellum_graphics::{
    BlurAmount, BlurType, Color, DescriptorPool, GraphicsError, Rect, ReportSeverity,
    SamplerDescriptor, SoftwareParameters, SubmissionCollector,
};

fn order(collector: &SubmissionCollector) -> Vec<&str> {
    collector.labels().collect()
}

// ============================================================================
// Ordering
// ============================================================================

/// S2 samples S1: S1's work is submitted first and S2 sees its output.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_sampled_surface_submitted_first(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let s1 = ctx.surface("s1", 32, 32, Color::RED);
    let s2 = ctx.surface("s2", 16, 16, Color::TRANSPARENT);

    record_clear(&s1);
    record_sampling(&s2, &[&s1]);

    let deps = s2.dependencies(s2.active_dependency_info());
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].surface_id(), s1.id());
    assert_eq!(deps[0].info, s1.active_dependency_info());

    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&s2).unwrap();
    assert_eq!(ticket.submission_order(), ["s1", "s2"]);
    assert!(schedule.finish(&ticket, Some(Duration::from_secs(5))).unwrap());

    assert!(s1.is_ready());
    assert!(s2.is_ready());
    let pixels = s2.read_pixels(0).unwrap();
    assert_eq!(pixel(&pixels, 16, 8, 8), [255, 0, 0, 255]);
}

/// Diamond: D samples B and C, both sample A. A is collected once, before B and C.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_diamond_collects_shared_dependency_once(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let a = ctx.surface("a", 8, 8, Color::GREEN);
    let b = ctx.surface("b", 8, 8, Color::TRANSPARENT);
    let c = ctx.surface("c", 8, 8, Color::TRANSPARENT);
    let d = ctx.surface("d", 8, 8, Color::TRANSPARENT);

    for frame in 0..2 {
        record_clear(&a);
        record_sampling(&b, &[&a]);
        record_sampling(&c, &[&a]);
        record_sampling(&d, &[&b, &c]);

        let mut collector = SubmissionCollector::new();
        d.commit_render(d.active_dependency_info(), &mut collector)
            .unwrap();
        assert_eq!(order(&collector), ["a", "b", "c", "d"], "frame {frame}");
        assert_eq!(collector.submit_infos().len(), 8);

        // Committing again in the same frame adds nothing.
        let mut again = SubmissionCollector::new();
        d.commit_render(d.active_dependency_info(), &mut again)
            .unwrap();
        assert!(again.is_empty());

        ctx.instance
            .queue()
            .submit(&collector.submit_infos(), None)
            .unwrap();
        d.confirm_submission(d.active_dependency_info());
        ctx.instance.wait_idle().unwrap();
        assert!(d.wait_until_ready(Some(Duration::from_secs(5))));
        d.confirm_finished(d.active_dependency_info());
        assert!(a.is_ready() && b.is_ready() && c.is_ready());
    }
}

/// Every dependency precedes its dependents in a larger random-looking DAG.
#[test]
fn test_wide_dag_topological_order() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let surfaces: Vec<_> = (0..12)
        .map(|i| ctx.surface(&format!("n{i}"), 4, 4, Color::BLUE))
        .collect();
    // Node i samples every j < i with (i + j) % 3 == 0.
    let edges = |i: usize| (0..i).filter(move |j| (i + j) % 3 == 0);

    for (i, surface) in surfaces.iter().enumerate() {
        let sources: Vec<_> = edges(i).map(|j| &surfaces[j]).collect();
        record_sampling(surface, &sources);
    }
    let root = &surfaces[11];
    let mut collector = SubmissionCollector::new();
    root.commit_render(root.active_dependency_info(), &mut collector)
        .unwrap();

    for (i, surface) in surfaces.iter().enumerate() {
        let Some(position) = collector.position(surface.id()) else {
            continue;
        };
        for j in edges(i) {
            let dependency = collector
                .position(surfaces[j].id())
                .expect("reachable dependency collected");
            assert!(dependency < position, "n{j} must precede n{i}");
        }
    }
    let labels = order(&collector);
    let mut unique = labels.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), labels.len());

    // Exactly the nodes reachable from the root, each once.
    let mut reachable = HashSet::from([11]);
    let mut pending = vec![11];
    while let Some(i) = pending.pop() {
        for j in edges(i) {
            if reachable.insert(j) {
                pending.push(j);
            }
        }
    }
    assert_eq!(collector.len(), reachable.len());
    for (i, surface) in surfaces.iter().enumerate() {
        assert_eq!(
            collector.position(surface.id()).is_some(),
            reachable.contains(&i),
            "n{i}"
        );
    }

    ctx.instance
        .queue()
        .submit(&collector.submit_infos(), None)
        .unwrap();
}

/// A dependency that is already sampleable is waited on but not resubmitted.
#[test]
fn test_ready_dependency_not_resubmitted() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let s1 = ctx.surface("s1", 8, 8, Color::RED);
    let s2 = ctx.surface("s2", 8, 8, Color::TRANSPARENT);
    let mut schedule = ctx.instance.create_frame_schedule();

    record_clear(&s1);
    let ticket = schedule.submit(&s1).unwrap();
    schedule.finish(&ticket, None).unwrap();
    assert!(s1.is_ready());

    record_sampling(&s2, &[&s1]);
    let ticket = schedule.submit(&s2).unwrap();
    assert_eq!(ticket.submission_order(), ["s2"]);
    schedule.finish(&ticket, None).unwrap();
    assert!(s2.is_ready());
}

// ============================================================================
// Failure handling
// ============================================================================

#[test]
fn test_abort_restores_commit_state() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let a = ctx.surface("a", 8, 8, Color::RED);
    let b = ctx.surface("b", 8, 8, Color::TRANSPARENT);
    let c = ctx.surface("c", 8, 8, Color::TRANSPARENT);
    record_clear(&a);
    record_sampling(&b, &[&a]);
    record_sampling(&c, &[&a, &b]);

    let info = c.active_dependency_info();
    let mut first = SubmissionCollector::new();
    c.commit_render(info, &mut first).unwrap();
    assert_eq!(order(&first), ["a", "b", "c"]);

    c.abort_render(info);

    let mut retry = SubmissionCollector::new();
    c.commit_render(info, &mut retry).unwrap();
    assert_eq!(order(&retry), order(&first));

    ctx.instance
        .queue()
        .submit(&retry.submit_infos(), None)
        .unwrap();
    c.confirm_submission(info);
    c.confirm_finished(info);
    assert!(a.is_ready() && b.is_ready() && c.is_ready());
}

#[test]
fn test_cycle_detected() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let a = ctx.surface("a", 8, 8, Color::RED);
    let b = ctx.surface("b", 8, 8, Color::GREEN);
    let full = Rect::new(0.0, 0.0, 8.0, 8.0);

    a.begin_render().unwrap();
    b.begin_render().unwrap();
    a.draw_rectangle(full, Color::WHITE, Some((&b).into()))
        .unwrap();
    b.draw_rectangle(full, Color::WHITE, Some((&a).into()))
        .unwrap();
    a.end_render(BlurAmount::NONE, BlurType::Gaussian).unwrap();
    b.end_render(BlurAmount::NONE, BlurType::Gaussian).unwrap();

    let mut collector = SubmissionCollector::new();
    let result = a.commit_render(a.active_dependency_info(), &mut collector);
    assert!(matches!(result, Err(GraphicsError::DependencyCycle { .. })));
    assert!(collector.is_empty());

    // The failed walk left no requests behind: the same failure repeats.
    let result = b.commit_render(b.active_dependency_info(), &mut collector);
    assert!(matches!(result, Err(GraphicsError::DependencyCycle { .. })));

    // Sampling edges do not keep the surfaces alive.
    let (weak_a, weak_b) = (Arc::downgrade(&a), Arc::downgrade(&b));
    drop(a);
    drop(b);
    assert!(weak_a.upgrade().is_none());
    assert!(weak_b.upgrade().is_none());
}

#[test]
fn test_commit_rejects_dropped_dependency() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let s1 = ctx.surface("s1", 8, 8, Color::RED);
    let s2 = ctx.surface("s2", 8, 8, Color::TRANSPARENT);
    record_clear(&s1);
    record_sampling(&s2, &[&s1]);

    let deps = s2.dependencies(s2.active_dependency_info());
    drop(s1);
    assert!(deps[0].surface().is_none());

    let mut collector = SubmissionCollector::new();
    let result = s2.commit_render(s2.active_dependency_info(), &mut collector);
    assert!(matches!(result, Err(GraphicsError::InvalidState(_))));
    assert!(collector.is_empty());
}

#[test]
fn test_commit_rejects_recording_dependency() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let s1 = ctx.surface("s1", 8, 8, Color::RED);
    let s2 = ctx.surface("s2", 8, 8, Color::TRANSPARENT);

    s1.begin_render().unwrap();
    record_sampling(&s2, &[&s1]);

    let mut collector = SubmissionCollector::new();
    let result = s2.commit_render(s2.active_dependency_info(), &mut collector);
    assert!(matches!(result, Err(GraphicsError::InvalidState(_))));
    assert!(collector.is_empty());

    s1.end_render(BlurAmount::NONE, BlurType::Gaussian).unwrap();
    s2.commit_render(s2.active_dependency_info(), &mut collector)
        .unwrap();
    assert_eq!(order(&collector), ["s1", "s2"]);
    ctx.instance
        .queue()
        .submit(&collector.submit_infos(), None)
        .unwrap();
}

#[test]
fn test_commit_failure_reported_by_schedule() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let surface = ctx.surface("recording", 8, 8, Color::RED);
    surface.begin_render().unwrap();

    let mut schedule = ctx.instance.create_frame_schedule();
    assert!(schedule.submit(&surface).is_err());
    assert_eq!(
        ctx.instance
            .reporter()
            .count(ReportSeverity::NonCriticalError),
        1
    );
    assert_eq!(schedule.in_flight(), 0);
    surface
        .end_render(BlurAmount::NONE, BlurType::Gaussian)
        .unwrap();
}

#[test]
fn test_fence_failure_leaves_graph_uncommitted() {
    let (ctx, faults) = TestContext::faulty();
    let s1 = ctx.surface("s1", 8, 8, Color::RED);
    let s2 = ctx.surface("s2", 8, 8, Color::TRANSPARENT);
    record_clear(&s1);
    record_sampling(&s2, &[&s1]);
    let mut schedule = ctx.instance.create_frame_schedule();

    faults.fence_creation.store(true, Ordering::SeqCst);
    let result = schedule.submit(&s2);
    assert!(matches!(result, Err(GraphicsError::ResourceCreationFailed(_))));
    assert_eq!(
        ctx.instance.reporter().count(ReportSeverity::CriticalError),
        1
    );
    assert_eq!(schedule.in_flight(), 0);

    faults.fence_creation.store(false, Ordering::SeqCst);
    let ticket = schedule.submit(&s2).unwrap();
    assert_eq!(ticket.submission_order(), ["s1", "s2"]);
    assert!(schedule.finish(&ticket, None).unwrap());
    assert!(s1.is_ready() && s2.is_ready());
}

#[test]
fn test_rejected_submission_rolls_back() {
    let (ctx, faults) = TestContext::faulty();
    let s1 = ctx.surface("s1", 8, 8, Color::RED);
    let s2 = ctx.surface("s2", 8, 8, Color::TRANSPARENT);
    record_clear(&s1);
    record_sampling(&s2, &[&s1]);
    let info = s2.active_dependency_info();
    let mut schedule = ctx.instance.create_frame_schedule();

    faults.submission.store(true, Ordering::SeqCst);
    let result = schedule.submit(&s2);
    assert!(matches!(result, Err(GraphicsError::SubmissionFailed(_))));
    assert_eq!(
        ctx.instance
            .reporter()
            .count(ReportSeverity::NonCriticalError),
        1
    );
    assert_eq!(schedule.in_flight(), 0);
    assert!(!s2.wait_until_ready(Some(Duration::ZERO)));

    // Every request was withdrawn: a new commit collects the whole graph.
    let mut collector = SubmissionCollector::new();
    s2.commit_render(info, &mut collector).unwrap();
    assert_eq!(order(&collector), ["s1", "s2"]);
    s2.abort_render(info);

    faults.submission.store(false, Ordering::SeqCst);
    let ticket = schedule.submit(&s2).unwrap();
    assert_eq!(ticket.submission_order(), ["s1", "s2"]);
    assert!(schedule.finish(&ticket, None).unwrap());
    assert!(s2.is_ready());
}

// ============================================================================
// Device loss
// ============================================================================

#[test]
fn test_device_loss_while_confirming_poisons_root() {
    let (ctx, faults) = TestContext::faulty();
    let surface = ctx.surface("lost", 8, 8, Color::RED);
    record_clear(&surface);
    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();

    faults.device_lost.store(true, Ordering::SeqCst);
    assert!(schedule.finish(&ticket, None).unwrap());
    assert!(surface.is_poisoned());
    assert_eq!(ctx.instance.reporter().count(ReportSeverity::DeviceLost), 1);
    faults.device_lost.store(false, Ordering::SeqCst);
}

#[test]
fn test_device_loss_in_readiness_query_is_reported() {
    let (ctx, faults) = TestContext::faulty();
    let polled = ctx.surface("polled", 8, 8, Color::RED);
    let waited = ctx.surface("waited", 8, 8, Color::RED);
    let mut schedule = ctx.instance.create_frame_schedule();
    record_clear(&polled);
    record_clear(&waited);
    schedule.submit(&polled).unwrap();
    schedule.submit(&waited).unwrap();

    faults.device_lost.store(true, Ordering::SeqCst);
    assert!(!polled.is_ready());
    assert!(polled.is_poisoned());
    assert!(!waited.wait_until_ready(Some(Duration::from_secs(1))));
    assert!(waited.is_poisoned());
    assert_eq!(ctx.instance.reporter().count(ReportSeverity::DeviceLost), 2);
    faults.device_lost.store(false, Ordering::SeqCst);
}

#[test]
fn test_device_loss_during_resize_is_reported() {
    let (ctx, faults) = TestContext::faulty();
    let surface = ctx.surface("resized", 8, 8, Color::RED);
    record_clear(&surface);
    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();
    assert!(schedule.finish(&ticket, None).unwrap());

    faults.device_lost.store(true, Ordering::SeqCst);
    let result = surface.resize(vellum_graphics::Extent2d::new(16, 16));
    assert!(matches!(result, Err(GraphicsError::DeviceLost)));
    assert!(surface.is_poisoned());
    assert_eq!(ctx.instance.reporter().count(ReportSeverity::DeviceLost), 1);
    faults.device_lost.store(false, Ordering::SeqCst);
}

// ============================================================================
// Descriptor allocation
// ============================================================================

/// Pool wrapper counting allocations.
struct CountingPool {
    inner: Arc<dyn DescriptorPool>,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl DescriptorPool for CountingPool {
    fn allocate(&self, layout: DescriptorLayout) -> Result<GpuDescriptorSet, GraphicsError> {
        let set = self.inner.allocate(layout)?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(set)
    }

    fn free(&self, set: GpuDescriptorSet) {
        self.freed.fetch_add(1, Ordering::Relaxed);
        self.inner.free(set);
    }
}

#[test]
fn test_descriptor_allocated_only_on_binding_change() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let pool = Arc::new(CountingPool {
        inner: ctx.instance.descriptor_pool(),
        allocated: AtomicUsize::new(0),
        freed: AtomicUsize::new(0),
    });
    ctx.instance.set_descriptor_pool(pool.clone());

    let surface = ctx.surface("binds", 8, 8, Color::BLACK);
    let texture = ctx.instance.create_texture(1, 1, &[0, 0, 255, 255]).unwrap();
    let full = Rect::new(0.0, 0.0, 8.0, 8.0);

    surface.begin_render().unwrap();
    surface.draw_rectangle(full, Color::WHITE, None).unwrap();
    surface.draw_rectangle(full, Color::WHITE, None).unwrap();
    assert_eq!(pool.allocated.load(Ordering::Relaxed), 1);

    surface
        .draw_rectangle(full, Color::WHITE, Some((&texture).into()))
        .unwrap();
    assert_eq!(pool.allocated.load(Ordering::Relaxed), 2);

    let vertices = [
        vellum_graphics::Vertex::new([0.0, 0.0], [0.0, 0.0]),
        vellum_graphics::Vertex::new([8.0, 0.0], [1.0, 0.0]),
        vellum_graphics::Vertex::new([0.0, 8.0], [0.0, 1.0]),
    ];
    surface
        .draw_triangles(
            &vertices,
            &[],
            Some((&texture).into()),
            &SamplerDescriptor::nearest(),
        )
        .unwrap();
    assert_eq!(pool.allocated.load(Ordering::Relaxed), 3);
    surface
        .end_render(BlurAmount::NONE, BlurType::Gaussian)
        .unwrap();
    assert_eq!(pool.freed.load(Ordering::Relaxed), 0);

    // The slot's sets are returned when it records its next generation.
    record_clear(&surface);
    assert_eq!(pool.freed.load(Ordering::Relaxed), 0);
    record_clear(&surface);
    assert_eq!(pool.freed.load(Ordering::Relaxed), 3);
}

#[test]
fn test_descriptor_exhaustion_fails_draw_only() {
    let params = Backend::Software
        .to_instance_parameters()
        .with_software(SoftwareParameters::default().with_descriptor_capacity(1));
    let ctx = TestContext::with_parameters(Backend::Software, params).unwrap();
    let surface = ctx.surface("starved", 8, 8, Color::BLACK);
    let texture = ctx.instance.create_texture(1, 1, &[255; 4]).unwrap();
    let full = Rect::new(0.0, 0.0, 8.0, 8.0);

    surface.begin_render().unwrap();
    surface.draw_rectangle(full, Color::WHITE, None).unwrap();
    let result = surface.draw_rectangle(full, Color::WHITE, Some((&texture).into()));
    assert!(matches!(
        result,
        Err(GraphicsError::DescriptorAllocationFailed(_))
    ));
    assert_eq!(
        ctx.instance
            .reporter()
            .count(ReportSeverity::NonCriticalError),
        1
    );
    assert!(!surface.is_poisoned());

    surface
        .end_render(BlurAmount::NONE, BlurType::Gaussian)
        .unwrap();
    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();
    assert!(schedule.finish(&ticket, None).unwrap());
}
