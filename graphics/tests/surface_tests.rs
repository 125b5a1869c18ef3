//! Integration tests for render surfaces: frame swapping, finalization and readback.
//!
//! Tests are parameterized using `rstest` to run against every available backend.
//! Backends that are not compiled in (or have no device) are skipped.
//!
//! ```bash
//! cargo test --test surface_tests
//! cargo test --test surface_tests --features vulkan-backend
//! ```

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::rstest;

use common::{Backend, TestContext, pixel, record_clear};
use vellum_graphics::{
    BlurAmount, BlurType, Color, Extent2d, GraphicsError, InstanceParameters, Rect,
    ReportSeverity, SampleCount, SamplerDescriptor, SoftwareParameters, SurfaceDescriptor,
    Vertex,
};

const RED: [u8; 4] = [255, 0, 0, 255];
const GREEN: [u8; 4] = [0, 255, 0, 255];

// ============================================================================
// Readiness
// ============================================================================

/// A fresh 256x256 surface renders one frame and becomes sampleable.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_single_frame_becomes_ready(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let surface = ctx.surface("single", 256, 256, Color::RED);
    assert!(surface.is_ready());

    record_clear(&surface);
    assert!(!surface.is_ready());

    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();
    assert_eq!(ticket.submission_order(), ["single"]);
    assert!(schedule.finish(&ticket, Some(Duration::from_secs(5))).unwrap());

    assert!(surface.is_ready());
    assert!(surface.wait_until_ready(Some(Duration::ZERO)));
    let pixels = surface.read_pixels(0).unwrap();
    assert_eq!(pixels.len(), 256 * 256 * 4);
    assert_eq!(pixel(&pixels, 256, 0, 0), RED);
    assert_eq!(pixel(&pixels, 256, 255, 255), RED);
}

#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_wait_until_ready_after_submit(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let surface = ctx.surface("waited", 32, 32, Color::BLUE);
    record_clear(&surface);

    // Never submitted: nothing will signal.
    assert!(!surface.wait_until_ready(None));

    let mut schedule = ctx.instance.create_frame_schedule();
    schedule.submit(&surface).unwrap();
    assert!(surface.wait_until_ready(None));
    assert_eq!(schedule.poll().unwrap(), 1);
    assert_eq!(schedule.in_flight(), 0);
}

// ============================================================================
// Blocking BeginRender
// ============================================================================

/// BeginRender on a slot whose previous generation is in flight blocks until it completes.
#[test]
fn test_begin_render_waits_for_previous_generation() {
    let ctx = TestContext::deferred(Duration::from_secs(10));
    let surface = ctx.surface("blocking", 16, 16, Color::GREEN);
    let mut schedule = ctx.instance.create_frame_schedule();

    // Slot 0 and slot 1 both get a generation in flight.
    record_clear(&surface);
    let first = schedule.submit(&surface).unwrap();
    record_clear(&surface);
    schedule.submit(&surface).unwrap();

    let instance = Arc::clone(&ctx.instance);
    let signaler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        instance.process_pending().unwrap()
    });

    // Back on slot 0: blocks until the signaler runs the queued work.
    surface.begin_render().unwrap();
    assert_eq!(signaler.join().unwrap(), 2);
    assert!(schedule.finish(&first, Some(Duration::ZERO)).unwrap());
    assert!(!surface.is_poisoned());

    surface
        .end_render(BlurAmount::NONE, BlurType::Gaussian)
        .unwrap();
    schedule.submit(&surface).unwrap();
    ctx.instance.process_pending().unwrap();
    assert!(surface.wait_until_ready(Some(Duration::from_secs(1))));
}

#[test]
fn test_begin_render_timeout_poisons_surface() {
    let ctx = TestContext::deferred(Duration::from_millis(20));
    let surface = ctx.surface("stalled", 16, 16, Color::GREEN);
    let mut schedule = ctx.instance.create_frame_schedule();

    record_clear(&surface);
    schedule.submit(&surface).unwrap();
    record_clear(&surface);
    schedule.submit(&surface).unwrap();

    assert!(matches!(
        surface.begin_render(),
        Err(GraphicsError::SynchronizationTimeout { .. })
    ));
    assert!(surface.is_poisoned());
    assert_eq!(ctx.instance.reporter().count(ReportSeverity::DeviceLost), 1);
    assert!(matches!(
        surface.begin_render(),
        Err(GraphicsError::InvalidState(_))
    ));

    // Let the queued work run so dropping the surface does not wait.
    ctx.instance.process_pending().unwrap();
}

// ============================================================================
// Finalization
// ============================================================================

/// A blur surface given a zero amount matches a plain surface pixel for pixel.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_zero_blur_matches_plain_surface(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let descriptor = SurfaceDescriptor::new(64, 48).with_clear_color(Color::BLACK);
    let plain = ctx
        .instance
        .create_surface(&descriptor.clone().with_label("plain"))
        .unwrap();
    let blurred = ctx
        .instance
        .create_surface(&descriptor.with_label("blurred").with_blur(true))
        .unwrap();

    let vertices = [
        Vertex::new([4.0, 4.0], [0.0, 0.0]).with_color(Color::RED),
        Vertex::new([60.0, 10.0], [0.0, 0.0]).with_color(Color::GREEN),
        Vertex::new([20.0, 44.0], [0.0, 0.0]).with_color(Color::BLUE),
    ];
    let mut schedule = ctx.instance.create_frame_schedule();
    for surface in [&plain, &blurred] {
        surface.begin_render().unwrap();
        surface
            .draw_triangles(&vertices, &[], None, &SamplerDescriptor::default())
            .unwrap();
        surface
            .end_render(BlurAmount::NONE, BlurType::Gaussian)
            .unwrap();
        let ticket = schedule.submit(surface).unwrap();
        schedule.finish(&ticket, None).unwrap();
    }

    assert_eq!(plain.read_pixels(0).unwrap(), blurred.read_pixels(0).unwrap());
}

#[test]
fn test_blur_spreads_coverage() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let surface = ctx
        .instance
        .create_surface(
            &SurfaceDescriptor::new(32, 32)
                .with_label("blur")
                .with_blur(true)
                .with_clear_color(Color::TRANSPARENT),
        )
        .unwrap();

    surface.begin_render().unwrap();
    surface
        .draw_rectangle(Rect::new(12.0, 12.0, 8.0, 8.0), Color::WHITE, None)
        .unwrap();
    surface
        .end_render(BlurAmount::uniform(6.0), BlurType::Box)
        .unwrap();
    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();
    schedule.finish(&ticket, None).unwrap();

    let pixels = surface.read_pixels(0).unwrap();
    let center = pixel(&pixels, 32, 16, 16);
    let edge = pixel(&pixels, 32, 10, 16);
    let far = pixel(&pixels, 32, 0, 0);
    assert!(center[3] > edge[3]);
    assert!(edge[3] > 0);
    assert_eq!(far[3], 0);
}

/// Non-power-of-two size with a coarse transfer granularity still yields a full mip chain.
#[test]
fn test_mip_chain_513x217() {
    let params = Backend::Software.to_instance_parameters().with_software(
        SoftwareParameters::default().with_transfer_granularity(Extent2d::new(8, 8)),
    );
    let ctx = TestContext::with_parameters(Backend::Software, params).unwrap();
    let surface = ctx.surface("odd", 513, 217, Color::GREEN);
    assert_eq!(surface.mip_level_count(), 10);

    record_clear(&surface);
    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();
    schedule.finish(&ticket, None).unwrap();

    let level1 = surface.read_pixels(1).unwrap();
    assert_eq!(level1.len(), 256 * 108 * 4);
    assert_eq!(pixel(&level1, 256, 255, 107), GREEN);

    let last = surface.read_pixels(9).unwrap();
    assert_eq!(last, GREEN.to_vec());
}

#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_multisampled_surface_resolves(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let surface = ctx
        .instance
        .create_surface(
            &SurfaceDescriptor::new(16, 16)
                .with_label("msaa")
                .with_samples(SampleCount::X4)
                .with_clear_color(Color::BLACK),
        )
        .unwrap();
    assert_eq!(surface.sample_count(), SampleCount::X4);

    surface.begin_render().unwrap();
    surface
        .draw_rectangle(Rect::new(0.0, 0.0, 8.0, 16.0), Color::WHITE, None)
        .unwrap();
    surface
        .end_render(BlurAmount::NONE, BlurType::Gaussian)
        .unwrap();
    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();
    schedule.finish(&ticket, None).unwrap();

    let pixels = surface.read_pixels(0).unwrap();
    assert_eq!(pixel(&pixels, 16, 2, 8), [255, 255, 255, 255]);
    assert_eq!(pixel(&pixels, 16, 12, 8), [0, 0, 0, 255]);
}

// ============================================================================
// Recording discipline
// ============================================================================

#[test]
fn test_self_draw_rejected() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let surface = ctx.surface("self", 8, 8, Color::BLACK);

    surface.begin_render().unwrap();
    let result = surface.draw_rectangle(
        Rect::new(0.0, 0.0, 8.0, 8.0),
        Color::WHITE,
        Some((&surface).into()),
    );
    assert!(matches!(result, Err(GraphicsError::InvalidState(_))));
    assert_eq!(ctx.instance.reporter().count(ReportSeverity::Warning), 1);
    assert!(surface.dependencies(surface.active_dependency_info()).is_empty());

    surface
        .end_render(BlurAmount::NONE, BlurType::Gaussian)
        .unwrap();
}

#[test]
fn test_draw_outside_recording_rejected() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let surface = ctx.surface("idle", 8, 8, Color::BLACK);
    let result = surface.draw_points(
        &[Vertex::new([1.0, 1.0], [0.0, 0.0])],
        None,
        &SamplerDescriptor::default(),
    );
    assert!(matches!(result, Err(GraphicsError::InvalidState(_))));
}

#[test]
fn test_lines_and_points_draw() {
    let ctx = TestContext::new(Backend::Software).unwrap();
    let surface = ctx.surface("strokes", 16, 16, Color::TRANSPARENT);

    surface.begin_render().unwrap();
    let line = [
        Vertex::new([0.0, 4.0], [0.0, 0.0]),
        Vertex::new([16.0, 4.0], [0.0, 0.0]),
    ];
    surface
        .draw_lines(&line, &[], None, &SamplerDescriptor::default(), 2.0)
        .unwrap();
    let point = [Vertex::new([12.0, 12.0], [0.0, 0.0]).with_point_size(4.0)];
    surface
        .draw_points(&point, None, &SamplerDescriptor::default())
        .unwrap();
    surface
        .end_render(BlurAmount::NONE, BlurType::Gaussian)
        .unwrap();

    let mut schedule = ctx.instance.create_frame_schedule();
    let ticket = schedule.submit(&surface).unwrap();
    schedule.finish(&ticket, None).unwrap();

    let pixels = surface.read_pixels(0).unwrap();
    assert_eq!(pixel(&pixels, 16, 8, 3)[3], 255);
    assert_eq!(pixel(&pixels, 16, 8, 4)[3], 255);
    assert_eq!(pixel(&pixels, 16, 8, 6)[3], 0);
    assert_eq!(pixel(&pixels, 16, 11, 11)[3], 255);
    assert_eq!(pixel(&pixels, 16, 8, 12)[3], 0);
}

// ============================================================================
// Resize
// ============================================================================

#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_resize_recreates_images(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let surface = ctx.surface("resized", 64, 64, Color::RED);
    record_clear(&surface);
    let mut schedule = ctx.instance.create_frame_schedule();
    schedule.submit(&surface).unwrap();

    // Same size is a no-op; a new size waits for the frame in flight.
    surface.resize(Extent2d::new(64, 64)).unwrap();
    surface.resize(Extent2d::new(32, 16)).unwrap();
    assert_eq!(surface.size(), Extent2d::new(32, 16));
    assert_eq!(surface.mip_level_count(), 6);
    assert!(surface.is_ready());

    record_clear(&surface);
    let ticket = schedule.submit(&surface).unwrap();
    schedule.finish(&ticket, None).unwrap();
    let pixels = surface.read_pixels(0).unwrap();
    assert_eq!(pixels.len(), 32 * 16 * 4);
    assert_eq!(pixel(&pixels, 32, 31, 15), RED);
}

#[test]
fn test_surface_uses_default_parameters() {
    let ctx = TestContext::with_parameters(
        Backend::Software,
        InstanceParameters::new()
            .with_backend(vellum_graphics::BackendType::Software)
            .with_fatal_policy(vellum_graphics::FatalPolicy::Continue),
    )
    .unwrap();
    let surface = ctx
        .instance
        .create_surface(&SurfaceDescriptor::default())
        .unwrap();
    assert_eq!(surface.size(), Extent2d::new(512, 512));
    assert_eq!(surface.sample_count(), SampleCount::X1);
    assert_eq!(ctx.instance.sync_timeout(), vellum_graphics::DEFAULT_SYNC_TIMEOUT);
}
