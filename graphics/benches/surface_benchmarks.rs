use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use vellum_graphics::{
    BackendType, BlurAmount, BlurType, Color, FatalPolicy, GraphicsInstance, InstanceParameters,
    Rect, RenderSurface, SubmissionCollector, SurfaceDescriptor,
};

fn instance() -> Arc<GraphicsInstance> {
    GraphicsInstance::new(
        InstanceParameters::new()
            .with_backend(BackendType::Software)
            .with_fatal_policy(FatalPolicy::Continue),
    )
    .unwrap()
}

fn surface(instance: &Arc<GraphicsInstance>, label: String) -> Arc<RenderSurface> {
    instance
        .create_surface(&SurfaceDescriptor::new(1, 1).with_label(label))
        .unwrap()
}

fn record(surface: &RenderSurface, sources: &[Arc<RenderSurface>]) {
    let rect = Rect::new(0.0, 0.0, 1.0, 1.0);
    surface.begin_render().unwrap();
    for source in sources {
        surface
            .draw_rectangle(rect, Color::WHITE, Some(source.into()))
            .unwrap();
    }
    surface.end_render(BlurAmount::NONE, BlurType::Gaussian).unwrap();
}

/// Commit then abort, so every iteration walks the whole graph again.
fn bench_commit(c: &mut Criterion, name: &str, root: &Arc<RenderSurface>) {
    let info = root.active_dependency_info();
    c.bench_function(name, |b| {
        b.iter(|| {
            let mut collector = SubmissionCollector::new();
            root.commit_render(info, &mut collector).unwrap();
            black_box(collector.len());
            root.abort_render(info);
        });
    });
}

// ---------------------------------------------------------------------------
// Commit walk
// ---------------------------------------------------------------------------

fn bench_commit_wide(c: &mut Criterion) {
    let instance = instance();
    let leaves: Vec<_> = (0..64).map(|i| surface(&instance, format!("leaf_{i}"))).collect();
    for leaf in &leaves {
        record(leaf, &[]);
    }
    let root = surface(&instance, "root".into());
    record(&root, &leaves);

    bench_commit(c, "commit_wide_64_leaves", &root);
}

fn bench_commit_deep(c: &mut Criterion) {
    let instance = instance();
    let mut chain: Vec<Arc<RenderSurface>> = Vec::new();
    for i in 0..64 {
        let node = surface(&instance, format!("node_{i}"));
        record(&node, &chain[chain.len().saturating_sub(1)..]);
        chain.push(node);
    }

    bench_commit(c, "commit_chain_64_deep", &chain[63]);
}

fn bench_commit_diamonds(c: &mut Criterion) {
    let instance = instance();
    let mut layer = vec![surface(&instance, "base".into())];
    record(&layer[0], &[]);
    for depth in 0..8 {
        let next: Vec<_> = (0..4)
            .map(|i| surface(&instance, format!("layer_{depth}_{i}")))
            .collect();
        for node in &next {
            record(node, &layer);
        }
        layer = next;
    }
    let root = surface(&instance, "root".into());
    record(&root, &layer);

    bench_commit(c, "commit_layered_8x4", &root);
}

criterion_group!(
    benches,
    bench_commit_wide,
    bench_commit_deep,
    bench_commit_diamonds
);
criterion_main!(benches);
