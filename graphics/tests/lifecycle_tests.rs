//! Model lifecycle: two-phase loading, background workers, the two-tier
//! cache and the diagnostics report built on top of them.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestContext, identity_bones, strip_model};
use toonskin_core::model::{ModelAsset, SkinnedVertex};
use toonskin_graphics::{
    AnimationFrame, CacheConfig, DiagnosticsReport, DisposeError, GpuModel, LoadError,
    LoadFailureKind, LoadWorker, ModelLoader, RuntimeConfig, SkinningPass,
};

const SECOND: Duration = Duration::from_secs(1);

/// 200 vertices rigidly bound to bone 0 of a 10-bone skeleton.
fn rigid_model() -> ModelAsset {
    let vertices: Vec<SkinnedVertex> = (0..200)
        .map(|i| {
            let t = i as f32 / 200.0;
            SkinnedVertex::rigid([t, t * t, 1.0 - t], [0.0, 0.0, 1.0], 0)
        })
        .collect();
    let indices = (0..198).flat_map(|i| [i, i + 1, i + 2]).collect();
    ModelAsset::builder("rigid")
        .bone_count(10)
        .submesh(&vertices, indices, 0)
        .build()
        .unwrap()
}

fn dispose(ctx: &TestContext) -> impl FnMut(&str, Arc<GpuModel>) -> Result<(), DisposeError> + '_ {
    move |_: &str, model: Arc<GpuModel>| ctx.pool.dispose(model)
}

#[test]
fn test_rest_pose_with_only_bone_zero_uploaded() {
    let ctx = TestContext::new();
    let asset = rigid_model();
    let model = ctx.load(asset.clone());

    let bones = identity_bones(1);
    let mut sink = common::RecordingSink::with_readback();
    SkinningPass::new(&ctx.engine)
        .run(&model, &AnimationFrame::animating(&bones), &mut sink)
        .unwrap();

    let posed = sink.draws[0].host.as_ref().unwrap();
    common::assert_close(&posed.positions, &asset.positions);
    common::assert_close(&posed.normals, &asset.normals);
}

#[test]
fn test_pending_hit_returns_same_model_without_reload() {
    let ctx = TestContext::new();
    let cache = ctx.cache(CacheConfig::default());
    let model = ctx.load(strip_model("a", 32, 2));
    cache.put("a", model.clone());
    let allocations = ctx.pool.stats().allocations;

    ctx.clock.advance(61 * SECOND);
    let report = cache.tick(dispose(&ctx));
    assert_eq!(report.idled, 1);
    assert!(cache.is_pending("a"));

    ctx.clock.advance(30 * SECOND);
    let hit = cache.get("a").unwrap();
    assert!(Arc::ptr_eq(&hit, &model));
    assert!(!cache.is_pending("a"));
    assert_eq!(cache.stats().promotions, 1);
    assert_eq!(ctx.pool.stats().allocations, allocations);

    // The promotion refreshed the access time: not idle yet.
    ctx.clock.advance(59 * SECOND);
    assert_eq!(cache.tick(dispose(&ctx)).idled, 0);
}

#[test]
fn test_expired_model_is_released() {
    let ctx = TestContext::new();
    let cache = ctx.cache(CacheConfig::default());
    cache.put("a", ctx.load(strip_model("a", 32, 2)));
    let baseline = 1; // the engine's placeholder buffer

    ctx.clock.advance(61 * SECOND);
    cache.tick(dispose(&ctx));
    ctx.clock.advance(61 * SECOND);
    let report = cache.tick(dispose(&ctx));

    assert_eq!(report.expired, 1);
    assert!(cache.get("a").is_none());
    assert_eq!(ctx.pool.stats().live_buffers, baseline);
    assert_eq!(ctx.pool.stats().staging_buffers, 0);
}

#[test]
fn test_capacity_evicts_idle_model_only() {
    let ctx = TestContext::new();
    let cache = ctx.cache(CacheConfig::default().with_capacity(1));

    cache.put("a", ctx.load(strip_model("a", 32, 2)));
    ctx.clock.advance(30 * SECOND);
    cache.put("b", ctx.load(strip_model("b", 32, 2)));

    // Both active: over capacity, but active entries are never evicted.
    let report = cache.tick(dispose(&ctx));
    assert_eq!(report.evicted, 0);
    assert_eq!(cache.len(), 2);

    ctx.clock.advance(31 * SECOND);
    let report = cache.tick(dispose(&ctx));
    assert_eq!(report.idled, 1);
    assert_eq!(report.evicted, 1);
    assert!(!cache.contains("a"));
    assert!(cache.contains("b"));
    assert!(!cache.is_pending("b"));
    assert!(cache.len() <= 1);
}

#[test]
fn test_still_referenced_model_is_reported_not_leaked() {
    let ctx = TestContext::new();
    let cache = ctx.cache(CacheConfig::default());
    let model = ctx.load(strip_model("a", 32, 2));
    cache.put("a", model.clone());

    assert!(cache.remove("a", dispose(&ctx)));
    assert_eq!(cache.stats().dispose_failures, 1);
    assert!(!cache.contains("a"));

    // The remaining holder releases the buffers when it lets go.
    drop(model);
    assert_eq!(ctx.pool.stats().live_buffers, 1);
}

#[test]
fn test_phase_two_rolls_back_on_allocation_failure() {
    // Measure what phase 1 needs on an unconstrained device.
    let probe = TestContext::new();
    let static_bytes = probe
        .loader
        .prepare_asset(strip_model("a", 32, 2), None)
        .unwrap()
        .device_bytes();

    // Room for the placeholder, the statics, and the first submesh's
    // positions and normals; its UVs do not fit.
    let output = 16 * 12;
    let ctx = TestContext::with_memory_budget(16 + static_bytes + 2 * output + 8);
    let prepared = ctx
        .loader
        .prepare_asset(strip_model("a", 32, 2), None)
        .unwrap();
    assert_eq!(ctx.pool.stats().live_buffers, 1 + 7);

    let err = ctx.loader.finalize(prepared).unwrap_err();
    assert!(matches!(err, LoadError::DeviceAllocation { .. }));
    assert_eq!(err.kind(), LoadFailureKind::DeviceAllocationFailure);

    let stats = ctx.pool.stats();
    assert_eq!(stats.live_buffers, 1);
    assert_eq!(stats.device_bytes, 16);
    assert_eq!(stats.staging_buffers, 0);
    assert_eq!(ctx.device.buffer_count(), 1);
}

#[test]
fn test_phase_two_off_render_thread_is_refused() {
    let ctx = TestContext::new();
    let prepared = ctx
        .loader
        .prepare_asset(strip_model("a", 32, 2), None)
        .unwrap();

    let loader = ctx.loader.clone();
    let err = std::thread::spawn(move || loader.finalize(prepared).map(|_| ()))
        .join()
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, LoadError::NotRenderThread));
    assert_eq!(ctx.pool.stats().live_buffers, 1);
}

#[test]
fn test_worker_prepares_off_thread() {
    let ctx = TestContext::new();
    let worker = LoadWorker::new(ctx.loader.clone(), 2).unwrap();

    let tickets: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| worker.submit_asset(strip_model(name, 32, 2), Some(4)).unwrap())
        .collect();

    let cache = ctx.cache(CacheConfig::default());
    for (name, ticket) in ["a", "b", "c"].iter().zip(tickets) {
        let prepared = ticket.recv().unwrap();
        assert_eq!(prepared.name(), *name);
        let model = ctx.loader.finalize(prepared).unwrap();
        assert_eq!(model.layer_count(), 4);
        cache.put(*name, Arc::new(model));
    }
    assert_eq!(cache.len(), 3);
}

#[test]
fn test_worker_thread_count_follows_config() {
    let ctx = TestContext::new();
    let config = RuntimeConfig::from_toml_str(
        r#"
        [loader]
        worker_threads = 3
        default_layer_count = 5
        "#,
    )
    .unwrap();
    let loader = Arc::new(ModelLoader::with_config(ctx.pool.clone(), config.loader));

    let worker = LoadWorker::from_config(loader).unwrap();
    assert_eq!(worker.thread_count(), 3);

    let prepared = worker
        .submit_asset(strip_model("a", 32, 2), None)
        .unwrap()
        .recv()
        .unwrap();
    assert_eq!(ctx.loader.finalize(prepared).unwrap().layer_count(), 5);
}

#[test]
fn test_worker_reports_load_failure() {
    let ctx = TestContext::new();
    let worker = LoadWorker::new(ctx.loader.clone(), 1).unwrap();

    let ticket = worker
        .submit(toonskin_graphics::LoadRequest::new("/nonexistent/hero.glb"))
        .unwrap();
    let err = ticket.recv().unwrap_err();
    assert!(matches!(err, LoadError::Io { .. }));
    assert_eq!(err.kind(), LoadFailureKind::LoadFailure);
    assert_eq!(ctx.pool.stats().allocations, 1);
}

#[test]
fn test_dropped_ticket_releases_its_result() {
    let ctx = TestContext::new();
    {
        let worker = LoadWorker::new(ctx.loader.clone(), 1).unwrap();
        let ticket = worker
            .submit_asset(strip_model("a", 32, 2), None)
            .unwrap();
        drop(ticket);
        // Dropping the worker joins its threads.
    }
    assert_eq!(ctx.pool.stats().live_buffers, 1);
}

#[test]
fn test_diagnostics_report() {
    let ctx = TestContext::new();
    let cache = ctx.cache(CacheConfig::default());
    let a = ctx.load(strip_model("alpha", 32, 2));
    let b = ctx.load(strip_model("beta", 64, 4));
    let vram = a.stats().vram_bytes + b.stats().vram_bytes;
    cache.put("a", a);
    ctx.clock.advance(61 * SECOND);
    cache.put("b", b);
    cache.tick(dispose(&ctx));

    let report = DiagnosticsReport::collect(&cache, &ctx.pool);
    assert_eq!(report.active, 1);
    assert_eq!(report.pending, 1);
    assert_eq!(report.vram_bytes, vram);
    assert_eq!(report.models[0].key, "a");
    assert!(report.models[0].pending);
    assert_eq!(report.models[1].stats.vertices, 64);
    assert_eq!(report.models[1].stats.bones, 4);

    let text = report.to_string();
    assert!(text.contains("1 active, 1 pending release"));
    assert!(text.contains("a (pending) [alpha]"));

    // Collecting is read-only.
    assert_eq!(cache.stats().promotions, 0);
    assert_eq!(cache.len(), 2);
}
