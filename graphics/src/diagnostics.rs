//! Read-only memory and size report for a HUD or log.

use std::fmt;
use std::sync::Arc;

use crate::cache::ModelCache;
use crate::model::{GpuModel, ModelStats};
use crate::resources::{BufferPool, PoolStats};

/// One cached model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLine {
    pub key: String,
    pub name: String,
    pub pending: bool,
    pub stats: ModelStats,
}

/// Snapshot of cache and pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsReport {
    pub active: usize,
    pub pending: usize,
    pub ram_bytes: u64,
    pub vram_bytes: u64,
    pub pool: PoolStats,
    /// Sorted by key.
    pub models: Vec<ModelLine>,
}

impl DiagnosticsReport {
    pub fn collect(cache: &ModelCache<Arc<GpuModel>>, pool: &BufferPool) -> Self {
        fn line(key: &str, model: &GpuModel, pending: bool) -> ModelLine {
            ModelLine {
                key: key.to_string(),
                name: model.name().to_string(),
                pending,
                stats: model.stats(),
            }
        }

        let mut models = Vec::new();
        cache.for_each_entry(|key, model, pending| models.push(line(key, model, pending)));
        models.sort_by(|a, b| a.key.cmp(&b.key));

        Self {
            active: models.iter().filter(|m| !m.pending).count(),
            pending: models.iter().filter(|m| m.pending).count(),
            ram_bytes: models.iter().map(|m| m.stats.ram_bytes).sum(),
            vram_bytes: models.iter().map(|m| m.stats.vram_bytes).sum(),
            pool: pool.stats(),
            models,
        }
    }
}

/// Format a byte count as B, KB, MB or GB.
pub fn fmt_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value >= KB * KB * KB {
        format!("{:.2} GB", value / (KB * KB * KB))
    } else if value >= KB * KB {
        format!("{:.2} MB", value / (KB * KB))
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}

/// Format a count with K or M suffixes.
pub fn fmt_count(count: u64) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "models: {} active, {} pending release",
            self.active, self.pending
        )?;
        writeln!(
            f,
            "memory: {} RAM, {} VRAM",
            fmt_bytes(self.ram_bytes),
            fmt_bytes(self.vram_bytes)
        )?;
        writeln!(
            f,
            "pool: {} buffers ({}), {} staging ({})",
            self.pool.live_buffers,
            fmt_bytes(self.pool.device_bytes),
            self.pool.staging_buffers,
            fmt_bytes(self.pool.staging_bytes)
        )?;
        for model in &self.models {
            let s = &model.stats;
            writeln!(
                f,
                "  {}{} [{}]: {} RAM, {} VRAM, {} verts, {} faces, {} bones, {} submeshes, {} materials, {} morphs, {} uv morphs",
                model.key,
                if model.pending { " (pending)" } else { "" },
                model.name,
                fmt_bytes(s.ram_bytes),
                fmt_bytes(s.vram_bytes),
                fmt_count(s.vertices as u64),
                fmt_count(s.faces as u64),
                s.bones,
                s.submeshes,
                s.materials,
                s.vertex_morphs,
                s.uv_morphs
            )?;
        }
        Ok(())
    }
}
