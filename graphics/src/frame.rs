//! Per-frame skinning pass and the renderer-facing interface.

use bitflags::bitflags;

use crate::error::GraphicsError;
use crate::model::{GpuModel, PosedVertices, SubmeshBuffers, SubmeshState};
use crate::profiling::profile_scope;
use crate::skinning::SkinningEngine;

/// Submeshes below this alpha are not drawn.
pub const MIN_VISIBLE_ALPHA: f32 = 0.001;

/// Whether the driver is animating a model this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Upload this frame's inputs and pose the model.
    #[default]
    Animating,
    /// Keep the last posed buffers; nothing is uploaded or dispatched.
    Frozen,
}

/// One frame of animation input for a model.
#[derive(Debug, Clone, Copy)]
pub struct AnimationFrame<'a> {
    pub playback: PlaybackState,
    /// Row-major 4x4 per bone; at most the model's bone count.
    pub bone_matrices: &'a [[f32; 16]],
    /// One weight per vertex morph.
    pub morph_weights: &'a [f32],
    /// One signed weight per UV morph.
    pub uv_morph_weights: &'a [f32],
}

impl<'a> AnimationFrame<'a> {
    pub fn animating(bone_matrices: &'a [[f32; 16]]) -> Self {
        Self {
            playback: PlaybackState::Animating,
            bone_matrices,
            morph_weights: &[],
            uv_morph_weights: &[],
        }
    }

    pub fn frozen() -> Self {
        Self {
            playback: PlaybackState::Frozen,
            bone_matrices: &[],
            morph_weights: &[],
            uv_morph_weights: &[],
        }
    }

    pub fn with_morph_weights(mut self, weights: &'a [f32]) -> Self {
        self.morph_weights = weights;
        self
    }

    pub fn with_uv_morph_weights(mut self, weights: &'a [f32]) -> Self {
        self.uv_morph_weights = weights;
        self
    }
}

bitflags! {
    /// What a renderer can consume.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RendererCapabilities: u32 {
        /// Wants posed vertices read back to host memory.
        const HOST_READBACK = 1 << 0;
    }
}

/// A posed submesh handed to the renderer.
pub struct PosedSubmesh<'a> {
    pub model: &'a GpuModel,
    pub index: usize,
    pub state: SubmeshState,
    /// Device buffers: positions and normals `f32 x 3`, UVs `f32 x 2`.
    pub buffers: &'a SubmeshBuffers,
    /// Present when the renderer asked for [`RendererCapabilities::HOST_READBACK`].
    pub host: Option<PosedVertices>,
}

/// Consumer of posed submeshes, implemented by the host renderer.
pub trait PosedMeshSink {
    fn capabilities(&self) -> RendererCapabilities {
        RendererCapabilities::empty()
    }

    /// Called once per drawn submesh, after its dispatch and barrier.
    fn draw(&mut self, submesh: PosedSubmesh<'_>);
}

/// What [`SkinningPass::run`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub dispatched: usize,
    pub drawn: usize,
    pub skipped: usize,
}

/// Uploads animation input, poses each drawable submesh and hands it to the
/// renderer.
#[derive(Debug)]
pub struct SkinningPass<'e> {
    engine: &'e SkinningEngine,
}

impl<'e> SkinningPass<'e> {
    pub fn new(engine: &'e SkinningEngine) -> Self {
        Self { engine }
    }

    /// Run the pass for one model.
    ///
    /// Inputs are uploaded before the first dispatch. Each submesh is
    /// dispatched and fenced before it is drawn. Hidden submeshes and
    /// submeshes below [`MIN_VISIBLE_ALPHA`] are skipped. A frozen
    /// frame draws the last posed buffers.
    pub fn run(
        &self,
        model: &GpuModel,
        frame: &AnimationFrame<'_>,
        sink: &mut dyn PosedMeshSink,
    ) -> Result<PassReport, GraphicsError> {
        profile_scope!("skinning_pass");
        let animating = frame.playback == PlaybackState::Animating;
        if animating {
            model.upload_bone_matrices(frame.bone_matrices)?;
            model.update_morph_weights(frame.morph_weights)?;
            model.update_uv_morph_weights(frame.uv_morph_weights)?;
        }

        let readback = sink
            .capabilities()
            .contains(RendererCapabilities::HOST_READBACK);
        let mut report = PassReport::default();
        for index in 0..model.submesh_count() {
            let (Some(state), Some(buffers)) =
                (model.submesh_state(index), model.submesh_buffers(index))
            else {
                continue;
            };
            if !state.visible || state.alpha < MIN_VISIBLE_ALPHA {
                report.skipped += 1;
                continue;
            }
            if animating {
                self.engine.dispatch(&model.dispatch_params(index)?)?;
                report.dispatched += 1;
            }
            let host = if readback {
                Some(model.read_posed(index)?)
            } else {
                None
            };
            sink.draw(PosedSubmesh {
                model,
                index,
                state,
                buffers,
                host,
            });
            report.drawn += 1;
        }
        Ok(report)
    }
}
