use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use toonskin_graphics::skinning::SkinningInputs;

// ---------------------------------------------------------------------------
// Synthetic model data
// ---------------------------------------------------------------------------

struct Model {
    positions: Vec<f32>,
    normals: Vec<f32>,
    uvs: Vec<f32>,
    bone_indices: Vec<i32>,
    bone_weights: Vec<f32>,
    bone_matrices: Vec<f32>,
    morph_offsets: Vec<f32>,
    morph_weights: Vec<f32>,
    uv_morph_offsets: Vec<f32>,
    uv_morph_weights: Vec<f32>,
    vertices: u32,
    bones: u32,
    morphs: u32,
    uv_morphs: u32,
}

impl Model {
    fn new(vertices: u32, bones: u32, morphs: u32, uv_morphs: u32) -> Self {
        let n = vertices as usize;
        let mut bone_indices = Vec::with_capacity(n * 4);
        let mut bone_weights = Vec::with_capacity(n * 4);
        for v in 0..vertices {
            let bone = (v % bones) as i32;
            bone_indices.extend([bone, (bone + 1) % bones as i32, 0, 0]);
            bone_weights.extend([0.6, 0.4, 0.0, 0.0]);
        }

        let mut bone_matrices = Vec::with_capacity(bones as usize * 16);
        for b in 0..bones {
            let m = glam::Mat4::from_rotation_y(b as f32 * 0.1)
                * glam::Mat4::from_translation(glam::Vec3::new(0.0, b as f32, 0.0));
            bone_matrices.extend(m.transpose().to_cols_array());
        }

        Self {
            positions: (0..n * 3).map(|i| i as f32 * 0.001).collect(),
            normals: (0..n).flat_map(|_| [0.0, 1.0, 0.0]).collect(),
            uvs: vec![0.5; n * 2],
            bone_indices,
            bone_weights,
            bone_matrices,
            morph_offsets: vec![0.01; morphs as usize * n * 3],
            // Half the morphs sit below the threshold.
            morph_weights: (0..morphs).map(|m| if m % 2 == 0 { 0.5 } else { 0.0 }).collect(),
            uv_morph_offsets: vec![0.01; uv_morphs as usize * n * 2],
            uv_morph_weights: vec![-0.25; uv_morphs as usize],
            vertices,
            bones,
            morphs,
            uv_morphs,
        }
    }

    fn inputs(&self) -> SkinningInputs<'_> {
        SkinningInputs {
            rest_positions: &self.positions,
            rest_normals: &self.normals,
            rest_uvs: &self.uvs,
            bone_indices: &self.bone_indices,
            bone_weights: &self.bone_weights,
            bone_matrices: &self.bone_matrices,
            morph_offsets: &self.morph_offsets,
            morph_weights: &self.morph_weights,
            uv_morph_offsets: &self.uv_morph_offsets,
            uv_morph_weights: &self.uv_morph_weights,
            total_vertex_count: self.vertices,
            bone_count: self.bones,
            morph_count: self.morphs,
            uv_morph_count: self.uv_morphs,
        }
    }
}

// ---------------------------------------------------------------------------
// Host kernel
// ---------------------------------------------------------------------------

fn bench_skin_bones_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("skin_bones_only");
    for vertices in [1_000u32, 10_000, 50_000] {
        let model = Model::new(vertices, 64, 0, 0);
        let inputs = model.inputs();
        group.bench_with_input(BenchmarkId::from_parameter(vertices), &inputs, |b, inputs| {
            b.iter(|| {
                for v in 0..vertices as usize {
                    black_box(inputs.skin_vertex(v));
                }
            });
        });
    }
    group.finish();
}

fn bench_skin_with_morphs(c: &mut Criterion) {
    let model = Model::new(10_000, 64, 32, 4);
    let inputs = model.inputs();
    c.bench_function("skin_10k_vertices_32_morphs", |b| {
        b.iter(|| {
            for v in 0..10_000 {
                black_box(inputs.skin_vertex(v));
            }
        });
    });
}

criterion_group!(benches, bench_skin_bones_only, bench_skin_with_morphs);
criterion_main!(benches);
