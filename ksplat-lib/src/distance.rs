use glam::{Mat4, Vec3, Vec4};
use rayon::prelude::*;

use crate::error::SplatError;
use crate::scene::MergedSplats;
use crate::sort::engine::{depth_row, float_depth};

const CHUNK_SIZE: usize = 16_384;

/// Computes one camera depth per sort candidate ahead of the sort, so the
/// sorter can skip its own depth pass.
///
/// Depths must match [`crate::sort::SortEngine`]'s float path.
pub trait DistancePrecomputer: Send {
    /// Uploads per-splat data. Called again whenever the merged set changes.
    fn prepare(&mut self, splats: &MergedSplats) -> Result<(), SplatError>;

    /// Writes the depth of `candidates[i]` into `out[i]`. `transforms` is read
    /// for dynamic scenes only.
    fn compute(
        &mut self,
        view_proj: &Mat4,
        transforms: &[Mat4],
        candidates: &[u32],
        out: &mut Vec<f32>,
    ) -> Result<(), SplatError>;
}

/// Data-parallel CPU implementation on the rayon pool.
#[derive(Debug, Default)]
pub struct ParallelDistancePrecomputer {
    centers: Vec<f32>,
    transform_indexes: Vec<u32>,
    dynamic: bool,
    rows: Vec<Vec4>,
}

impl ParallelDistancePrecomputer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistancePrecomputer for ParallelDistancePrecomputer {
    fn prepare(&mut self, splats: &MergedSplats) -> Result<(), SplatError> {
        self.centers.clone_from(&splats.centers);
        self.transform_indexes.clone_from(&splats.transform_indexes);
        self.dynamic = splats.is_dynamic();
        Ok(())
    }

    fn compute(
        &mut self,
        view_proj: &Mat4,
        transforms: &[Mat4],
        candidates: &[u32],
        out: &mut Vec<f32>,
    ) -> Result<(), SplatError> {
        self.rows.clear();
        if self.dynamic {
            self.rows
                .extend(transforms.iter().map(|t| depth_row(&(*view_proj * *t))));
        } else {
            self.rows.push(depth_row(view_proj));
        }

        let splat_count = self.centers.len() / 3;
        out.clear();
        out.resize(candidates.len(), 0.0);
        let (centers, indexes, rows, dynamic) = (&self.centers, &self.transform_indexes, &self.rows, self.dynamic);

        out.par_chunks_mut(CHUNK_SIZE)
            .zip(candidates.par_chunks(CHUNK_SIZE))
            .try_for_each(|(depths, chunk)| {
                for (depth, &candidate) in depths.iter_mut().zip(chunk) {
                    let i = candidate as usize;
                    if i >= splat_count {
                        return Err(SplatError::IndexOutOfRange {
                            what: "splat",
                            index: i,
                            len: splat_count,
                        });
                    }
                    let row = if dynamic {
                        let t = indexes[i] as usize;
                        *rows.get(t).ok_or(SplatError::IndexOutOfRange {
                            what: "transform",
                            index: t,
                            len: rows.len(),
                        })?
                    } else {
                        rows[0]
                    };
                    *depth = float_depth(row, Vec3::from_slice(&centers[i * 3..i * 3 + 3]));
                }
                Ok(())
            })
    }
}

/// Optional distance pass in front of the sorter. The first failure turns it
/// off for good and callers fall back to sorting without precomputed depths.
pub struct DistancePass {
    precomputer: Box<dyn DistancePrecomputer>,
    enabled: bool,
    distances: Vec<f32>,
}

impl std::fmt::Debug for DistancePass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistancePass")
            .field("enabled", &self.enabled)
            .field("distances", &self.distances.len())
            .finish()
    }
}

impl DistancePass {
    pub fn new(precomputer: impl DistancePrecomputer + 'static) -> Self {
        Self {
            precomputer: Box::new(precomputer),
            enabled: true,
            distances: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn disable(&mut self, error: SplatError) {
        tracing::warn!(%error, "distance pass disabled, sorting on the CPU path");
        self.enabled = false;
        self.distances = Vec::new();
    }

    /// Returns whether the pass is still usable.
    pub fn prepare(&mut self, splats: &MergedSplats) -> bool {
        if self.enabled {
            if let Err(e) = self.precomputer.prepare(splats) {
                self.disable(e);
            }
        }
        self.enabled
    }

    /// Depths for `candidates`, or `None` when the pass is (or just became)
    /// disabled.
    pub fn compute(&mut self, view_proj: &Mat4, transforms: &[Mat4], candidates: &[u32]) -> Option<&[f32]> {
        if !self.enabled {
            return None;
        }
        match self
            .precomputer
            .compute(view_proj, transforms, candidates, &mut self.distances)
        {
            Ok(()) => Some(self.distances.as_slice()),
            Err(e) => {
                self.disable(e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{CompressionOptions, SplatCompressor};
    use crate::scene::SplatScene;
    use crate::sort::engine::{SortEngine, SortEngineConfig, SortParams};
    use crate::structures::{SplatRecord, UncompressedSplatList};
    use glam::Quat;

    struct BrokenShader;

    impl DistancePrecomputer for BrokenShader {
        fn prepare(&mut self, _: &MergedSplats) -> Result<(), SplatError> {
            Ok(())
        }

        fn compute(&mut self, _: &Mat4, _: &[Mat4], _: &[u32], _: &mut Vec<f32>) -> Result<(), SplatError> {
            Err(SplatError::DistancePass("program failed to link".to_string()))
        }
    }

    fn merged(dynamic: bool) -> MergedSplats {
        let list: UncompressedSplatList = (0..40)
            .map(|i| SplatRecord {
                center: Vec3::new((i % 7) as f32, (i % 3) as f32, -(i as f32) * 0.5),
                scale: Vec3::splat(0.1),
                rotation: Quat::IDENTITY,
                color: [255; 4],
            })
            .collect();
        let buffer = SplatCompressor::new(CompressionOptions {
            bucket_size: 16,
            ..Default::default()
        })
        .unwrap()
        .compress(&list)
        .unwrap();
        let scenes = [
            SplatScene::new(buffer.clone()),
            SplatScene::new(buffer).with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, -40.0))),
        ];
        MergedSplats::merge(&scenes, dynamic).unwrap()
    }

    fn camera() -> Mat4 {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        Mat4::perspective_rh(1.0, 1.0, 0.1, 1000.0) * view
    }

    #[test]
    fn test_precomputed_sort_matches_cpu_sort() {
        for dynamic in [false, true] {
            let splats = merged(dynamic);
            let n = splats.splat_count();
            let candidates: Vec<u32> = (0..n as u32).filter(|&i| splats.passes_alpha(i)).collect();

            let mut pass = DistancePass::new(ParallelDistancePrecomputer::new());
            assert!(pass.prepare(&splats));
            let depths = pass
                .compute(&camera(), splats.scene_transforms(), &candidates)
                .unwrap()
                .to_vec();
            assert_eq!(depths.len(), candidates.len());

            let config = SortEngineConfig {
                dynamic_mode: dynamic,
                ..Default::default()
            };
            let mut engine = SortEngine::new(n, config).unwrap();
            engine
                .set_data(splats.centers.clone(), splats.transform_indexes.clone())
                .unwrap();
            engine.set_transforms(splats.scene_transforms().to_vec());
            let params = SortParams::full(camera(), candidates.len());
            let cpu = engine.sort(&params, &candidates, None).unwrap().to_vec();
            let pre = engine.sort(&params, &candidates, Some(&depths)).unwrap().to_vec();
            assert_eq!(cpu, pre);
        }
    }

    #[test]
    fn test_failure_disables_the_pass() {
        let splats = merged(false);
        let mut pass = DistancePass::new(BrokenShader);
        assert!(pass.prepare(&splats));
        assert!(pass.compute(&camera(), &[], &[1, 2]).is_none());
        assert!(!pass.is_enabled());
        assert!(!pass.prepare(&splats));
        assert!(pass.compute(&camera(), &[], &[1, 2]).is_none());
    }

    #[test]
    fn test_out_of_range_candidate_disables_the_pass() {
        let splats = merged(false);
        let mut pass = DistancePass::new(ParallelDistancePrecomputer::new());
        pass.prepare(&splats);
        assert!(pass.compute(&camera(), &[], &[u32::MAX]).is_none());
        assert!(!pass.is_enabled());
    }
}
