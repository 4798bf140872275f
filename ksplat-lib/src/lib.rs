pub mod buffer;
pub mod bundle;
pub mod common;
pub mod compressor;
pub mod distance;
pub mod error;
pub mod loader;
pub mod ply;
pub mod ray;
pub mod scene;
pub mod sort;
pub mod splat_file;
pub mod structures;
pub mod tree;
mod varint;

pub use buffer::SplatBuffer;
pub use bundle::{compress_bundle, decompress_bundle, BundleScene};
pub use compressor::{CompressionOptions, SplatCompressor};
pub use distance::{DistancePass, DistancePrecomputer, ParallelDistancePrecomputer};
pub use error::SplatError;
pub use loader::{load_scene, load_scene_file, SceneFormat};
pub use ray::{Aabb, Ray};
pub use scene::{MergedSplats, SplatScene};
pub use structures::{SplatRecord, UncompressedSplatList};
pub use tree::{RayHit, SplatTree, SplatTreeConfig};

#[cfg(feature = "async")]
pub use bundle::{compress_bundle_async, decompress_bundle_async};

use loader::parse_uncompressed;
use splat_file::write_splat_file;

/// Parses a `.ply` or `.splat` scene and writes it out as a ksplat buffer.
pub fn compress(
    raw_data: &[u8],
    format: SceneFormat,
    options: &CompressionOptions,
    output: &mut Vec<u8>,
) -> Result<(), SplatError> {
    let list = parse_uncompressed(raw_data, format)?;
    if list.is_empty() {
        return Err(SplatError::EmptyScene);
    }
    let buffer = SplatCompressor::new(*options)?.compress(&list)?;
    output.clear();
    output.extend_from_slice(buffer.as_bytes());
    Ok(())
}

/// Expands a ksplat buffer back into `.splat` rows, dropping bucket padding.
/// Returns the number of rows written.
pub fn decompress(ksplat_data: &[u8], output: &mut Vec<u8>) -> Result<usize, SplatError> {
    let buffer = SplatBuffer::from_bytes(ksplat_data.to_vec())?;
    write_splat_file(&buffer, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ply::tests::create_test_ply;
    use crate::sort::{SortEngineConfig, SortParams, SortPoll, SortWorker, SortWorkerConfig, TransportMode};
    use glam::{Mat4, Quat, Vec3};

    fn grid_scene(offset: Vec3) -> UncompressedSplatList {
        let mut list = UncompressedSplatList::new();
        for x in 0..6 {
            for y in 0..6 {
                for z in 0..6 {
                    list.push(SplatRecord {
                        center: offset + Vec3::new(x as f32, y as f32, z as f32),
                        scale: Vec3::splat(0.2),
                        rotation: Quat::IDENTITY,
                        color: [200, 100, 50, 255],
                    });
                }
            }
        }
        list
    }

    #[test]
    fn test_compress_decompress_ply() {
        #[rustfmt::skip]
        let ply = create_test_ply(&[
            [1.0, 2.0, 3.0, -1.0, -1.5, -2.0, 1.0, 0.0, 0.0, 0.0, 4.0, 0.5, 0.0, -0.5],
            [-4.0, 0.5, 8.0, -3.0, -3.0, -3.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.1, 0.2, 0.3],
        ]);
        let mut packed = Vec::new();
        compress(&ply, SceneFormat::Ply, &CompressionOptions::default(), &mut packed)
            .expect("compress(...) failed");

        let buffer = SplatBuffer::from_bytes(packed.clone()).unwrap();
        assert_eq!(buffer.splat_count(), 256);

        let mut rows = Vec::new();
        let written = decompress(&packed, &mut rows).expect("decompress(...) failed");
        assert_eq!(written, 2);

        let back = splat_file::parse_splat_file(&rows).unwrap();
        assert_eq!(back.get(0).center, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(back.get(1).center, Vec3::new(-4.0, 0.5, 8.0));
    }

    #[test]
    fn test_compress_rejects_ksplat_and_empty_input() {
        let mut out = Vec::new();
        assert!(matches!(
            compress(&[0; 1024], SceneFormat::KSplat, &CompressionOptions::default(), &mut out),
            Err(SplatError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            compress(&[], SceneFormat::Splat, &CompressionOptions::default(), &mut out),
            Err(SplatError::EmptyScene)
        ));
        assert!(decompress(&[0; 16], &mut out).is_err());
    }

    /// Load, index, cull and sort a two-scene setup the way a viewer frame does.
    #[test]
    fn test_frame_pipeline() {
        let options = CompressionOptions {
            compression_level: 1,
            bucket_size: 64,
            ..Default::default()
        };
        let compressor = SplatCompressor::new(options).unwrap();
        let near = compressor.compress(&grid_scene(Vec3::ZERO)).unwrap();
        let far = compressor.compress(&grid_scene(Vec3::new(0.0, 0.0, -20.0))).unwrap();
        let scenes = [SplatScene::new(near), SplatScene::new(far)];
        let splats = MergedSplats::merge(&scenes, false).unwrap();

        let tree = SplatTree::build(
            &splats,
            SplatTreeConfig {
                max_centers_per_node: 32,
                ..Default::default()
            },
            |i| splats.passes_alpha(i),
        );
        assert_eq!(tree.indexed_count(), 2 * 6 * 6 * 6);

        let camera = Vec3::new(2.5, 2.5, 15.0);
        let view = Mat4::look_at_rh(camera, Vec3::new(2.5, 2.5, 0.0), Vec3::Y);
        let view_proj = Mat4::perspective_rh(1.2, 1.0, 0.1, 500.0) * view;
        let mut visible = Vec::new();
        let count = tree.collect_visible(&splats, &view_proj, camera, &mut visible);
        assert_eq!(count, visible.len());
        assert!(count > 0);

        let mut pass = DistancePass::new(ParallelDistancePrecomputer::new());
        assert!(pass.prepare(&splats));
        let depths = pass
            .compute(&view_proj, splats.scene_transforms(), &visible)
            .map(<[f32]>::to_vec);

        let mut worker = SortWorker::spawn(
            splats.splat_count(),
            SortWorkerConfig {
                transport: TransportMode::Shared,
                engine: SortEngineConfig::default(),
                ..Default::default()
            },
        )
        .unwrap();
        worker
            .set_data(splats.centers.clone(), splats.transform_indexes.clone())
            .unwrap();
        worker
            .request_sort(SortParams::full(view_proj, count), &visible, depths.as_deref())
            .unwrap();
        let SortPoll::Done(outcome) = worker.wait().unwrap() else {
            panic!("sort did not complete");
        };
        let order = outcome.sorted.to_vec();
        assert_eq!(order.len(), count);

        // Back to front.
        let distances: Vec<f32> = order
            .iter()
            .map(|&i| splats.world_center(i).unwrap().distance(camera))
            .collect();
        assert!(distances.first() > distances.last());

        let mut sorted = order.clone();
        sorted.sort_unstable();
        let mut expected = visible.clone();
        expected.sort_unstable();
        assert_eq!(sorted, expected);
        worker.shutdown();
    }
}
