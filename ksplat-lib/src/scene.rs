use std::ops::Range;

use glam::{Mat4, Quat, Vec3};

use crate::buffer::SplatBuffer;
use crate::error::{check_index, SplatError};

/// One loaded scene and its placement.
#[derive(Debug, Clone)]
pub struct SplatScene {
    pub buffer: SplatBuffer,
    pub transform: Mat4,
    /// Splats below this alpha are left out of the spatial index.
    pub minimum_alpha: u8,
}

impl SplatScene {
    pub fn new(buffer: SplatBuffer) -> Self {
        Self {
            buffer,
            transform: Mat4::IDENTITY,
            minimum_alpha: 1,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_minimum_alpha(mut self, minimum_alpha: u8) -> Self {
        self.minimum_alpha = minimum_alpha;
        self
    }
}

/// Flat attribute arrays for every splat of every scene, addressed by a
/// global splat index.
///
/// In static mode scene transforms are baked into the arrays. In dynamic mode
/// the arrays stay in scene space and `transform_indexes` maps each splat to
/// its scene transform, which may change every frame.
#[derive(Debug, Default, Clone)]
pub struct MergedSplats {
    pub centers: Vec<f32>,
    pub scales: Vec<f32>,
    pub rotations: Vec<f32>,
    pub colors: Vec<u8>,
    pub transform_indexes: Vec<u32>,
    scene_ranges: Vec<Range<u32>>,
    scene_transforms: Vec<Mat4>,
    scene_alpha: Vec<u8>,
    dynamic: bool,
}

impl MergedSplats {
    pub fn merge(scenes: &[SplatScene], dynamic: bool) -> Result<Self, SplatError> {
        if scenes.is_empty() {
            return Err(SplatError::EmptyScene);
        }
        let total: usize = scenes.iter().map(|s| s.buffer.splat_count()).sum();
        let total_u32 = u32::try_from(total).map_err(|_| SplatError::IndexOutOfRange {
            what: "merged splat",
            index: total,
            len: u32::MAX as usize,
        })?;

        let mut merged = Self {
            centers: vec![0.0; total * 3],
            scales: vec![0.0; total * 3],
            rotations: vec![0.0; total * 4],
            colors: vec![0; total * 4],
            transform_indexes: Vec::with_capacity(total),
            scene_ranges: Vec::with_capacity(scenes.len()),
            scene_transforms: Vec::with_capacity(scenes.len()),
            scene_alpha: Vec::with_capacity(scenes.len()),
            dynamic,
        };

        let mut offset = 0usize;
        for (scene_index, scene) in scenes.iter().enumerate() {
            let count = scene.buffer.splat_count();
            let baked = (!dynamic).then_some(&scene.transform);
            scene
                .buffer
                .fill_splat_center_array(&mut merged.centers, offset, baked)?;
            scene.buffer.fill_splat_scale_rotation_array(
                &mut merged.scales,
                &mut merged.rotations,
                offset,
                baked,
            )?;
            scene
                .buffer
                .fill_splat_color_array(&mut merged.colors, offset, scene.minimum_alpha)?;
            merged
                .transform_indexes
                .extend(std::iter::repeat(scene_index as u32).take(count));
            merged
                .scene_ranges
                .push(offset as u32..(offset + count) as u32);
            merged.scene_transforms.push(scene.transform);
            merged.scene_alpha.push(scene.minimum_alpha);
            offset += count;
        }

        tracing::debug!(
            scenes = scenes.len(),
            splats = total_u32,
            dynamic,
            "merged splat scenes"
        );
        Ok(merged)
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn splat_count(&self) -> usize {
        self.transform_indexes.len()
    }

    pub fn scene_count(&self) -> usize {
        self.scene_ranges.len()
    }

    pub fn scene_ranges(&self) -> &[Range<u32>] {
        &self.scene_ranges
    }

    pub fn scene_range(&self, scene: usize) -> Result<Range<u32>, SplatError> {
        check_index("scene", scene, self.scene_count())?;
        Ok(self.scene_ranges[scene].clone())
    }

    pub fn scene_transforms(&self) -> &[Mat4] {
        &self.scene_transforms
    }

    pub fn scene_transform(&self, scene: usize) -> Result<Mat4, SplatError> {
        check_index("scene", scene, self.scene_count())?;
        Ok(self.scene_transforms[scene])
    }

    /// Replaces a scene transform. Only dynamic merges can move scenes after
    /// the arrays were filled.
    pub fn set_scene_transform(&mut self, scene: usize, transform: Mat4) -> Result<(), SplatError> {
        check_index("scene", scene, self.scene_count())?;
        if !self.dynamic {
            return Err(SplatError::InvalidSortRequest(
                "scene transforms are baked in static mode".to_string(),
            ));
        }
        self.scene_transforms[scene] = transform;
        Ok(())
    }

    /// Maps a global splat index to `(scene, local index)`.
    pub fn locate(&self, global: u32) -> Result<(usize, usize), SplatError> {
        check_index("splat", global as usize, self.splat_count())?;
        let scene = self.transform_indexes[global as usize] as usize;
        Ok((scene, (global - self.scene_ranges[scene].start) as usize))
    }

    pub fn global_index(&self, scene: usize, local: usize) -> Result<u32, SplatError> {
        let range = self.scene_range(scene)?;
        check_index("splat", local, range.len())?;
        Ok(range.start + local as u32)
    }

    /// Center as stored (scene space in dynamic mode, world space otherwise).
    pub fn center(&self, global: u32) -> Result<Vec3, SplatError> {
        check_index("splat", global as usize, self.splat_count())?;
        Ok(Vec3::from_slice(&self.centers[global as usize * 3..]))
    }

    pub fn world_center(&self, global: u32) -> Result<Vec3, SplatError> {
        let center = self.center(global)?;
        if !self.dynamic {
            return Ok(center);
        }
        let scene = self.transform_indexes[global as usize] as usize;
        Ok(self.scene_transforms[scene].transform_point3(center))
    }

    pub fn scale_rotation(&self, global: u32) -> Result<(Vec3, Quat), SplatError> {
        check_index("splat", global as usize, self.splat_count())?;
        let i = global as usize;
        let scale = Vec3::from_slice(&self.scales[i * 3..]);
        let r = &self.rotations[i * 4..i * 4 + 4];
        Ok((scale, Quat::from_xyzw(r[1], r[2], r[3], r[0])))
    }

    pub fn color(&self, global: u32) -> Result<[u8; 4], SplatError> {
        check_index("splat", global as usize, self.splat_count())?;
        let c = &self.colors[global as usize * 4..global as usize * 4 + 4];
        Ok([c[0], c[1], c[2], c[3]])
    }

    /// Filter predicate for the spatial index: the splat's alpha reaches its
    /// scene's threshold. Padding and dropped splats have alpha 0.
    pub fn passes_alpha(&self, global: u32) -> bool {
        let i = global as usize;
        match self.transform_indexes.get(i) {
            Some(&scene) => {
                let alpha = self.colors[i * 4 + 3];
                alpha > 0 && alpha >= self.scene_alpha[scene as usize]
            }
            None => false,
        }
    }
}
