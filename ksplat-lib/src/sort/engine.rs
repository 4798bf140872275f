use glam::{Mat4, Vec3, Vec4};

use crate::error::{check_index, SplatError};

pub const DEFAULT_DEPTH_MAP_RANGE: u32 = 1 << 16;
const MAX_DEPTH_MAP_RANGE: u32 = 1 << 24;

/// Fixed-point scale of the integer sort path (three decimal places).
pub const FIXED_POINT_SCALE: f32 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortEngineConfig {
    /// Compute depths on fixed-point copies of centers and matrices. Depths
    /// are then in units of `1 / FIXED_POINT_SCALE²` and must fit in `i32`,
    /// which limits them to about ±2147 clip-space units. Larger scenes fail
    /// with [`SplatError::DepthOverflow`] and need the float path.
    pub integer_based_sort: bool,
    /// Look up a per-scene transform for every splat.
    pub dynamic_mode: bool,
    /// Number of counting-sort buckets. Power of two.
    pub depth_map_range: u32,
}

impl Default for SortEngineConfig {
    fn default() -> Self {
        Self {
            integer_based_sort: false,
            dynamic_mode: false,
            depth_map_range: DEFAULT_DEPTH_MAP_RANGE,
        }
    }
}

impl SortEngineConfig {
    pub fn validate(&self) -> Result<(), SplatError> {
        if !self.depth_map_range.is_power_of_two()
            || self.depth_map_range < 2
            || self.depth_map_range > MAX_DEPTH_MAP_RANGE
        {
            return Err(SplatError::InvalidSortRequest(format!(
                "depth map range {} must be a power of two in 2..={}",
                self.depth_map_range, MAX_DEPTH_MAP_RANGE
            )));
        }
        Ok(())
    }
}

/// Per-call sort parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortParams {
    pub view_proj: Mat4,
    /// Leading candidates that get depth sorted. Candidate lists are expected
    /// nearest-first, so this prefix holds the splats closest to the camera.
    pub splat_sort_count: usize,
    /// Length of the output. Candidates between the two counts are drawn
    /// first, in reverse candidate order, ahead of the sorted prefix.
    pub splat_render_count: usize,
}

impl SortParams {
    pub fn full(view_proj: Mat4, count: usize) -> Self {
        Self {
            view_proj,
            splat_sort_count: count,
            splat_render_count: count,
        }
    }

    pub fn validate(&self, candidates: usize, precomputed: Option<usize>) -> Result<(), SplatError> {
        if self.splat_sort_count > self.splat_render_count || self.splat_render_count > candidates {
            return Err(SplatError::InvalidSortRequest(format!(
                "need sort count {} <= render count {} <= candidates {}",
                self.splat_sort_count, self.splat_render_count, candidates
            )));
        }
        if let Some(len) = precomputed {
            if len < self.splat_sort_count {
                return Err(SplatError::InvalidSortRequest(format!(
                    "{} precomputed distances for {} sorted splats",
                    len, self.splat_sort_count
                )));
            }
        }
        Ok(())
    }
}

/// Converts to fixed point, rejecting anything that leaves `i32`.
pub fn to_fixed(value: f32) -> Result<i32, SplatError> {
    let scaled = (value * FIXED_POINT_SCALE).round();
    if !scaled.is_finite() || !(-2_147_483_648.0..2_147_483_648.0).contains(&scaled) {
        return Err(SplatError::DepthOverflow(format!(
            "{} does not fit fixed point x{}",
            value, FIXED_POINT_SCALE
        )));
    }
    Ok(scaled as i32)
}

/// Camera depth of a point: third row of the (model-)view-projection.
/// Larger values are farther from the camera.
#[inline]
pub fn depth_row(mvp: &Mat4) -> Vec4 {
    mvp.row(2)
}

#[inline]
pub(crate) fn float_depth(row: Vec4, center: Vec3) -> f32 {
    row.dot(center.extend(1.0))
}

fn fixed_row(row: Vec4) -> Result<[i64; 4], SplatError> {
    Ok([
        to_fixed(row.x)? as i64,
        to_fixed(row.y)? as i64,
        to_fixed(row.z)? as i64,
        // Matches the scale of the fixed-point center products.
        to_fixed(row.w)? as i64 * FIXED_POINT_SCALE as i64,
    ])
}

fn fixed_depth(row: &[i64; 4], center: &[i32]) -> Option<i32> {
    let d = row[0]
        .checked_mul(center[0] as i64)?
        .checked_add(row[1].checked_mul(center[1] as i64)?)?
        .checked_add(row[2].checked_mul(center[2] as i64)?)?
        .checked_add(row[3])?;
    i32::try_from(d).ok()
}

/// Maps depths onto `range` buckets, farthest at bucket 0.
fn quantize<T: Copy + PartialOrd>(depths: &[T], range: u32, to_f64: impl Fn(T) -> f64, keys: &mut Vec<u32>) {
    keys.clear();
    let Some(&first) = depths.first() else {
        return;
    };
    let (min, max) = depths.iter().fold((first, first), |(lo, hi), &d| {
        (if d < lo { d } else { lo }, if d > hi { d } else { hi })
    });
    let (min, max) = (to_f64(min), to_f64(max));
    let top = (range - 1) as f64;
    let scale = if max > min { top / (max - min) } else { 0.0 };
    keys.extend(depths.iter().map(|&d| {
        let bucket = ((to_f64(d) - min) * scale).clamp(0.0, top) as u32;
        range - 1 - bucket
    }));
}

/// Counting sort of candidate indices by camera depth, far to near.
#[derive(Debug)]
pub struct SortEngine {
    config: SortEngineConfig,
    splat_count: usize,
    centers: Vec<f32>,
    centers_fixed: Vec<i32>,
    transform_indexes: Vec<u32>,
    transforms: Vec<Mat4>,
    rows: Vec<Vec4>,
    rows_fixed: Vec<[i64; 4]>,
    depths: Vec<f32>,
    depths_fixed: Vec<i32>,
    keys: Vec<u32>,
    counts: Vec<u32>,
    outputs: [Vec<u32>; 2],
    front: usize,
}

impl SortEngine {
    pub fn new(splat_count: usize, config: SortEngineConfig) -> Result<Self, SplatError> {
        config.validate()?;
        Ok(Self {
            config,
            splat_count,
            centers: Vec::new(),
            centers_fixed: Vec::new(),
            transform_indexes: Vec::new(),
            transforms: Vec::new(),
            rows: Vec::new(),
            rows_fixed: Vec::new(),
            depths: Vec::with_capacity(splat_count),
            depths_fixed: Vec::new(),
            keys: Vec::with_capacity(splat_count),
            counts: vec![0; config.depth_map_range as usize],
            outputs: [Vec::with_capacity(splat_count), Vec::with_capacity(splat_count)],
            front: 0,
        })
    }

    pub fn config(&self) -> &SortEngineConfig {
        &self.config
    }

    pub fn splat_count(&self) -> usize {
        self.splat_count
    }

    /// Primes per-splat static data: `x, y, z` centers and, in dynamic mode,
    /// one transform index per splat.
    pub fn set_data(&mut self, centers: Vec<f32>, transform_indexes: Vec<u32>) -> Result<(), SplatError> {
        if centers.len() != self.splat_count * 3 {
            return Err(SplatError::MismatchedArrays(format!(
                "{} center floats for {} splats",
                centers.len(),
                self.splat_count
            )));
        }
        if self.config.dynamic_mode && transform_indexes.len() != self.splat_count {
            return Err(SplatError::MismatchedArrays(format!(
                "{} transform indexes for {} splats",
                transform_indexes.len(),
                self.splat_count
            )));
        }
        if self.config.integer_based_sort {
            self.centers_fixed = centers
                .iter()
                .map(|&c| to_fixed(c))
                .collect::<Result<_, _>>()?;
        }
        self.centers = centers;
        self.transform_indexes = transform_indexes;
        Ok(())
    }

    pub fn set_transforms(&mut self, transforms: Vec<Mat4>) {
        self.transforms = transforms;
    }

    fn prepare_rows(&mut self, view_proj: &Mat4) -> Result<(), SplatError> {
        self.rows.clear();
        if self.config.dynamic_mode {
            self.rows
                .extend(self.transforms.iter().map(|t| depth_row(&(*view_proj * *t))));
        } else {
            self.rows.push(depth_row(view_proj));
        }
        if self.config.integer_based_sort {
            self.rows_fixed = self.rows.iter().map(|&r| fixed_row(r)).collect::<Result<_, _>>()?;
        }
        Ok(())
    }

    #[inline]
    fn row_index(&self, index: usize) -> Result<usize, SplatError> {
        if !self.config.dynamic_mode {
            return Ok(0);
        }
        let t = self.transform_indexes[index] as usize;
        check_index("transform", t, self.rows.len())?;
        Ok(t)
    }

    fn compute_depths(&mut self, candidates: &[u32]) -> Result<(), SplatError> {
        if self.centers.is_empty() && !candidates.is_empty() {
            return Err(SplatError::InvalidSortRequest(
                "no splat data has been loaded".to_string(),
            ));
        }
        self.depths.clear();
        self.depths_fixed.clear();
        for &candidate in candidates {
            let i = candidate as usize;
            check_index("splat", i, self.splat_count)?;
            let row = self.row_index(i)?;
            if self.config.integer_based_sort {
                let depth = fixed_depth(&self.rows_fixed[row], &self.centers_fixed[i * 3..i * 3 + 3])
                    .ok_or_else(|| {
                        SplatError::DepthOverflow(format!("depth of splat {} leaves i32 range", i))
                    })?;
                self.depths_fixed.push(depth);
            } else {
                let center = Vec3::from_slice(&self.centers[i * 3..i * 3 + 3]);
                self.depths.push(float_depth(self.rows[row], center));
            }
        }
        Ok(())
    }

    /// Writes `candidates[splat_sort_count..splat_render_count]` reversed,
    /// then `candidates[..splat_sort_count]` sorted far to near. With
    /// `precomputed`, entry `i` is the depth of `candidates[i]` and no depth is
    /// computed here.
    ///
    /// Output buffers alternate between calls, so the previous result stays
    /// intact until the next sort.
    pub fn sort(
        &mut self,
        params: &SortParams,
        candidates: &[u32],
        precomputed: Option<&[f32]>,
    ) -> Result<&[u32], SplatError> {
        params.validate(candidates.len(), precomputed.map(<[f32]>::len))?;
        let sort_count = params.splat_sort_count;
        let sorted = &candidates[..sort_count];
        let range = self.config.depth_map_range;

        match precomputed {
            Some(depths) => quantize(&depths[..sort_count], range, |d| d as f64, &mut self.keys),
            None => {
                self.prepare_rows(&params.view_proj)?;
                self.compute_depths(sorted)?;
                if self.config.integer_based_sort {
                    quantize(&self.depths_fixed, range, |d| d as f64, &mut self.keys);
                } else {
                    quantize(&self.depths, range, |d| d as f64, &mut self.keys);
                }
            }
        }

        self.counts.iter_mut().for_each(|c| *c = 0);
        for &key in &self.keys {
            self.counts[key as usize] += 1;
        }
        let mut running = 0u32;
        for count in self.counts.iter_mut() {
            let n = *count;
            *count = running;
            running += n;
        }

        let out = &mut self.outputs[self.front];
        out.clear();
        out.extend(candidates[sort_count..params.splat_render_count].iter().rev());
        let base = out.len();
        out.resize(params.splat_render_count, 0);
        for (&key, &index) in self.keys.iter().zip(sorted) {
            let slot = &mut self.counts[key as usize];
            out[base + *slot as usize] = index;
            *slot += 1;
        }

        let front = self.front;
        self.front ^= 1;
        Ok(&self.outputs[front])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Mat4 {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        Mat4::perspective_rh(1.0, 1.0, 0.1, 1000.0) * view
    }

    fn engine(centers: &[Vec3], config: SortEngineConfig) -> SortEngine {
        let mut engine = SortEngine::new(centers.len(), config).unwrap();
        let flat: Vec<f32> = centers.iter().flat_map(|c| c.to_array()).collect();
        engine.set_data(flat, vec![0; centers.len()]).unwrap();
        engine.set_transforms(vec![Mat4::IDENTITY]);
        engine
    }

    fn depth_of(centers: &[Vec3], view_proj: &Mat4, i: u32) -> f32 {
        float_depth(depth_row(view_proj), centers[i as usize])
    }

    fn z_line(n: usize) -> Vec<Vec3> {
        (0..n).map(|i| Vec3::new(0.0, 0.0, -(i as f32) * 3.0 + 5.0)).collect()
    }

    #[test]
    fn test_far_to_near_permutation() {
        let centers = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, -20.0),
            Vec3::new(0.0, 2.0, 5.0),
            Vec3::new(0.0, 0.0, -5.0),
            Vec3::new(-3.0, 0.0, 8.0),
        ];
        let mut engine = engine(&centers, SortEngineConfig::default());
        let candidates = [4u32, 2, 0, 3, 1];
        let vp = camera();
        let out = engine
            .sort(&SortParams::full(vp, 5), &candidates, None)
            .unwrap()
            .to_vec();
        assert_eq!(out, vec![1, 3, 0, 2, 4]);
        for pair in out.windows(2) {
            assert!(depth_of(&centers, &vp, pair[0]) >= depth_of(&centers, &vp, pair[1]));
        }

        let again = engine.sort(&SortParams::full(vp, 5), &candidates, None).unwrap();
        assert_eq!(again, out.as_slice());
    }

    #[test]
    fn test_partial_sort_draws_the_remainder_first() {
        let centers = z_line(6);
        let mut engine = engine(&centers, SortEngineConfig::default());
        let candidates = [0u32, 1, 2, 3, 4, 5];
        let params = SortParams {
            view_proj: camera(),
            splat_sort_count: 3,
            splat_render_count: 5,
        };
        let out = engine.sort(&params, &candidates, None).unwrap();
        assert_eq!(out, &[4, 3, 2, 1, 0]);

        // The prefix is sorted whatever its candidate order.
        let params = SortParams {
            view_proj: camera(),
            splat_sort_count: 2,
            splat_render_count: 4,
        };
        let out = engine.sort(&params, &[1, 0, 2, 3], None).unwrap();
        assert_eq!(out, &[3, 2, 1, 0]);
    }

    #[test]
    fn test_ties_keep_candidate_order() {
        let centers = vec![Vec3::ZERO; 4];
        let mut engine = engine(&centers, SortEngineConfig::default());
        let out = engine
            .sort(&SortParams::full(camera(), 4), &[3, 1, 2, 0], None)
            .unwrap();
        assert_eq!(out, &[3, 1, 2, 0]);
    }

    #[test]
    fn test_dynamic_mode_uses_scene_transforms() {
        let config = SortEngineConfig {
            dynamic_mode: true,
            ..Default::default()
        };
        let mut engine = SortEngine::new(2, config).unwrap();
        engine.set_data(vec![0.0; 6], vec![0, 1]).unwrap();
        engine.set_transforms(vec![
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(0.0, 0.0, -50.0)),
        ]);
        let params = SortParams::full(camera(), 2);
        assert_eq!(engine.sort(&params, &[0, 1], None).unwrap(), &[1, 0]);

        engine.set_transforms(vec![
            Mat4::from_translation(Vec3::new(0.0, 0.0, -50.0)),
            Mat4::IDENTITY,
        ]);
        assert_eq!(engine.sort(&params, &[0, 1], None).unwrap(), &[0, 1]);

        engine.set_transforms(vec![Mat4::IDENTITY]);
        assert!(matches!(
            engine.sort(&params, &[0, 1], None),
            Err(SplatError::IndexOutOfRange { what: "transform", .. })
        ));
    }

    #[test]
    fn test_integer_mode_matches_float_order() {
        let centers = z_line(8);
        let candidates: Vec<u32> = (0..8).rev().collect();
        let params = SortParams::full(camera(), 8);
        let mut float = engine(&centers, SortEngineConfig::default());
        let mut fixed = engine(
            &centers,
            SortEngineConfig {
                integer_based_sort: true,
                ..Default::default()
            },
        );
        let a = float.sort(&params, &candidates, None).unwrap().to_vec();
        let b = fixed.sort(&params, &candidates, None).unwrap().to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn test_integer_mode_overflow_is_an_error() {
        let config = SortEngineConfig {
            integer_based_sort: true,
            ..Default::default()
        };
        let mut engine = SortEngine::new(1, config).unwrap();
        assert!(matches!(
            engine.set_data(vec![0.0, 0.0, 3.0e6], vec![]),
            Err(SplatError::DepthOverflow(_))
        ));

        // About 2010 units deep, inside the i32 depth range.
        engine.set_data(vec![0.0, 0.0, -2000.0], vec![]).unwrap();
        assert!(engine.sort(&SortParams::full(camera(), 1), &[0], None).is_ok());

        // Fits fixed point but the depth product does not fit i32.
        engine.set_data(vec![0.0, 0.0, -5000.0], vec![]).unwrap();
        assert!(matches!(
            engine.sort(&SortParams::full(camera(), 1), &[0], None),
            Err(SplatError::DepthOverflow(_))
        ));
        assert!(to_fixed(f32::NAN).is_err());
        assert_eq!(to_fixed(-1.5).unwrap(), -1500);
    }

    #[test]
    fn test_precomputed_depths_drive_order() {
        let centers = z_line(3);
        let mut engine = engine(&centers, SortEngineConfig::default());
        let out = engine
            .sort(&SortParams::full(Mat4::IDENTITY, 3), &[0, 1, 2], Some(&[1.0, 3.0, 2.0]))
            .unwrap();
        assert_eq!(out, &[1, 2, 0]);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let centers = z_line(3);
        let mut engine = engine(&centers, SortEngineConfig::default());
        let bad_counts = SortParams {
            view_proj: camera(),
            splat_sort_count: 3,
            splat_render_count: 2,
        };
        assert!(matches!(
            engine.sort(&bad_counts, &[0, 1, 2], None),
            Err(SplatError::InvalidSortRequest(_))
        ));
        assert!(engine.sort(&SortParams::full(camera(), 4), &[0, 1, 2], None).is_err());
        assert!(matches!(
            engine.sort(&SortParams::full(camera(), 1), &[7], None),
            Err(SplatError::IndexOutOfRange { .. })
        ));
        assert!(engine
            .sort(&SortParams::full(camera(), 2), &[0, 1], Some(&[1.0]))
            .is_err());
        assert!(engine.set_data(vec![0.0; 4], vec![]).is_err());
        assert!(SortEngine::new(
            1,
            SortEngineConfig {
                depth_map_range: 1000,
                ..Default::default()
            }
        )
        .is_err());
    }
}
