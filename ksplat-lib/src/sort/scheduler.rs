use glam::Vec3;

/// Fractions of the visible set sorted on consecutive frames after the view
/// changes.
pub const PROGRESSIVE_LADDER: [f32; 4] = [0.125, 0.33, 0.75, 1.0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortSchedulerConfig {
    /// Visible counts above this sort progressively.
    pub progressive_threshold: usize,
    /// Restart when the dot product of old and new view directions drops
    /// below this.
    pub angle_threshold: f32,
    /// Restart when the camera moves farther than this.
    pub position_threshold: f32,
}

impl Default for SortSchedulerConfig {
    fn default() -> Self {
        Self {
            progressive_threshold: 1_000_000,
            angle_threshold: 0.99,
            position_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortPlan {
    pub splat_sort_count: usize,
    pub splat_render_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct CameraState {
    position: Vec3,
    direction: Vec3,
    visible: usize,
}

/// Decides whether the next frame needs a sort, and how much of the visible
/// set it covers.
#[derive(Debug, Clone)]
pub struct SortScheduler {
    config: SortSchedulerConfig,
    last: Option<CameraState>,
    step: usize,
}

impl SortScheduler {
    pub fn new(config: SortSchedulerConfig) -> Self {
        Self {
            config,
            last: None,
            step: 0,
        }
    }

    /// Forces the next plan to start over, e.g. after the scene changed.
    pub fn reset(&mut self) {
        self.last = None;
        self.step = 0;
    }

    fn camera_moved(&self, position: Vec3, direction: Vec3, visible: usize) -> bool {
        match &self.last {
            None => true,
            Some(last) => {
                last.visible != visible
                    || last.direction.dot(direction) < self.config.angle_threshold
                    || last.position.distance(position) > self.config.position_threshold
            }
        }
    }

    /// Returns the sort to issue this frame, or `None` when the previous order
    /// is still good. Call only when no sort is in flight.
    ///
    /// Every plan renders the whole visible set. The set is expected
    /// nearest-first, so a partial plan depth sorts the closest splats and the
    /// engine draws them last, over the unsorted remainder.
    pub fn plan(
        &mut self,
        camera_position: Vec3,
        view_direction: Vec3,
        visible_count: usize,
        dynamic: bool,
    ) -> Option<SortPlan> {
        let direction = view_direction.normalize_or_zero();
        let full = SortPlan {
            splat_sort_count: visible_count,
            splat_render_count: visible_count,
        };
        if dynamic {
            self.last = Some(CameraState {
                position: camera_position,
                direction,
                visible: visible_count,
            });
            self.step = PROGRESSIVE_LADDER.len();
            return Some(full);
        }

        if self.camera_moved(camera_position, direction, visible_count) {
            self.last = Some(CameraState {
                position: camera_position,
                direction,
                visible: visible_count,
            });
            self.step = if visible_count > self.config.progressive_threshold {
                0
            } else {
                PROGRESSIVE_LADDER.len() - 1
            };
        }

        let fraction = PROGRESSIVE_LADDER.get(self.step)?;
        self.step += 1;
        let count = if *fraction >= 1.0 {
            visible_count
        } else {
            ((visible_count as f64 * *fraction as f64).round() as usize).min(visible_count)
        };
        Some(SortPlan {
            splat_sort_count: count,
            splat_render_count: visible_count,
        })
    }
}

impl Default for SortScheduler {
    fn default() -> Self {
        Self::new(SortSchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::{SortEngine, SortEngineConfig, SortParams};
    use glam::Mat4;

    fn small_threshold() -> SortScheduler {
        SortScheduler::new(SortSchedulerConfig {
            progressive_threshold: 100,
            ..Default::default()
        })
    }

    #[test]
    fn test_progressive_ladder_then_idle() {
        let mut scheduler = small_threshold();
        let plans: Vec<SortPlan> = (0..5)
            .filter_map(|_| scheduler.plan(Vec3::ZERO, -Vec3::Z, 1000, false))
            .collect();
        let counts: Vec<usize> = plans.iter().map(|p| p.splat_sort_count).collect();
        assert_eq!(counts, vec![125, 330, 750, 1000]);
        assert!(plans.iter().all(|p| p.splat_render_count == 1000));
    }

    #[test]
    fn test_partial_plan_renders_everything_back_to_front() {
        let mut scheduler = small_threshold();
        let plan = scheduler.plan(Vec3::ZERO, -Vec3::Z, 1000, false).unwrap();
        assert_eq!(plan.splat_sort_count, 125);
        assert_eq!(plan.splat_render_count, 1000);

        // Splat i sits at z = -i, so candidates 0.. are nearest-first.
        let centers: Vec<f32> = (0..1000).flat_map(|i| [0.0, 0.0, -(i as f32)]).collect();
        let mut engine = SortEngine::new(1000, SortEngineConfig::default()).unwrap();
        engine.set_data(centers, vec![]).unwrap();
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let params = SortParams {
            view_proj: Mat4::perspective_rh(1.0, 1.0, 0.1, 2000.0) * view,
            splat_sort_count: plan.splat_sort_count,
            splat_render_count: plan.splat_render_count,
        };
        let candidates: Vec<u32> = (0..1000).collect();
        let out = engine.sort(&params, &candidates, None).unwrap();
        let expected: Vec<u32> = (0..1000).rev().collect();
        assert_eq!(out, expected.as_slice());
    }

    #[test]
    fn test_small_scenes_sort_fully_once() {
        let mut scheduler = small_threshold();
        let plan = scheduler.plan(Vec3::ZERO, -Vec3::Z, 50, false).unwrap();
        assert_eq!(plan.splat_sort_count, 50);
        assert_eq!(plan.splat_render_count, 50);
        assert!(scheduler.plan(Vec3::ZERO, -Vec3::Z, 50, false).is_none());
    }

    #[test]
    fn test_camera_changes_restart_the_ladder() {
        let mut scheduler = small_threshold();
        for _ in 0..4 {
            scheduler.plan(Vec3::ZERO, -Vec3::Z, 1000, false);
        }
        // Small moves stay under both thresholds.
        assert!(scheduler
            .plan(Vec3::new(0.5, 0.0, 0.0), -Vec3::Z, 1000, false)
            .is_none());

        let turned = Vec3::new(0.3, 0.0, -1.0);
        let plan = scheduler.plan(Vec3::ZERO, turned, 1000, false).unwrap();
        assert_eq!(plan.splat_sort_count, 125);

        for _ in 0..3 {
            scheduler.plan(Vec3::ZERO, turned, 1000, false);
        }
        let plan = scheduler
            .plan(Vec3::new(0.0, 2.0, 0.0), turned, 1000, false)
            .unwrap();
        assert_eq!(plan.splat_sort_count, 125);
    }

    #[test]
    fn test_dynamic_always_sorts_fully() {
        let mut scheduler = small_threshold();
        for _ in 0..3 {
            let plan = scheduler.plan(Vec3::ZERO, -Vec3::Z, 1000, true).unwrap();
            assert_eq!(plan.splat_sort_count, 1000);
        }
    }
}
