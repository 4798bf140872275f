use glam::{Quat, Vec3};

use crate::common::is_degenerate_scale;

/// Axis-aligned box with a cached center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min,
            max,
            center: (min + max) * 0.5,
        }
    }

    /// Smallest box around `points`, or `None` when there are none.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self::new(min, max))
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Closed containment test.
    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Octant of `p` relative to the center: bit 0 is x, bit 1 y, bit 2 z.
    /// Coordinates below the center go low, everything else high, so every
    /// point lands in exactly one octant.
    #[inline]
    pub fn octant_of(&self, p: Vec3) -> usize {
        (p.x >= self.center.x) as usize
            | ((p.y >= self.center.y) as usize) << 1
            | ((p.z >= self.center.z) as usize) << 2
    }

    pub fn octant(&self, octant: usize) -> Aabb {
        let pick = |bit: usize, lo: f32, mid: f32, hi: f32| {
            if octant & bit == 0 {
                (lo, mid)
            } else {
                (mid, hi)
            }
        };
        let (x0, x1) = pick(1, self.min.x, self.center.x, self.max.x);
        let (y0, y1) = pick(2, self.min.y, self.center.y, self.max.y);
        let (z0, z1) = pick(4, self.min.z, self.center.z, self.max.z);
        Aabb::new(Vec3::new(x0, y0, z0), Vec3::new(x1, y1, z1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Unit length.
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Slab test. Returns the entry and exit distances clipped to the
    /// positive half of the ray.
    pub fn intersect_aabb(&self, aabb: &Aabb) -> Option<(f32, f32)> {
        let mut t_min = f32::NEG_INFINITY;
        let mut t_max = f32::INFINITY;
        for axis in 0..3 {
            let (o, d) = (self.origin[axis], self.direction[axis]);
            let (lo, hi) = (aabb.min[axis], aabb.max[axis]);
            // Parallel to this slab: inside it or never.
            if d.abs() <= f32::EPSILON {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let (t0, t1) = ((lo - o) * inv, (hi - o) * inv);
            t_min = t_min.max(t0.min(t1));
            t_max = t_max.min(t0.max(t1));
            if t_max < t_min {
                return None;
            }
        }
        (t_max >= 0.0).then(|| (t_min.max(0.0), t_max))
    }

    /// Nearest positive hit against a sphere.
    pub fn intersect_sphere(&self, center: Vec3, radius: f32) -> Option<f32> {
        nearest_unit_hit((self.origin - center) / radius, self.direction / radius)
    }

    /// Nearest positive hit against the ellipsoid with radii `scale`, rotated
    /// by `rotation` and centered at `center`. Degenerate splats never hit.
    pub fn intersect_splat(&self, center: Vec3, scale: Vec3, rotation: Quat) -> Option<f32> {
        if is_degenerate_scale(scale.to_array()) {
            return None;
        }
        let to_local = rotation.normalize().inverse();
        let origin = to_local * (self.origin - center) / scale;
        let direction = to_local * self.direction / scale;
        nearest_unit_hit(origin, direction)
    }
}

/// Solves `|o + t·d| = 1`. `t` is in the caller's units because the mapping
/// to local space is linear.
fn nearest_unit_hit(origin: Vec3, direction: Vec3) -> Option<f32> {
    let a = direction.length_squared();
    if a <= f32::EPSILON {
        return None;
    }
    let b = origin.dot(direction);
    let c = origin.length_squared() - 1.0;
    let disc = b * b - a * c;
    if disc < 0.0 {
        return None;
    }
    let root = disc.sqrt();
    let near = (-b - root) / a;
    let far = (-b + root) / a;
    if near >= 0.0 {
        Some(near)
    } else if far >= 0.0 {
        // Origin is inside.
        Some(0.0)
    } else {
        None
    }
}
