use std::ops::Range;

use glam::{Mat4, Vec3, Vec4Swizzles};

use crate::ray::{Aabb, Ray};
use crate::scene::MergedSplats;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatTreeConfig {
    pub max_depth: u32,
    pub max_centers_per_node: usize,
    /// Slack around the unit NDC cube when testing node centers for
    /// visibility.
    pub visibility_margin: f32,
}

impl Default for SplatTreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_centers_per_node: 1000,
            visibility_margin: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SplatTreeNode {
    pub bounds: Aabb,
    pub depth: u32,
    /// First of 8 consecutive child nodes; `None` for leaves.
    first_child: Option<u32>,
    /// Range into the tree's shared index array. Empty for internal nodes.
    indexes: Range<u32>,
}

impl SplatTreeNode {
    pub fn is_leaf(&self) -> bool {
        self.first_child.is_none()
    }

    pub fn children(&self) -> Option<Range<u32>> {
        self.first_child.map(|first| first..first + 8)
    }
}

/// Root of the nodes built for one scene (dynamic mode) or for all splats.
#[derive(Debug, Clone)]
pub struct SplatSubTree {
    pub scene: Option<usize>,
    pub root: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub index: u32,
    pub distance: f32,
    pub position: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct SplatTree {
    config: SplatTreeConfig,
    nodes: Vec<SplatTreeNode>,
    indexes: Vec<u32>,
    subtrees: Vec<SplatSubTree>,
    nodes_with_indexes: Vec<u32>,
    duplicates_dropped: usize,
}

impl SplatTree {
    pub fn build(
        splats: &MergedSplats,
        config: SplatTreeConfig,
        filter: impl Fn(u32) -> bool,
    ) -> SplatTree {
        SplatTreeBuilder::new(config).build(splats, filter)
    }

    pub fn config(&self) -> &SplatTreeConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[SplatTreeNode] {
        &self.nodes
    }

    pub fn subtrees(&self) -> &[SplatSubTree] {
        &self.subtrees
    }

    pub fn node_indexes(&self, node: &SplatTreeNode) -> &[u32] {
        &self.indexes[node.indexes.start as usize..node.indexes.end as usize]
    }

    /// Indices dropped at leaf finalization because an earlier leaf already
    /// emitted them. Half-open octants keep this at zero.
    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates_dropped
    }

    /// Total number of indexed splats.
    pub fn indexed_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn count_leaves(&self) -> usize {
        let mut count = 0;
        self.visit_leaves(|_, _| count += 1);
        count
    }

    /// Pre-order walk over every leaf, including empty ones.
    pub fn visit_leaves(&self, mut visitor: impl FnMut(&SplatTreeNode, &[u32])) {
        let mut stack = Vec::new();
        for subtree in self.subtrees.iter().rev() {
            stack.extend(subtree.root);
        }
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            match node.children() {
                Some(children) => stack.extend(children.rev()),
                None => visitor(node, self.node_indexes(node)),
            }
        }
    }

    /// Leaves that hold at least one index, for per-frame iteration without
    /// descending the tree.
    pub fn nodes_with_indexes(&self) -> impl Iterator<Item = (&SplatTreeNode, &[u32])> + '_ {
        self.nodes_with_indexes.iter().map(move |&id| {
            let node = &self.nodes[id as usize];
            (node, self.node_indexes(node))
        })
    }

    fn scene_transform(&self, splats: &MergedSplats, scene: Option<usize>) -> Option<Mat4> {
        match scene {
            Some(scene) if splats.is_dynamic() => splats.scene_transforms().get(scene).copied(),
            _ => None,
        }
    }

    /// Appends the indexes of every leaf whose center is in front of the
    /// camera and inside the widened clip volume, or that contains the camera.
    /// Nearer leaves come first so a partial sort covers them. Returns the
    /// number of indexes appended.
    pub fn collect_visible(
        &self,
        splats: &MergedSplats,
        view_proj: &Mat4,
        camera_position: Vec3,
        out: &mut Vec<u32>,
    ) -> usize {
        let limit = 1.0 + self.config.visibility_margin;
        let mut visible: Vec<(f32, u32)> = Vec::with_capacity(self.nodes_with_indexes.len());

        for subtree in &self.subtrees {
            let transform = self.scene_transform(splats, subtree.scene);
            let mvp = match transform {
                Some(t) => *view_proj * t,
                None => *view_proj,
            };
            let local_camera = match transform {
                Some(t) => t.inverse().transform_point3(camera_position),
                None => camera_position,
            };
            let mut stack: Vec<u32> = subtree.root.into_iter().collect();
            while let Some(id) = stack.pop() {
                let node = &self.nodes[id as usize];
                if let Some(children) = node.children() {
                    stack.extend(children);
                    continue;
                }
                if node.indexes.is_empty() {
                    continue;
                }
                let inside = node.bounds.contains(local_camera);
                let clip = mvp * node.bounds.center.extend(1.0);
                let in_view = clip.w > 0.0 && {
                    let ndc = clip.xyz() / clip.w;
                    ndc.x.abs() <= limit && ndc.y.abs() <= limit && ndc.z.abs() <= limit
                };
                if inside || in_view {
                    let world_center = match transform {
                        Some(t) => t.transform_point3(node.bounds.center),
                        None => node.bounds.center,
                    };
                    visible.push((world_center.distance_squared(camera_position), id));
                }
            }
        }

        visible.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let before = out.len();
        for (_, id) in visible {
            out.extend_from_slice(self.node_indexes(&self.nodes[id as usize]));
        }
        out.len() - before
    }

    /// All splats hit by `ray`, nearest first. Nodes the ray misses are
    /// skipped wholesale.
    pub fn raycast(&self, splats: &MergedSplats, ray: &Ray) -> Vec<RayHit> {
        let mut hits = Vec::new();
        for subtree in &self.subtrees {
            let transform = self.scene_transform(splats, subtree.scene);
            let local_ray = match transform {
                Some(t) => {
                    let inverse = t.inverse();
                    Ray::new(
                        inverse.transform_point3(ray.origin),
                        inverse.transform_vector3(ray.direction),
                    )
                }
                None => *ray,
            };
            let mut stack: Vec<u32> = subtree.root.into_iter().collect();
            while let Some(id) = stack.pop() {
                let node = &self.nodes[id as usize];
                if local_ray.intersect_aabb(&node.bounds).is_none() {
                    continue;
                }
                if let Some(children) = node.children() {
                    stack.extend(children);
                    continue;
                }
                for &index in self.node_indexes(node) {
                    let (Ok(center), Ok((scale, rotation))) =
                        (splats.center(index), splats.scale_rotation(index))
                    else {
                        continue;
                    };
                    let Some(t) = local_ray.intersect_splat(center, scale, rotation) else {
                        continue;
                    };
                    let local_hit = local_ray.at(t);
                    let position = match transform {
                        Some(m) => m.transform_point3(local_hit),
                        None => local_hit,
                    };
                    hits.push(RayHit {
                        index,
                        distance: position.distance(ray.origin),
                        position,
                    });
                }
            }
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index)));
        hits
    }
}

/// Builds [`SplatTree`]s. Partition scratch and the emitted set live here so
/// dynamic scenes can rebuild every frame without reallocating.
#[derive(Debug, Default)]
pub struct SplatTreeBuilder {
    config: SplatTreeConfig,
    work: Vec<u32>,
    scratch: Vec<u32>,
    octants: Vec<u8>,
    emitted: Vec<u64>,
}

impl SplatTreeBuilder {
    pub fn new(config: SplatTreeConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn build(&mut self, splats: &MergedSplats, filter: impl Fn(u32) -> bool) -> SplatTree {
        let mut tree = SplatTree {
            config: self.config,
            ..Default::default()
        };
        self.emitted.clear();
        self.emitted.resize(splats.splat_count().div_ceil(64), 0);

        let ranges: Vec<(Option<usize>, Range<u32>)> = if splats.is_dynamic() {
            splats
                .scene_ranges()
                .iter()
                .cloned()
                .enumerate()
                .map(|(scene, range)| (Some(scene), range))
                .collect()
        } else {
            vec![(None, 0..splats.splat_count() as u32)]
        };

        for (scene, range) in ranges {
            self.work.clear();
            self.work.extend(range.filter(|&i| filter(i)));
            let bounds = Aabb::from_points(self.work.iter().map(|&i| center_of(splats, i)));
            let root = bounds.map(|bounds| {
                let id = tree.nodes.len() as u32;
                tree.nodes.push(SplatTreeNode {
                    bounds,
                    depth: 0,
                    first_child: None,
                    indexes: 0..0,
                });
                let len = self.work.len();
                self.process_node(&mut tree, splats, id, 0..len);
                id
            });
            tree.subtrees.push(SplatSubTree { scene, root });
        }

        tracing::debug!(
            nodes = tree.nodes.len(),
            leaves = tree.nodes_with_indexes.len(),
            indexed = tree.indexes.len(),
            subtrees = tree.subtrees.len(),
            "built splat tree"
        );
        tree
    }

    fn process_node(
        &mut self,
        tree: &mut SplatTree,
        splats: &MergedSplats,
        id: u32,
        range: Range<usize>,
    ) {
        let depth = tree.nodes[id as usize].depth;
        if range.len() < self.config.max_centers_per_node || depth > self.config.max_depth {
            self.finalize_leaf(tree, id, range);
            return;
        }

        let bounds = tree.nodes[id as usize].bounds;
        let mut counts = [0usize; 8];
        self.octants.clear();
        for &index in &self.work[range.clone()] {
            let octant = bounds.octant_of(center_of(splats, index));
            counts[octant] += 1;
            self.octants.push(octant as u8);
        }

        let mut starts = [0usize; 8];
        let mut running = range.start;
        for (start, count) in starts.iter_mut().zip(counts) {
            *start = running;
            running += count;
        }

        self.scratch.clear();
        self.scratch.resize(range.len(), 0);
        let mut cursor = starts;
        for (&index, &octant) in self.work[range.clone()].iter().zip(&self.octants) {
            let slot = &mut cursor[octant as usize];
            self.scratch[*slot - range.start] = index;
            *slot += 1;
        }
        self.work[range].copy_from_slice(&self.scratch);

        let first_child = tree.nodes.len() as u32;
        for octant in 0..8 {
            tree.nodes.push(SplatTreeNode {
                bounds: bounds.octant(octant),
                depth: depth + 1,
                first_child: None,
                indexes: 0..0,
            });
        }
        tree.nodes[id as usize].first_child = Some(first_child);

        for octant in 0..8 {
            let child_range = starts[octant]..starts[octant] + counts[octant];
            self.process_node(tree, splats, first_child + octant as u32, child_range);
        }
    }

    fn finalize_leaf(&mut self, tree: &mut SplatTree, id: u32, range: Range<usize>) {
        let start = tree.indexes.len() as u32;
        for &index in &self.work[range] {
            let (word, bit) = (index as usize / 64, 1u64 << (index % 64));
            if self.emitted[word] & bit != 0 {
                tree.duplicates_dropped += 1;
                continue;
            }
            self.emitted[word] |= bit;
            tree.indexes.push(index);
        }
        let end = tree.indexes.len() as u32;
        tree.nodes[id as usize].indexes = start..end;
        if end > start {
            tree.nodes_with_indexes.push(id);
        }
    }
}

#[inline]
fn center_of(splats: &MergedSplats, index: u32) -> Vec3 {
    let i = index as usize * 3;
    Vec3::new(splats.centers[i], splats.centers[i + 1], splats.centers[i + 2])
}
