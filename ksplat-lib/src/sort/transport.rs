//! How candidate and sorted index buffers cross the worker boundary.
//!
//! `Copy` moves owned vectors through the channel on every request and
//! response. `Shared` allocates one arena up front; the caller stages
//! candidates into it, the worker reads them and writes the sorted order into
//! whichever of the two result halves the caller picked. The mutex guarantees the two sides never touch
//! the arena at the same time.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::SplatError;
use crate::sort::engine::{SortEngine, SortParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Copy,
    Shared,
}

/// Offsets (in `u32` words) of every region in a [`SharedSortArena`].
/// Sent with the init handshake so both sides agree on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaLayout {
    pub capacity: usize,
    pub candidates: Range<usize>,
    /// Precomputed depths, stored as `f32` bits.
    pub distances: Range<usize>,
    pub sorted: [Range<usize>; 2],
}

impl ArenaLayout {
    pub fn for_splat_count(capacity: usize) -> Self {
        let region = |i: usize| i * capacity..(i + 1) * capacity;
        Self {
            capacity,
            candidates: region(0),
            distances: region(1),
            sorted: [region(2), region(3)],
        }
    }

    pub fn total_words(&self) -> usize {
        self.sorted[1].end
    }
}

#[derive(Debug)]
pub struct SharedSortArena {
    layout: ArenaLayout,
    data: Mutex<Vec<u32>>,
}

impl SharedSortArena {
    pub fn new(capacity: usize) -> Self {
        let layout = ArenaLayout::for_splat_count(capacity);
        let data = Mutex::new(vec![0; layout.total_words()]);
        Self { layout, data }
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Candidate region, for callers that fill it in place before
    /// [`crate::sort::SortWorker::request_staged_sort`].
    pub fn candidates_mut(&self) -> MappedMutexGuard<'_, [u32]> {
        let range = self.layout.candidates.clone();
        MutexGuard::map(self.data.lock(), move |d| &mut d[range])
    }

    pub fn distances_mut(&self) -> MappedMutexGuard<'_, [u32]> {
        let range = self.layout.distances.clone();
        MutexGuard::map(self.data.lock(), move |d| &mut d[range])
    }

    fn sorted(&self, half: usize, len: usize) -> MappedMutexGuard<'_, [u32]> {
        let start = self.layout.sorted[half].start;
        MutexGuard::map(self.data.lock(), move |d| &mut d[start..start + len])
    }
}

/// Candidate data of one sort request.
#[derive(Debug)]
pub enum SortPayload {
    Inline {
        candidates: Vec<u32>,
        precomputed: Option<Vec<f32>>,
    },
    Shared {
        candidate_count: usize,
        precomputed: bool,
    },
}

/// Sorted order returned by the worker.
#[derive(Debug, Clone)]
pub enum SortedIndexes {
    Owned(Vec<u32>),
    /// Valid until a newer result is delivered and the sort after it reuses
    /// this half.
    Shared {
        arena: Arc<SharedSortArena>,
        half: usize,
        len: usize,
    },
}

impl SortedIndexes {
    pub fn len(&self) -> usize {
        match self {
            SortedIndexes::Owned(v) => v.len(),
            SortedIndexes::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_slice<R>(&self, f: impl FnOnce(&[u32]) -> R) -> R {
        match self {
            SortedIndexes::Owned(v) => f(v),
            SortedIndexes::Shared { arena, half, len } => f(&arena.sorted(*half, *len)),
        }
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.with_slice(<[u32]>::to_vec)
    }
}

#[derive(Debug, Clone)]
pub enum SortTransport {
    Copy,
    Shared(Arc<SharedSortArena>),
}

impl SortTransport {
    pub fn new(mode: TransportMode, splat_count: usize) -> Self {
        match mode {
            TransportMode::Copy => SortTransport::Copy,
            TransportMode::Shared => SortTransport::Shared(Arc::new(SharedSortArena::new(splat_count))),
        }
    }

    pub fn mode(&self) -> TransportMode {
        match self {
            SortTransport::Copy => TransportMode::Copy,
            SortTransport::Shared(_) => TransportMode::Shared,
        }
    }

    pub fn layout(&self) -> Option<ArenaLayout> {
        match self {
            SortTransport::Copy => None,
            SortTransport::Shared(arena) => Some(arena.layout().clone()),
        }
    }

    pub fn arena(&self) -> Option<&Arc<SharedSortArena>> {
        match self {
            SortTransport::Copy => None,
            SortTransport::Shared(arena) => Some(arena),
        }
    }

    /// Caller side: packages candidates for the worker.
    pub fn stage(&self, candidates: &[u32], precomputed: Option<&[f32]>) -> Result<SortPayload, SplatError> {
        match self {
            SortTransport::Copy => Ok(SortPayload::Inline {
                candidates: candidates.to_vec(),
                precomputed: precomputed.map(<[f32]>::to_vec),
            }),
            SortTransport::Shared(arena) => {
                let capacity = arena.layout().capacity;
                if candidates.len() > capacity || precomputed.is_some_and(|d| d.len() > capacity) {
                    return Err(SplatError::InvalidSortRequest(format!(
                        "{} candidates exceed the shared arena capacity {}",
                        candidates.len(),
                        capacity
                    )));
                }
                arena.candidates_mut()[..candidates.len()].copy_from_slice(candidates);
                if let Some(depths) = precomputed {
                    let mut region = arena.distances_mut();
                    for (slot, d) in region.iter_mut().zip(depths) {
                        *slot = d.to_bits();
                    }
                }
                Ok(SortPayload::Shared {
                    candidate_count: candidates.len(),
                    precomputed: precomputed.is_some(),
                })
            }
        }
    }

    /// Worker side: runs one sort and hands the result back the way this
    /// transport moves data. `half` selects the shared result region.
    pub fn execute(
        &self,
        engine: &mut SortEngine,
        params: &SortParams,
        payload: SortPayload,
        half: usize,
    ) -> Result<SortedIndexes, SplatError> {
        match (self, payload) {
            (
                SortTransport::Copy,
                SortPayload::Inline {
                    candidates,
                    precomputed,
                },
            ) => {
                let sorted = engine.sort(params, &candidates, precomputed.as_deref())?;
                Ok(SortedIndexes::Owned(sorted.to_vec()))
            }
            (
                SortTransport::Shared(arena),
                SortPayload::Shared {
                    candidate_count,
                    precomputed,
                },
            ) => {
                let layout = arena.layout();
                if candidate_count > layout.capacity {
                    return Err(SplatError::InvalidSortRequest(format!(
                        "{} candidates exceed the shared arena capacity {}",
                        candidate_count, layout.capacity
                    )));
                }
                let mut data = arena.data.lock();
                let candidates = &data[layout.candidates.start..layout.candidates.start + candidate_count];
                let depths: Option<Vec<f32>> = precomputed.then(|| {
                    data[layout.distances.start..layout.distances.start + candidate_count]
                        .iter()
                        .map(|&bits| f32::from_bits(bits))
                        .collect()
                });
                let sorted = engine.sort(params, candidates, depths.as_deref())?;
                let len = sorted.len();
                let start = layout.sorted[half].start;
                data[start..start + len].copy_from_slice(sorted);
                Ok(SortedIndexes::Shared {
                    arena: Arc::clone(arena),
                    half,
                    len,
                })
            }
            _ => Err(SplatError::InvalidSortRequest(
                "payload does not match the worker transport".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::engine::SortEngineConfig;
    use glam::Mat4;

    fn engine() -> SortEngine {
        let mut engine = SortEngine::new(4, SortEngineConfig::default()).unwrap();
        engine.set_data(vec![0.0; 12], vec![]).unwrap();
        engine
    }

    #[test]
    fn test_layout_regions_do_not_overlap() {
        let layout = ArenaLayout::for_splat_count(10);
        assert_eq!(layout.candidates, 0..10);
        assert_eq!(layout.distances, 10..20);
        assert_eq!(layout.sorted, [20..30, 30..40]);
        assert_eq!(layout.total_words(), 40);
    }

    #[test]
    fn test_copy_and_shared_agree() {
        let params = SortParams::full(Mat4::IDENTITY, 4);
        let candidates = [0u32, 1, 2, 3];
        let depths = [0.5f32, 4.0, -1.0, 2.0];

        let copy = SortTransport::new(TransportMode::Copy, 4);
        let payload = copy.stage(&candidates, Some(&depths)).unwrap();
        let a = copy.execute(&mut engine(), &params, payload, 0).unwrap();

        let shared = SortTransport::new(TransportMode::Shared, 4);
        let payload = shared.stage(&candidates, Some(&depths)).unwrap();
        let b = shared.execute(&mut engine(), &params, payload, 1).unwrap();

        assert_eq!(a.to_vec(), vec![1, 3, 0, 2]);
        assert_eq!(a.to_vec(), b.to_vec());
        assert!(matches!(b, SortedIndexes::Shared { half: 1, len: 4, .. }));
    }

    #[test]
    fn test_shared_capacity_and_mismatch() {
        let shared = SortTransport::new(TransportMode::Shared, 2);
        assert!(shared.stage(&[0, 1, 2], None).is_err());

        let copy = SortTransport::new(TransportMode::Copy, 2);
        let payload = copy.stage(&[0, 1], None).unwrap();
        assert!(matches!(
            shared.execute(&mut engine(), &SortParams::full(Mat4::IDENTITY, 2), payload, 0),
            Err(SplatError::InvalidSortRequest(_))
        ));
    }
}
