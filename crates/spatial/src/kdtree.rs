use kiddo::float::distance::SquaredEuclidean;
use kiddo::immutable::float::kdtree::ImmutableKdTree;
use std::num::NonZero;

use crate::index::NeighborIndex;

/// k-d tree neighbor index over one chunk's points.
///
/// Built on kiddo v5's `ImmutableKdTree`, which uses a cache-optimized
/// layout for faster queries than the mutable variant. The tree is built
/// once per chunk from a contiguous point slice and cannot be modified
/// afterwards; `u32` items map back to positions in that slice.
#[derive(Debug, Clone)]
pub struct KdTreeIndex {
    tree: ImmutableKdTree<f64, u32, 3, 32>,
    num_points: usize,
}

impl KdTreeIndex {
    pub fn build(points: &[[f64; 3]]) -> Self {
        if points.is_empty() {
            return Self {
                tree: ImmutableKdTree::new_from_slice(&[]),
                num_points: 0,
            };
        }
        Self {
            tree: ImmutableKdTree::new_from_slice(points),
            num_points: points.len(),
        }
    }
}

impl NeighborIndex for KdTreeIndex {
    fn len(&self) -> usize {
        self.num_points
    }

    fn knn(&self, query: &[f64; 3], k: usize) -> Vec<usize> {
        if k == 0 || self.is_empty() || !query.iter().all(|v| v.is_finite()) {
            return Vec::new();
        }

        let nz_k = NonZero::new(k).unwrap();
        let results = self.tree.nearest_n::<SquaredEuclidean>(query, nz_k);
        results.iter().map(|nn| nn.item as usize).collect()
    }
}
