/// k-nearest-neighbor query over a bounded point buffer.
///
/// The processing passes only need this one operation; any index structure
/// (k-d tree, grid, brute force) satisfies the contract. Implementations
/// return indices into the buffer the index was built over, sorted by
/// ascending distance. A query placed exactly on a buffer point returns
/// that point among its neighbors.
pub trait NeighborIndex: Sync {
    /// Number of points in the buffer.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of the `k` nearest points to `query`, ascending by distance.
    ///
    /// Edge cases:
    /// - Returns empty if `k == 0`, the buffer is empty, or the query
    ///   contains non-finite values.
    /// - Returns all points if `k >= len()`.
    fn knn(&self, query: &[f64; 3], k: usize) -> Vec<usize>;
}

/// Reference implementation: linear scan. O(n log n) per query, used to
/// cross-check the k-d tree and for very small buffers.
#[derive(Debug, Clone)]
pub struct BruteForceIndex {
    points: Vec<[f64; 3]>,
}

impl BruteForceIndex {
    pub fn build(points: &[[f64; 3]]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }
}

impl NeighborIndex for BruteForceIndex {
    fn len(&self) -> usize {
        self.points.len()
    }

    fn knn(&self, query: &[f64; 3], k: usize) -> Vec<usize> {
        if k == 0 || self.points.is_empty() || !query.iter().all(|v| v.is_finite()) {
            return Vec::new();
        }

        let mut order: Vec<(f64, usize)> = self
            .points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let dx = p[0] - query[0];
                let dy = p[1] - query[1];
                let dz = p[2] - query[2];
                (dx * dx + dy * dy + dz * dz, i)
            })
            .collect();
        // Ties break on index for deterministic output.
        order.sort_by(|a, b| a.partial_cmp(b).unwrap());
        order.truncate(k);
        order.into_iter().map(|(_, i)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brute_force_finds_nearest_in_order() {
        let points = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
        ];
        let index = BruteForceIndex::build(&points);
        assert_eq!(index.knn(&[0.2, 0.0, 0.0], 2), vec![0, 1]);
    }

    #[test]
    fn brute_force_k_zero_and_empty() {
        let index = BruteForceIndex::build(&[]);
        assert!(index.knn(&[0.0, 0.0, 0.0], 3).is_empty());
        let index = BruteForceIndex::build(&[[1.0, 2.0, 3.0]]);
        assert!(index.knn(&[0.0, 0.0, 0.0], 0).is_empty());
    }

    #[test]
    fn brute_force_nan_query_is_empty() {
        let index = BruteForceIndex::build(&[[1.0, 2.0, 3.0]]);
        assert!(index.knn(&[f64::NAN, 0.0, 0.0], 1).is_empty());
    }

    #[test]
    fn brute_force_k_larger_than_buffer() {
        let index = BruteForceIndex::build(&[[0.0; 3], [1.0, 0.0, 0.0]]);
        assert_eq!(index.knn(&[0.0; 3], 10).len(), 2);
    }
}
