//! k-d tree over Earth-centred cartesian points
//!
//! Straight-line (chord) distance between two points on the sphere grows
//! monotonically with their great-circle distance, so a euclidean nearest
//! neighbour search over `Coordinate::to_cartesian` points returns the
//! geodesically nearest nodes.

use crate::geo::Coordinate;

#[derive(Debug)]
struct KdNode {
    point: [f64; 3],
    item: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Immutable nearest-neighbour index; items are caller-side indices
#[derive(Debug, Default)]
pub struct SpatialIndex {
    nodes: Vec<KdNode>,
    root: Option<usize>,
}

impl SpatialIndex {
    /// Build an index where item `i` sits at `coords[i]`
    pub fn build(coords: &[Coordinate]) -> Self {
        let mut points: Vec<(usize, [f64; 3])> = coords
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.to_cartesian()))
            .collect();

        let mut index = Self {
            nodes: Vec::with_capacity(points.len()),
            root: None,
        };
        index.root = index.build_subtree(&mut points, 0);
        index
    }

    fn build_subtree(&mut self, points: &mut [(usize, [f64; 3])], depth: usize) -> Option<usize> {
        if points.is_empty() {
            return None;
        }

        let axis = depth % 3;
        points.sort_by(|a, b| a.1[axis].total_cmp(&b.1[axis]));
        let median = points.len() / 2;
        let (item, point) = points[median];

        let slot = self.nodes.len();
        self.nodes.push(KdNode {
            point,
            item,
            axis,
            left: None,
            right: None,
        });

        let (below, rest) = points.split_at_mut(median);
        let left = self.build_subtree(below, depth + 1);
        let right = self.build_subtree(&mut rest[1..], depth + 1);
        self.nodes[slot].left = left;
        self.nodes[slot].right = right;

        Some(slot)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Items of the `k` nearest points to `target`, nearest first
    pub fn nearest(&self, target: Coordinate, k: usize) -> Vec<usize> {
        if k == 0 {
            return Vec::new();
        }

        let query = target.to_cartesian();
        let mut best: Vec<(f64, usize)> = Vec::with_capacity(k + 1);
        if let Some(root) = self.root {
            self.search(root, &query, k, &mut best);
        }
        best.into_iter().map(|(_, item)| item).collect()
    }

    /// Like `nearest`, but also keeps every point tied with the `k`-th
    /// distance, so coincident points are never cut off by item order
    pub fn nearest_with_ties(&self, target: Coordinate, k: usize) -> Vec<usize> {
        if k == 0 {
            return Vec::new();
        }

        let query = target.to_cartesian();
        let mut best: Vec<(f64, usize)> = Vec::with_capacity(k + 1);
        if let Some(root) = self.root {
            self.search(root, &query, k, &mut best);
        }

        if best.len() < k {
            return best.into_iter().map(|(_, item)| item).collect();
        }
        let radius = best[k - 1].0;

        let mut within = Vec::new();
        if let Some(root) = self.root {
            self.collect_within(root, &query, radius, &mut within);
        }
        within.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        within.into_iter().map(|(_, item)| item).collect()
    }

    fn collect_within(&self, slot: usize, query: &[f64; 3], radius: f64, out: &mut Vec<(f64, usize)>) {
        let node = &self.nodes[slot];
        let distance = squared_distance(&node.point, query);
        if distance <= radius {
            out.push((distance, node.item));
        }

        let diff = query[node.axis] - node.point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.collect_within(near, query, radius, out);
        }
        if let Some(far) = far {
            if diff * diff <= radius {
                self.collect_within(far, query, radius, out);
            }
        }
    }

    fn search(&self, slot: usize, query: &[f64; 3], k: usize, best: &mut Vec<(f64, usize)>) {
        let node = &self.nodes[slot];
        insert_candidate(best, k, squared_distance(&node.point, query), node.item);

        let diff = query[node.axis] - node.point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.search(near, query, k, best);
        }
        if let Some(far) = far {
            let worst = best.last().map(|(d, _)| *d).unwrap_or(f64::INFINITY);
            if best.len() < k || diff * diff <= worst {
                self.search(far, query, k, best);
            }
        }
    }
}

/// Keep `best` sorted by (distance, item) and at most `k` long
fn insert_candidate(best: &mut Vec<(f64, usize)>, k: usize, distance: f64, item: usize) {
    let pos = best.partition_point(|&(d, i)| d < distance || (d == distance && i < item));
    if pos >= k {
        return;
    }
    best.insert(pos, (distance, item));
    best.truncate(k);
}

fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
