//! Isolation Forest for multivariate outlier scoring.
//!
//! Points that are isolated by few random axis-aligned cuts are outliers.
//! Each tree is grown on a random subsample of the reference population up to
//! a height limit of ceil(log2(sample_size)); the anomaly measure of a point is
//! s(x) = 2^(-E[h(x)] / c(sample_size)), close to 1 for outliers and at or
//! below 0.5 for inliers.
//!
//! Reference: "Isolation Forest" (Liu, Ting, Zhou, ICDM 2008)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Euler-Mascheroni constant, used in the harmonic-number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Serialize, Deserialize, Clone, Debug)]
enum ITreeNode {
    Internal {
        split_dim: usize,
        split_value: f64,
        left: Box<ITreeNode>,
        right: Box<ITreeNode>,
    },
    Leaf {
        /// Number of training points that ended here
        size: usize,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct IsolationTree {
    root: ITreeNode,
}

impl IsolationTree {
    fn grow<P: AsRef<[f64]>>(
        data: &[P],
        indices: Vec<usize>,
        depth: usize,
        height_limit: usize,
        dimensions: usize,
        rng: &mut StdRng,
    ) -> ITreeNode {
        if indices.len() <= 1 || depth >= height_limit {
            return ITreeNode::Leaf {
                size: indices.len(),
            };
        }

        // Only dimensions with spread in this node can be cut.
        let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(dimensions);
        for dim in 0..dimensions {
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for &i in &indices {
                let v = data[i].as_ref()[dim];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if hi > lo {
                candidates.push((dim, lo, hi));
            }
        }
        if candidates.is_empty() {
            return ITreeNode::Leaf {
                size: indices.len(),
            };
        }

        let (split_dim, lo, hi) = candidates[rng.random_range(0..candidates.len())];
        let split_value = lo + rng.random::<f64>() * (hi - lo);

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| data[i].as_ref()[split_dim] < split_value);

        ITreeNode::Internal {
            split_dim,
            split_value,
            left: Box::new(Self::grow(data, left, depth + 1, height_limit, dimensions, rng)),
            right: Box::new(Self::grow(data, right, depth + 1, height_limit, dimensions, rng)),
        }
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                ITreeNode::Internal {
                    split_dim,
                    split_value,
                    left,
                    right,
                } => {
                    node = if point[*split_dim] < *split_value {
                        left
                    } else {
                        right
                    };
                    depth += 1.0;
                }
                ITreeNode::Leaf { size } => return depth + average_path_length(*size),
            }
        }
    }

    fn max_split_dim(&self) -> Option<usize> {
        let mut max = None;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if let ITreeNode::Internal {
                split_dim,
                left,
                right,
                ..
            } = node
            {
                max = max.max(Some(*split_dim));
                stack.push(left.as_ref());
                stack.push(right.as_ref());
            }
        }
        max
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(try_from = "ForestParts")]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    /// Subsample size each tree was grown on
    sample_size: usize,
    dimensions: usize,
}

/// Unchecked deserialized form; every split must address a real dimension.
#[derive(Deserialize)]
struct ForestParts {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    dimensions: usize,
}

impl TryFrom<ForestParts> for IsolationForest {
    type Error = ModelError;

    fn try_from(parts: ForestParts) -> Result<Self, ModelError> {
        for (tree, t) in parts.trees.iter().enumerate() {
            if let Some(split_dim) = t.max_split_dim().filter(|d| *d >= parts.dimensions) {
                return Err(ModelError::SplitOutOfRange {
                    tree,
                    split_dim,
                    dimensions: parts.dimensions,
                });
            }
        }
        Ok(Self {
            trees: parts.trees,
            sample_size: parts.sample_size,
            dimensions: parts.dimensions,
        })
    }
}

impl IsolationForest {
    /// Grow a forest on a reference population. Returns `None` for empty data.
    pub fn fit<P: AsRef<[f64]>>(
        data: &[P],
        num_trees: usize,
        sample_size: usize,
        seed: u64,
    ) -> Option<Self> {
        let first = data.first()?;
        let dimensions = first.as_ref().len();
        let sample_size = sample_size.clamp(2, data.len().max(2)).min(data.len());
        let height_limit = (sample_size.max(2) as f64).log2().ceil() as usize;

        let trees = (0..num_trees.max(1))
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                let indices =
                    rand::seq::index::sample(&mut rng, data.len(), sample_size).into_vec();
                IsolationTree {
                    root: IsolationTree::grow(data, indices, 0, height_limit, dimensions, &mut rng),
                }
            })
            .collect();

        Some(Self {
            trees,
            sample_size,
            dimensions,
        })
    }

    /// s(x) in (0, 1]; larger means more isolated.
    pub fn anomaly_measure(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() || point.len() != self.dimensions {
            return 0.5;
        }
        let mean_depth = self
            .trees
            .iter()
            .map(|t| t.path_length(point))
            .sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_depth / c)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }
}
