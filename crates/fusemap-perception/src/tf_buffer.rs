//! Time-indexed Transform Frame (TF) buffer.
//!
//! Maintains a graph of named reference frames connected by parent → child
//! edges.  Each edge is either *static* (a fixed mounting offset, e.g.
//! `base_link → laser`) or *dynamic*, carrying a bounded, time-ordered
//! history of poses (e.g. `map → base_link` fed by an external localizer).
//!
//! [`TfBuffer::lookup`] finds a path between two frames with BFS, resolves
//! every edge at the requested instant (interpolating between the bracketing
//! samples) and composes the result.  When the requested instant lies after
//! the newest sample of an edge, or a frame has not been published yet, the
//! lookup waits for new data up to the caller's timeout.
//!
//! The mapper never sees this type directly; it only depends on the
//! [`TransformResolver`] trait so tests can inject canned transforms or
//! forced timeouts.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chrono::{TimeZone, Utc};
//! use fusemap_perception::tf_buffer::{TfBuffer, TransformResolver};
//! use fusemap_perception::transform::Transform3D;
//! use fusemap_types::Point3;
//!
//! let tf = TfBuffer::new();
//! let t0 = Utc.timestamp_opt(100, 0).unwrap();
//! let t1 = Utc.timestamp_opt(101, 0).unwrap();
//!
//! tf.set_static_transform("base_link", "laser",
//!     Transform3D::from_translation(Point3::new(0.2, 0.0, 0.0)));
//! tf.set_transform("map", "base_link", t0, Transform3D::identity());
//! tf.set_transform("map", "base_link", t1,
//!     Transform3D::from_translation(Point3::new(2.0, 0.0, 0.0)));
//!
//! let mid = Utc.timestamp_opt(100, 500_000_000).unwrap();
//! let t = tf.lookup("map", "laser", mid, Duration::ZERO).unwrap();
//! assert!((t.translation.x - 1.2).abs() < 1e-9);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::transform::Transform3D;

/// Default number of samples retained per dynamic edge.
const DEFAULT_HISTORY: usize = 1000;

// ────────────────────────────────────────────────────────────────────────────
// Resolver contract
// ────────────────────────────────────────────────────────────────────────────

/// Reasons a transform could not be resolved.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("no transform path from '{source_frame}' to '{target_frame}'")]
    UnknownFrame {
        target_frame: String,
        source_frame: String,
    },

    #[error("transform '{frame}' requested at {requested} is outside available history [{oldest}, {newest}]")]
    Extrapolation {
        frame: String,
        requested: DateTime<Utc>,
        oldest: DateTime<Utc>,
        newest: DateTime<Utc>,
    },

    #[error("timed out after {waited:?} waiting for '{source_frame}' → '{target_frame}'")]
    Timeout {
        target_frame: String,
        source_frame: String,
        waited: Duration,
    },
}

/// Resolves the rigid transform between two frames at a given instant.
///
/// Implementations must be callable from many threads at once.  A call may
/// block, but never for longer than `timeout`.
pub trait TransformResolver: Send + Sync {
    /// Return T_target_source: the transform mapping points expressed in
    /// `source_frame` into `target_frame` at `time`.
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Transform3D, TransformError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Edge history
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum EdgeHistory {
    Static(Transform3D),
    Dynamic {
        capacity: usize,
        /// Time-ordered `(stamp, parent_T_child)` samples.
        samples: VecDeque<(DateTime<Utc>, Transform3D)>,
    },
}

/// Why a single edge could not be evaluated at the requested instant.
enum EdgeMiss {
    /// Requested time is older than the oldest retained sample.
    TooOld {
        oldest: DateTime<Utc>,
        newest: DateTime<Utc>,
    },
    /// Requested time is newer than the newest sample; more data may arrive.
    TooNew {
        oldest: DateTime<Utc>,
        newest: DateTime<Utc>,
    },
}

impl EdgeHistory {
    fn push(&mut self, stamp: DateTime<Utc>, transform: Transform3D) {
        match self {
            EdgeHistory::Static(_) => *self = EdgeHistory::dynamic(stamp, transform),
            EdgeHistory::Dynamic { capacity, samples } => {
                // Keep the history sorted even when samples arrive late.
                let pos = samples.partition_point(|(t, _)| *t <= stamp);
                if pos > 0 && samples[pos - 1].0 == stamp {
                    samples[pos - 1].1 = transform;
                } else {
                    samples.insert(pos, (stamp, transform));
                }
                while samples.len() > *capacity {
                    samples.pop_front();
                }
            }
        }
    }

    fn dynamic(stamp: DateTime<Utc>, transform: Transform3D) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((stamp, transform));
        EdgeHistory::Dynamic {
            capacity: DEFAULT_HISTORY,
            samples,
        }
    }

    fn at(&self, time: DateTime<Utc>) -> Result<Transform3D, EdgeMiss> {
        let samples = match self {
            EdgeHistory::Static(t) => return Ok(*t),
            EdgeHistory::Dynamic { samples, .. } => samples,
        };

        // An empty history waits for its first sample.
        let (Some(&(oldest, _)), Some(&(newest, _))) = (samples.front(), samples.back()) else {
            return Err(EdgeMiss::TooNew {
                oldest: time,
                newest: time,
            });
        };
        if time < oldest {
            return Err(EdgeMiss::TooOld { oldest, newest });
        }
        if time > newest {
            return Err(EdgeMiss::TooNew { oldest, newest });
        }

        // First sample with stamp >= time.
        let hi = samples.partition_point(|(t, _)| *t < time);
        let (t_hi, tf_hi) = samples[hi];
        if t_hi == time || hi == 0 {
            return Ok(tf_hi);
        }
        let (t_lo, tf_lo) = samples[hi - 1];
        let span = (t_hi - t_lo).num_nanoseconds().unwrap_or(i64::MAX) as f64;
        let offset = (time - t_lo).num_nanoseconds().unwrap_or(0) as f64;
        Ok(tf_lo.interpolate(tf_hi, offset / span))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame graph
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of a single, non-blocking resolution attempt.
enum Attempt {
    Resolved(Transform3D),
    /// No path yet; frames may still be published.
    NoPath,
    /// Some edge has not caught up with the requested time yet.
    Pending(TransformError),
    /// Cannot succeed no matter how long we wait.
    Failed(TransformError),
}

#[derive(Debug, Default)]
struct FrameGraph {
    /// `edges[child] = (parent, history)`; every frame has at most one parent.
    edges: HashMap<String, (String, EdgeHistory)>,
    /// `children[parent]` lists the frames hanging below `parent`.
    children: HashMap<String, HashSet<String>>,
}

impl FrameGraph {
    fn upsert(&mut self, parent: &str, child: &str, update: impl FnOnce(Option<&mut EdgeHistory>) -> Option<EdgeHistory>) {
        // Re-parenting a frame drops its history under the old parent.
        let reparent = matches!(self.edges.get(child), Some((p, _)) if p != parent);
        if reparent {
            if let Some((old_parent, _)) = self.edges.remove(child) {
                if let Some(set) = self.children.get_mut(&old_parent) {
                    set.remove(child);
                }
            }
        }

        match self.edges.get_mut(child) {
            Some((_, history)) => {
                if let Some(replacement) = update(Some(history)) {
                    *history = replacement;
                }
            }
            None => {
                if let Some(history) = update(None) {
                    self.edges
                        .insert(child.to_string(), (parent.to_string(), history));
                    self.children
                        .entry(parent.to_string())
                        .or_default()
                        .insert(child.to_string());
                }
            }
        }
    }

    fn neighbours<'a>(&'a self, frame: &'a str) -> impl Iterator<Item = (&'a str, bool)> + 'a {
        // `true` marks a parent → child step, `false` a child → parent step.
        let down = self
            .children
            .get(frame)
            .into_iter()
            .flat_map(|set| set.iter().map(|c| (c.as_str(), true)));
        let up = self
            .edges
            .get(frame)
            .map(|(parent, _)| (parent.as_str(), false));
        down.chain(up)
    }

    /// BFS from `target` to `source`, returning the frame sequence.
    fn path(&self, target: &str, source: &str) -> Option<Vec<(String, bool)>> {
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut came_from: HashMap<&str, (&str, bool)> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::new();

        queue.push_back(target);
        visited.insert(target);

        while let Some(current) = queue.pop_front() {
            if current == source {
                let mut steps = Vec::new();
                let mut node = current;
                while let Some(&(prev, down)) = came_from.get(node) {
                    steps.push((node.to_string(), down));
                    node = prev;
                }
                steps.reverse();
                return Some(steps);
            }
            for (next, down) in self.neighbours(current) {
                if visited.insert(next) {
                    came_from.insert(next, (current, down));
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn attempt(&self, target: &str, source: &str, time: DateTime<Utc>) -> Attempt {
        if target == source {
            return Attempt::Resolved(Transform3D::identity());
        }
        let Some(steps) = self.path(target, source) else {
            return Attempt::NoPath;
        };

        // Walk from target towards source, accumulating T_target_current.
        let mut accumulated = Transform3D::identity();
        let mut current = target.to_string();
        for (next, down) in steps {
            // The edge is always keyed by its child frame.
            let child = if down { &next } else { &current };
            let Some((_, history)) = self.edges.get(child) else {
                return Attempt::NoPath;
            };
            let edge = match history.at(time) {
                Ok(t) => t,
                Err(EdgeMiss::TooOld { oldest, newest }) => {
                    return Attempt::Failed(TransformError::Extrapolation {
                        frame: child.clone(),
                        requested: time,
                        oldest,
                        newest,
                    });
                }
                Err(EdgeMiss::TooNew { oldest, newest }) => {
                    return Attempt::Pending(TransformError::Extrapolation {
                        frame: child.clone(),
                        requested: time,
                        oldest,
                        newest,
                    });
                }
            };
            let step = if down { edge } else { edge.inverse() };
            accumulated = accumulated.compose(step);
            current = next;
        }
        Attempt::Resolved(accumulated)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TfBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe, time-indexed transform buffer.
///
/// Publishers call [`set_transform`][Self::set_transform] /
/// [`set_static_transform`][Self::set_static_transform]; every publication
/// wakes lookups that are waiting for data.
#[derive(Debug, Default)]
pub struct TfBuffer {
    graph: Mutex<FrameGraph>,
    updated: Condvar,
}

impl TfBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pose of `child_frame` in `parent_frame` at `stamp`.
    pub fn set_transform(
        &self,
        parent_frame: &str,
        child_frame: &str,
        stamp: DateTime<Utc>,
        transform: Transform3D,
    ) {
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        graph.upsert(parent_frame, child_frame, |existing| match existing {
            Some(history) => {
                history.push(stamp, transform);
                None
            }
            None => Some(EdgeHistory::dynamic(stamp, transform)),
        });
        drop(graph);
        self.updated.notify_all();
    }

    /// Register a time-invariant transform (e.g. a sensor mounting offset).
    pub fn set_static_transform(&self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        graph.upsert(parent_frame, child_frame, |_| Some(EdgeHistory::Static(transform)));
        drop(graph);
        self.updated.notify_all();
    }

    /// True when `frame` appears anywhere in the graph.
    pub fn has_frame(&self, frame: &str) -> bool {
        let graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        graph.edges.contains_key(frame) || graph.children.contains_key(frame)
    }
}

impl TransformResolver for TfBuffer {
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Transform3D, TransformError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            let pending = match graph.attempt(target_frame, source_frame, time) {
                Attempt::Resolved(t) => return Ok(t),
                Attempt::Failed(e) => return Err(e),
                Attempt::NoPath => TransformError::UnknownFrame {
                    target_frame: target_frame.to_string(),
                    source_frame: source_frame.to_string(),
                },
                Attempt::Pending(e) => e,
            };

            let now = Instant::now();
            if now >= deadline {
                if timeout.is_zero() || matches!(pending, TransformError::UnknownFrame { .. }) {
                    return Err(pending);
                }
                debug!(target_frame, source_frame, "transform lookup timed out");
                return Err(TransformError::Timeout {
                    target_frame: target_frame.to_string(),
                    source_frame: source_frame.to_string(),
                    waited: now - started,
                });
            }

            let (guard, _) = self
                .updated
                .wait_timeout(graph, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            graph = guard;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
