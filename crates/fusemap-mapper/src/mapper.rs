//! [`FusionMapper`] – thread-safe incremental map builder.
//!
//! A mapper owns one backend and feeds it sensor frames in arrival order.
//! Each [`process`][FusionMapper::process] call runs in three phases:
//!
//! 1. take an arrival ticket;
//! 2. resolve the sensor → map transform and filter the points, **without**
//!    holding the map lock, so a slow lookup never blocks readers;
//! 3. wait until the ticket's turn comes up, then insert under the lock.
//!
//! Frames that are ignored mid-way (failed lookup, failed lazy setup, panic)
//! give their turn up through [`Turn`]'s `Drop`, so later frames never wait on
//! them.
//!
//! ```text
//!            ┌──────────────┐  setup() / first process()   ┌─────────────┐
//!  new() ──► │ Uninitialized │ ───────────────────────────► │ Initialized │ ◄─┐
//!            └──────────────┘                               └─────────────┘ ──┘
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fusemap_maps::{MapBackend, MapSnapshot};
use fusemap_perception::{PointFilterStats, TransformError, TransformResolver};
use fusemap_types::{DataItem, MapError};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::MapperSettings;
use crate::persist::{self, MapDescriptor};

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The mapper does not consume this kind of data.
    Ignored,
    /// The whole frame was discarded; the map is unchanged.
    Dropped(DropReason),
    /// The frame was fused.  `rejected` counts points removed by filtering.
    Inserted { inserted: usize, rejected: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// The sensor → map transform could not be resolved in time.
    Transform(TransformError),
    /// The backend could not be built from the mapper's configuration.
    Uninitialized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The mapper never built a backend; nothing was written.
    NoMap,
    Saved { dir: PathBuf, cells: usize },
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MapperStats {
    pub frames_ignored: u64,
    pub frames_inserted: u64,
    pub frames_dropped: u64,
    pub points_inserted: u64,
    pub points_rejected: u64,
    /// Time spent on each inserted frame, excluding the wait for its turn.
    pub processing: FrameTiming,
}

/// Running mean and variance of frame processing time, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FrameTiming {
    count: u64,
    mean_ms: f64,
    m2: f64,
    max_ms: f64,
}

impl FrameTiming {
    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.count += 1;
        let delta = ms - self.mean_ms;
        self.mean_ms += delta / self.count as f64;
        self.m2 += delta * (ms - self.mean_ms);
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean_ms(&self) -> f64 {
        self.mean_ms
    }

    /// Sample variance; `None` with fewer than two frames.
    pub fn variance_ms(&self) -> Option<f64> {
        (self.count > 1).then(|| self.m2 / (self.count - 1) as f64)
    }

    pub fn std_dev_ms(&self) -> Option<f64> {
        self.variance_ms().map(f64::sqrt)
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ms
    }
}

impl fmt::Display for FrameTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 0 {
            return f.write_str("no frames timed");
        }
        write!(
            f,
            "{:.3} ms ± {:.3} ms (max {:.3} ms, n = {})",
            self.mean_ms,
            self.std_dev_ms().unwrap_or(0.0),
            self.max_ms,
            self.count
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MapState {
    backend: Option<MapBackend>,
    /// Last exported snapshot; cleared on every insertion.
    snapshot: Option<Arc<MapSnapshot>>,
    /// Ticket allowed to insert next.
    next_turn: u64,
    /// Tickets given up before their turn.
    skipped: BTreeSet<u64>,
    /// Why the backend could not be built.  Settings never change, so the
    /// build is not retried.
    setup_error: Option<String>,
    stats: MapperStats,
}

impl MapState {
    fn advance_past(&mut self, ticket: u64) {
        self.next_turn = ticket + 1;
        while self.skipped.remove(&self.next_turn) {
            self.next_turn += 1;
        }
    }

    fn give_up(&mut self, ticket: u64) {
        if ticket == self.next_turn {
            self.advance_past(ticket);
        } else {
            self.skipped.insert(ticket);
        }
    }

    fn snapshot(&mut self) -> Option<Arc<MapSnapshot>> {
        if self.snapshot.is_none() {
            let backend = self.backend.as_mut()?;
            self.snapshot = Some(Arc::new(backend.export_snapshot()));
        }
        self.snapshot.clone()
    }
}

/// An arrival ticket.  Dropping it without [`finish`][Turn::finish] gives the
/// turn up.
struct Turn<'a> {
    mapper: &'a FusionMapper,
    ticket: u64,
    finished: bool,
}

impl<'a> Turn<'a> {
    fn take(mapper: &'a FusionMapper) -> Self {
        Self {
            mapper,
            ticket: mapper.next_ticket.fetch_add(1, Ordering::SeqCst),
            finished: false,
        }
    }

    /// Block until every earlier ticket has inserted or given up.
    fn wait(&self) -> MutexGuard<'a, MapState> {
        let state = self.mapper.lock();
        self.mapper
            .turn
            .wait_while(state, |s| s.next_turn != self.ticket)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(mut self, state: &mut MapState) {
        state.advance_past(self.ticket);
        self.finished = true;
        self.mapper.turn.notify_all();
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.mapper.lock().give_up(self.ticket);
        self.mapper.turn.notify_all();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FusionMapper
// ─────────────────────────────────────────────────────────────────────────────

/// Fuses sensor frames into one map backend.
///
/// All methods take `&self`; share a mapper between threads with `Arc`.
pub struct FusionMapper {
    settings: MapperSettings,
    resolver: Arc<dyn TransformResolver>,
    state: Mutex<MapState>,
    /// Signalled once the backend exists.
    map_ready: Condvar,
    /// Signalled whenever `next_turn` moves.
    turn: Condvar,
    next_ticket: AtomicU64,
}

impl fmt::Debug for FusionMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionMapper")
            .field("name", &self.settings.name)
            .field("map_frame", &self.settings.map_frame)
            .field("backend", &self.settings.backend.kind())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl FusionMapper {
    /// Create an uninitialized mapper.  No backend is built until
    /// [`setup`][Self::setup] or the first processed frame.
    pub fn new(settings: MapperSettings, resolver: Arc<dyn TransformResolver>) -> Self {
        Self {
            settings,
            resolver,
            state: Mutex::new(MapState::default()),
            map_ready: Condvar::new(),
            turn: Condvar::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &MapperSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().backend.is_some()
    }

    pub fn stats(&self) -> MapperStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, MapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the backend if it does not exist yet.
    fn ensure_backend(&self, state: &mut MapState) -> Result<(), MapError> {
        if state.backend.is_some() {
            return Ok(());
        }
        let invalid = |details: String| MapError::InvalidConfig {
            mapper: self.settings.name.clone(),
            details,
        };
        if let Some(details) = &state.setup_error {
            return Err(invalid(details.clone()));
        }
        let backend = match MapBackend::build(&self.settings.backend) {
            Ok(backend) => backend,
            Err(e) => {
                let details = e.to_string();
                warn!(
                    mapper = %self.settings.name,
                    error = %details,
                    "map backend setup failed; frames will be dropped"
                );
                state.setup_error = Some(details.clone());
                return Err(invalid(details));
            }
        };
        info!(
            mapper = %self.settings.name,
            kind = %backend.kind(),
            resolution = backend.resolution(),
            "map backend initialised"
        );
        state.backend = Some(backend);
        self.map_ready.notify_all();
        Ok(())
    }

    /// Construct the backend from the configured parameters.
    ///
    /// Calling `setup` on an initialized mapper does nothing.
    ///
    /// # Errors
    ///
    /// [`MapError::InvalidConfig`] when the backend parameters are invalid;
    /// the mapper stays uninitialized.
    pub fn setup(&self) -> Result<(), MapError> {
        let mut state = self.lock();
        self.ensure_backend(&mut state)
    }

    /// True when this mapper consumes `item`'s kind of data.
    pub fn accepts(&self, item: &DataItem) -> bool {
        self.settings.accepts.contains(&item.kind())
    }

    /// Fuse one sensor frame.
    ///
    /// Never fails: frames whose transform cannot be resolved are dropped
    /// whole and reported through the returned outcome.
    #[instrument(skip_all, fields(mapper = %self.settings.name, frame = %item.frame_id()))]
    pub fn process(&self, item: &DataItem) -> ProcessOutcome {
        if !self.accepts(item) {
            self.lock().stats.frames_ignored += 1;
            return ProcessOutcome::Ignored;
        }

        let turn = Turn::take(self);
        let started = Instant::now();
        let stamp = item.time_frame().end;
        let transform = match self.resolver.lookup(
            &self.settings.map_frame,
            item.frame_id(),
            stamp,
            self.settings.tf_timeout,
        ) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, stamp = %stamp, "dropping frame: transform unavailable");
                self.lock().stats.frames_dropped += 1;
                return ProcessOutcome::Dropped(DropReason::Transform(e));
            }
        };

        let filtered = self.settings.filter.apply(&item.points(), &transform);
        let rejected = filtered.stats.rejected();
        if rejected > 0 {
            log_rejections(&filtered.stats);
        }
        let origin = transform.translation;
        let prepared = started.elapsed();

        let mut state = turn.wait();
        if let Err(e) = self.ensure_backend(&mut state) {
            debug!(error = %e, "dropping frame: map backend unavailable");
            state.stats.frames_dropped += 1;
            turn.finish(&mut state);
            return ProcessOutcome::Dropped(DropReason::Uninitialized);
        }

        let inserted = filtered.points.len();
        let insert_started = Instant::now();
        if let Some(backend) = state.backend.as_mut() {
            backend.insert(&filtered.points, origin);
        }
        let elapsed = prepared + insert_started.elapsed();
        state.snapshot = None;
        state.stats.frames_inserted += 1;
        state.stats.points_inserted += inserted as u64;
        state.stats.points_rejected += rejected as u64;
        state.stats.processing.record(elapsed);
        turn.finish(&mut state);
        drop(state);
        self.map_ready.notify_all();

        debug!(inserted, rejected, elapsed_ms = elapsed.as_secs_f64() * 1_000.0, "frame fused");
        ProcessOutcome::Inserted { inserted, rejected }
    }

    /// Snapshot of the current map, blocking until the backend exists.
    ///
    /// **Blocks forever** on a mapper that is never set up and never
    /// processes an accepted frame.  Use [`try_get_map`][Self::try_get_map]
    /// or [`get_map_timeout`][Self::get_map_timeout] when that can happen.
    pub fn get_map(&self) -> Arc<MapSnapshot> {
        let mut state = self.lock();
        loop {
            if let Some(snapshot) = state.snapshot() {
                return snapshot;
            }
            state = self.map_ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Snapshot of the current map, or `None` when uninitialized.
    pub fn try_get_map(&self) -> Option<Arc<MapSnapshot>> {
        self.lock().snapshot()
    }

    /// Like [`get_map`][Self::get_map] but gives up after `timeout`.
    pub fn get_map_timeout(&self, timeout: Duration) -> Option<Arc<MapSnapshot>> {
        let state = self.lock();
        let (mut state, _) = self
            .map_ready
            .wait_timeout_while(state, timeout, |s| s.backend.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.snapshot()
    }

    /// Persist the map into `dir` as `map.toml` plus a payload file.
    ///
    /// The payload is encoded under the map lock; files are written after
    /// it is released.
    ///
    /// # Errors
    ///
    /// - [`MapError::InvalidDestination`] when `dir` exists but is not a
    ///   writable directory.
    /// - [`MapError::Io`] when a write fails.  No partially written file is
    ///   left under its final name.
    #[instrument(skip_all, fields(mapper = %self.settings.name, dir = %dir.as_ref().display()))]
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<SaveOutcome, MapError> {
        let dir = dir.as_ref();
        let (descriptor, payload) = {
            let mut state = self.lock();
            let Some(backend) = state.backend.as_mut() else {
                info!("mapper is not initialised; nothing to save");
                return Ok(SaveOutcome::NoMap);
            };
            backend.refresh();
            let descriptor = MapDescriptor::describe(&self.settings.map_frame, backend);
            let mut payload = Vec::new();
            backend
                .write_payload(&mut payload)
                .map_err(|e| MapError::Codec(e.to_string()))?;
            (descriptor, payload)
        };

        persist::write_map(dir, &descriptor, &payload)?;
        info!(
            cells = descriptor.cell_count,
            payload = %descriptor.payload,
            "map saved"
        );
        Ok(SaveOutcome::Saved {
            dir: dir.to_path_buf(),
            cells: descriptor.cell_count as usize,
        })
    }
}

fn log_rejections(stats: &PointFilterStats) {
    debug!(
        non_finite = stats.rejected_sensor,
        non_finite_after_transform = stats.rejected_map,
        out_of_range = stats.rejected_range,
        "points rejected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use fusemap_maps::{BackendConfig, OccupancyParams};
    use fusemap_perception::Transform3D;
    use fusemap_types::{LaserScan, Point3, SensorData, TimeFrame};

    /// Resolver returning a fixed result for every lookup.
    struct Fixed(Result<Transform3D, TransformError>);

    impl TransformResolver for Fixed {
        fn lookup(&self, _: &str, _: &str, _: DateTime<Utc>, _: Duration) -> Result<Transform3D, TransformError> {
            self.0.clone()
        }
    }

    /// Identity resolver that sleeps before answering.
    struct Slow(Duration);

    impl TransformResolver for Slow {
        fn lookup(&self, _: &str, _: &str, _: DateTime<Utc>, _: Duration) -> Result<Transform3D, TransformError> {
            std::thread::sleep(self.0);
            Ok(Transform3D::identity())
        }
    }

    fn stamp() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap()
    }

    fn mapper_with(resolver: Fixed, resolution: f64) -> FusionMapper {
        let backend = BackendConfig::Occupancy(OccupancyParams {
            resolution,
            ..Default::default()
        });
        FusionMapper::new(MapperSettings::new("test", backend), Arc::new(resolver))
    }

    fn identity_mapper() -> FusionMapper {
        mapper_with(Fixed(Ok(Transform3D::identity())), 0.5)
    }

    fn cloud(points: Vec<Point3>) -> DataItem {
        DataItem::pointcloud("laser", stamp(), points)
    }

    #[test]
    fn setup_is_idempotent() {
        let m = identity_mapper();
        assert!(!m.is_initialized());
        m.setup().unwrap();
        m.process(&cloud(vec![Point3::new(1.0, 0.0, 0.0)]));
        m.setup().unwrap();
        assert_eq!(m.get_map().insert_stats().insertions, 1);
    }

    #[test]
    fn setup_with_bad_resolution_leaves_mapper_uninitialized() {
        let m = mapper_with(Fixed(Ok(Transform3D::identity())), 0.0);
        assert!(matches!(m.setup(), Err(MapError::InvalidConfig { .. })));
        assert!(!m.is_initialized());
        assert_eq!(
            m.process(&cloud(vec![Point3::origin()])),
            ProcessOutcome::Dropped(DropReason::Uninitialized)
        );
        assert!(m.try_get_map().is_none());
    }

    #[test]
    fn failed_setup_is_remembered() {
        let m = mapper_with(Fixed(Ok(Transform3D::identity())), -1.0);
        for _ in 0..3 {
            assert_eq!(
                m.process(&cloud(vec![Point3::origin()])),
                ProcessOutcome::Dropped(DropReason::Uninitialized)
            );
        }
        let details = m.lock().setup_error.clone().unwrap();
        assert!(details.contains("resolution"), "{details}");
        match m.setup() {
            Err(MapError::InvalidConfig { mapper, details: again }) => {
                assert_eq!(mapper, "test");
                assert_eq!(again, details);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.stats().frames_dropped, 3);
        assert!(!m.is_initialized());
    }

    #[test]
    fn accepts_only_configured_kinds() {
        let m = identity_mapper();
        let scan = DataItem::new(
            "laser",
            TimeFrame::instant(stamp()),
            SensorData::LaserScan(LaserScan {
                angle_min: 0.0,
                angle_increment: 0.1,
                range_min: 0.1,
                range_max: 10.0,
                ranges: vec![1.0, 2.0],
            }),
        );
        assert!(!m.accepts(&scan));
        assert_eq!(m.process(&scan), ProcessOutcome::Ignored);
        assert!(!m.is_initialized());
        assert_eq!(m.stats().frames_ignored, 1);
    }

    #[test]
    fn process_filters_non_finite_points_and_initializes_lazily() {
        let m = identity_mapper();
        let outcome = m.process(&cloud(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(f64::NAN, 0.0, 0.0),
        ]));
        assert_eq!(outcome, ProcessOutcome::Inserted { inserted: 2, rejected: 1 });
        assert!(m.is_initialized());

        let map = m.get_map();
        assert_eq!(map.insert_stats().points, 2);
        assert_eq!(map.insert_stats().last_origin, Some(Point3::origin()));
        let stats = m.stats();
        assert_eq!(stats.frames_inserted, 1);
        assert_eq!(stats.points_inserted, 2);
        assert_eq!(stats.points_rejected, 1);
    }

    #[test]
    fn failed_lookup_drops_the_frame() {
        let err = TransformError::UnknownFrame {
            target_frame: "map".into(),
            source_frame: "laser".into(),
        };
        let m = mapper_with(Fixed(Err(err.clone())), 1.0);
        m.setup().unwrap();
        assert_eq!(
            m.process(&cloud(vec![Point3::new(1.0, 1.0, 1.0)])),
            ProcessOutcome::Dropped(DropReason::Transform(err))
        );
        assert_eq!(m.get_map().insert_stats().insertions, 0);
        assert_eq!(m.stats().frames_dropped, 1);
        assert_eq!(m.stats().processing.count(), 0);
    }

    #[test]
    fn frame_timing_tracks_mean_and_variance() {
        let mut timing = FrameTiming::default();
        assert_eq!(timing.variance_ms(), None);
        assert_eq!(timing.to_string(), "no frames timed");
        for ms in [10, 20, 30] {
            timing.record(Duration::from_millis(ms));
        }
        assert_eq!(timing.count(), 3);
        assert!((timing.mean_ms() - 20.0).abs() < 1e-9);
        assert!((timing.variance_ms().unwrap() - 100.0).abs() < 1e-6);
        assert!((timing.std_dev_ms().unwrap() - 10.0).abs() < 1e-6);
        assert!((timing.max_ms() - 30.0).abs() < 1e-9);
        assert!(timing.to_string().starts_with("20.000 ms ± 10.000 ms"));
    }

    #[test]
    fn process_times_lookup_and_insert() {
        let backend = BackendConfig::Occupancy(OccupancyParams::default());
        let m = FusionMapper::new(
            MapperSettings::new("slow", backend),
            Arc::new(Slow(Duration::from_millis(15))),
        );
        for i in 0..3 {
            m.process(&cloud(vec![Point3::new(i as f64, 0.0, 0.0)]));
        }
        let timing = m.stats().processing;
        assert_eq!(timing.count(), 3);
        assert!(timing.mean_ms() >= 15.0, "mean {}", timing.mean_ms());
        assert!(timing.max_ms() >= timing.mean_ms());
        assert!(timing.variance_ms().is_some());
    }

    #[test]
    fn dropped_frames_do_not_stall_later_frames() {
        let failing = mapper_with(
            Fixed(Err(TransformError::Timeout {
                target_frame: "map".into(),
                source_frame: "laser".into(),
                waited: Duration::ZERO,
            })),
            1.0,
        );
        for _ in 0..3 {
            failing.process(&cloud(vec![Point3::origin()]));
        }
        // Every ticket was given up, so the next one is immediately due.
        let state = failing.lock();
        assert_eq!(state.next_turn, 3);
        assert!(state.skipped.is_empty());
    }

    #[test]
    fn out_of_order_give_up_is_remembered() {
        let mut state = MapState::default();
        state.give_up(2);
        state.give_up(1);
        assert_eq!(state.next_turn, 0);
        state.advance_past(0);
        assert_eq!(state.next_turn, 3);
        assert!(state.skipped.is_empty());
    }

    #[test]
    fn snapshot_is_cached_until_next_insert() {
        let m = identity_mapper();
        m.process(&cloud(vec![Point3::new(1.0, 0.0, 0.0)]));
        let a = m.get_map();
        let b = m.get_map();
        assert!(Arc::ptr_eq(&a, &b));
        m.process(&cloud(vec![Point3::new(2.0, 0.0, 0.0)]));
        let c = m.get_map();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.insert_stats().insertions, 1);
        assert_eq!(c.insert_stats().insertions, 2);
    }

    #[test]
    fn get_map_timeout_gives_up_when_never_configured() {
        let m = identity_mapper();
        assert!(m.get_map_timeout(Duration::from_millis(20)).is_none());
        m.setup().unwrap();
        assert!(m.get_map_timeout(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn save_without_map_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        let m = identity_mapper();
        assert_eq!(m.save(&target).unwrap(), SaveOutcome::NoMap);
        assert!(!target.exists());
    }
}
