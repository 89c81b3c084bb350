//! Participant location source
//!
//! Produces this participant's own samples, either from a positioning
//! sensor queried on explicit request (live) or from a pseudo-random
//! generator on a fixed interval (synthetic). Every produced sample is
//! stamped with a monotonic `seq` seeded from the wall clock, so numbering
//! keeps increasing when the same participant restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::SourceConfig;
use crate::error::GeoError;
use crate::location::{Coordinates, LocationSample, ParticipantId};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Platform positioning capability.
pub trait PositionSensor: Send + Sync {
    fn current_position(&self) -> BoxFuture<'_, Result<Coordinates, GeoError>>;
}

/// A sensor that always reports the same fix, or is denied when empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSensor {
    fix: Option<Coordinates>,
}

impl FixedSensor {
    pub fn new(fix: Coordinates) -> Self {
        Self { fix: Some(fix) }
    }

    pub fn unavailable() -> Self {
        Self { fix: None }
    }
}

impl PositionSensor for FixedSensor {
    fn current_position(&self) -> BoxFuture<'_, Result<Coordinates, GeoError>> {
        let result = self
            .fix
            .ok_or_else(|| GeoError::PositionUnavailable("no positioning capability".into()));
        Box::pin(future::ready(result))
    }
}

/// Pseudo-random coordinates, uniform over the globe or jittered around a center.
pub struct SyntheticGenerator {
    rng: Mutex<StdRng>,
    center: Option<Coordinates>,
}

impl SyntheticGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            center: None,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            center: None,
        }
    }

    pub fn around(mut self, center: Coordinates) -> Self {
        self.center = Some(center);
        self
    }

    pub fn next_fix(&self) -> Coordinates {
        let mut rng = self.rng.lock();
        match self.center {
            Some(c) => Coordinates::new(
                (c.lat + rng.gen_range(-0.01..=0.01)).clamp(-90.0, 90.0),
                (c.lng + rng.gen_range(-0.01..=0.01)).clamp(-180.0, 180.0),
            ),
            None => Coordinates::new(rng.gen_range(-90.0..=90.0), rng.gen_range(-180.0..=180.0)),
        }
    }
}

impl Default for SyntheticGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub enum SourceMode {
    Live(Arc<dyn PositionSensor>),
    Synthetic {
        interval: Duration,
        generator: Arc<SyntheticGenerator>,
    },
}

impl SourceMode {
    pub fn synthetic(interval: Duration) -> Self {
        SourceMode::Synthetic {
            interval,
            generator: Arc::new(SyntheticGenerator::new()),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        match config {
            SourceConfig::Live { fixed: Some(fix) } => SourceMode::Live(Arc::new(FixedSensor::new(*fix))),
            SourceConfig::Live { fixed: None } => SourceMode::Live(Arc::new(FixedSensor::unavailable())),
            SourceConfig::Synthetic { interval_ms } => {
                SourceMode::synthetic(Duration::from_millis((*interval_ms).max(1)))
            }
        }
    }
}

pub type SampleCallback = Arc<dyn Fn(LocationSample) + Send + Sync>;

// low bits of a seq left for samples drawn within the same microsecond
const SEQ_COUNTER_BITS: u32 = 10;

/// Clock floor for the next `seq`, so a restarted source numbers above
/// everything its previous incarnation sent.
fn clock_seq() -> u64 {
    let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
    micros << SEQ_COUNTER_BITS
}

struct Active {
    generation: u64,
    callback: SampleCallback,
    timer: Option<JoinHandle<()>>,
    query: Option<JoinHandle<()>>,
}

impl Active {
    fn abort(self) {
        for task in [self.timer, self.query].into_iter().flatten() {
            task.abort();
        }
    }
}

struct SourceInner {
    id: ParticipantId,
    mode: SourceMode,
    query_timeout: Duration,
    seq: AtomicU64,
    generation: AtomicU64,
    active: Mutex<Option<Active>>,
}

impl SourceInner {
    async fn sample(&self) -> Result<LocationSample, GeoError> {
        let coords = match &self.mode {
            SourceMode::Live(sensor) => {
                tokio::time::timeout(self.query_timeout, sensor.current_position())
                    .await
                    .map_err(|_| GeoError::PositionUnavailable("positioning timed out".into()))??
            }
            SourceMode::Synthetic { generator, .. } => generator.next_fix(),
        };
        coords.validate()?;

        Ok(LocationSample::new(self.id.clone(), coords.lat, coords.lng).with_seq(self.next_seq()))
    }

    fn next_seq(&self) -> u64 {
        let floor = clock_seq();
        let previous = self
            .seq
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + 1).max(floor))
            })
            .unwrap_or_else(|current| current);
        (previous + 1).max(floor)
    }
}

#[derive(Clone)]
pub struct LocationSource {
    inner: Arc<SourceInner>,
}

/// Cancels the `start` it came from; a no-op once the source was restarted.
pub struct SourceHandle {
    inner: Arc<SourceInner>,
    generation: u64,
}

impl SourceHandle {
    pub fn cancel(&self) {
        let mut active = self.inner.active.lock();
        if active.as_ref().is_some_and(|a| a.generation == self.generation) {
            if let Some(active) = active.take() {
                active.abort();
            }
        }
    }
}

impl LocationSource {
    pub fn new(id: ParticipantId, mode: SourceMode) -> Self {
        Self::with_query_timeout(id, mode, DEFAULT_QUERY_TIMEOUT)
    }

    pub fn with_query_timeout(id: ParticipantId, mode: SourceMode, query_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                id,
                mode,
                query_timeout,
                seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.inner.id
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.inner.mode, SourceMode::Synthetic { .. })
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Begin producing samples into `on_sample`.
    ///
    /// Synthetic sources start their timer immediately; live sources wait
    /// for [`request`](Self::request). Starting an active source restarts it.
    pub fn start<F>(&self, on_sample: F) -> SourceHandle
    where
        F: Fn(LocationSample) + Send + Sync + 'static,
    {
        self.stop();

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let callback: SampleCallback = Arc::new(on_sample);

        let timer = match &self.inner.mode {
            SourceMode::Synthetic { interval, .. } => {
                let inner = self.inner.clone();
                let callback = callback.clone();
                let period = *interval;
                Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        ticker.tick().await;
                        match inner.sample().await {
                            Ok(sample) => callback(sample),
                            Err(e) => tracing::warn!("synthetic sample failed: {e}"),
                        }
                    }
                }))
            }
            SourceMode::Live(_) => None,
        };

        *self.inner.active.lock() = Some(Active {
            generation,
            callback,
            timer,
            query: None,
        });
        tracing::debug!(id = %self.inner.id, generation, "location source started");

        SourceHandle {
            inner: self.inner.clone(),
            generation,
        }
    }

    /// Stop producing samples, cancelling any timer or in-flight query.
    pub fn stop(&self) {
        if let Some(active) = self.inner.active.lock().take() {
            active.abort();
            tracing::debug!(id = %self.inner.id, "location source stopped");
        }
    }

    /// Query once, deliver the sample to the started callback and return it.
    ///
    /// The query occupies the source's single query slot: a request still in
    /// flight is replaced, and [`stop`](Self::stop) aborts it. A replaced or
    /// aborted request resolves to `PositionUnavailable`.
    pub async fn request(&self) -> Result<LocationSample, GeoError> {
        let done = {
            let mut guard = self.inner.active.lock();
            let active = guard
                .as_mut()
                .ok_or_else(|| GeoError::PositionUnavailable("source not started".into()))?;

            if let Some(previous) = active.query.take() {
                previous.abort();
            }
            let (tx, rx) = oneshot::channel();
            let inner = self.inner.clone();
            let callback = active.callback.clone();
            active.query = Some(tokio::spawn(async move {
                let result = inner.sample().await;
                match &result {
                    Ok(sample) => callback(sample.clone()),
                    Err(e) => tracing::warn!(id = %inner.id, "{e}"),
                }
                let _ = tx.send(result);
            }));
            rx
        };

        done.await
            .map_err(|_| GeoError::PositionUnavailable("location request cancelled".into()))?
    }

    /// Query once and return the sample without delivering it.
    pub async fn sample_once(&self) -> Result<LocationSample, GeoError> {
        self.inner.sample().await
    }
}
