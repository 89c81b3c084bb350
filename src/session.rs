//! Participant session
//!
//! Binds one participant identity to a transport channel, a local
//! reconciliation table and a location source, and releases all three
//! through a single idempotent [`Session::shutdown`].
//!
//! The relay never echoes an update to its sender, so every own sample is
//! applied to the local table before it is emitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::ParticipantConfig;
use crate::error::GeoError;
use crate::location::{LocationSample, ParticipantId, LOCATION_UPDATE};
use crate::source::{LocationSource, SourceHandle, SourceMode};
use crate::store::{ApplyOutcome, LocationTable};
use crate::transport::Channel;

pub struct Session {
    id: ParticipantId,
    channel: Channel,
    table: Arc<Mutex<LocationTable>>,
    source: LocationSource,
    source_handle: Mutex<Option<SourceHandle>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Apply an own sample locally, then publish it.
///
/// The table is updated even when the channel is gone. A sample the table
/// rejects as stale is not published.
fn publish_to(
    table: &Mutex<LocationTable>,
    channel: &Channel,
    sample: LocationSample,
) -> Result<ApplyOutcome, GeoError> {
    let payload = sample.to_payload();
    let outcome = table.lock().apply_sample(sample);
    if outcome == ApplyOutcome::Stale {
        tracing::debug!("own sample older than the stored one; not published");
        return Ok(outcome);
    }
    channel.emit(LOCATION_UPDATE, payload)?;
    Ok(outcome)
}

impl Session {
    /// Connect to the configured relay and start a session.
    pub async fn join(config: &ParticipantConfig) -> Result<Self, GeoError> {
        let channel = Channel::connect(&config.relay_url, &config.retry_policy()).await?;
        Ok(Self::attach(config, channel))
    }

    /// Start a session over an already connected channel.
    pub fn attach(config: &ParticipantConfig, channel: Channel) -> Self {
        let source = LocationSource::new(config.id.clone(), SourceMode::from_config(&config.source));
        Self::with_source(channel, source, config.stale_after())
    }

    pub fn with_source(channel: Channel, source: LocationSource, stale_after: Option<Duration>) -> Self {
        let id = source.id().clone();
        let table = Arc::new(Mutex::new(LocationTable::new()));

        let inbound_table = table.clone();
        channel.on(LOCATION_UPDATE, move |payload| {
            if let Some(outcome) = inbound_table.lock().apply_payload(payload) {
                tracing::trace!(?outcome, "applied relayed sample");
            }
        });

        let own_table = table.clone();
        let own_channel = channel.clone();
        let handle = source.start(move |sample| {
            if let Err(e) = publish_to(&own_table, &own_channel, sample) {
                tracing::warn!("own sample kept locally only: {e}");
            }
        });

        let sweeper = stale_after.map(|max_age| {
            let table = table.clone();
            let keep = id.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval((max_age / 2).max(Duration::from_millis(10)));
                loop {
                    ticker.tick().await;
                    let expired = table.lock().sweep_stale_except(max_age, &keep);
                    for id in expired {
                        tracing::debug!(%id, "participant went silent");
                    }
                }
            })
        });

        tracing::info!(%id, synthetic = source.is_synthetic(), "session started");

        Self {
            id,
            channel,
            table,
            source,
            source_handle: Mutex::new(Some(handle)),
            sweeper: Mutex::new(sweeper),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Apply an own sample locally and emit it to the relay.
    pub fn publish(&self, sample: LocationSample) -> Result<ApplyOutcome, GeoError> {
        if sample.id != self.id {
            return Err(GeoError::MalformedPayload(format!(
                "sample for {} published by {}",
                sample.id, self.id
            )));
        }
        sample.coordinates().validate()?;
        publish_to(&self.table, &self.channel, sample)
    }

    /// Query the location source once and publish the result.
    ///
    /// The sample flows through the source's started callback, so a
    /// [`shutdown`](Self::shutdown) while the query is pending cancels it.
    pub async fn request_location(&self) -> Result<LocationSample, GeoError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(GeoError::ChannelDisconnected);
        }
        let sample = self.source.request().await?;
        if !self.channel.is_connected() {
            return Err(GeoError::ChannelDisconnected);
        }
        Ok(sample)
    }

    /// Current view: every known participant including this one.
    pub fn snapshot(&self) -> Vec<LocationSample> {
        self.table.lock().get_all()
    }

    pub fn get(&self, id: &ParticipantId) -> Option<LocationSample> {
        self.table.lock().get(id).cloned()
    }

    /// Stop the source, drop subscriptions and disconnect. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.source_handle.lock().take() {
            handle.cancel();
        }
        self.source.stop();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.channel.off(LOCATION_UPDATE);
        self.channel.disconnect();

        tracing::info!(id = %self.id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
