//! ==============================================================================
//! acquisition.rs - the acquisition loop
//! ==============================================================================
//!
//! purpose:
//!     owns the bus and every piece of per-cycle state. two timers run inside
//!     one select! loop, each on its own period:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │  poll tick (1s)                    persist tick (30s)        │
//!     │  ├─ connect if needed              └─ push a copy of the     │
//!     │  ├─ read every endpoint               latest snapshot onto   │
//!     │  │  (one failure never stops          the persistence queue  │
//!     │  │   the others)                                             │
//!     │  ├─ air-quality reference lookup                             │
//!     │  ├─ rainfall accumulation + AQI                              │
//!     │  └─ publish Arc<Snapshot>                                    │
//!     └──────────────────────────────────────────────────────────────┘
//!
//!     a bus connect failure pauses the loop for the reconnect back-off.
//!     a snapshot is queued at most once: while nothing new is published
//!     (bus down) persist ticks queue nothing.
//!     the running flag is checked once per iteration; the bus is closed on
//!     the way out.
//!
//! relationships:
//!     - uses: bus.rs, sensors.rs, air_quality.rs, metrics.rs
//!     - feeds: snapshot.rs (live consumers), persistence.rs (queue)
//!
//! ==============================================================================

use chrono::{DateTime, Local, NaiveDate};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::air_quality::AirQualitySource;
use crate::bus::{BusClient, Transport};
use crate::config::AcquisitionConfig;
use crate::metrics::{aqi_from_pm25, RainfallAccumulator};
use crate::persistence::QueueProducer;
use crate::sensors::{read_endpoint, EndpointRegistry, Reading};
use crate::snapshot::{Snapshot, SnapshotPublisher};

#[derive(Debug, Clone, Copy)]
pub struct AcquisitionTiming {
    pub poll: Duration,
    pub persist: Duration,
    pub reconnect_backoff: Duration,
}

impl From<&AcquisitionConfig> for AcquisitionTiming {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            poll: config.poll_interval(),
            persist: config.persist_interval(),
            reconnect_backoff: config.reconnect_backoff(),
        }
    }
}

pub struct AcquisitionLoop<T: Transport> {
    bus: BusClient<T>,
    registry: EndpointRegistry,
    air_quality: AirQualitySource,
    rainfall: RainfallAccumulator,
    publisher: SnapshotPublisher,
    queue: QueueProducer,
    timing: AcquisitionTiming,
    show_sensor_data: bool,
    running: Arc<AtomicBool>,
    /// capture time of the last snapshot handed to the queue
    last_enqueued: Option<DateTime<Local>>,
}

impl<T: Transport> AcquisitionLoop<T> {
    pub fn new(
        bus: BusClient<T>,
        registry: EndpointRegistry,
        air_quality: AirQualitySource,
        rainfall: RainfallAccumulator,
        publisher: SnapshotPublisher,
        queue: QueueProducer,
        timing: AcquisitionTiming,
    ) -> Self {
        Self {
            bus,
            registry,
            air_quality,
            rainfall,
            publisher,
            queue,
            timing,
            show_sensor_data: false,
            running: Arc::new(AtomicBool::new(true)),
            last_enqueued: None,
        }
    }

    /// share the process-wide running flag
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    /// log every successful reading at info
    pub fn with_sensor_logging(mut self, enabled: bool) -> Self {
        self.show_sensor_data = enabled;
        self
    }

    // ==========================================================================
    // one poll cycle
    // ==========================================================================

    /// read everything once and publish the result.
    /// None means the bus could not be connected and nothing was published.
    pub async fn poll_cycle(&mut self, now: DateTime<Local>) -> Option<Arc<Snapshot>> {
        if !self.bus.connect().await {
            return None;
        }

        let today = now.date_naive();
        let mut snapshot = Snapshot::empty(now);

        for endpoint in self.registry.iter() {
            let Some(reading) = read_endpoint(&mut self.bus, endpoint).await else {
                continue;
            };
            if self.show_sensor_data {
                tracing::info!(endpoint = endpoint.name, "{reading}");
            }
            apply_reading(&mut snapshot, reading, &mut self.rainfall, today);
        }

        if let Some(aq) = self.air_quality.lookup(now.naive_local()) {
            snapshot.pm2_5 = aq.pm2_5;
            snapshot.pm10 = aq.pm10;
            snapshot.co2 = aq.co2;
            snapshot.carbon_monoxide = aq.carbon_monoxide;
            snapshot.nitrogen_dioxide = aq.nitrogen_dioxide;
            snapshot.sulphur_dioxide = aq.sulphur_dioxide;
            snapshot.ozone = aq.ozone;
        }
        snapshot.aqi = aqi_from_pm25(snapshot.pm2_5);

        if !self.bus.is_connected() {
            tracing::debug!("bus link dropped during cycle, reconnecting next tick");
        }

        if self.show_sensor_data {
            if let Some(aqi) = snapshot.aqi {
                tracing::info!(pm2_5 = ?snapshot.pm2_5, "AQI: {aqi:.0}");
            }
        }

        let snapshot = Arc::new(snapshot);
        self.publisher.publish(snapshot.clone());
        Some(snapshot)
    }

    /// queue a copy of the latest snapshot for the persistence writer,
    /// unless that snapshot was already queued
    pub fn enqueue_latest(&mut self) -> bool {
        let Some(latest) = self.publisher.latest() else {
            tracing::debug!("nothing published yet, skipping persist tick");
            return false;
        };
        if self.last_enqueued == Some(latest.captured_at) {
            tracing::debug!(at = %latest.captured_at, "no new snapshot since last persist tick");
            return false;
        }
        self.last_enqueued = Some(latest.captured_at);
        let queued = self.queue.push(Snapshot::clone(&latest));
        if !queued {
            tracing::error!("persistence writer is gone, snapshot dropped");
        }
        queued
    }

    // ==========================================================================
    // loop
    // ==========================================================================

    pub async fn run(mut self) {
        let mut poll = time::interval(self.timing.poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut persist = time::interval_at(Instant::now() + self.timing.persist, self.timing.persist);
        persist.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            poll_ms = self.timing.poll.as_millis() as u64,
            persist_secs = self.timing.persist.as_secs(),
            endpoints = self.registry.iter().count(),
            "acquisition loop started"
        );

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = poll.tick() => {
                    if self.poll_cycle(Local::now()).await.is_none() {
                        tracing::warn!(
                            backoff_secs = self.timing.reconnect_backoff.as_secs(),
                            "bus unavailable, pausing acquisition"
                        );
                        time::sleep(self.timing.reconnect_backoff).await;
                    }
                }
                _ = persist.tick() => {
                    self.enqueue_latest();
                }
            }
        }

        self.bus.close().await;
        tracing::info!("acquisition loop stopped");
    }
}

fn apply_reading(snapshot: &mut Snapshot, reading: Reading, rainfall: &mut RainfallAccumulator, today: NaiveDate) {
    match reading {
        Reading::Environment { temperature, humidity, pressure } => {
            snapshot.temperature = Some(temperature);
            snapshot.humidity = Some(humidity);
            snapshot.pressure = Some(pressure);
        }
        Reading::Uv(uv) => snapshot.uv_index = Some(uv),
        Reading::WindSpeed(speed) => snapshot.wind_speed = Some(speed),
        Reading::WindDirection { degrees, cardinal } => {
            snapshot.wind_dir_degrees = Some(degrees);
            snapshot.wind_dir_cardinal = Some(cardinal);
        }
        Reading::Rainfall(raw) => {
            snapshot.rainfall = Some(raw);
            snapshot.rainfall_daily = Some(rainfall.process(raw, today));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeTransport;
    use crate::config::StationConfig;
    use crate::error::{BusError, StorageError};
    use crate::metrics::RainfallLedger;
    use crate::persistence::{snapshot_queue, QueueConsumer};
    use crate::snapshot::{self, SnapshotReader};
    use chrono::TimeZone;

    struct DiscardLedger;

    impl RainfallLedger for DiscardLedger {
        fn record(&mut self, _: NaiveDate, _: f64) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn healthy_bus() -> FakeTransport {
        let transport = FakeTransport::new();
        transport
            .respond(1, Ok(vec![253, 612, 10087]))
            .respond(2, Ok(vec![734]))
            .respond(4, Ok(vec![45]))
            .respond(5, Ok(vec![1800, 0, 1820]))
            .respond(6, Ok(vec![100]));
        transport
    }

    fn build(
        transport: &FakeTransport,
        air_quality: AirQualitySource,
        timing: AcquisitionTiming,
    ) -> (AcquisitionLoop<FakeTransport>, SnapshotReader, QueueConsumer) {
        let (publisher, reader) = snapshot::channel();
        let (producer, consumer) = snapshot_queue();
        let acquisition = AcquisitionLoop::new(
            BusClient::new(transport.clone(), Duration::from_millis(50)),
            StationConfig::default().endpoint_registry(),
            air_quality,
            RainfallAccumulator::new(Box::new(DiscardLedger)),
            publisher,
            producer,
            timing,
        );
        (acquisition, reader, consumer)
    }

    fn slow_timing() -> AcquisitionTiming {
        AcquisitionTiming {
            poll: Duration::from_secs(1),
            persist: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(5),
        }
    }

    fn no_air_quality() -> AirQualitySource {
        AirQualitySource::new("/nonexistent/aqi_reference.csv")
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 5, 4, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn full_cycle_fills_every_bus_field() {
        let transport = healthy_bus();
        let (mut acquisition, reader, _) = build(&transport, no_air_quality(), slow_timing());

        let snapshot = acquisition.poll_cycle(noon()).await.unwrap();
        assert_eq!(snapshot.temperature, Some(25.3));
        assert_eq!(snapshot.humidity, Some(61.2));
        assert_eq!(snapshot.pressure, Some(1008.7));
        assert_eq!(snapshot.uv_index, Some(7.34));
        assert_eq!(snapshot.wind_speed, Some(4.5));
        assert_eq!(snapshot.wind_dir_degrees, Some(181));
        assert_eq!(snapshot.wind_dir_cardinal, Some("S"));
        assert_eq!(snapshot.rainfall, Some(10.0));
        assert_eq!(snapshot.rainfall_daily, Some(0.0));
        assert_eq!(snapshot.pm2_5, None);
        assert_eq!(snapshot.aqi, None);

        assert!(Arc::ptr_eq(&reader.latest().unwrap(), &snapshot));
    }

    #[tokio::test]
    async fn one_failed_endpoint_does_not_abort_the_cycle() {
        let transport = healthy_bus();
        transport
            .respond(1, Err(BusError::Exception("GatewayTargetDevice".into())))
            .respond(2, Err(BusError::Io("broken pipe".into())));
        let (mut acquisition, _, _) = build(&transport, no_air_quality(), slow_timing());

        let snapshot = acquisition.poll_cycle(noon()).await.unwrap();
        // environment has no fallback, uv falls back to zero
        assert_eq!(snapshot.temperature, None);
        assert_eq!(snapshot.humidity, None);
        assert_eq!(snapshot.uv_index, Some(0.0));
        // reads after the dropped link reconnect and succeed
        assert_eq!(snapshot.wind_speed, Some(4.5));
        assert_eq!(snapshot.rainfall, Some(10.0));
        assert_eq!(transport.state.lock().unwrap().reads.len(), 5);
    }

    #[tokio::test]
    async fn wind_speed_timeout_keeps_environment() {
        let transport = healthy_bus();
        transport.silence(4);
        let (mut acquisition, _, _) = build(&transport, no_air_quality(), slow_timing());

        let snapshot = acquisition.poll_cycle(noon()).await.unwrap();
        assert_eq!(snapshot.temperature, Some(25.3));
        assert_eq!(snapshot.humidity, Some(61.2));
        assert_eq!(snapshot.pressure, Some(1008.7));
        assert_eq!(snapshot.wind_speed, Some(0.0));
        assert_eq!(snapshot.wind_dir_cardinal, Some("S"));
    }

    #[tokio::test]
    async fn connect_failure_publishes_nothing() {
        let transport = healthy_bus();
        transport.refuse_open(true);
        let (mut acquisition, reader, _) = build(&transport, no_air_quality(), slow_timing());

        assert!(acquisition.poll_cycle(noon()).await.is_none());
        assert!(reader.latest().is_none());
        assert!(transport.state.lock().unwrap().reads.is_empty());
    }

    #[tokio::test]
    async fn derived_metrics_follow_readings() {
        let dir = std::env::temp_dir().join(format!("acq-aqi-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let aq_path = dir.join("aqi_reference.csv");
        std::fs::write(
            &aq_path,
            "date,pm2_5,pm10,carbon_monoxide,nitrogen_dioxide,sulphur_dioxide,ozone,carbon_dioxide\n\
             2025-05-04 11:00:00,35.4,70.0,300.0,20.0,9.0,55.0,410.0\n\
             2025-05-04 12:00:00,6.0,12.0,250.0,10.0,4.0,40.0,400.0\n",
        )
        .unwrap();

        let transport = healthy_bus();
        let (mut acquisition, _, _) = build(&transport, AirQualitySource::new(&aq_path), slow_timing());

        let first = acquisition.poll_cycle(noon()).await.unwrap();
        assert_eq!(first.pm2_5, Some(6.0));
        assert_eq!(first.co2, Some(400.0));
        assert!((first.aqi.unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(first.rainfall_daily, Some(0.0));

        transport.respond(6, Ok(vec![103]));
        let second = acquisition.poll_cycle(noon() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(second.rainfall, Some(10.3));
        assert!((second.rainfall_daily.unwrap() - 0.3).abs() < 1e-9);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn persist_tick_queues_copy_of_latest() {
        let transport = healthy_bus();
        let (mut acquisition, _, consumer) = build(&transport, no_air_quality(), slow_timing());

        assert!(!acquisition.enqueue_latest());

        let published = acquisition.poll_cycle(noon()).await.unwrap();
        assert!(acquisition.enqueue_latest());

        let queued = consumer.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(&queued, published.as_ref());

        // same snapshot again: not queued twice
        assert!(!acquisition.enqueue_latest());
        assert!(consumer.drain().is_empty());

        acquisition.poll_cycle(noon() + chrono::Duration::seconds(1)).await.unwrap();
        assert!(acquisition.enqueue_latest());
    }

    #[tokio::test]
    async fn bus_outage_queues_no_stale_snapshots() {
        let transport = healthy_bus();
        let timing = AcquisitionTiming {
            poll: Duration::from_millis(10),
            persist: Duration::from_millis(30),
            reconnect_backoff: Duration::from_millis(20),
        };
        let (acquisition, reader, consumer) = build(&transport, no_air_quality(), timing);
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(acquisition.with_running(running.clone()).run());

        while reader.latest().is_none() {
            time::sleep(Duration::from_millis(5)).await;
        }
        {
            let mut state = transport.state.lock().unwrap();
            state.open = false;
            state.refuse_open = true;
        }
        let last_published = reader.latest().unwrap().captured_at;

        time::sleep(Duration::from_millis(400)).await;
        running.store(false, Ordering::SeqCst);
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        // nothing new was published during the outage
        assert_eq!(reader.latest().unwrap().captured_at, last_published);

        let queued = consumer.drain();
        assert!(!queued.is_empty());
        let mut times: Vec<_> = queued.iter().map(|s| s.captured_at).collect();
        times.dedup();
        assert_eq!(times.len(), queued.len());
    }

    #[tokio::test]
    async fn run_stops_on_flag_and_closes_bus() {
        let transport = healthy_bus();
        let timing = AcquisitionTiming {
            poll: Duration::from_millis(10),
            persist: Duration::from_millis(30),
            reconnect_backoff: Duration::from_millis(20),
        };
        let (acquisition, reader, consumer) = build(&transport, no_air_quality(), timing);
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(acquisition.with_running(running.clone()).run());

        time::sleep(Duration::from_millis(150)).await;
        running.store(false, Ordering::SeqCst);
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert!(reader.latest().is_some());
        assert!(!consumer.drain().is_empty());
        let state = transport.state.lock().unwrap();
        assert!(!state.open);
        assert_eq!(state.closes, 1);
    }
}
