use crate::broker::{BrokerWriter, PublisherFactory};
use crate::error::{ScrapeError, TickError};
use crate::mqtt::MqttPublisherFactory;
use crate::readings::ReadingSet;
use crate::scrape::Scraper;
use crate::store::{PgConnector, RelationalWriter, StoreConnector};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(15);

#[allow(async_fn_in_trait)]
pub trait ReadingSource {
    async fn scrape(&mut self, cancel: &CancellationToken) -> Result<ReadingSet, ScrapeError>;
}

#[allow(async_fn_in_trait)]
pub trait Sink {
    type Error: Into<TickError>;

    async fn write(
        &mut self,
        timestamp: DateTime<Utc>,
        readings: &ReadingSet,
    ) -> Result<(), Self::Error>;

    /// Drops cached backing state so the next write rebuilds it.
    fn reset(&mut self) {}
}

impl ReadingSource for Scraper {
    async fn scrape(&mut self, cancel: &CancellationToken) -> Result<ReadingSet, ScrapeError> {
        Scraper::scrape(self, cancel).await
    }
}

impl<C: StoreConnector> Sink for RelationalWriter<C> {
    type Error = crate::error::RelationalError;

    async fn write(
        &mut self,
        timestamp: DateTime<Utc>,
        readings: &ReadingSet,
    ) -> Result<(), Self::Error> {
        RelationalWriter::write(self, timestamp, readings).await?;
        tracing::info!(
            column = %self.column(),
            timestamp = %timestamp.to_rfc3339(),
            data = ?readings,
            "wrote to db"
        );
        Ok(())
    }

    fn reset(&mut self) {
        RelationalWriter::reset(self);
    }
}

impl<F: PublisherFactory> Sink for BrokerWriter<F> {
    type Error = crate::error::BrokerError;

    async fn write(
        &mut self,
        timestamp: DateTime<Utc>,
        readings: &ReadingSet,
    ) -> Result<(), Self::Error> {
        let payload = Bytes::from(readings.to_json()?);
        self.produce(timestamp, payload.clone()).await?;
        tracing::info!(
            topic = %self.topic(),
            data = %String::from_utf8_lossy(&payload),
            timestamp = %timestamp.to_rfc3339(),
            "produced to broker"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Cancelled,
}

/// The tick loop: scrape, then relational sink, then broker sink.
///
/// The first error of a tick ends the loop; a relational failure therefore
/// also skips that tick's broker write.
pub struct Pipeline<S, R, B> {
    source: S,
    relational: Option<R>,
    broker: Option<B>,
    period: Duration,
    reload: Arc<AtomicBool>,
}

pub type DaemonPipeline =
    Pipeline<Scraper, RelationalWriter<PgConnector>, BrokerWriter<MqttPublisherFactory>>;

impl<S, R, B> Pipeline<S, R, B>
where
    S: ReadingSource,
    R: Sink,
    B: Sink,
{
    pub fn new(source: S, relational: Option<R>, broker: Option<B>, period: Duration) -> Self {
        Self {
            source,
            relational,
            broker,
            period,
            reload: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag makes the next tick reset every sink before writing,
    /// which reconnects and reloads the sensor registry.
    pub fn reload_flag(&self) -> Arc<AtomicBool> {
        self.reload.clone()
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunOutcome, TickError> {
        let mut ticker = tokio::time::interval(self.period);
        // Next wake is one period after the previous wake, even after a slow tick.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let started_at = ticker.tick().await;
        let started_wall = Utc::now();
        let mut timestamp = started_wall;

        loop {
            if let Some(outcome) = self.tick(timestamp, &cancel).await? {
                return Ok(outcome);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("cancelled; stopping tick loop");
                    return Ok(RunOutcome::Cancelled);
                }
                fired = ticker.tick() => {
                    timestamp = schedule_timestamp(started_wall, started_at, fired);
                }
            }
        }
    }

    /// Returns `Some` when shutdown interrupted the scrape; the tick then
    /// writes nothing.
    async fn tick(
        &mut self,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<RunOutcome>, TickError> {
        let readings = match self.source.scrape(cancel).await {
            Ok(readings) => readings,
            Err(err) if cancel.is_cancelled() => {
                tracing::info!(error=%err, "scrape interrupted by shutdown");
                return Ok(Some(RunOutcome::Cancelled));
            }
            Err(err) => {
                tracing::error!(error=%err, "failed to scrape");
                return Err(err.into());
            }
        };
        if readings.is_empty() {
            tracing::warn!("scrape returned no readings");
        }

        if self.reload.swap(false, Ordering::Relaxed) {
            tracing::info!("reload requested; resetting sinks");
            self.relational.iter_mut().for_each(Sink::reset);
            self.broker.iter_mut().for_each(Sink::reset);
        }

        if let Some(relational) = self.relational.as_mut() {
            relational
                .write(timestamp, &readings)
                .await
                .map_err(|err| log_sink_error(err.into()))?;
        }

        if let Some(broker) = self.broker.as_mut() {
            broker
                .write(timestamp, &readings)
                .await
                .map_err(|err| log_sink_error(err.into()))?;
        }

        Ok(None)
    }
}

fn log_sink_error(err: TickError) -> TickError {
    tracing::error!(error=%err, "sink write failed");
    err
}

/// Wall-clock time of a schedule firing, derived from the monotonic clock so
/// consecutive ticks never go backwards.
fn schedule_timestamp(
    started_wall: DateTime<Utc>,
    started_at: Instant,
    fired: Instant,
) -> DateTime<Utc> {
    let elapsed = fired.saturating_duration_since(started_at);
    chrono::Duration::from_std(elapsed)
        .ok()
        .and_then(|elapsed| started_wall.checked_add_signed(elapsed))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::{broker_config, RecordingFactory};
    use crate::config::ScrapeConfig;
    use crate::error::{BrokerError, RelationalError};
    use crate::exposition::UnitScaling;
    use axum::routing::get;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Scrape,
        Relational(DateTime<Utc>),
        Broker(DateTime<Utc>),
    }

    type Log = Arc<Mutex<Vec<Call>>>;

    struct FakeSource {
        log: Log,
        fail: bool,
        readings: ReadingSet,
    }

    impl ReadingSource for FakeSource {
        async fn scrape(&mut self, _cancel: &CancellationToken) -> Result<ReadingSet, ScrapeError> {
            self.log.lock().unwrap().push(Call::Scrape);
            if self.fail {
                return Err(ScrapeError::Request("cancelled before send".into()));
            }
            Ok(self.readings.clone())
        }
    }

    struct FakeRelational {
        log: Log,
        fail: bool,
        cancel_after_ticks: Option<(usize, CancellationToken)>,
        resets: usize,
    }

    impl Sink for FakeRelational {
        type Error = RelationalError;

        async fn write(
            &mut self,
            timestamp: DateTime<Utc>,
            _readings: &ReadingSet,
        ) -> Result<(), RelationalError> {
            let mut log = self.log.lock().unwrap();
            log.push(Call::Relational(timestamp));
            if self.fail {
                return Err(RelationalError::NotPrepared);
            }
            if let Some((ticks, cancel)) = &self.cancel_after_ticks {
                let written = log.iter().filter(|c| matches!(c, Call::Relational(_))).count();
                if written >= *ticks {
                    cancel.cancel();
                }
            }
            Ok(())
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    struct FakeBroker {
        log: Log,
    }

    impl Sink for FakeBroker {
        type Error = BrokerError;

        async fn write(
            &mut self,
            timestamp: DateTime<Utc>,
            _readings: &ReadingSet,
        ) -> Result<(), BrokerError> {
            self.log.lock().unwrap().push(Call::Broker(timestamp));
            Ok(())
        }
    }

    fn readings() -> ReadingSet {
        [("cpu_temp", 23500), ("humidity", 55)].into_iter().collect()
    }

    fn source(log: &Log, fail: bool) -> FakeSource {
        FakeSource {
            log: log.clone(),
            fail,
            readings: readings(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_sinks_in_order_and_stops_on_cancel() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        let relational = FakeRelational {
            log: log.clone(),
            fail: false,
            cancel_after_ticks: Some((3, cancel.clone())),
            resets: 0,
        };
        let mut pipeline = Pipeline::new(
            source(&log, false),
            Some(relational),
            Some(FakeBroker { log: log.clone() }),
            DEFAULT_TICK_PERIOD,
        );

        let outcome = pipeline.run(cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);

        let log = log.lock().unwrap();
        // Cancelled during tick 3: the tick finishes, no fourth scrape starts.
        assert_eq!(log.len(), 9);
        let mut stamps = Vec::new();
        for chunk in log.chunks(3) {
            let (Call::Scrape, Call::Relational(a), Call::Broker(b)) =
                (&chunk[0], &chunk[1], &chunk[2])
            else {
                panic!("unexpected order: {chunk:?}");
            };
            assert_eq!(a, b, "both sinks share the tick timestamp");
            stamps.push(*a);
        }
        assert_eq!(stamps[1] - stamps[0], chrono::Duration::seconds(15));
        assert_eq!(stamps[2] - stamps[1], chrono::Duration::seconds(15));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_ticks_skips_next_scrape() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        let mut pipeline: Pipeline<_, FakeRelational, FakeBroker> =
            Pipeline::new(source(&log, false), None, None, DEFAULT_TICK_PERIOD);

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                cancel.cancel();
            })
        };
        let outcome = pipeline.run(cancel).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        // Ticks at 0s and 15s; cancelled at 20s before the 30s tick.
        assert_eq!(*log.lock().unwrap(), vec![Call::Scrape, Call::Scrape]);
    }

    #[tokio::test(start_paused = true)]
    async fn scrape_failure_is_fatal_before_any_write() {
        let log: Log = Arc::default();
        let mut pipeline = Pipeline::new(
            source(&log, true),
            Some(FakeRelational {
                log: log.clone(),
                fail: false,
                cancel_after_ticks: None,
                resets: 0,
            }),
            Some(FakeBroker { log: log.clone() }),
            DEFAULT_TICK_PERIOD,
        );

        let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TickError::Scrape(_)));
        assert_eq!(*log.lock().unwrap(), vec![Call::Scrape]);
    }

    #[tokio::test(start_paused = true)]
    async fn relational_failure_skips_broker_write() {
        let log: Log = Arc::default();
        let mut pipeline = Pipeline::new(
            source(&log, false),
            Some(FakeRelational {
                log: log.clone(),
                fail: true,
                cancel_after_ticks: None,
                resets: 0,
            }),
            Some(FakeBroker { log: log.clone() }),
            DEFAULT_TICK_PERIOD,
        );

        let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TickError::Relational(RelationalError::NotPrepared)));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(!log.iter().any(|call| matches!(call, Call::Broker(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn broker_sink_serializes_reading_set() {
        let factory = RecordingFactory::default();
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut pipeline: Pipeline<_, FakeRelational, _> = Pipeline::new(
            source(&log, false),
            None,
            Some(BrokerWriter::new(factory.clone(), broker_config())),
            DEFAULT_TICK_PERIOD,
        );

        // An already-cancelled token still lets the first tick complete.
        let outcome = pipeline.run(cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);

        let recorded = factory.0.lock().unwrap();
        assert_eq!(recorded.messages.len(), 1);
        assert_eq!(
            recorded.messages[0].payload,
            Bytes::from_static(br#"{"cpu_temp":23500,"humidity":55}"#)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reload_flag_resets_sinks_once() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        let relational = FakeRelational {
            log: log.clone(),
            fail: false,
            cancel_after_ticks: Some((2, cancel.clone())),
            resets: 0,
        };
        let mut pipeline: Pipeline<_, _, FakeBroker> =
            Pipeline::new(source(&log, false), Some(relational), None, DEFAULT_TICK_PERIOD);
        pipeline.reload_flag().store(true, Ordering::Relaxed);

        pipeline.run(cancel).await.unwrap();

        assert_eq!(pipeline.relational.as_ref().unwrap().resets, 1);
        assert!(!pipeline.reload_flag().load(Ordering::Relaxed));
    }

    /// Records the monotonic wake and timestamp of every write; the first
    /// write overruns the period.
    struct SlowSink {
        first_write: Duration,
        stop_after: usize,
        cancel: CancellationToken,
        wakes: Vec<Instant>,
        stamps: Vec<DateTime<Utc>>,
    }

    impl Sink for SlowSink {
        type Error = RelationalError;

        async fn write(
            &mut self,
            timestamp: DateTime<Utc>,
            _readings: &ReadingSet,
        ) -> Result<(), RelationalError> {
            self.wakes.push(Instant::now());
            self.stamps.push(timestamp);
            if self.stamps.len() == 1 {
                tokio::time::sleep(self.first_write).await;
            }
            if self.stamps.len() >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_delays_the_schedule() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        let sink = SlowSink {
            first_write: Duration::from_secs(20),
            stop_after: 4,
            cancel: cancel.clone(),
            wakes: Vec::new(),
            stamps: Vec::new(),
        };
        let mut pipeline: Pipeline<_, _, FakeBroker> =
            Pipeline::new(source(&log, false), Some(sink), None, DEFAULT_TICK_PERIOD);

        pipeline.run(cancel).await.unwrap();

        let sink = pipeline.relational.as_ref().unwrap();
        assert_eq!(sink.stamps.len(), 4);
        let secs = |d: chrono::Duration| d.num_seconds();
        // The tick due at 15s fires late (at 20s) but keeps its deadline as
        // timestamp; the next one is a full period after the late wake.
        assert_eq!(secs(sink.stamps[1] - sink.stamps[0]), 15);
        assert_eq!(secs(sink.stamps[2] - sink.stamps[1]), 20);
        assert_eq!(secs(sink.stamps[3] - sink.stamps[2]), 15);
        assert!(sink.stamps.windows(2).all(|pair| pair[0] < pair[1]));

        assert_eq!(sink.wakes[1] - sink.wakes[0], Duration::from_secs(20));
        assert_eq!(sink.wakes[2] - sink.wakes[1], Duration::from_secs(15));
    }

    async fn serve_slow_metrics() -> String {
        let router = Router::new().route(
            "/metrics",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "humidity 55\n"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}/metrics")
    }

    fn scraper_for(address: String) -> Scraper {
        Scraper::new(&ScrapeConfig {
            address,
            timeout: Duration::from_secs(60),
            scaling: UnitScaling::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn shutdown_during_scrape_is_clean_cancel() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        let relational = FakeRelational {
            log: log.clone(),
            fail: false,
            cancel_after_ticks: None,
            resets: 0,
        };
        let mut pipeline: Pipeline<_, _, FakeBroker> = Pipeline::new(
            scraper_for(serve_slow_metrics().await),
            Some(relational),
            None,
            DEFAULT_TICK_PERIOD,
        );

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            })
        };
        let outcome = pipeline.run(cancel).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn already_cancelled_token_writes_nothing() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let relational = FakeRelational {
            log: log.clone(),
            fail: false,
            cancel_after_ticks: None,
            resets: 0,
        };
        let mut pipeline: Pipeline<_, _, FakeBroker> = Pipeline::new(
            scraper_for(serve_slow_metrics().await),
            Some(relational),
            None,
            DEFAULT_TICK_PERIOD,
        );

        let outcome = pipeline.run(cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(log.lock().unwrap().is_empty());
    }
}
