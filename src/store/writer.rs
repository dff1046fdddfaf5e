use super::{PgConnector, ReadingColumn, ReadingStore, ResolvedReading, SensorRegistry, StoreConnector};
use crate::config::RelationalConfig;
use crate::error::RelationalError;
use crate::lifecycle::Lifecycle;
use crate::readings::ReadingSet;
use chrono::{DateTime, Utc};

struct Prepared<S> {
    store: S,
    registry: SensorRegistry,
}

/// Writes each tick's readings to `sensor_readings` in one transaction.
///
/// The connection and the sensor registry are established together on first
/// use; a connection whose registry failed to load is discarded.
pub struct RelationalWriter<C: StoreConnector = PgConnector> {
    connector: C,
    column: ReadingColumn,
    state: Lifecycle<Prepared<C::Store>>,
}

impl RelationalWriter<PgConnector> {
    pub fn from_config(config: &RelationalConfig) -> Self {
        Self::new(PgConnector::new(config.connect_string.clone()), config.column)
    }
}

impl<C: StoreConnector> RelationalWriter<C> {
    pub fn new(connector: C, column: ReadingColumn) -> Self {
        Self {
            connector,
            column,
            state: Lifecycle::default(),
        }
    }

    pub fn column(&self) -> ReadingColumn {
        self.column
    }

    pub fn registry(&self) -> Result<&SensorRegistry, RelationalError> {
        self.state
            .get()
            .map(|prepared| &prepared.registry)
            .ok_or(RelationalError::NotPrepared)
    }

    /// Drops the connection and registry. The next write reconnects and
    /// reloads the catalog.
    pub fn reset(&mut self) {
        if let Ok(registry) = self.registry() {
            tracing::info!(sensors = registry.len(), "dropping db connection; registry will be reloaded");
        }
        self.state.reset();
    }

    /// Returns the number of committed rows. Readings for sensors missing from
    /// the registry are skipped, not treated as failures.
    pub async fn write(
        &mut self,
        timestamp: DateTime<Utc>,
        readings: &ReadingSet,
    ) -> Result<usize, RelationalError> {
        let column = self.column;
        let prepared = self.ensure_ready().await?;

        let mut rows = Vec::with_capacity(readings.len());
        for (name, value) in readings.iter() {
            match prepared.registry.lookup(name) {
                Some(sensor) => rows.push(ResolvedReading { sensor, value }),
                None => tracing::warn!(sensor = %name, "unknown sensor"),
            }
        }

        if rows.is_empty() {
            tracing::debug!(ts = %timestamp.to_rfc3339(), "no known sensors in readings; nothing to commit");
            return Ok(0);
        }

        let count = prepared.store.insert_batch(timestamp, column, &rows).await?;
        tracing::info!(ts = %timestamp.to_rfc3339(), count, "committed transaction");
        Ok(count)
    }

    async fn ensure_ready(&mut self) -> Result<&mut Prepared<C::Store>, RelationalError> {
        let connector = &self.connector;
        self.state
            .ready_or_init(|| async move {
                let mut store = connector.connect().await?;
                let registry = SensorRegistry::load(&mut store).await?;
                Ok(Prepared { store, registry })
            })
            .await
    }
}
