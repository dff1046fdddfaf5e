mod column;
mod postgres;
mod registry;
mod writer;


use crate::error::RelationalError;
use crate::readings::Reading;
use chrono::{DateTime, Utc};

pub use column::ReadingColumn;
pub use postgres::PgConnector;
pub use registry::SensorRegistry;
pub use writer::RelationalWriter;

/// A reading whose sensor name resolved to a catalog identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedReading {
    pub sensor: i32,
    pub value: Reading,
}

#[allow(async_fn_in_trait)]
pub trait ReadingStore {
    /// All `(id, name)` pairs of the sensor catalog.
    async fn load_sensors(&mut self) -> Result<Vec<(i32, String)>, RelationalError>;

    /// Inserts `rows` in a single transaction. Either every row is committed
    /// or none is.
    async fn insert_batch(
        &mut self,
        timestamp: DateTime<Utc>,
        column: ReadingColumn,
        rows: &[ResolvedReading],
    ) -> Result<usize, RelationalError>;
}

#[allow(async_fn_in_trait)]
pub trait StoreConnector {
    type Store: ReadingStore;

    async fn connect(&self) -> Result<Self::Store, RelationalError>;
}
