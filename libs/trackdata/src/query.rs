use std::sync::Arc;

use arrow::array::{AsArray, Float64Array, Int64Array, RecordBatch};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use tracing::{error, trace};

use crate::Error;
use crate::engine::Engine;

/// Thin handle over a shared engine that turns in-band errors into
/// [`Error::Query`].
pub struct QueryClient<E> {
    engine: Arc<E>,
}

impl<E> Clone for QueryClient<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<E: Engine> QueryClient<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub async fn query(&self, query: &str) -> Result<Columns, Error> {
        trace!(query, "sending query");
        let result = self.engine.query(query).await;
        if let Some(message) = result.error {
            error!(query, error = %message, "query failed");
            return Err(Error::Query {
                query: query.to_string(),
                message,
            });
        }
        Columns::new(result.batches)
    }
}

/// A query result flattened into a single batch.
#[derive(Debug, Clone, Default)]
pub struct Columns {
    batch: Option<RecordBatch>,
}

impl Columns {
    pub fn new(batches: Vec<RecordBatch>) -> Result<Self, Error> {
        let batch = match batches.first() {
            Some(first) => Some(concat_batches(first.schema_ref(), &batches)?),
            None => None,
        };
        Ok(Self { batch })
    }

    pub fn num_records(&self) -> usize {
        self.batch.as_ref().map_or(0, RecordBatch::num_rows)
    }

    pub fn is_empty(&self) -> bool {
        self.num_records() == 0
    }

    /// Column `index` cast to Int64. An empty result yields an empty array.
    pub fn i64s(&self, index: usize) -> Result<Int64Array, Error> {
        let Some(batch) = &self.batch else {
            return Ok(Int64Array::from(Vec::<i64>::new()));
        };
        let column = batch
            .columns()
            .get(index)
            .ok_or(Error::MissingColumn(index))?;
        let column = cast(column, &DataType::Int64)?;
        Ok(column.as_primitive::<Int64Type>().clone())
    }

    pub fn f64s(&self, index: usize) -> Result<Float64Array, Error> {
        let Some(batch) = &self.batch else {
            return Ok(Float64Array::from(Vec::<f64>::new()));
        };
        let column = batch
            .columns()
            .get(index)
            .ok_or(Error::MissingColumn(index))?;
        let column = cast(column, &DataType::Float64)?;
        Ok(column.as_primitive::<Float64Type>().clone())
    }
}
