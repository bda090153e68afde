//! `span_join(source, partition, window)`: a table function that intersects
//! an event table with a single-row window relation.
//!
//! Each source row overlapping `[window_start, window_start + window_dur)` is
//! clipped to the window. When `quantum > 0` the clipped interval is further
//! split at every multiple of `quantum` from `window_start`, and each piece is
//! tagged with its bucket index in `quantum_ts`. The function is evaluated at
//! scan time, so a view over it always reflects the window's current row.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Int64Array, RecordBatch, UInt32Array};
use arrow::compute::{SortColumn, cast, concat_batches, lexsort_to_indices, take};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
use async_trait::async_trait;
use dashmap::DashMap;
use datafusion::catalog::{SchemaProvider, Session, TableFunctionImpl, TableProvider};
use datafusion::common::{DataFusionError, ScalarValue};
use datafusion::datasource::MemTable;
use datafusion::error::Result as DataFusionResult;
use datafusion::logical_expr::{Expr, TableType};
use datafusion::physical_plan::{ExecutionPlan, collect};
use tracing::trace;

use crate::Error;

pub const SPAN_JOIN_FUNCTION: &str = "span_join";

const TS: &str = "ts";
const DUR: &str = "dur";
const QUANTUM_TS: &str = "quantum_ts";

/// The single row of a window relation, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanWindow {
    pub start: i64,
    pub dur: i64,
    /// Bucket width, `0` for unquantized output.
    pub quantum: i64,
}

impl SpanWindow {
    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.dur)
    }
}

/// Output of [`split_spans`]: one entry per emitted piece, `rows` pointing
/// back at the source row it came from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanPieces {
    pub rows: Vec<u32>,
    pub ts: Vec<i64>,
    pub dur: Vec<i64>,
    pub quantum_ts: Vec<i64>,
}

impl SpanPieces {
    fn push(&mut self, row: usize, ts: i64, dur: i64, bucket: i64) {
        self.rows.push(row as u32);
        self.ts.push(ts);
        self.dur.push(dur);
        self.quantum_ts.push(bucket);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Clips `(ts, dur)` intervals to `window` and splits them at bucket
/// boundaries. Rows that don't overlap the window, including zero-length
/// rows, produce nothing. Pieces come out in input order.
pub fn split_spans(ts: &[i64], dur: &[i64], window: SpanWindow) -> SpanPieces {
    let mut pieces = SpanPieces::default();
    let window_end = window.end();
    for (row, (&ts, &dur)) in ts.iter().zip(dur).enumerate() {
        let lo = ts.max(window.start);
        let hi = ts.saturating_add(dur).min(window_end);
        if lo >= hi {
            continue;
        }
        if window.quantum <= 0 {
            pieces.push(row, lo, hi - lo, 0);
            continue;
        }
        // i128 so windows near the ends of the i64 range can't overflow;
        // every piece still lies within [lo, hi)
        let (start, quantum) = (i128::from(window.start), i128::from(window.quantum));
        let (lo, hi) = (i128::from(lo), i128::from(hi));
        let mut bucket = (lo - start) / quantum;
        loop {
            let bucket_start = start + bucket * quantum;
            let bucket_end = bucket_start + quantum;
            let piece_lo = lo.max(bucket_start);
            let piece_hi = hi.min(bucket_end);
            pieces.push(
                row,
                piece_lo as i64,
                (piece_hi - piece_lo) as i64,
                i64::try_from(bucket).unwrap_or(i64::MAX),
            );
            if bucket_end >= hi {
                break;
            }
            bucket += 1;
        }
    }
    pieces
}

/// Resolves `span_join(...)` calls against the event sources registered
/// with the engine.
pub(crate) struct SpanJoinFunc {
    sources: Arc<DashMap<String, SchemaRef>>,
    tables: Arc<dyn SchemaProvider>,
}

impl SpanJoinFunc {
    pub(crate) fn new(
        sources: Arc<DashMap<String, SchemaRef>>,
        tables: Arc<dyn SchemaProvider>,
    ) -> Self {
        Self { sources, tables }
    }
}

impl fmt::Debug for SpanJoinFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanJoinFunc")
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl TableFunctionImpl for SpanJoinFunc {
    fn call(&self, args: &[Expr]) -> DataFusionResult<Arc<dyn TableProvider>> {
        let [source, partition, window] = args else {
            return Err(invalid_args(format!(
                "{SPAN_JOIN_FUNCTION} takes (source, partition, window), got {} arguments",
                args.len()
            )));
        };
        let source = string_arg(source)?;
        let partition = string_arg(partition)?;
        let window = string_arg(window)?;
        let source_schema = self
            .sources
            .get(source.as_str())
            .map(|schema| schema.value().clone())
            .ok_or_else(|| invalid_args(format!("{source} is not a registered event source")))?;
        let schema = span_schema(&source_schema, &partition)?;
        Ok(Arc::new(SpanJoinTable {
            source,
            partition,
            window,
            schema,
            tables: self.tables.clone(),
        }))
    }
}

fn invalid_args(message: String) -> DataFusionError {
    DataFusionError::External(Box::new(Error::InvalidTableFunctionArgs(message)))
}

fn string_arg(expr: &Expr) -> DataFusionResult<String> {
    match expr {
        Expr::Literal(
            ScalarValue::Utf8(Some(value))
            | ScalarValue::LargeUtf8(Some(value))
            | ScalarValue::Utf8View(Some(value)),
            ..,
        ) => Ok(value.clone()),
        other => Err(invalid_args(format!(
            "expected a string literal, got {other}"
        ))),
    }
}

/// Source schema with `ts` and `dur` widened to Int64 and `quantum_ts`
/// appended.
fn span_schema(source: &Schema, partition: &str) -> DataFusionResult<SchemaRef> {
    for required in [TS, DUR, partition] {
        if source.field_with_name(required).is_err() {
            return Err(invalid_args(format!("source has no column {required}")));
        }
    }
    if source.field_with_name(QUANTUM_TS).is_ok() {
        return Err(invalid_args(format!("source already has a {QUANTUM_TS} column")));
    }
    let mut fields: Vec<Field> = source
        .fields()
        .iter()
        .map(|field| match field.name().as_str() {
            TS | DUR => Field::new(field.name(), DataType::Int64, true),
            _ => field.as_ref().clone(),
        })
        .collect();
    fields.push(Field::new(QUANTUM_TS, DataType::Int64, false));
    Ok(Arc::new(Schema::new(fields)))
}

/// One bound `span_join` call. Holds names only; both relations are read
/// on every scan.
pub(crate) struct SpanJoinTable {
    source: String,
    partition: String,
    window: String,
    schema: SchemaRef,
    tables: Arc<dyn SchemaProvider>,
}

impl fmt::Debug for SpanJoinTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanJoinTable")
            .field("source", &self.source)
            .field("partition", &self.partition)
            .field("window", &self.window)
            .finish()
    }
}

impl SpanJoinTable {
    async fn read_table(
        &self,
        state: &dyn Session,
        name: &str,
    ) -> DataFusionResult<(SchemaRef, Vec<RecordBatch>)> {
        let provider = self
            .tables
            .table(name)
            .await?
            .ok_or_else(|| DataFusionError::Plan(format!("table '{name}' not found")))?;
        let plan = provider.scan(state, None, &[], None).await?;
        let batches = collect(plan, state.task_ctx()).await?;
        Ok((provider.schema(), batches))
    }

    async fn read_window(&self, state: &dyn Session) -> DataFusionResult<Option<SpanWindow>> {
        let (_, batches) = self.read_table(state, &self.window).await?;
        let Some(batch) = batches.iter().find(|batch| batch.num_rows() > 0) else {
            return Ok(None);
        };
        let value = |name: &str| -> DataFusionResult<i64> {
            let column = batch.column_by_name(name).ok_or_else(|| {
                DataFusionError::Plan(format!("window '{}' has no column {name}", self.window))
            })?;
            let column = cast(column, &DataType::Int64)?;
            Ok(column.as_primitive::<Int64Type>().value(0))
        };
        Ok(Some(SpanWindow {
            start: value("window_start")?,
            dur: value("window_dur")?,
            quantum: value("quantum")?,
        }))
    }

    /// Clips and splits `source` (sorted by partition then ts) into rows of
    /// this table's schema.
    fn join(&self, source: &RecordBatch, window: SpanWindow) -> DataFusionResult<RecordBatch> {
        let column = |batch: &RecordBatch, name: &str| {
            batch
                .column_by_name(name)
                .cloned()
                .ok_or_else(|| DataFusionError::Plan(format!("source has no column {name}")))
        };
        let order = lexsort_to_indices(
            &[
                SortColumn {
                    values: column(source, &self.partition)?,
                    options: None,
                },
                SortColumn {
                    values: column(source, TS)?,
                    options: None,
                },
            ],
            None,
        )?;
        let sorted = source
            .columns()
            .iter()
            .map(|array| take(array.as_ref(), &order, None))
            .collect::<Result<Vec<_>, _>>()?;
        let sorted = RecordBatch::try_new(source.schema(), sorted)?;

        let ts = cast(&column(&sorted, TS)?, &DataType::Int64)?;
        let dur = cast(&column(&sorted, DUR)?, &DataType::Int64)?;
        let ts = ts.as_primitive::<Int64Type>();
        let dur = dur.as_primitive::<Int64Type>();
        // rows with a null bound get a zero duration and are skipped
        let durations: Vec<i64> = (0..sorted.num_rows())
            .map(|row| {
                if ts.is_null(row) || dur.is_null(row) {
                    0
                } else {
                    dur.value(row)
                }
            })
            .collect();
        let pieces = split_spans(ts.values(), &durations, window);
        trace!(
            source = %self.source,
            rows = sorted.num_rows(),
            pieces = pieces.len(),
            "span join"
        );

        let indices = UInt32Array::from(pieces.rows);
        let ts: ArrayRef = Arc::new(Int64Array::from(pieces.ts));
        let dur: ArrayRef = Arc::new(Int64Array::from(pieces.dur));
        let quantum_ts: ArrayRef = Arc::new(Int64Array::from(pieces.quantum_ts));
        let columns = self
            .schema
            .fields()
            .iter()
            .map(|field| -> DataFusionResult<ArrayRef> {
                match field.name().as_str() {
                    TS => Ok(ts.clone()),
                    DUR => Ok(dur.clone()),
                    QUANTUM_TS => Ok(quantum_ts.clone()),
                    name => Ok(take(column(&sorted, name)?.as_ref(), &indices, None)?),
                }
            })
            .collect::<DataFusionResult<Vec<_>>>()?;
        Ok(RecordBatch::try_new(self.schema.clone(), columns)?)
    }
}

#[async_trait]
impl TableProvider for SpanJoinTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Temporary
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        let batch = match self.read_window(state).await? {
            Some(window) => {
                let (schema, batches) = self.read_table(state, &self.source).await?;
                let source = concat_batches(&schema, &batches)?;
                self.join(&source, window)?
            }
            None => RecordBatch::new_empty(self.schema.clone()),
        };
        let table = MemTable::try_new(self.schema.clone(), vec![vec![batch]])?;
        table.scan(state, projection, filters, limit).await
    }
}
