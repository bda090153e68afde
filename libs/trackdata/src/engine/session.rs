use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use dashmap::DashMap;
use datafusion::catalog::TableProvider;
use datafusion::common::TableReference;
use datafusion::common::tree_node::TreeNode;
use datafusion::datasource::MemTable;
use datafusion::error::DataFusionError;
use datafusion::logical_expr::{DmlStatement, LogicalPlan, WriteOp};
use datafusion::prelude::{CsvReadOptions, SessionConfig, SessionContext};
use tracing::{debug, trace};

use super::span_join::SpanJoinFunc;
use super::{Engine, QueryResult, SPAN_JOIN_FUNCTION};
use crate::Error;

/// One scheduling slice: thread `utid` ran on `cpu` for `dur` ns from `ts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedSlice {
    pub row_id: i64,
    pub ts: i64,
    pub dur: i64,
    pub cpu: i64,
    pub utid: i64,
}

/// Builds an event-table batch with columns `row_id, ts, dur, cpu, utid`.
pub fn sched_batch(slices: &[SchedSlice]) -> Result<RecordBatch, Error> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("row_id", DataType::Int64, false),
        Field::new("ts", DataType::Int64, false),
        Field::new("dur", DataType::Int64, false),
        Field::new("cpu", DataType::Int64, false),
        Field::new("utid", DataType::Int64, false),
    ]));
    let column = |f: fn(&SchedSlice) -> i64| -> ArrayRef {
        Arc::new(slices.iter().map(f).collect::<Int64Array>())
    };
    let columns = vec![
        column(|s| s.row_id),
        column(|s| s.ts),
        column(|s| s.dur),
        column(|s| s.cpu),
        column(|s| s.utid),
    ];
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// In-process SQL engine backed by a DataFusion [`SessionContext`].
///
/// On top of stock DataFusion it provides the `span_join` table function and
/// executes `UPDATE` statements without a `WHERE` clause by rewriting the
/// target table, which is all the window relations need.
pub struct DataFusionEngine {
    ctx: SessionContext,
    sources: Arc<DashMap<String, SchemaRef>>,
}

impl DataFusionEngine {
    pub fn new() -> Result<Self, Error> {
        let config =
            SessionConfig::new().set_bool("datafusion.catalog.information_schema", true);
        let ctx = SessionContext::new_with_config(config);
        let catalog = ctx.copied_config().options().catalog.clone();
        let tables = ctx
            .catalog(&catalog.default_catalog)
            .and_then(|catalog_provider| catalog_provider.schema(&catalog.default_schema))
            .ok_or_else(|| {
                DataFusionError::Configuration(format!(
                    "default schema {}.{} missing",
                    catalog.default_catalog, catalog.default_schema
                ))
            })?;
        let sources = Arc::new(DashMap::new());
        ctx.register_udtf(
            SPAN_JOIN_FUNCTION,
            Arc::new(SpanJoinFunc::new(sources.clone(), tables)),
        );
        Ok(Self { ctx, sources })
    }

    /// Registers an in-memory event table. Replaces any table of that name.
    pub fn register_batch(&self, name: &str, batch: RecordBatch) -> Result<(), Error> {
        let schema = batch.schema();
        let table = MemTable::try_new(schema, vec![vec![batch]])?;
        self.register_source(name, Arc::new(table))
    }

    pub fn register_slices(&self, name: &str, slices: &[SchedSlice]) -> Result<(), Error> {
        self.register_batch(name, sched_batch(slices)?)
    }

    /// Registers a CSV file with a header row as an event table.
    pub async fn register_csv(&self, name: &str, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        self.ctx.deregister_table(name)?;
        self.ctx
            .register_csv(name, path.to_string_lossy(), CsvReadOptions::new())
            .await?;
        let provider = self.ctx.table_provider(name).await?;
        self.sources.insert(name.to_string(), provider.schema());
        debug!(table = name, path = %path.display(), "registered csv source");
        Ok(())
    }

    fn register_source(&self, name: &str, table: Arc<dyn TableProvider>) -> Result<(), Error> {
        let schema = table.schema();
        self.ctx.deregister_table(name)?;
        self.ctx.register_table(name, table)?;
        self.sources.insert(name.to_string(), schema);
        debug!(table = name, "registered source");
        Ok(())
    }

    pub async fn execute(&self, sql: &str) -> Result<Vec<RecordBatch>, Error> {
        let plan = self.ctx.state().create_logical_plan(sql).await?;
        match plan {
            LogicalPlan::Dml(DmlStatement {
                table_name,
                op: WriteOp::Update,
                input,
                ..
            }) => self.update(table_name, input).await,
            plan => Ok(self.ctx.execute_logical_plan(plan).await?.collect().await?),
        }
    }

    /// Replaces every row of `table_name` with the rows produced by the
    /// update's projection.
    async fn update(
        &self,
        table_name: TableReference,
        input: Arc<LogicalPlan>,
    ) -> Result<Vec<RecordBatch>, Error> {
        if input.as_ref().exists(|node| Ok(matches!(node, LogicalPlan::Filter(_))))? {
            return Err(Error::UnsupportedStatement("UPDATE with a WHERE clause"));
        }
        let schema = self.ctx.table_provider(table_name.clone()).await?.schema();
        let rows = self
            .ctx
            .execute_logical_plan(input.as_ref().clone())
            .await?
            .collect()
            .await?
            .into_iter()
            .map(|batch| RecordBatch::try_new(schema.clone(), batch.columns().to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        let updated: usize = rows.iter().map(RecordBatch::num_rows).sum();
        trace!(table = %table_name, rows = updated, "update");
        let table = MemTable::try_new(schema, vec![rows])?;
        self.ctx.deregister_table(table_name.clone())?;
        self.ctx.register_table(table_name, Arc::new(table))?;
        Ok(vec![])
    }
}

impl Engine for DataFusionEngine {
    fn query(&self, sql: &str) -> impl Future<Output = QueryResult> + Send {
        async move {
            trace!(sql, "execute");
            match self.execute(sql).await {
                Ok(batches) => QueryResult::ok(batches),
                Err(err) => {
                    debug!(sql, %err, "query failed");
                    QueryResult::error(err)
                }
            }
        }
    }
}
