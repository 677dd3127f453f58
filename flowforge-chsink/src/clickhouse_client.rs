//! A [`ClickHouseClient`] backed by the real `clickhouse` wire client, with round-robin
//! endpoint rotation and a literal-SQL insert path (the table's column layout is only known at
//! runtime, so a compile-time typed row can't be derived for it).

use flowforge_chsink_core::{Block, ChSinkError, ClickHouseClient, ColumnBuffer, DbValue};
use tokio::runtime::Runtime;

/// One ClickHouse server this client can connect to.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn display(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct DescribedColumn {
    name: String,
    #[serde(rename = "type")]
    db_type: String,
}

/// Drives an HTTP connection to one of `endpoints`, advancing to the next on
/// [`reset_connection_endpoint`](ClickHouseClient::reset_connection_endpoint).
///
/// Every call runs a fresh `async` block against a dedicated current-thread runtime: each
/// inserter worker owns one client, so there's no concurrent use to multiplex over a shared
/// multi-thread executor.
pub struct LiveClickHouseClient {
    endpoints: Vec<Endpoint>,
    current: usize,
    database: String,
    username: String,
    password: String,
    runtime: Runtime,
}

impl LiveClickHouseClient {
    pub fn new(
        endpoints: Vec<Endpoint>,
        database: String,
        username: String,
        password: String,
    ) -> Result<Self, ChSinkError> {
        if endpoints.is_empty() {
            return Err(ChSinkError::ConfigInvalid(
                "at least one connection endpoint is required".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ChSinkError::ConfigInvalid(e.to_string()))?;
        Ok(LiveClickHouseClient {
            endpoints,
            current: 0,
            database,
            username,
            password,
            runtime,
        })
    }

    fn client(&self) -> clickhouse::Client {
        clickhouse::Client::default()
            .with_url(self.endpoints[self.current].url())
            .with_database(&self.database)
            .with_user(&self.username)
            .with_password(&self.password)
    }
}

fn sql_literal(value: &DbValue) -> String {
    match value {
        DbValue::Int8(v) => v.to_string(),
        DbValue::Int16(v) => v.to_string(),
        DbValue::Int32(v) => v.to_string(),
        DbValue::Int64(v) => v.to_string(),
        DbValue::UInt8(v) => v.to_string(),
        DbValue::UInt16(v) => v.to_string(),
        DbValue::UInt32(v) => v.to_string(),
        DbValue::UInt64(v) => v.to_string(),
        DbValue::Float32(v) => v.to_string(),
        DbValue::Float64(v) => v.to_string(),
        DbValue::IpV6(addr) => format!("'{addr}'"),
        DbValue::DateTime64Nanos(nanos) => format!("fromUnixTimestamp64Nano({nanos})"),
        DbValue::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        DbValue::Array(items) => {
            let rendered: Vec<String> = items.iter().map(sql_literal).collect();
            format!("[{}]", rendered.join(","))
        }
    }
}

fn cell_literal(cell: Option<&DbValue>) -> String {
    cell.map(sql_literal).unwrap_or_else(|| "NULL".to_string())
}

/// Renders every row of `block` as a `(v1,v2,...)` tuple, in column declaration order.
fn row_literals(block: &Block) -> Vec<String> {
    let row_count = block.row_count();
    (0..row_count)
        .map(|row| {
            let cells: Vec<String> = block
                .columns()
                .map(|(_, buffer)| match buffer {
                    ColumnBuffer::Scalar(rows) => cell_literal(rows[row].as_ref()),
                    ColumnBuffer::Array(rows) => sql_literal(&rows[row]),
                })
                .collect();
            format!("({})", cells.join(","))
        })
        .collect()
}

impl ClickHouseClient for LiveClickHouseClient {
    fn describe_table(&mut self, table: &str) -> Result<Vec<(String, String)>, ChSinkError> {
        let client = self.client();
        let query = format!("DESCRIBE TABLE {table}");
        self.runtime.block_on(async move {
            let mut cursor = client
                .query(&query)
                .fetch::<DescribedColumn>()
                .map_err(|e| ChSinkError::InsertFailed(e.to_string()))?;
            let mut out = Vec::new();
            while let Some(row) = cursor
                .next()
                .await
                .map_err(|e| ChSinkError::InsertFailed(e.to_string()))?
            {
                out.push((row.name, row.db_type));
            }
            Ok(out)
        })
    }

    fn insert(&mut self, table: &str, block: &Block) -> Result<(), ChSinkError> {
        if block.row_count() == 0 {
            return Ok(());
        }
        let columns = block
            .specs()
            .iter()
            .map(|spec| format!("\"{}\"", spec.name))
            .collect::<Vec<_>>()
            .join(",");
        let values = row_literals(block).join(",");
        let sql = format!("INSERT INTO {table} ({columns}) VALUES {values}");

        let client = self.client();
        self.runtime
            .block_on(async move { client.query(&sql).execute().await })
            .map_err(|e| ChSinkError::InsertFailed(e.to_string()))
    }

    fn reset_connection_endpoint(&mut self) -> Result<(), ChSinkError> {
        self.current = (self.current + 1) % self.endpoints.len();
        Ok(())
    }

    fn current_endpoint(&self) -> String {
        self.endpoints[self.current].display()
    }
}
