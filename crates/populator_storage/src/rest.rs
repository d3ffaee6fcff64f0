#![forbid(unsafe_code)]

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use populator_contracts::row::RowKey;
use populator_contracts::table::{
    BatchEntry, ColumnQualifier, StoredCell, TableName, TableSchema, UNBOUNDED_MAX_VERSIONS,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::{ColumnStore, StorageError, StoreConnector};

pub const DEFAULT_REST_PORT: u16 = 8080;
const USER_AGENT: &str = "hbase-populate/0.1";
/// Row placeholder in the batch put path; the gateway reads row keys from the body.
const BATCH_ROW_PLACEHOLDER: &str = "false-row-key";

#[derive(Debug, Serialize, Deserialize)]
struct CellSet {
    #[serde(rename = "Row", default)]
    rows: Vec<RowModel>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RowModel {
    key: String,
    #[serde(rename = "Cell", default)]
    cells: Vec<CellModel>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellModel {
    column: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    timestamp: Option<u64>,
    #[serde(rename = "$")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct TableList {
    #[serde(default)]
    table: Vec<TableEntry>,
}

#[derive(Debug, Deserialize)]
struct TableEntry {
    name: String,
}

/// Connects to an HBase REST gateway (`http://<quorum>:<port>`).
#[derive(Debug, Clone)]
pub struct RestConnector {
    base_url: String,
    timeout: Duration,
}

impl RestConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_base_url(format!("http://{host}:{port}"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl StoreConnector for RestConnector {
    type Store = RestStore;

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    fn connect(&mut self) -> Result<RestStore, StorageError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout_read(self.timeout)
            .timeout_write(self.timeout)
            .user_agent(USER_AGENT)
            .try_proxy_from_env(false)
            .build();
        let store = RestStore {
            base_url: self.base_url.clone(),
            agent,
        };
        // Only a successful cluster version request counts as connected.
        store
            .agent
            .get(&store.url("/version/cluster"))
            .set("Accept", "application/json")
            .call()
            .map_err(|e| StorageError::Unreachable {
                endpoint: self.base_url.clone(),
                detail: e.to_string(),
            })?;
        Ok(store)
    }
}

#[derive(Debug)]
pub struct RestStore {
    base_url: String,
    agent: ureq::Agent,
}

impl RestStore {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_error(&self, err: ureq::Error) -> StorageError {
        match err {
            ureq::Error::Status(status, response) => StorageError::Rejected {
                status,
                detail: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => StorageError::Unreachable {
                endpoint: self.base_url.clone(),
                detail: transport.to_string(),
            },
        }
    }

    fn table_exists(&self, table: &TableName) -> Result<bool, StorageError> {
        match self
            .agent
            .get(&self.url(&format!("/{table}/schema")))
            .set("Accept", "application/json")
            .call()
        {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(err) => Err(self.map_error(err)),
        }
    }
}

impl ColumnStore for RestStore {
    fn list_tables(&self) -> Result<Vec<TableName>, StorageError> {
        let list: TableList = self
            .agent
            .get(&self.url("/"))
            .set("Accept", "application/json")
            .call()
            .map_err(|e| self.map_error(e))?
            .into_json()
            .map_err(|e| StorageError::Codec(format!("table list: {e}")))?;
        list.table
            .into_iter()
            .map(|t| TableName::new(t.name).map_err(|e| StorageError::Codec(e.to_string())))
            .collect()
    }

    fn create_table(&self, schema: &TableSchema) -> Result<(), StorageError> {
        // The gateway's schema PUT alters an existing table instead of failing.
        if self.table_exists(&schema.name)? {
            return Err(StorageError::TableExists(schema.name.clone()));
        }
        let body = json!({
            "name": schema.name.as_str(),
            "ColumnSchema": [{
                "name": schema.family,
                "VERSIONS": schema.max_versions.to_string(),
            }],
        });
        match self
            .agent
            .put(&self.url(&format!("/{}/schema", schema.name)))
            .set("Accept", "application/json")
            .send_json(body)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, response)) => {
                let detail = response.into_string().unwrap_or_default();
                if detail.contains("TableExistsException") {
                    Err(StorageError::TableExists(schema.name.clone()))
                } else {
                    Err(StorageError::Rejected { status, detail })
                }
            }
            Err(err) => Err(self.map_error(err)),
        }
    }

    fn put_batch(&self, table: &TableName, entries: &[BatchEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let cell_set = encode_cell_set(entries);
        match self
            .agent
            .put(&self.url(&format!("/{table}/{BATCH_ROW_PLACEHOLDER}")))
            .set("Accept", "application/json")
            .send_json(&cell_set)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Err(StorageError::TableNotFound(table.clone())),
            Err(err) => Err(self.map_error(err)),
        }
    }

    fn scan(&self, table: &TableName) -> Result<Vec<StoredCell>, StorageError> {
        let response = match self
            .agent
            .get(&self.url(&format!("/{table}/*")))
            .query("v", &UNBOUNDED_MAX_VERSIONS.to_string())
            .set("Accept", "application/json")
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(Vec::new()),
            Err(err) => return Err(self.map_error(err)),
        };
        let cell_set: CellSet = response
            .into_json()
            .map_err(|e| StorageError::Codec(format!("cell set: {e}")))?;
        decode_cell_set(table, cell_set)
    }
}

fn encode_cell_set(entries: &[BatchEntry]) -> CellSet {
    let mut rows: Vec<RowModel> = Vec::new();
    for entry in entries {
        let key = BASE64.encode(entry.row_key.as_bytes());
        let cell = CellModel {
            column: BASE64.encode(entry.column.to_string()),
            timestamp: entry.timestamp,
            value: BASE64.encode(&entry.value),
        };
        match rows.last_mut() {
            Some(last) if last.key == key => last.cells.push(cell),
            _ => rows.push(RowModel {
                key,
                cells: vec![cell],
            }),
        }
    }
    CellSet { rows }
}

fn decode_cell_set(table: &TableName, cell_set: CellSet) -> Result<Vec<StoredCell>, StorageError> {
    let decode = |field: &str, raw: &str| {
        BASE64
            .decode(raw)
            .map_err(|e| StorageError::Codec(format!("{field}: {e}")))
    };
    let mut cells = Vec::new();
    for row in cell_set.rows {
        let row_key = RowKey::from_bytes(decode("row key", &row.key)?)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        for cell in row.cells {
            let column_raw = String::from_utf8(decode("column", &cell.column)?)
                .map_err(|e| StorageError::Codec(format!("column: {e}")))?;
            let column = ColumnQualifier::parse(&column_raw)
                .map_err(|e| StorageError::Codec(e.to_string()))?;
            cells.push(StoredCell {
                table: table.clone(),
                row_key: row_key.clone(),
                column,
                timestamp: cell.timestamp.unwrap_or(0),
                value: decode("value", &cell.value)?,
            });
        }
    }
    Ok(cells)
}
