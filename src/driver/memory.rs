//! In-memory reference driver.
//!
//! A deliberately tiny database used by the test suite and examples: it
//! understands just enough SQL for the pool's own journal traffic and for
//! row-content assertions (`INSERT INTO t VALUES (?, ...)`, `SELECT * FROM t
//! ORDER BY id`, `SELECT COUNT(*) FROM t`, `DELETE FROM t WHERE id = ?`).
//! Every table row carries an autoincrement id in column 0. Fault injection
//! (unreachable server, scripted per-call failures) drives the fallback and
//! eviction paths in tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{DriverError, DriverErrorKind, DriverResult, IsolationLevel, ParamValue};
use crate::driver::{DataSource, DriverConnection, DriverStatement, Rows};

#[derive(Debug, Default)]
struct MemTable {
    next_id: i64,
    rows: BTreeMap<i64, Vec<ParamValue>>,
}

impl MemTable {
    fn insert(&mut self, row: Vec<ParamValue>) -> i64 {
        self.next_id += 1;
        self.rows.insert(self.next_id, row);
        self.next_id
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    Insert { table: String, row: Vec<ParamValue> },
    DeleteById { table: String, id: i64 },
    Clear { table: String },
}

#[derive(Debug, Default)]
struct ServerState {
    tables: HashMap<String, MemTable>,
    fail_next: VecDeque<String>,
}

/// Per-connection transaction state, shared with the statements prepared on
/// the connection so their work joins the same transaction.
#[derive(Debug)]
struct TxState {
    auto_commit: bool,
    pending: Vec<Mutation>,
}

/// A fake database shared by all connections opened from it.
#[derive(Debug, Clone)]
pub struct MemServer {
    name: String,
    unreachable: Arc<AtomicBool>,
    state: Arc<Mutex<ServerState>>,
}

impl MemServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unreachable: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    /// While unreachable, new connects and every call on existing
    /// connections fail with SQLSTATE 08S01.
    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    /// Script the next call (on any connection) to fail with the given
    /// SQLSTATE.
    pub fn fail_next_with(&self, sqlstate: &str) {
        self.state
            .lock()
            .expect("server lock poisoned")
            .fail_next
            .push_back(sqlstate.to_string());
    }

    /// Committed rows of a table, without the autoincrement id column.
    pub fn rows(&self, table: &str) -> Vec<Vec<ParamValue>> {
        let state = self.state.lock().expect("server lock poisoned");
        state
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock().expect("server lock poisoned");
        state.tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    fn gate(&self) -> DriverResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DriverError::unavailable(format!(
                "server '{}' is unreachable",
                self.name
            )));
        }
        let scripted = self
            .state
            .lock()
            .expect("server lock poisoned")
            .fail_next
            .pop_front();
        if let Some(state) = scripted {
            return Err(DriverError::with_state(
                DriverErrorKind::Rejected,
                &state,
                format!("scripted failure on '{}'", self.name),
            ));
        }
        Ok(())
    }

    fn apply(&self, mutations: &[Mutation]) {
        let mut state = self.state.lock().expect("server lock poisoned");
        for m in mutations {
            match m {
                Mutation::Insert { table, row } => {
                    state
                        .tables
                        .entry(table.clone())
                        .or_default()
                        .insert(row.clone());
                }
                Mutation::DeleteById { table, id } => {
                    if let Some(t) = state.tables.get_mut(table) {
                        t.rows.remove(id);
                    }
                }
                Mutation::Clear { table } => {
                    if let Some(t) = state.tables.get_mut(table) {
                        t.rows.clear();
                    }
                }
            }
        }
    }

    /// Route a mutation through the connection's transaction state.
    fn run(&self, tx: &Mutex<TxState>, mutation: Mutation) {
        let mut tx = tx.lock().expect("tx lock poisoned");
        if tx.auto_commit {
            self.apply(std::slice::from_ref(&mutation));
        } else {
            tx.pending.push(mutation);
        }
    }

    fn select(&self, sql: &Sql) -> DriverResult<Rows> {
        let state = self.state.lock().expect("server lock poisoned");
        match sql {
            Sql::SelectAll { table } => {
                let rows = state
                    .tables
                    .get(table)
                    .map(|t| {
                        t.rows
                            .iter()
                            .map(|(id, row)| {
                                let mut full = Vec::with_capacity(row.len() + 1);
                                full.push(ParamValue::Integer(*id));
                                full.extend(row.iter().cloned());
                                full
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Rows::new(vec!["id".into()], rows))
            }
            Sql::SelectCount { table } => {
                let n = state.tables.get(table).map(|t| t.rows.len()).unwrap_or(0);
                Ok(Rows::new(
                    vec!["count".into()],
                    vec![vec![ParamValue::Integer(n as i64)]],
                ))
            }
            _ => Err(unsupported(sql)),
        }
    }
}

#[async_trait]
impl DataSource for MemServer {
    async fn connect(&self) -> DriverResult<Box<dyn DriverConnection>> {
        self.gate()?;
        Ok(Box::new(MemConnection {
            server: self.clone(),
            tx: Arc::new(Mutex::new(TxState {
                auto_commit: true,
                pending: Vec::new(),
            })),
            network_timeout: Duration::ZERO,
            closed: false,
        }))
    }
}

/// Recognized statement shapes.
#[derive(Debug)]
enum Sql {
    Insert { table: String },
    SelectAll { table: String },
    SelectCount { table: String },
    DeleteById { table: String },
    DeleteAll { table: String },
}

fn parse(sql: &str) -> DriverResult<Sql> {
    let trimmed = sql.trim().trim_end_matches(';');
    let upper = trimmed.to_ascii_uppercase();
    let word = |n: usize| {
        trimmed
            .split_whitespace()
            .nth(n)
            .map(|w| w.trim_matches(|c| c == '(' || c == ')').to_string())
    };

    if upper.starts_with("INSERT INTO ") {
        let table = word(2).ok_or_else(|| syntax(sql))?;
        return Ok(Sql::Insert { table });
    }
    if upper.starts_with("SELECT COUNT(*) FROM ") {
        let table = word(3).ok_or_else(|| syntax(sql))?;
        return Ok(Sql::SelectCount { table });
    }
    if upper.starts_with("SELECT * FROM ") && upper.ends_with("ORDER BY ID") {
        let table = word(3).ok_or_else(|| syntax(sql))?;
        return Ok(Sql::SelectAll { table });
    }
    if upper.starts_with("DELETE FROM ") {
        let table = word(2).ok_or_else(|| syntax(sql))?;
        if upper.contains("WHERE ID = ?") {
            return Ok(Sql::DeleteById { table });
        }
        return Ok(Sql::DeleteAll { table });
    }
    Err(syntax(sql))
}

fn syntax(sql: &str) -> DriverError {
    DriverError::with_state(
        DriverErrorKind::Rejected,
        "42601",
        format!("unsupported statement: {sql}"),
    )
}

fn unsupported(sql: &Sql) -> DriverError {
    DriverError::new(DriverErrorKind::Other, format!("not a query: {sql:?}"))
}

fn mutation_for(sql: &Sql, params: &[ParamValue]) -> DriverResult<Mutation> {
    match sql {
        Sql::Insert { table } => Ok(Mutation::Insert {
            table: table.clone(),
            row: params.to_vec(),
        }),
        Sql::DeleteById { table } => {
            let id = params
                .first()
                .and_then(|p| p.as_i64())
                .ok_or_else(|| DriverError::new(DriverErrorKind::Rejected, "missing id parameter"))?;
            Ok(Mutation::DeleteById {
                table: table.clone(),
                id,
            })
        }
        Sql::DeleteAll { table } => Ok(Mutation::Clear {
            table: table.clone(),
        }),
        _ => Err(unsupported(sql)),
    }
}

pub struct MemConnection {
    server: MemServer,
    tx: Arc<Mutex<TxState>>,
    network_timeout: Duration,
    closed: bool,
}

impl MemConnection {
    fn check_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::new(DriverErrorKind::Other, "connection closed"));
        }
        self.server.gate()
    }
}

#[async_trait]
impl DriverConnection for MemConnection {
    async fn execute(&mut self, sql: &str, params: &[ParamValue]) -> DriverResult<u64> {
        self.check_open()?;
        let parsed = parse(sql)?;
        let mutation = mutation_for(&parsed, params)?;
        self.server.run(&self.tx, mutation);
        Ok(1)
    }

    async fn query(&mut self, sql: &str, _params: &[ParamValue]) -> DriverResult<Rows> {
        self.check_open()?;
        let parsed = parse(sql)?;
        self.server.select(&parsed)
    }

    async fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>> {
        self.check_open()?;
        parse(sql)?;
        Ok(Box::new(MemStatement {
            server: self.server.clone(),
            tx: Arc::clone(&self.tx),
            sql: sql.to_string(),
            binds: BTreeMap::new(),
            batch: Vec::new(),
            closed: false,
        }))
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.check_open()?;
        let pending = {
            let mut tx = self.tx.lock().expect("tx lock poisoned");
            std::mem::take(&mut tx.pending)
        };
        self.server.apply(&pending);
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.check_open()?;
        self.tx.lock().expect("tx lock poisoned").pending.clear();
        Ok(())
    }

    async fn set_auto_commit(&mut self, on: bool) -> DriverResult<()> {
        self.check_open()?;
        self.tx.lock().expect("tx lock poisoned").auto_commit = on;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.tx.lock().expect("tx lock poisoned").auto_commit
    }

    async fn set_read_only(&mut self, _on: bool) -> DriverResult<()> {
        self.check_open()
    }

    async fn set_isolation(&mut self, _level: IsolationLevel) -> DriverResult<()> {
        self.check_open()
    }

    async fn set_catalog(&mut self, _catalog: &str) -> DriverResult<()> {
        self.check_open()
    }

    async fn set_schema(&mut self, _schema: &str) -> DriverResult<()> {
        self.check_open()
    }

    async fn set_network_timeout(&mut self, timeout: Duration) -> DriverResult<()> {
        self.check_open()?;
        self.network_timeout = timeout;
        Ok(())
    }

    fn network_timeout(&self) -> Duration {
        self.network_timeout
    }

    async fn is_valid(&mut self, _timeout: Duration) -> bool {
        !self.closed && self.server.gate().is_ok()
    }

    async fn abort(&mut self) -> DriverResult<()> {
        self.tx.lock().expect("tx lock poisoned").pending.clear();
        self.closed = true;
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.tx.lock().expect("tx lock poisoned").pending.clear();
        self.closed = true;
        Ok(())
    }
}

pub struct MemStatement {
    server: MemServer,
    tx: Arc<Mutex<TxState>>,
    sql: String,
    binds: BTreeMap<u16, ParamValue>,
    batch: Vec<Vec<ParamValue>>,
    closed: bool,
}

impl MemStatement {
    fn check_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::new(DriverErrorKind::Other, "statement closed"));
        }
        self.server.gate()
    }

    fn bound_params(&self) -> Vec<ParamValue> {
        self.binds.values().cloned().collect()
    }

    fn apply_once(&self, params: &[ParamValue]) -> DriverResult<u64> {
        let parsed = parse(&self.sql)?;
        let mutation = mutation_for(&parsed, params)?;
        self.server.run(&self.tx, mutation);
        Ok(1)
    }
}

#[async_trait]
impl DriverStatement for MemStatement {
    async fn bind(&mut self, index: u16, value: ParamValue) -> DriverResult<()> {
        self.check_open()?;
        self.binds.insert(index, value);
        Ok(())
    }

    async fn execute(&mut self) -> DriverResult<u64> {
        self.check_open()?;
        self.apply_once(&self.bound_params())
    }

    async fn query(&mut self) -> DriverResult<Rows> {
        self.check_open()?;
        let parsed = parse(&self.sql)?;
        self.server.select(&parsed)
    }

    async fn add_batch(&mut self) -> DriverResult<()> {
        self.check_open()?;
        let params = self.bound_params();
        self.batch.push(params);
        self.binds.clear();
        Ok(())
    }

    async fn execute_batch(&mut self) -> DriverResult<Vec<u64>> {
        self.check_open()?;
        let batch = std::mem::take(&mut self.batch);
        let mut counts = Vec::with_capacity(batch.len());
        for params in &batch {
            counts.push(self.apply_once(params)?);
        }
        Ok(counts)
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_count() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(7)])
            .await
            .unwrap();
        let rows = conn.query("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(rows.rows[0][0], ParamValue::Integer(1));
        assert_eq!(server.rows("t"), vec![vec![ParamValue::Integer(7)]]);
    }

    #[tokio::test]
    async fn test_transaction_buffers_until_commit() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(1)])
            .await
            .unwrap();
        assert_eq!(server.row_count("t"), 0);
        conn.commit().await.unwrap();
        assert_eq!(server.row_count("t"), 1);
    }

    #[tokio::test]
    async fn test_statement_joins_the_connection_transaction() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        let mut st = conn.prepare("INSERT INTO t VALUES (?)").await.unwrap();
        st.bind(1, ParamValue::Integer(5)).await.unwrap();
        st.execute().await.unwrap();
        assert_eq!(server.row_count("t"), 0);
        conn.rollback().await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(server.row_count("t"), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_pending() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(1)])
            .await
            .unwrap();
        conn.rollback().await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(server.row_count("t"), 0);
    }

    #[tokio::test]
    async fn test_delete_by_id() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(1)])
            .await
            .unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(2)])
            .await
            .unwrap();
        let all = conn.query("SELECT * FROM t ORDER BY id", &[]).await.unwrap();
        let first_id = all.rows[0][0].as_i64().unwrap();
        conn.execute(
            "DELETE FROM t WHERE id = ?",
            &[ParamValue::Integer(first_id)],
        )
        .await
        .unwrap();
        assert_eq!(server.rows("t"), vec![vec![ParamValue::Integer(2)]]);
    }

    #[tokio::test]
    async fn test_unreachable_server_refuses_everything() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        server.set_unreachable(true);
        let err = conn
            .execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(1)])
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
        assert!(server.connect().await.is_err());
        assert!(!conn.is_valid(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_scripted_failure_fires_once() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        server.fail_next_with("57P01");
        let err = conn
            .execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(1)])
            .await
            .unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("57P01"));
        conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(2)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_statement_batch() {
        let server = MemServer::new("db");
        let mut conn = server.connect().await.unwrap();
        let mut st = conn.prepare("INSERT INTO t VALUES (?)").await.unwrap();
        st.bind(1, ParamValue::Integer(1)).await.unwrap();
        st.add_batch().await.unwrap();
        st.bind(1, ParamValue::Integer(2)).await.unwrap();
        st.add_batch().await.unwrap();
        let counts = st.execute_batch().await.unwrap();
        assert_eq!(counts, vec![1, 1]);
        assert_eq!(server.row_count("t"), 2);
    }
}
