//! The wire-level backend: one trait, one live implementation over the redis
//! protocol, and a scripted double for tests.

use async_trait::async_trait;
use redis::Value;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::value::{decode_reply, ResultSet};

/// Executes Cypher against a named logical graph.
///
/// Everything above this trait builds query text and decodes rows; everything
/// below it is the redis connection. Tests substitute a [`MockBackend`].
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn execute(&self, graph: &str, cypher: &str) -> Result<ResultSet>;

    /// Cheap liveness probe against one graph.
    async fn ping(&self, graph: &str) -> Result<()> {
        self.execute(graph, "RETURN 1").await.map(|_| ())
    }
}

/// Live client speaking `GRAPH.QUERY` over a multiplexed redis connection.
pub struct GraphClient {
    conn: redis::aio::MultiplexedConnection,
}

impl GraphClient {
    /// Connect to the graph engine. Fails fast — callers treat a connect
    /// error at startup as fatal (exit code 3).
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{host}:{port}"))?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl GraphBackend for GraphClient {
    async fn execute(&self, graph: &str, cypher: &str) -> Result<ResultSet> {
        debug!(graph, cypher, "GRAPH.QUERY");
        let mut conn = self.conn.clone();
        let raw: Value = redis::cmd("GRAPH.QUERY")
            .arg(graph)
            .arg(cypher)
            .query_async(&mut conn)
            .await?;
        decode_reply(raw)
    }
}

/// Scripted backend for tests: responses are matched by substring against the
/// incoming query, executed queries are recorded for assertions.
///
/// Lives in the library (not behind `cfg(test)`) so dependent crates can
/// drive their stage tests against it.
#[derive(Default)]
pub struct MockBackend {
    scripts: std::sync::Mutex<Vec<(String, ResultSet)>>,
    executed: std::sync::Mutex<Vec<(String, String)>>,
    fail_with: std::sync::Mutex<Option<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `result` for any query containing `pattern`. First match wins.
    pub fn script(&self, pattern: &str, result: ResultSet) {
        self.scripts
            .lock()
            .unwrap()
            .push((pattern.to_string(), result));
    }

    /// Make every subsequent call fail with a protocol error.
    pub fn fail(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    /// All `(graph, cypher)` pairs executed so far.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }

    /// Queries executed against one graph, joined for substring assertions.
    pub fn executed_on(&self, graph: &str) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| g == graph)
            .map(|(_, q)| q.clone())
            .collect()
    }
}

#[async_trait]
impl GraphBackend for MockBackend {
    async fn execute(&self, graph: &str, cypher: &str) -> Result<ResultSet> {
        self.executed
            .lock()
            .unwrap()
            .push((graph.to_string(), cypher.to_string()));

        if let Some(msg) = self.fail_with.lock().unwrap().clone() {
            return Err(GraphError::Protocol(msg));
        }

        let scripts = self.scripts.lock().unwrap();
        for (pattern, result) in scripts.iter() {
            if cypher.contains(pattern.as_str()) {
                return Ok(result.clone());
            }
        }
        Ok(ResultSet::default())
    }
}
