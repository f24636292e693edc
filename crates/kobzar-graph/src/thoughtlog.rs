//! Reasoning-process records, isolated in their own logical graph so prompt
//! and response blobs never pollute PrimaryMemory analytics.
//!
//! Writes are fire-and-forget through a bounded queue: the pipeline never
//! waits on the log, and a wedged log drops entries rather than messages.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::GraphBackend;
use crate::query::lit;

/// Queue depth for pending log writes.
const LOG_QUEUE_CAPACITY: usize = 256;

/// One prompt/response pair on its way into the ThoughtLog graph.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub prompt: String,
    pub response: String,
    pub model: String,
}

/// Async writer for the ThoughtLog graph.
#[derive(Clone)]
pub struct ThoughtLogger {
    tx: mpsc::Sender<LogEntry>,
}

impl ThoughtLogger {
    /// Spawn the writer task and return the handle used by the streams.
    pub fn spawn(backend: Arc<dyn GraphBackend>, graph: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(LOG_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let cypher = format!(
                    "CREATE (:LogEntry {{id: {id}, timestamp: {ts}, prompt: {prompt}, response: {response}, model: {model}}})",
                    id = lit(&Uuid::new_v4().to_string()),
                    ts = Utc::now().timestamp(),
                    prompt = lit(&entry.prompt),
                    response = lit(&entry.response),
                    model = lit(&entry.model),
                );
                if let Err(e) = backend.execute(&graph, &cypher).await {
                    warn!(error = %e, "thought log write failed, entry dropped");
                } else {
                    debug!(model = %entry.model, "thought logged");
                }
            }
        });

        Self { tx }
    }

    /// Enqueue an entry. Never blocks — a full queue drops the entry.
    pub fn log(&self, prompt: &str, response: &str, model: &str) {
        let entry = LogEntry {
            prompt: prompt.to_string(),
            response: response.to_string(),
            model: model.to_string(),
        };
        if self.tx.try_send(entry).is_err() {
            warn!("thought log queue full, entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    #[tokio::test]
    async fn entries_land_in_the_thoughtlog_graph() {
        let backend = Arc::new(MockBackend::new());
        let logger = ThoughtLogger::spawn(backend.clone(), "ThoughtLog".to_string());

        logger.log("who am I", "ти Кобзар", "gemini-2.0-flash");

        // Give the writer task a tick to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let executed = backend.executed_on("ThoughtLog");
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("CREATE (:LogEntry"));
        assert!(executed[0].contains("'who am I'"));
        assert!(executed[0].contains("'gemini-2.0-flash'"));
    }
}
