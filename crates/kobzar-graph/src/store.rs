//! The single source of truth for PrimaryMemory writes and reads.
//!
//! Every mutation is expressed as MERGE/CREATE statements keyed by natural
//! ids, so at-least-once redelivery from the bus is harmless. The chronology
//! repoint (LAST_EVENT → NEXT) runs under a per-chat lock: within one chat
//! writes are strictly ordered, across chats they are free to interleave.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use kobzar_core::config::AgentIdentity;
use kobzar_core::types::{message_label, Enrichment, EventSource, InboundEvent, MessageUid};

use crate::backend::GraphBackend;
use crate::error::{GraphError, Result};
use crate::query::lit;
use crate::value::ResultSet;

/// Result of a `persist` call.
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub uid: MessageUid,
    /// False when the uid already existed and the call was a no-op.
    pub created: bool,
    /// Per-day human-readable label (`BS02`), for logging only.
    pub label: String,
}

/// One message as read back from the graph.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: MessageUid,
    pub text: String,
    pub created_at: i64,
    pub author: String,
    pub from_agent: bool,
    /// Media kind (`sticker`, `voice`, …) when the message wasn't plain text.
    pub media: Option<String>,
}

/// One active topic as read back from the graph.
#[derive(Debug, Clone)]
pub struct StoredTopic {
    pub title: String,
    pub description: String,
}

/// Profile summary for `fetch_user_profile` tasks.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub name: String,
    pub username: Option<String>,
    pub message_count: i64,
}

/// Store facade over the primary graph.
pub struct GraphStore {
    backend: Arc<dyn GraphBackend>,
    graph: String,
    agent: AgentIdentity,
    /// Striped per-chat locks serializing the LAST_EVENT repoint.
    chat_locks: DashMap<i64, Arc<Mutex<()>>>,
    /// Bumped on every write to the prompt subgraph; the assembler compares
    /// generations to invalidate its cache.
    prompt_generation: AtomicU64,
}

impl GraphStore {
    pub fn new(backend: Arc<dyn GraphBackend>, graph: impl Into<String>, agent: AgentIdentity) -> Self {
        Self {
            backend,
            graph: graph.into(),
            agent,
            chat_locks: DashMap::new(),
            prompt_generation: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    pub fn graph_name(&self) -> &str {
        &self.graph
    }

    pub fn agent(&self) -> &AgentIdentity {
        &self.agent
    }

    pub fn prompt_generation(&self) -> u64 {
        self.prompt_generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_prompt_generation(&self) {
        self.prompt_generation.fetch_add(1, Ordering::Release);
    }

    fn chat_lock(&self, chat_id: i64) -> Arc<Mutex<()>> {
        self.chat_locks
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run(&self, cypher: &str) -> Result<ResultSet> {
        self.backend.execute(&self.graph, cypher).await
    }

    /// Append one raw event to the graph: identities, time tree, the Message
    /// node, authorship, and the chronology repoint — all keyed by uid.
    ///
    /// Duplicate uids are a no-op returning the existing uid.
    pub async fn persist(&self, event: &InboundEvent) -> Result<PersistOutcome> {
        let uid = event.uid();
        let lock = self.chat_lock(event.chat_id);
        let _guard = lock.lock().await;

        let existing = self
            .run(&format!(
                "MATCH (m:Message {{uid: {}}}) RETURN m.uid",
                lit(&uid.to_string())
            ))
            .await?;
        if !existing.is_empty() {
            debug!(%uid, "duplicate event, persist is a no-op");
            return Ok(PersistOutcome {
                uid,
                created: false,
                label: String::new(),
            });
        }

        let when = epoch_to_datetime(event.timestamp);
        let author_name = self.author_name(event);

        self.run(&self.persist_query(event, &uid, &when, &author_name))
            .await?;

        let seq = self.day_sequence(event, &when).await.unwrap_or(1);
        let label = message_label(&author_name, seq);
        debug!(%uid, label, "message persisted");

        Ok(PersistOutcome {
            uid,
            created: true,
            label,
        })
    }

    fn author_name(&self, event: &InboundEvent) -> String {
        match event.source {
            EventSource::Agent => self.agent.name.clone(),
            EventSource::User => event
                .sender_name
                .clone()
                .or_else(|| event.username.clone())
                .unwrap_or_else(|| event.sender_id.to_string()),
        }
    }

    fn persist_query(
        &self,
        event: &InboundEvent,
        uid: &MessageUid,
        when: &DateTime<Utc>,
        author_name: &str,
    ) -> String {
        let author_clause = match event.source {
            EventSource::User => format!(
                "MERGE (a:User {{telegram_id: {id}}}) \
                 ON CREATE SET a.id = {node_id}, a.name = {name}, a.username = {username}",
                id = event.sender_id,
                node_id = lit(&Uuid::new_v4().to_string()),
                name = lit(author_name),
                username = event
                    .username
                    .as_deref()
                    .map(lit)
                    .unwrap_or_else(|| "''".to_string()),
            ),
            EventSource::Agent => format!(
                "MERGE (a:Agent {{telegram_id: {id}}}) \
                 ON CREATE SET a.id = {node_id}, a.name = {name}",
                id = self.agent.telegram_id,
                node_id = lit(&Uuid::new_v4().to_string()),
                name = lit(&self.agent.name),
            ),
        };
        let authored = match event.source {
            EventSource::User => "CREATE (a)-[:AUTHORED]->(m)",
            EventSource::Agent => "CREATE (a)-[:GENERATED]->(m)",
        };

        format!(
            "{author_clause} \
             MERGE (c:Chat {{chat_id: {chat_id}}}) \
             ON CREATE SET c.id = {chat_node_id}, c.name = {chat_name}, c.type = {chat_kind} \
             MERGE (y:Year {{value: {year}}}) \
             MERGE (d:Day {{date: {date}}}) \
             MERGE (y)-[:MONTH {{number: {month}}}]->(d) \
             CREATE (m:Message {{uid: {uid}, message_id: {message_id}, text: {text}, created_at: {created_at}, media: {media}}}) \
             {authored} \
             CREATE (m)-[:HAPPENED_IN]->(c) \
             CREATE (m)-[:HAPPENED_AT {{time: {time}}}]->(d) \
             WITH c, m \
             OPTIONAL MATCH (c)-[le:LAST_EVENT]->(prev:Message) \
             FOREACH (p IN CASE WHEN prev IS NULL THEN [] ELSE [prev] END | CREATE (p)-[:NEXT]->(m)) \
             DELETE le \
             CREATE (c)-[:LAST_EVENT]->(m)",
            chat_id = event.chat_id,
            chat_node_id = lit(&Uuid::new_v4().to_string()),
            chat_name = lit(event.chat_title.as_deref().unwrap_or("")),
            chat_kind = lit(&event.chat_kind.to_string()),
            year = when.year(),
            date = lit(&when.format("%Y-%m-%d").to_string()),
            month = when.month(),
            uid = lit(&uid.to_string()),
            message_id = event.message_id,
            text = lit(&event.text),
            created_at = event.timestamp as i64,
            media = event
                .media
                .map(|m| lit(&m.to_string()))
                .unwrap_or_else(|| "''".to_string()),
            time = lit(&when.format("%H:%M:%S").to_string()),
        )
    }

    /// Count of this author's messages on the event's day, for the label.
    async fn day_sequence(&self, event: &InboundEvent, when: &DateTime<Utc>) -> Result<u32> {
        let sender = match event.source {
            EventSource::Agent => self.agent.telegram_id,
            EventSource::User => event.sender_id,
        };
        let rs = self
            .run(&format!(
                "MATCH (a {{telegram_id: {sender}}})-[:AUTHORED|GENERATED]->(m:Message)\
                 -[:HAPPENED_AT]->(:Day {{date: {date}}}) RETURN count(m)",
                date = lit(&when.format("%Y-%m-%d").to_string()),
            ))
            .await?;
        Ok(rs.single().and_then(|s| s.as_i64()).unwrap_or(1) as u32)
    }

    /// Apply the Thinker's semantic output: topics, entities, and their
    /// edges. Every statement is a MERGE keyed by normalized natural keys.
    pub async fn enrich(&self, enrichment: &Enrichment) -> Result<()> {
        let uid = lit(&enrichment.msg_uid.to_string());
        let now = Utc::now().timestamp();

        for topic in &enrichment.topics {
            let title = lit(&normalize_topic(&topic.title));
            self.run(&format!(
                "MATCH (m:Message {{uid: {uid}}}) \
                 MERGE (t:Topic {{title: {title}}}) \
                 ON CREATE SET t.description = '', t.status = 'active', t.created_at = {now} \
                 MERGE (m)-[:DISCUSSES]->(t)"
            ))
            .await?;
        }

        for entity in &enrichment.entities {
            let name = lit(entity.name.trim());
            let kind = lit(entity.kind.as_str());
            self.run(&format!(
                "MATCH (m:Message {{uid: {uid}}}) \
                 MERGE (e:Entity {{name: {name}}}) \
                 ON CREATE SET e.type = {kind} \
                 MERGE (m)-[:MENTIONS]->(e)"
            ))
            .await?;
        }

        for topic in &enrichment.topics {
            let title = lit(&normalize_topic(&topic.title));
            for entity in &enrichment.entities {
                let name = lit(entity.name.trim());
                self.run(&format!(
                    "MATCH (t:Topic {{title: {title}}}), (e:Entity {{name: {name}}}) \
                     MERGE (t)-[:INVOLVES]->(e)"
                ))
                .await?;
            }
        }

        Ok(())
    }

    pub async fn message_by_uid(&self, uid: MessageUid) -> Result<Option<StoredMessage>> {
        let rs = self
            .run(&format!(
                "MATCH (m:Message {{uid: {}}}) \
                 OPTIONAL MATCH (u:User)-[:AUTHORED]->(m) \
                 OPTIONAL MATCH (a:Agent)-[:GENERATED]->(m) \
                 RETURN m.uid, m.text, m.created_at, u.name, a.name, m.media",
                lit(&uid.to_string())
            ))
            .await?;
        Ok(rs.rows.first().and_then(|row| decode_message(row)))
    }

    /// The most recent `limit` messages of a chat, oldest first.
    pub async fn recent_messages(&self, chat_id: i64, limit: usize) -> Result<Vec<StoredMessage>> {
        let rs = self
            .run(&format!(
                "MATCH (m:Message)-[:HAPPENED_IN]->(:Chat {{chat_id: {chat_id}}}) \
                 OPTIONAL MATCH (u:User)-[:AUTHORED]->(m) \
                 OPTIONAL MATCH (a:Agent)-[:GENERATED]->(m) \
                 RETURN m.uid, m.text, m.created_at, u.name, a.name, m.media \
                 ORDER BY m.created_at DESC LIMIT {limit}"
            ))
            .await?;
        let mut messages: Vec<StoredMessage> =
            rs.rows.iter().filter_map(|r| decode_message(r)).collect();
        messages.reverse();
        Ok(messages)
    }

    /// User-authored messages of a chat at or after `since_ts`. Used by the
    /// Coordinator's mid-stream check for late-arriving input.
    pub async fn messages_since(&self, chat_id: i64, since_ts: i64) -> Result<Vec<MessageUid>> {
        let rs = self
            .run(&format!(
                "MATCH (:User)-[:AUTHORED]->(m:Message)-[:HAPPENED_IN]->(:Chat {{chat_id: {chat_id}}}) \
                 WHERE m.created_at >= {since_ts} \
                 RETURN m.uid ORDER BY m.created_at"
            ))
            .await?;
        Ok(rs
            .rows
            .iter()
            .filter_map(|r| r.first()?.as_str()?.parse().ok())
            .collect())
    }

    /// Uid of the chat's LAST_EVENT head, if the chat has any messages.
    pub async fn last_event_uid(&self, chat_id: i64) -> Result<Option<MessageUid>> {
        let rs = self
            .run(&format!(
                "MATCH (:Chat {{chat_id: {chat_id}}})-[:LAST_EVENT]->(m:Message) RETURN m.uid"
            ))
            .await?;
        Ok(rs.single().and_then(|s| s.as_str()?.parse().ok()))
    }

    pub async fn active_topics(&self, limit: usize) -> Result<Vec<StoredTopic>> {
        let rs = self
            .run(&format!(
                "MATCH (t:Topic {{status: 'active'}}) \
                 RETURN t.title, t.description ORDER BY t.created_at DESC LIMIT {limit}"
            ))
            .await?;
        Ok(rs
            .rows
            .iter()
            .filter_map(|r| {
                Some(StoredTopic {
                    title: r.first()?.as_str()?.to_string(),
                    description: r
                        .get(1)
                        .and_then(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }

    /// Every chat the graph knows about. Used by `backfill`.
    pub async fn all_chat_ids(&self) -> Result<Vec<i64>> {
        let rs = self
            .run("MATCH (c:Chat) RETURN c.chat_id ORDER BY c.chat_id")
            .await?;
        Ok(rs
            .rows
            .iter()
            .filter_map(|r| r.first()?.as_i64())
            .collect())
    }

    pub async fn user_profile(&self, telegram_id: i64) -> Result<Option<StoredUser>> {
        let rs = self
            .run(&format!(
                "MATCH (u:User {{telegram_id: {telegram_id}}}) \
                 OPTIONAL MATCH (u)-[:AUTHORED]->(m:Message) \
                 RETURN u.name, u.username, count(m)"
            ))
            .await?;
        Ok(rs.rows.first().map(|row| StoredUser {
            name: row
                .first()
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
            username: row
                .get(1)
                .and_then(|s| s.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            message_count: row.get(2).and_then(|s| s.as_i64()).unwrap_or(0),
        }))
    }

    /// Replace the agent's WORKING_ON lock with a fresh Task node. A newer
    /// intent supersedes whatever was there.
    pub async fn set_working_on(&self, description: &str) -> Result<()> {
        self.run(&format!(
            "MERGE (a:Agent {{telegram_id: {id}}}) \
             ON CREATE SET a.id = {node_id}, a.name = {name} \
             WITH a \
             OPTIONAL MATCH (a)-[:WORKING_ON]->(old:Task) \
             DETACH DELETE old \
             CREATE (a)-[:WORKING_ON]->(:Task {{id: {task_id}, description: {desc}, started_at: {ts}}})",
            id = self.agent.telegram_id,
            node_id = lit(&Uuid::new_v4().to_string()),
            name = lit(&self.agent.name),
            task_id = lit(&Uuid::new_v4().to_string()),
            desc = lit(description),
            ts = Utc::now().timestamp(),
        ))
        .await
        .map(|_| ())
    }

    /// Remove the WORKING_ON lock. Idempotent — missing lock is fine.
    pub async fn clear_working_on(&self) -> Result<()> {
        self.run(&format!(
            "MATCH (:Agent {{telegram_id: {}}})-[:WORKING_ON]->(t:Task) DETACH DELETE t",
            self.agent.telegram_id
        ))
        .await
        .map(|_| ())
    }

    /// Record the Thinker's situational narrative as an immutable snapshot.
    pub async fn record_thought(&self, narrative: &str, model: &str) -> Result<()> {
        self.run(&format!(
            "MERGE (a:Agent {{telegram_id: {id}}}) \
             ON CREATE SET a.id = {node_id}, a.name = {name} \
             CREATE (a)-[:THOUGHT]->(:ThoughtSnapshot {{id: {snap_id}, timestamp: {ts}, narrative: {narrative}, model: {model}}})",
            id = self.agent.telegram_id,
            node_id = lit(&Uuid::new_v4().to_string()),
            name = lit(&self.agent.name),
            snap_id = lit(&Uuid::new_v4().to_string()),
            ts = Utc::now().timestamp(),
            narrative = lit(narrative),
            model = lit(model),
        ))
        .await
        .map(|_| ())
    }

    /// `remember_fact` task: upsert a Concept entity carrying the fact text.
    pub async fn remember_fact(&self, name: &str, detail: &str) -> Result<()> {
        self.run(&format!(
            "MERGE (e:Entity {{name: {name}}}) \
             ON CREATE SET e.type = 'Concept' \
             SET e.description = {detail}",
            name = lit(name.trim()),
            detail = lit(detail),
        ))
        .await
        .map(|_| ())
    }

    /// Execute an already-validated research query. Callers must run the
    /// query through [`crate::query::validate_research_query`] first.
    pub async fn research(&self, validated_cypher: &str) -> Result<ResultSet> {
        self.run(validated_cypher).await
    }

    /// One-line schema summary handed to the LLM when it writes queries.
    pub fn schema_summary(&self) -> &'static str {
        "Nodes: User{telegram_id,name,username}, Agent{telegram_id,name}, \
         Chat{chat_id,name,type}, Message{uid,message_id,text,created_at}, \
         Year{value}, Day{date}, Topic{title,description,status,created_at}, \
         Entity{name,type,description}. \
         Edges: (User)-[:AUTHORED]->(Message), (Agent)-[:GENERATED]->(Message), \
         (Message)-[:HAPPENED_IN]->(Chat), (Message)-[:HAPPENED_AT{time}]->(Day), \
         (Year)-[:MONTH{number}]->(Day), (Message)-[:NEXT]->(Message), \
         (Chat)-[:LAST_EVENT]->(Message), (Message)-[:DISCUSSES]->(Topic), \
         (Topic)-[:INVOLVES]->(Entity), (Message)-[:MENTIONS]->(Entity)"
    }
}

/// Trim + casefold, so `" Docker "` and `"docker"` land on one Topic node.
pub fn normalize_topic(title: &str) -> String {
    title.trim().to_lowercase()
}

fn epoch_to_datetime(ts: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts as i64, 0).unwrap_or_else(Utc::now)
}

fn decode_message(row: &[crate::value::Scalar]) -> Option<StoredMessage> {
    let uid: MessageUid = row.first()?.as_str()?.parse().ok()?;
    let text = row.get(1)?.as_str().unwrap_or_default().to_string();
    let created_at = row.get(2)?.as_i64().unwrap_or(0);
    let user_name = row.get(3).and_then(|s| s.as_str());
    let agent_name = row.get(4).and_then(|s| s.as_str());
    let from_agent = agent_name.is_some() && user_name.is_none();
    let author = user_name
        .or(agent_name)
        .unwrap_or("unknown")
        .to_string();
    let media = row
        .get(5)
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(StoredMessage {
        uid,
        text,
        created_at,
        author,
        from_agent,
        media,
    })
}
