use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Globally unique message identity: `{chat_id}:{message_id}`.
///
/// The uid is the idempotence key for every downstream graph write, so it is
/// carried as a value type rather than a raw string. Serialized as the
/// `"1:100"` string form on every wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageUid {
    pub chat_id: i64,
    pub message_id: i64,
}

impl MessageUid {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

impl fmt::Display for MessageUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.message_id)
    }
}

impl FromStr for MessageUid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chat, msg) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed message uid: {s}"))?;
        Ok(Self {
            chat_id: chat
                .parse()
                .map_err(|_| format!("malformed chat id in uid: {s}"))?,
            message_id: msg
                .parse()
                .map_err(|_| format!("malformed message id in uid: {s}"))?,
        })
    }
}

impl Serialize for MessageUid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Who produced an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    User,
    Agent,
}

/// Telegram chat flavor, recorded on the Chat node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Group => write!(f, "group"),
            Self::Supergroup => write!(f, "supergroup"),
        }
    }
}

/// Non-text payload kinds. Their presence forces a direct quick reply in the
/// Gatekeeper regardless of any caption text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Sticker,
    Voice,
    Photo,
    Video,
    Document,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sticker => write!(f, "sticker"),
            Self::Voice => write!(f, "voice"),
            Self::Photo => write!(f, "photo"),
            Self::Video => write!(f, "video"),
            Self::Document => write!(f, "document"),
        }
    }
}

/// A raw chat event as delivered by the transport adapter (or looped back
/// from the Responder for the agent's own messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub chat_id: i64,
    pub message_id: i64,
    pub source: EventSource,
    pub sender_id: i64,
    /// Display name of the sender, when the transport knows it.
    pub sender_name: Option<String>,
    /// Platform username (without `@`), when set.
    pub username: Option<String>,
    pub chat_kind: ChatKind,
    pub chat_title: Option<String>,
    pub text: String,
    /// Seconds since epoch.
    pub timestamp: f64,
    #[serde(default)]
    pub media: Option<MediaKind>,
}

impl InboundEvent {
    pub fn uid(&self) -> MessageUid {
        MessageUid::new(self.chat_id, self.message_id)
    }
}

/// Addressee resolution from the Gatekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateTarget {
    Direct,
    Contextual,
    Nobody,
    OtherUser,
}

/// How much cognitive work the message deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDepth {
    QuickReply,
    DeepAnalysis,
    Skip,
}

/// Suggested register for the eventual reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToneHint {
    Humor,
    Serious,
    Neutral,
}

/// Triage verdict for one message. Strict schema: unknown variants fail
/// deserialization, which is what drives the retry-then-skip policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateVerdict {
    pub target: GateTarget,
    pub required_depth: GateDepth,
    pub tone_hint: ToneHint,
}

impl GateVerdict {
    /// The safe default applied when classification fails twice.
    pub fn skip() -> Self {
        Self {
            target: GateTarget::Nobody,
            required_depth: GateDepth::Skip,
            tone_hint: ToneHint::Neutral,
        }
    }

    /// Verdict forced by media payloads (stickers, voice, images).
    pub fn forced_direct() -> Self {
        Self {
            target: GateTarget::Direct,
            required_depth: GateDepth::QuickReply,
            tone_hint: ToneHint::Neutral,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.required_depth == GateDepth::Skip
    }
}

/// A topic reference emitted by the Thinker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicTag {
    pub title: String,
    #[serde(default)]
    pub is_new: bool,
}

/// The closed catalog of entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Technology,
    Person,
    Concept,
    Tool,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Technology,
        EntityKind::Person,
        EntityKind::Concept,
        EntityKind::Tool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technology => "Technology",
            Self::Person => "Person",
            Self::Concept => "Concept",
            Self::Tool => "Tool",
        }
    }
}

/// An entity reference emitted by the Thinker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTag {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
}

/// Semantic enrichment for one message — the Thinker's structured output,
/// consumed by the Scribe for graph writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrichment {
    pub msg_uid: MessageUid,
    #[serde(default)]
    pub topics: Vec<TopicTag>,
    #[serde(default)]
    pub entities: Vec<EntityTag>,
    #[serde(default)]
    pub narrative: String,
}

impl Enrichment {
    /// The no-op enrichment used when the Thinker's output fails validation
    /// twice. The pipeline continues; nothing is written.
    pub fn empty(msg_uid: MessageUid) -> Self {
        Self {
            msg_uid,
            topics: Vec::new(),
            entities: Vec::new(),
            narrative: String::new(),
        }
    }
}

/// Payload of the `triage` channel: Scribe → Gatekeeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageJob {
    pub message_uid: MessageUid,
}

/// Payload of the `planning` channel: Gatekeeper (quick path) or Thinker
/// (deep path) → Analyst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningJob {
    pub message_uid: MessageUid,
    pub narrative: String,
    pub gate_decision: GateVerdict,
}

/// Analyst's intent classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Question,
    Command,
    SmallTalk,
    Noise,
}

/// The closed set of plan actions. Anything else fails plan validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Reply,
    SearchGraph,
    SearchWeb,
    FetchUserProfile,
    RememberFact,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply => write!(f, "reply"),
            Self::SearchGraph => write!(f, "search_graph"),
            Self::SearchWeb => write!(f, "search_web"),
            Self::FetchUserProfile => write!(f, "fetch_user_profile"),
            Self::RememberFact => write!(f, "remember_fact"),
        }
    }
}

/// One node of the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: u32,
    pub action: TaskAction,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

/// The executable plan for one message — payload of the `execution` channel.
///
/// The gate verdict and narrative ride along from the triage/analysis stages
/// so the Coordinator and Responder don't have to re-fetch them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystSnapshot {
    pub msg_uid: MessageUid,
    pub intent: Intent,
    pub tasks: Vec<PlanTask>,
    pub gate: GateVerdict,
    #[serde(default)]
    pub narrative: String,
}

impl AnalystSnapshot {
    pub fn chat_id(&self) -> i64 {
        self.msg_uid.chat_id
    }
}

/// Terminal state of one executed plan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Done,
    TimedOut,
    Rejected,
    Failed,
}

/// Output of one executed plan task. Timed-out and rejected tasks produce an
/// empty `content` that downstream tasks still see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub task_id: u32,
    pub action: TaskAction,
    pub status: ToolStatus,
    pub content: String,
}

impl ToolOutput {
    pub fn done(task_id: u32, action: TaskAction, content: impl Into<String>) -> Self {
        Self {
            task_id,
            action,
            status: ToolStatus::Done,
            content: content.into(),
        }
    }

    pub fn empty(task_id: u32, action: TaskAction, status: ToolStatus) -> Self {
        Self {
            task_id,
            action,
            status,
            content: String::new(),
        }
    }
}

/// The bundle handed from Coordinator to Responder: the plan plus every tool
/// output it produced. Payload of the `response` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBundle {
    pub snapshot: AnalystSnapshot,
    pub outputs: Vec<ToolOutput>,
}

impl ContextBundle {
    pub fn output_for(&self, task_id: u32) -> Option<&ToolOutput> {
        self.outputs.iter().find(|o| o.task_id == task_id)
    }
}

/// Per-day human-readable message label: two-letter author code plus a
/// per-day sequence number (`BS02`). View-layer only — never graph identity.
pub fn message_label(author_name: &str, day_sequence: u32) -> String {
    let code: String = author_name
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(2)
        .collect::<String>()
        .to_uppercase();
    let code = if code.is_empty() {
        "XX".to_string()
    } else if code.len() == 1 {
        format!("{code}{code}")
    } else {
        code
    };
    format!("{code}{day_sequence:02}")
}
