//! LLM-driven distillation of a conversation window into memory actions.
//!
//! The distiller is the only lossy, non-deterministic component: it builds a
//! prompt from the window plus the current memory set, asks the model for a
//! JSON delta, and repairs or discards what comes back. Failure degrades to
//! an empty delta — the store never becomes inconsistent because of it.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::db::{Memory, MemoryType, TurnRecord};
use crate::error::Result;
use crate::llm::LanguageModel;
use crate::prompts;
use crate::thresholds::MAX_DISTILLED_VALUE_LEN;

/// Closed set of delta actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAction {
    Add,
    Update,
    Keep,
    Expire,
}

impl std::str::FromStr for MemoryAction {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "keep" => Ok(Self::Keep),
            "expire" => Ok(Self::Expire),
            _ => Err(()),
        }
    }
}

/// One parsed action of a distillation delta, before resolution against the
/// store. `id` targets an existing memory for update/keep/expire; add
/// carries the full field set.
#[derive(Debug, Clone)]
pub struct DistilledMemory {
    pub action: MemoryAction,
    pub id: Option<String>,
    pub kind: MemoryType,
    pub category: String,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub source_turn: Option<i64>,
}

pub struct Distiller {
    llm: Arc<dyn LanguageModel>,
    max_tokens: u32,
}

impl Distiller {
    pub fn new(llm: Arc<dyn LanguageModel>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    /// Convert a window of turns plus the active memory set into a delta.
    ///
    /// Transport errors propagate; an unusable response is logged and
    /// yields an empty delta.
    pub async fn distill(
        &self,
        window: &[TurnRecord],
        existing: &[Memory],
    ) -> Result<Vec<DistilledMemory>> {
        if window.is_empty() {
            return Ok(vec![]);
        }
        let prompt = prompts::distill_prompt(window, existing);
        let raw = self.llm.json_complete(&prompt, self.max_tokens).await?;
        match parse_delta(&raw, existing) {
            Some(delta) => {
                debug!(actions = delta.len(), "distilled window");
                Ok(delta)
            }
            None => {
                let head: String = raw.chars().take(200).collect();
                warn!(head, "unrecoverable distiller response, dropping window");
                Ok(vec![])
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing and repair
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawAction {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    source_turn: Option<i64>,
}

fn strip_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = rest.strip_prefix("json").unwrap_or(rest).trim_start();
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest.trim_end();
    }
    s
}

/// Parse a raw distiller response into validated actions. Returns `None`
/// only when the JSON is unrecoverable.
pub fn parse_delta(raw: &str, existing: &[Memory]) -> Option<Vec<DistilledMemory>> {
    let cleaned = strip_fences(raw);
    let data: serde_json::Value = match serde_json::from_str(cleaned) {
        Ok(v) => v,
        Err(_) => recover_truncated(cleaned)?,
    };

    let items = data
        .get("actions")
        .or_else(|| data.get("memories"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut parsed: Vec<DistilledMemory> = items.into_iter().filter_map(parse_item).collect();

    // A "keep" naming a key no active memory holds is really a new fact the
    // model hedged on — promote it to an add.
    let existing_keys: HashSet<&str> = existing.iter().map(|m| m.key.as_str()).collect();
    let existing_ids: HashSet<&str> = existing.iter().map(|m| m.id.as_str()).collect();
    for dm in &mut parsed {
        if dm.action == MemoryAction::Keep
            && !dm.value.trim().is_empty()
            && !existing_keys.contains(dm.key.as_str())
            && dm.id.as_deref().is_none_or(|id| !existing_ids.contains(id))
        {
            debug!(key = dm.key, "correcting keep to add for unknown memory");
            dm.action = MemoryAction::Add;
            dm.id = None;
        }
        // Fill a missing target id from the key when it resolves.
        if dm.action != MemoryAction::Add && dm.id.is_none() {
            dm.id = existing
                .iter()
                .find(|m| m.key == dm.key)
                .map(|m| m.id.clone());
        }
    }

    Some(filter_world_facts(parsed))
}

fn parse_item(item: serde_json::Value) -> Option<DistilledMemory> {
    let raw: RawAction = serde_json::from_value(item).ok()?;
    let action: MemoryAction = raw.action.as_deref().unwrap_or("add").parse().ok()?;
    let kind: MemoryType = raw.kind.as_deref().unwrap_or("fact").parse().ok()?;

    let key = raw.key.unwrap_or_default().trim().to_lowercase();
    let value = match raw.value {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    match action {
        MemoryAction::Add | MemoryAction::Update => {
            if key.is_empty() || value.trim().is_empty() || key == "unknown" {
                return None;
            }
        }
        MemoryAction::Keep | MemoryAction::Expire => {
            if key.is_empty() && raw.id.is_none() {
                return None;
            }
        }
    }

    Some(DistilledMemory {
        action,
        id: raw.id,
        kind,
        category: raw.category.unwrap_or_else(|| "general".into()),
        key,
        value,
        confidence: raw.confidence.unwrap_or(0.8).clamp(0.0, 1.0),
        source_turn: raw.source_turn,
    })
}

fn regexes() -> &'static (Regex, Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r#",\s*"[^"]*$"#).expect("dangling-field regex"),
            Regex::new(r",\s*$").expect("trailing-comma regex"),
            Regex::new(r"\.{2,}$").expect("ellipsis regex"),
            Regex::new(
                r#"\{[^{}]*"action"\s*:\s*"[^"]+"[^{}]*"key"\s*:\s*"[^"]+"[^{}]*"value"\s*:\s*"[^"]+"[^{}]*\}"#,
            )
            .expect("object-extraction regex"),
        )
    })
}

/// Best-effort recovery of a truncated JSON response: trim the dangling
/// fragment, close open brackets with a few suffix strategies, and as a
/// last resort pull out whole action objects individually.
fn recover_truncated(text: &str) -> Option<serde_json::Value> {
    let (dangling, trailing_comma, ellipsis, object) = regexes();

    let mut attempt = text.trim_end().to_string();
    attempt = ellipsis.replace(&attempt, "").into_owned();
    attempt = dangling.replace(&attempt, "").into_owned();
    attempt = trailing_comma.replace(&attempt, "").into_owned();

    let open_braces =
        attempt.matches('{').count().saturating_sub(attempt.matches('}').count());
    let open_brackets =
        attempt.matches('[').count().saturating_sub(attempt.matches(']').count());
    let suffix = format!("{}{}", "]".repeat(open_brackets), "}".repeat(open_braces));

    let candidates = [
        format!("{attempt}{suffix}"),
        format!("{attempt}}}{suffix}"),
        format!("{attempt}\"{suffix}"),
        format!("{attempt}\"}}{suffix}"),
        format!(
            "{attempt}\"}}{}{}",
            "]".repeat(open_brackets),
            "}".repeat(open_braces.saturating_sub(1))
        ),
    ];
    for candidate in &candidates {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(candidate) {
            warn!("recovered truncated distiller JSON via bracket closing");
            return Some(v);
        }
    }

    let recovered: Vec<serde_json::Value> = object
        .find_iter(text)
        .filter_map(|m| serde_json::from_str(m.as_str()).ok())
        .collect();
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "recovered distiller actions via object extraction");
        return Some(serde_json::json!({ "actions": recovered }));
    }
    None
}

// ---------------------------------------------------------------------------
// World-fact filtering
// ---------------------------------------------------------------------------

/// Keys that almost always indicate world-facts rather than user facts.
const BLOCKED_KEY_FRAGMENTS: &[&str] = &[
    "wifi", "gps", "http", "https", "photosynthesis", "vaccine", "recipe", "chess", "history",
    "capital", "population", "weather", "temperature", "definition", "explanation", "how_to",
    "tutorial", "steps", "process", "mechanism", "science", "physics", "biology", "chemistry",
    "quantum", "solar_system", "airplane", "engine", "bridge", "magnet", "octopus", "animal",
    "planet", "ocean", "earthquake", "renaissance", "ancient", "civilization", "theory",
    "machine_learning", "algorithm", "cryptocurrency", "electric_car", "space_exploration",
    "rainforest", "bacteria", "virus_definition", "immune", "dna", "fun_fact",
    "interesting_fact", "trivia", "movie_recommendation", "book_recommendation",
    "game_recommendation", "song_recommendation", "cooking_tip", "exercise_tip", "sleep_tip",
    "topic_discussed", "question_asked", "conversation_topic", "user_interest_in", "interest_in",
    "curiosity_about", "asked_about", "discussed_topic", "mentioned_topic",
];

/// Values that look like definitions or explanations rather than user facts.
const EXPLANATION_SIGNALS: &[&str] = &[
    "is a ", "is an ", "is the ", "are the ", "was the ", "were the ", "works by ", "refers to ",
    "is defined as", "is when ", "involves ", "is the process", "can be described as",
    "is used to ", "is made of ", "consists of ", "was invented ", "was discovered ",
    "was founded ", "is located in ", "is known for ", "is famous for ", "originated in ",
    "dates back to ", "is caused by ", "occurs when ", "is measured in ", "is calculated by ",
];

/// Keys that suggest the subject is the user rather than the world, which
/// exempts a value from the explanation-signal check.
const USER_KEY_SIGNALS: &[&str] = &[
    "user_", "my_", "preferred_", "favorite_", "dietary_", "allergy", "name", "age", "location",
    "email", "phone", "address", "occupation", "job", "daughter", "son", "wife", "husband",
    "partner", "pet_", "dog_", "cat_",
];

const TOPIC_KEY_PREFIXES: &[&str] = &[
    "topic_", "discussed_", "asked_about_", "mentioned_", "conversation_about_", "info_about_",
    "knowledge_of_", "learned_about_",
];

const TOPIC_KEY_SUFFIXES: &[&str] = &["_topic", "_question", "_discussed"];

const GENERIC_VALUE_STARTS: &[&str] = &[
    "the user asked about ",
    "the user was curious about ",
    "the user wanted to know ",
    "the assistant explained ",
    "the assistant provided ",
    "the assistant suggested ",
    "they discussed ",
    "the conversation covered ",
];

/// Second line of defense after the prompt: drop extracted memories that
/// look like world-facts, definitions, or conversation meta-noise. `keep`
/// and `expire` pass through untouched — they reference memories that were
/// already validated when first stored.
fn filter_world_facts(delta: Vec<DistilledMemory>) -> Vec<DistilledMemory> {
    let before = delta.len();
    let filtered: Vec<DistilledMemory> = delta
        .into_iter()
        .filter(|dm| {
            if matches!(dm.action, MemoryAction::Keep | MemoryAction::Expire) {
                return true;
            }
            let key = dm.key.as_str();
            let value_lower = dm.value.to_lowercase();

            if BLOCKED_KEY_FRAGMENTS.iter().any(|b| key.contains(b)) {
                debug!(key, "filtered: blocked key fragment");
                return false;
            }
            if dm.value.chars().count() > MAX_DISTILLED_VALUE_LEN {
                debug!(key, "filtered: value too long to be a fact");
                return false;
            }
            if TOPIC_KEY_PREFIXES.iter().any(|p| key.starts_with(p))
                || TOPIC_KEY_SUFFIXES.iter().any(|s| key.ends_with(s))
            {
                debug!(key, "filtered: topic-discussed key");
                return false;
            }
            if GENERIC_VALUE_STARTS.iter().any(|g| value_lower.starts_with(g)) {
                debug!(key, "filtered: generic conversation summary");
                return false;
            }
            if EXPLANATION_SIGNALS.iter().any(|s| value_lower.contains(s)) {
                let first_word = value_lower.split_whitespace().next().unwrap_or("");
                let about_user = matches!(first_word, "user" | "i" | "they" | "he" | "she")
                    || USER_KEY_SIGNALS.iter().any(|u| key.starts_with(u));
                if !about_user {
                    debug!(key, "filtered: reads like a definition");
                    return false;
                }
            }
            true
        })
        .collect();
    if filtered.len() != before {
        debug!(before, after = filtered.len(), "world-fact filter dropped candidates");
    }
    filtered
}
