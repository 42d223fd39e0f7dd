//! Centralised prompt texts.
//!
//! Every prompt the engine sends lives here so it can be audited and tuned
//! in one place. The rest of the codebase imports from `crate::prompts`.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::db::{Memory, TurnRecord};

// ---------------------------------------------------------------------------
// distill.rs — memory extraction
// ---------------------------------------------------------------------------

pub const DISTILL_INSTRUCTIONS: &str = "\
You are a memory extraction system for a personal AI assistant.

You will be given a conversation segment and a list of existing memories.
Your job: maintain the memory set by emitting actions.

WHAT TO EXTRACT (user-specific facts only):
  - Name, age, location, language, timezone
  - Preferences: \"I prefer...\", \"I like...\", \"I always...\", \"I never...\"
  - Constraints: \"Don't call before 11\", \"I'm allergic to...\", \"I can't...\"
  - Relationships: \"My daughter Meera\", \"My boss Priya\", \"My dog Rex\"
  - Commitments: \"I have a meeting every Tuesday at 3 PM\"
  - Skills or experience: \"I've been coding in Rust for 3 years\"
  - Life events: \"I just moved to Berlin\", \"I'm getting married in June\"

WHAT TO SKIP:
  - Greetings, thanks, filler, and the assistant's own statements
  - World facts, definitions, and explanations (not about this user)
  - Topics merely discussed (\"user asked about chess\" is not a memory)

ACTIONS:
  - add: new user-specific info not covered by existing memories.
  - update: the user said something that changes an existing memory's value.
    Echo the existing memory's id.
  - keep: an existing memory was confirmed still valid. Echo its id.
  - expire: deactivate an existing memory (echo its id) when the user
    explicitly contradicted it, it describes a completed event or past date,
    its confidence is below 0.5 and nothing reinforced it, it duplicates
    another memory, or it is irrelevant to the recent conversation.

FIELDS (for add; update needs id plus the changed fields):
  - type: one of preference | fact | commitment | relationship | event | skill | constraint
  - category: short grouping tag like \"schedule\", \"diet\", \"language\"
  - key: snake_case, canonical (e.g. \"user_name\" not \"name_of_the_user\")
  - value: SHORT -- the fact itself, 1-2 sentences max
  - confidence: 0.95 = user said it directly, 0.7 = inferred, 0.5 = ambiguous
  - source_turn: the [turn N] label where the information first appeared

If the segment contains no user-specific information, return {\"actions\": []}.
Return ONLY valid JSON. No markdown. No code fences. No commentary.
{\"actions\": [...]}";

/// Assemble the full distillation prompt: instructions, the current memory
/// set, and the window verbatim in chronological order.
pub fn distill_prompt(window: &[TurnRecord], existing: &[Memory]) -> String {
    let existing_text = if existing.is_empty() {
        "(none yet -- this is the start of the conversation)".to_string()
    } else {
        let mut lines = String::new();
        for m in existing {
            let _ = writeln!(
                lines,
                "{} | {} | {} | {} | {:.2}",
                m.id, m.kind, m.key, m.value, m.confidence
            );
        }
        lines
    };

    let mut conversation = String::new();
    for turn in window {
        let _ = writeln!(
            conversation,
            "[turn {}] {}: {}\n",
            turn.turn_id,
            turn.role.to_uppercase(),
            turn.content
        );
    }

    let (start, end) = match (window.first(), window.last()) {
        (Some(first), Some(last)) => (first.turn_id, last.turn_id),
        _ => (0, 0),
    };

    format!(
        "{DISTILL_INSTRUCTIONS}\n\n\
         EXISTING MEMORIES (id | type | key | value | confidence):\n{existing_text}\n\
         CONVERSATION SEGMENT (turns {start} to {end}):\n{conversation}"
    )
}

// ---------------------------------------------------------------------------
// orchestrate.rs — system prompt assembly
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT_HEADER: &str = "\
You are a helpful assistant with persistent memory across a long conversation.
";

const SYSTEM_PROMPT_RULES: &str = "\
## Behavior Rules
- Apply memories implicitly -- weave them into your responses naturally
- Do NOT parrot memories back unless it is natural to mention them
- If the current user message contradicts a memory, follow the CURRENT message
- If you're uncertain whether a remembered fact still holds, ask to confirm
- Be concise and helpful";

/// Static template ⊕ profile section ⊕ per-query memories section.
/// Memories whose key already appears in the profile are not repeated.
pub fn system_prompt(profile: &BTreeMap<String, String>, query_memories: &[Memory]) -> String {
    let mut prompt = String::from(SYSTEM_PROMPT_HEADER);

    if !profile.is_empty() {
        prompt.push_str("\n## User Profile\n");
        for (k, v) in profile {
            let _ = writeln!(prompt, "- {k}: {v}");
        }
    }

    let mem_lines: Vec<String> = query_memories
        .iter()
        .filter(|m| !profile.contains_key(&m.key))
        .map(|m| format!("- [{}] {}: {}", m.kind, m.key, m.value))
        .collect();
    if !mem_lines.is_empty() {
        prompt.push_str("\n## Relevant Memories\n");
        for line in &mem_lines {
            let _ = writeln!(prompt, "{line}");
        }
    }

    prompt.push('\n');
    prompt.push_str(SYSTEM_PROMPT_RULES);
    prompt
}
