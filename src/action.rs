//! Decoding structured actions out of free-form reasoning output.
//!
//! Decoding is a separate step from dispatch: [`parse_actions`] only ever
//! returns well-typed [`Action`] values, and anything that does not decode is
//! an [`Fragment::Unrecognized`] that gets dropped. Malformed text never
//! reaches the tool gateway.

use serde::Deserialize;

/// An action a worker asked for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    EditFile {
        path: String,
        old: String,
        new: String,
    },
    VerifyCriterion {
        index: usize,
        #[serde(default)]
        evidence: Option<String>,
    },
    Complete {
        #[serde(default)]
        summary: Option<String>,
    },
    Blocked {
        reason: String,
    },
    Note {
        message: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::EditFile { .. } => "edit_file",
            Self::VerifyCriterion { .. } => "verify_criterion",
            Self::Complete { .. } => "complete",
            Self::Blocked { .. } => "blocked",
            Self::Note { .. } => "note",
        }
    }
}

/// One JSON-looking fragment of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Action(Action),
    Unrecognized(String),
}

#[derive(Deserialize)]
struct Batch {
    actions: Vec<serde_json::Value>,
}

/// Classify one fragment. A `{"actions": [...]}` wrapper yields one entry per
/// element.
pub fn decode(fragment: &str) -> Vec<Fragment> {
    if let Ok(action) = serde_json::from_str::<Action>(fragment) {
        return vec![Fragment::Action(action)];
    }
    if let Ok(batch) = serde_json::from_str::<Batch>(fragment) {
        return batch
            .actions
            .into_iter()
            .map(|value| match serde_json::from_value::<Action>(value.clone()) {
                Ok(action) => Fragment::Action(action),
                Err(_) => Fragment::Unrecognized(value.to_string()),
            })
            .collect();
    }
    vec![Fragment::Unrecognized(fragment.to_string())]
}

/// All actions in `text`, in order of appearance.
pub fn parse_actions(text: &str) -> Vec<Action> {
    scan(text)
        .into_iter()
        .flat_map(decode)
        .filter_map(|fragment| match fragment {
            Fragment::Action(action) => Some(action),
            Fragment::Unrecognized(raw) => {
                tracing::debug!("Ignoring unrecognized fragment: {}", preview(&raw));
                None
            }
        })
        .collect()
}

/// Top-level JSON object spans of `text`, in order. Each `{` is tried as the
/// start of an object; when one does not parse (a stray brace in prose, an
/// unterminated string) scanning resumes at the next `{` after it, so a bad
/// fragment never hides the ones that follow.
pub fn scan(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find('{') {
        let start = cursor + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(serde_json::Value::Object(_))) => {
                let end = start + stream.byte_offset();
                spans.push(&text[start..end]);
                cursor = end;
            }
            _ => cursor = start + 1,
        }
    }
    spans
}

fn preview(raw: &str) -> String {
    const MAX: usize = 80;
    match raw.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}
