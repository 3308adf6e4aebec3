use std::sync::LazyLock;

use regex::Regex;

static THINK_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<think>.*?</think>").expect("think pattern is a valid regex")
});

/// Removes every `<think>...</think>` block and trims what is left.
pub fn strip_reasoning(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    THINK_BLOCK.replace_all(raw, "").trim().to_owned()
}

/// Turns successive filtered snapshots of a stream into forward deltas.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    raw: String,
    sent: String,
}

impl DeltaTracker {
    /// Appends a raw fragment. Returns the delta to emit when the filtered
    /// text changed. If the new filtered text does not extend what was already
    /// sent, the whole filtered text is returned as the delta.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.raw.push_str(fragment);
        let filtered = strip_reasoning(&self.raw);
        if filtered == self.sent {
            return None;
        }

        let delta = match filtered.strip_prefix(self.sent.as_str()) {
            Some(rest) => rest.to_owned(),
            None => filtered.clone(),
        };
        self.sent = filtered;
        Some(delta)
    }

    /// Filtered text sent so far.
    pub fn text(&self) -> &str {
        &self.sent
    }

    pub fn into_text(self) -> String {
        self.sent
    }
}
