//! Model name validation and typo correction.
//!
//! The resolved name ends up on a real command line, so anything outside
//! `[A-Za-z0-9._-]` is rejected before recognition is even attempted.
//! Corrections are only ever offered as suggestions, never applied.

/// Models the agent accepts, in suggestion priority order.
pub const SUPPORTED_MODELS: &[&str] = &[
    "auto",
    "composer-1",
    "sonnet-4.5",
    "sonnet-4.5-thinking",
    "sonnet-4",
    "sonnet-4-thinking",
    "opus-4.5",
    "opus-4.1",
    "gpt-5",
    "gpt-5-codex",
    "gemini-3-pro",
    "grok",
];

/// Minimum character-overlap score a fuzzy suggestion must exceed.
const SIMILARITY_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Contains characters that are not allowed on the command line.
    Invalid { value: String },
    /// Not a supported model. `suggestion` is the closest correction, if any.
    Unknown {
        value: String,
        suggestion: Option<String>,
    },
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Invalid { value } => write!(
                f,
                "invalid model name {value:?}: only letters, digits, '.', '_' and '-' are allowed"
            ),
            ModelError::Unknown {
                value,
                suggestion: Some(s),
            } => write!(f, "unknown model {value:?}. Did you mean {s:?}?"),
            ModelError::Unknown {
                value,
                suggestion: None,
            } => write!(
                f,
                "unknown model {value:?}. Supported models: {}",
                SUPPORTED_MODELS.join(", ")
            ),
        }
    }
}

impl std::error::Error for ModelError {}

/// Validate and canonicalize a user-supplied model name.
pub fn resolve(input: &str) -> Result<&'static str, ModelError> {
    if !is_safe(input) {
        return Err(ModelError::Invalid {
            value: input.to_string(),
        });
    }

    if let Some(model) = SUPPORTED_MODELS
        .iter()
        .copied()
        .find(|m| m.eq_ignore_ascii_case(input))
    {
        return Ok(model);
    }

    let suggestion = suggest(input).map(str::to_string);
    tracing::debug!(input, ?suggestion, "model not recognized");
    Err(ModelError::Unknown {
        value: input.to_string(),
        suggestion,
    })
}

fn is_safe(input: &str) -> bool {
    !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Closest supported model for a misspelled name. First strategy to hit wins.
fn suggest(input: &str) -> Option<&'static str> {
    let lowered = input.to_ascii_lowercase();

    let stripped = strip_separators(&lowered);
    if let Some(m) = SUPPORTED_MODELS
        .iter()
        .copied()
        .find(|m| strip_separators(m) == stripped)
    {
        return Some(m);
    }

    let hyphenated = lowered.replace('_', "-");
    if let Some(m) = SUPPORTED_MODELS.iter().copied().find(|m| *m == hyphenated) {
        return Some(m);
    }

    let mut best: Option<(&'static str, f64)> = None;
    for &model in SUPPORTED_MODELS {
        let score = similarity(&lowered, model);
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((model, score));
        }
    }
    best.filter(|(_, score)| *score > SIMILARITY_THRESHOLD)
        .map(|(m, _)| m)
}

fn strip_separators(s: &str) -> String {
    s.chars().filter(|c| !matches!(c, '-' | '_')).collect()
}

/// Fraction of the shorter string's characters that occur anywhere in the
/// longer one, divided by the longer string's length. Case-insensitive.
fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if longer.is_empty() {
        return 0.0;
    }
    let hits = shorter.chars().filter(|c| longer.contains(*c)).count();
    hits as f64 / longer.chars().count() as f64
}
