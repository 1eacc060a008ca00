use serde::{Deserialize, Serialize};

/// Machine-parseable task failure.
///
/// All fatal pipeline errors serialize as `{"stage": ..., "message": ...}`
/// JSON so failure reasons can be consumed programmatically instead of as
/// free-text stack traces. `Display` renders the JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
  pub stage: String,
  pub message: String,
}

impl TaskFailure {
  pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      stage: stage.into(),
      message: message.into(),
    }
  }

  /// Render as a JSON object string.
  pub fn to_json(&self) -> String {
    serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"stage":"{}","message":"?"}}"#, self.stage))
  }

  /// Parse a failure back out of its JSON form.
  pub fn from_json(raw: &str) -> Option<Self> {
    serde_json::from_str(raw).ok()
  }
}

impl std::fmt::Display for TaskFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.to_json())
  }
}

impl std::error::Error for TaskFailure {}
