use std::fmt;

/// Identifier of a node in the timeout forest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutId(String);

impl TimeoutId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, unique id with the given prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TimeoutId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TimeoutId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
