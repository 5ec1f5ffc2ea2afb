use std::fmt;
use uuid::Uuid;

/// Unique correlation identifier used to match RPC requests and responses.
///
/// Correlation IDs travel as transport metadata (the AMQP `correlation_id`
/// property), never inside the message body.
///
/// # Format
///
/// Standard UUID v4 format: `550e8400-e29b-41d4-a9b6-446655440000`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        // ---
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_unique() {
        // ---
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_format() {
        // ---
        let id = CorrelationId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 36); // Standard UUID format
        assert_eq!(s, id.as_str());
    }

    #[test]
    fn test_foreign_id_preserved() {
        // ---
        // Ids from other implementations are opaque and must round-trip as-is.
        let id = CorrelationId::from("req-42");
        assert_eq!(id.as_str(), "req-42");
    }
}
