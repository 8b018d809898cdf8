// ID Provider Port (replica identity and lock tokens)

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    /// Generate a new unique identifier
    fn generate_id(&self) -> String;
}

/// UUID v4 provider (production)
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Replica identity written into `run_by`: `<host>-<uuid prefix>`.
pub fn replica_id(host: &str, ids: &dyn IdProvider) -> String {
    let id = ids.generate_id();
    let suffix: String = id.chars().filter(|c| *c != '-').take(8).collect();
    if host.is_empty() {
        suffix
    } else {
        format!("{host}-{suffix}")
    }
}
