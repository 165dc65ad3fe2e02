//! Run and correlation id generation.

use uuid::Uuid;

/// Generates a new run id.
///
/// Run ids are UUID v7 so that checkpoint listings sort by creation time.
#[must_use]
pub fn generate_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates a correlation id for one external task invocation.
#[must_use]
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_v7() {
        let id = Uuid::parse_str(&generate_run_id()).unwrap();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_run_ids_sort_by_creation() {
        let first = generate_run_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate_run_id();
        assert!(first < second);
    }

    #[test]
    fn test_correlation_ids_unique() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert_ne!(a, b);
        assert_eq!(Uuid::parse_str(&a).unwrap().get_version_num(), 4);
    }
}
