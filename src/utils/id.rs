use rand::Rng;

/// Generates an opaque 16-hex-char identifier from 64 random bits.
///
/// Used for per-upload file ids and conflict ids.
pub fn generate_id() -> String {
    let n: u64 = rand::rng().random();
    format!("{n:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(generate_id(), generate_id());
    }
}
