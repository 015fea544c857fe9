use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Get current Unix timestamp in seconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sanitize filename to remove invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Randomized base name the planner uses to name the zip archives of one request.
pub fn bundle_base_name(prefix: &str) -> String {
    let prefix = sanitize_filename(prefix).replace(' ', "_");
    let prefix = if prefix.is_empty() { "bundle" } else { &prefix };
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..12])
}

/// `round(100 * done / total)`, clamped to `[0, 100]`. An empty total counts as done.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let value = (done as f64 * 100.0 / total as f64).round();
    value.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp() {
        let ts = get_timestamp();
        assert!(ts > 1700000000); // Sanity check
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test/file.zip"), "test_file.zip");
        assert_eq!(sanitize_filename("normal-name.zip"), "normal-name.zip");
    }

    #[test]
    fn test_bundle_base_name_is_randomized() {
        let a = bundle_base_name("my cart:1");
        let b = bundle_base_name("my cart:1");
        assert!(a.starts_with("my_cart_1-"));
        assert_ne!(a, b);
        assert!(bundle_base_name("").starts_with("bundle-"));
    }

    #[test]
    fn test_percent_rounds_and_clamps() {
        assert_eq!(percent(0, 300), 0);
        assert_eq!(percent(100, 300), 33);
        assert_eq!(percent(200, 300), 67);
        assert_eq!(percent(900, 300), 100);
        assert_eq!(percent(0, 0), 100);
    }
}
