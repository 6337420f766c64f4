/// Reduce a user-supplied name to `[A-Za-z0-9_-]`.
///
/// The result is safe to use as a single path component. Returns `None`
/// when nothing is left.
pub fn sanitize_name(name: &str) -> Option<String> {
    let clean: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!clean.is_empty()).then_some(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_allowed_characters() {
        assert_eq!(sanitize_name("my_script-2").as_deref(), Some("my_script-2"));
    }

    #[test]
    fn strips_path_traversal() {
        assert_eq!(sanitize_name("../../evil").as_deref(), Some("evil"));
        assert_eq!(sanitize_name("/etc/passwd").as_deref(), Some("etcpasswd"));
        assert_eq!(sanitize_name("a\\b").as_deref(), Some("ab"));
    }

    #[test]
    fn strips_spaces_and_dots() {
        assert_eq!(sanitize_name("hello world.rhai").as_deref(), Some("helloworldrhai"));
    }

    #[test]
    fn non_ascii_is_dropped() {
        assert_eq!(sanitize_name("café").as_deref(), Some("caf"));
        assert_eq!(sanitize_name("日本"), None);
    }

    #[test]
    fn empty_result_is_rejected() {
        assert_eq!(sanitize_name(""), None);
        assert_eq!(sanitize_name("../.."), None);
        assert_eq!(sanitize_name("   "), None);
    }
}
