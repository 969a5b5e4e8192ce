use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_GIT_DIRTY"),
    )
});

fn format_version(image: &str, sha: Option<&str>, dirty: Option<&str>) -> String {
    let sha = sha.map(|s| &s[..s.len().min(8)]).unwrap_or("unknown");
    let dirty = if dirty == Some("true") { "-dirty" } else { "" };
    format!("{image}-{sha}{dirty}")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test_log::test]
    fn version_without_git_metadata() {
        assert_eq!(format_version("latest", None, None), "latest-unknown");
    }

    #[test_log::test]
    fn version_truncates_sha_and_marks_dirty() {
        assert_eq!(
            format_version("v1.2.0", Some("0123456789abcdef"), Some("true")),
            "v1.2.0-01234567-dirty"
        );
        assert_eq!(
            format_version("v1.2.0", Some("abc"), Some("false")),
            "v1.2.0-abc"
        );
    }
}
