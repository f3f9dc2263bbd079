/// Joins a base path and a path suffix with exactly one `/` between them. An empty suffix
/// leaves the base untouched, so a trailing slash on either side is preserved.
pub fn join_url_fragments(base: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return base.to_string();
    }

    match (base.ends_with('/'), suffix.starts_with('/')) {
        (true, true) => format!("{base}{}", &suffix[1..]),
        (false, false) => format!("{base}/{suffix}"),
        _ => format!("{base}{suffix}"),
    }
}
