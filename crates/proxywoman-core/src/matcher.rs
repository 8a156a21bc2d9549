/// URL and method matching shared by every rule kind: `pattern` is either a
/// plain substring or, when `is_regex` is set, a full regex. A rule with an
/// invalid regex matches nothing.
pub fn url_matches(pattern: &str, is_regex: bool, url: &str) -> bool {
    if is_regex {
        match regex::Regex::new(pattern) {
            Ok(compiled) => compiled.is_match(url),
            Err(error) => {
                tracing::warn!(%pattern, %error, "invalid rule regex, treating as no match");
                false
            }
        }
    } else {
        url.contains(pattern)
    }
}

/// Empty or `*` matches any method.
pub fn method_matches(rule_method: &str, method: &str) -> bool {
    rule_method.is_empty() || rule_method == "*" || rule_method.eq_ignore_ascii_case(method)
}
