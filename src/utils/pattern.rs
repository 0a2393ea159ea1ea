use regex::Regex;

/// Glob where `*` matches any substring (including `/` and the empty string); every other
/// character is literal.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Option<Regex>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Self {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        // Fragments are escaped, so only the compiled-size limit can reject a pattern;
        // such patterns degrade to exact comparison.
        let regex = Regex::new(&format!("^(?s:{})$", body)).ok();
        Self {
            raw: pattern.to_string(),
            regex,
        }
    }

    pub fn is_match(&self, key: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(key),
            None => self.raw == key,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::KeyPattern;

    #[test]
    fn star_matches_any_substring() {
        let pattern = KeyPattern::new("cms:GET:/content/*");
        assert!(pattern.is_match("cms:GET:/content/site/en.json:abc"));
        assert!(pattern.is_match("cms:GET:/content/"));
        assert!(!pattern.is_match("cms:GET:/conf/site"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = KeyPattern::new("a.b?c*");
        assert!(pattern.is_match("a.b?c-anything"));
        assert!(!pattern.is_match("axb?c"));
        assert!(!pattern.is_match("a.bc"));
    }

    #[test]
    fn pattern_without_star_is_exact() {
        let pattern = KeyPattern::new("exact");
        assert!(pattern.is_match("exact"));
        assert!(!pattern.is_match("exactly"));
    }

    #[test]
    fn multiple_stars() {
        let pattern = KeyPattern::new("*:/content/dam/*:*");
        assert!(pattern.is_match("cms:GET:/content/dam/a.png:123"));
        assert!(!pattern.is_match("cms:GET:/content/site:123"));
    }
}
