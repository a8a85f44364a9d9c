//! String template rendering utilities.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap());

/// Keys referenced by `{{key}}` placeholders, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for caps in PLACEHOLDER_PATTERN.captures_iter(template) {
        let key = caps[1].to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Render a template, failing with the list of keys that have no value.
///
/// Substitution is single-pass: placeholder-like text inside a value is
/// copied through untouched.
pub fn render_strict(
    template: &str,
    variables: &HashMap<String, String>,
) -> std::result::Result<String, Vec<String>> {
    let missing: Vec<String> = placeholders(template)
        .into_iter()
        .filter(|key| !variables.contains_key(key))
        .collect();

    if !missing.is_empty() {
        return Err(missing);
    }

    let rendered = PLACEHOLDER_PATTERN.replace_all(template, |caps: &regex::Captures| {
        variables
            .get(&caps[1])
            .cloned()
            .unwrap_or_default()
    });

    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_deduplicated_in_order() {
        assert_eq!(placeholders("{{b}} {{a}} {{b}}"), vec!["b", "a"]);
    }

    #[test]
    fn render_strict_reports_every_missing_key() {
        let err = render_strict("{{a}} {{b}} {{c}}", &vars(&[("b", "1")])).unwrap_err();
        assert_eq!(err, vec!["a", "c"]);
    }

    #[test]
    fn render_strict_does_not_expand_values() {
        let out = render_strict("{{a}}", &vars(&[("a", "{{b}}"), ("b", "no")])).unwrap();
        assert_eq!(out, "{{b}}");
    }
}
