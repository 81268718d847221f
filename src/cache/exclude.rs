//! Rules for requests that must never touch a cache store.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use url::Url;

/// Prefix marking a rule as a regular expression instead of a substring.
const PATTERN_PREFIX: &str = "re:";

/// Endpoint excluded when no rules are configured.
pub const FEATURE_FLAGS_PATH: &str = "featureFlags.json";

#[derive(Debug, Clone)]
enum Rule {
  Substring(String),
  Pattern(Regex),
}

/// Excluded-URL predicate. A URL matching any rule bypasses the cache.
#[derive(Debug, Clone, Default)]
pub struct ExcludeRules {
  rules: Vec<Rule>,
}

impl ExcludeRules {
  /// Parse rules. Plain strings match anywhere in the URL; `re:` rules are
  /// regular expressions matched against the full URL.
  pub fn parse<I, S>(rules: I) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let rules = rules
      .into_iter()
      .map(|rule| {
        let rule = rule.as_ref();
        match rule.strip_prefix(PATTERN_PREFIX) {
          Some(pattern) => Regex::new(pattern)
            .map(Rule::Pattern)
            .map_err(|e| eyre!("Invalid exclude pattern '{}': {}", pattern, e)),
          None if rule.is_empty() => Err(eyre!("Empty exclude rule")),
          None => Ok(Rule::Substring(rule.to_string())),
        }
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self { rules })
  }

  pub fn matches(&self, url: &Url) -> bool {
    let url = url.as_str();
    self.rules.iter().any(|rule| match rule {
      Rule::Substring(s) => url.contains(s.as_str()),
      Rule::Pattern(re) => re.is_match(url),
    })
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_substring_rule() {
    let rules = ExcludeRules::parse([FEATURE_FLAGS_PATH]).unwrap();
    assert!(rules.matches(&url("https://food.example/featureFlags.json")));
    assert!(rules.matches(&url("https://food.example/featureFlags.json?t=1")));
    assert!(!rules.matches(&url("https://food.example/data.json")));
  }

  #[test]
  fn test_pattern_rule() {
    let rules = ExcludeRules::parse(["re:/api/v\\d+/flags$"]).unwrap();
    assert!(rules.matches(&url("https://food.example/api/v2/flags")));
    assert!(!rules.matches(&url("https://food.example/api/v2/flags/old")));
  }

  #[test]
  fn test_invalid_rules() {
    assert!(ExcludeRules::parse(["re:("]).is_err());
    assert!(ExcludeRules::parse([""]).is_err());
  }

  #[test]
  fn test_no_rules_match_nothing() {
    let rules = ExcludeRules::parse(Vec::<String>::new()).unwrap();
    assert!(rules.is_empty());
    assert!(!rules.matches(&url("https://food.example/featureFlags.json")));
  }
}
