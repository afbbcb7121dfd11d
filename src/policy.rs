//! Newsgroup subscription rules for peer feeds
//!
//! A rule is either an exact group name or a glob (`*` wildcards), optionally
//! inverted with a leading `!`. A feed policy is an ordered set of rules; a
//! newsgroup is carried if any rule allows it.

use crate::error::{NntpdError, Result};
use regex::Regex;
use std::collections::BTreeMap;

/// A single compiled subscription rule
#[derive(Debug, Clone)]
pub struct PolicyRule {
    inverted: bool,
    matcher: RuleMatcher,
}

#[derive(Debug, Clone)]
enum RuleMatcher {
    Exact(String),
    Glob(Regex),
}

impl PolicyRule {
    /// Compile a rule string
    ///
    /// `*`, `!*`, and `!` are rejected: they would make the inversion
    /// meaningless or invert nothing.
    pub fn new(rule: &str) -> Result<Self> {
        if rule.starts_with('*') || rule == "!*" || rule == "!" {
            return Err(NntpdError::Config(format!("invalid rule: {}", rule)));
        }
        let inverted = rule.starts_with('!');
        let rule = if inverted { &rule[1..] } else { rule };
        let matcher = if rule.contains('*') {
            let pattern = format!("^{}$", rule.replace('.', "\\.").replace('*', ".*"));
            let re = Regex::new(&format!("(?i){}", pattern))
                .map_err(|e| NntpdError::Config(format!("invalid rule {}: {}", rule, e)))?;
            RuleMatcher::Glob(re)
        } else {
            RuleMatcher::Exact(rule.to_ascii_lowercase())
        };
        Ok(Self { inverted, matcher })
    }

    /// Check whether this rule allows a newsgroup
    pub fn allows_newsgroup(&self, newsgroup: &str) -> bool {
        let hit = match &self.matcher {
            RuleMatcher::Exact(name) => newsgroup.eq_ignore_ascii_case(name),
            RuleMatcher::Glob(re) => re.is_match(newsgroup),
        };
        if self.inverted {
            !hit
        } else {
            hit
        }
    }
}

/// Ordered rule set deciding which newsgroups a feed carries
#[derive(Debug, Clone, Default)]
pub struct FeedPolicy {
    rules: Vec<PolicyRule>,
}

impl FeedPolicy {
    /// Build a policy from rule strings
    pub fn new<I, S>(rule_strs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for rule in rule_strs {
            rules.push(PolicyRule::new(rule.as_ref())?);
        }
        Ok(Self { rules })
    }

    /// Build a policy from a configuration section
    ///
    /// Only keys whose value is the literal `"1"` become rules.
    pub fn from_config(section: &BTreeMap<String, String>) -> Result<Self> {
        Self::new(
            section
                .iter()
                .filter(|(_, v)| v.as_str() == "1")
                .map(|(k, _)| k.as_str()),
        )
    }

    /// True if any rule allows the newsgroup; an empty policy denies all
    pub fn allow_newsgroup(&self, newsgroup: &str) -> bool {
        self.rules.iter().any(|r| r.allows_newsgroup(newsgroup))
    }

    /// True if any group in the set is allowed
    pub fn allow_any<S: AsRef<str>>(&self, newsgroups: &[S]) -> bool {
        newsgroups.iter().any(|g| self.allow_newsgroup(g.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_rule_inverted() {
        let rule = PolicyRule::new("!overchan.lame").unwrap();
        assert!(rule.allows_newsgroup("overchan.awesome"));
        assert!(!rule.allows_newsgroup("overchan.lame"));
        assert!(rule.allows_newsgroup("overchan.lamecat"));
        assert!(rule.allows_newsgroup("alt.bin.hax"));
    }

    #[test]
    fn test_policy_rule_regular() {
        let rule = PolicyRule::new("overchan.lame").unwrap();
        assert!(!rule.allows_newsgroup("overchan.awesome"));
        assert!(rule.allows_newsgroup("overchan.lame"));
        assert!(!rule.allows_newsgroup("overchan.lamecat"));
        assert!(!rule.allows_newsgroup("alt.bin.hax"));
    }

    #[test]
    fn test_policy_rule_glob() {
        let rule = PolicyRule::new("overchan.*").unwrap();
        assert!(rule.allows_newsgroup("overchan.awesome"));
        assert!(rule.allows_newsgroup("overchan.lame"));
        assert!(rule.allows_newsgroup("overchan.lamecat"));
        assert!(!rule.allows_newsgroup("alt.bin.hax"));
    }

    #[test]
    fn test_policy_rule_inverted_glob() {
        let rule = PolicyRule::new("!overchan.*").unwrap();
        assert!(!rule.allows_newsgroup("overchan.awesome"));
        assert!(!rule.allows_newsgroup("overchan.lame"));
        assert!(!rule.allows_newsgroup("overchan.lamecat"));
        assert!(rule.allows_newsgroup("alt.bin.hax"));
    }

    #[test]
    fn test_policy_rule_case_insensitive() {
        let rule = PolicyRule::new("Overchan.Test").unwrap();
        assert!(rule.allows_newsgroup("overchan.test"));
        assert!(rule.allows_newsgroup("OVERCHAN.TEST"));

        let glob = PolicyRule::new("OVERCHAN.*").unwrap();
        assert!(glob.allows_newsgroup("overchan.test"));
    }

    #[test]
    fn test_policy_rule_glob_is_anchored() {
        let rule = PolicyRule::new("overchan.*").unwrap();
        assert!(!rule.allows_newsgroup("alt.overchan.test"));
    }

    #[test]
    fn test_policy_rule_invalid() {
        assert!(PolicyRule::new("*").is_err());
        assert!(PolicyRule::new("!*").is_err());
        assert!(PolicyRule::new("!").is_err());
        assert!(PolicyRule::new("*.overchan").is_err());
    }

    #[test]
    fn test_feed_policy_any_rule_wins() {
        let policy = FeedPolicy::new(["overchan.*", "ctl"]).unwrap();
        assert!(policy.allow_newsgroup("overchan.test"));
        assert!(policy.allow_newsgroup("ctl"));
        assert!(!policy.allow_newsgroup("alt.bin.hax"));
    }

    #[test]
    fn test_feed_policy_empty_denies_all() {
        let policy = FeedPolicy::default();
        assert!(policy.is_empty());
        assert!(!policy.allow_newsgroup("overchan.test"));
    }

    #[test]
    fn test_feed_policy_from_config_filters_values() {
        let mut section = BTreeMap::new();
        section.insert("overchan.*".to_string(), "1".to_string());
        section.insert("ano.paste".to_string(), "0".to_string());
        section.insert("ctl".to_string(), "1".to_string());
        let policy = FeedPolicy::from_config(&section).unwrap();
        assert!(policy.allow_newsgroup("overchan.test"));
        assert!(policy.allow_newsgroup("ctl"));
        assert!(!policy.allow_newsgroup("ano.paste"));
    }

    #[test]
    fn test_feed_policy_allow_any() {
        let policy = FeedPolicy::new(["overchan.*"]).unwrap();
        assert!(policy.allow_any(&["ctl", "overchan.test"]));
        assert!(!policy.allow_any(&["ctl", "ano.paste"]));
        assert!(!policy.allow_any::<&str>(&[]));
    }
}
