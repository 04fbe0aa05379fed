//! Trigger matching and evaluation.

use kiln_core::event::TriggerEvent;
use kiln_core::pipeline::TriggerRule;

/// Matcher for determining if a pipeline should run for an event.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if any rule matches the event.
    pub fn matches(&self, event: &TriggerEvent, rules: &[TriggerRule]) -> bool {
        self.matching_rule(event, rules).is_some()
    }

    /// The first rule that matches the event, if any.
    pub fn matching_rule<'a>(
        &self,
        event: &TriggerEvent,
        rules: &'a [TriggerRule],
    ) -> Option<&'a TriggerRule> {
        rules.iter().find(|rule| self.rule_matches(rule, event))
    }

    fn rule_matches(&self, rule: &TriggerRule, event: &TriggerEvent) -> bool {
        // Unrecognised event kinds have no kind and never match.
        if event.kind() != Some(rule.event) {
            return false;
        }
        match event.filter_branch() {
            Some(branch) => {
                self.branch_matches(rule.branches.as_deref(), branch)
                    && !self.branch_ignored(&rule.branches_ignore, branch)
            }
            None => false,
        }
    }

    fn branch_matches(&self, patterns: Option<&[String]>, branch: &str) -> bool {
        match patterns {
            None => true,
            Some(patterns) => patterns.iter().any(|p| glob_match(p, branch)),
        }
    }

    fn branch_ignored(&self, patterns: &[String], branch: &str) -> bool {
        patterns.iter().any(|p| glob_match(p, branch))
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Branch glob: `*` matches within a path segment, `**` across segments and
/// `?` a single non-`/` character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => {
            if let Some(('*', rest)) = rest.split_first() {
                return (0..=text.len()).any(|i| match_from(rest, &text[i..]));
            }
            for i in 0..=text.len() {
                if match_from(rest, &text[i..]) {
                    return true;
                }
                if i < text.len() && text[i] == '/' {
                    return false;
                }
            }
            false
        }
        Some(('?', rest)) => {
            matches!(text.split_first(), Some((c, tail)) if *c != '/' && match_from(rest, tail))
        }
        Some((expected, rest)) => {
            matches!(text.split_first(), Some((c, tail)) if c == expected && match_from(rest, tail))
        }
    }
}
