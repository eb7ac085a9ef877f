use serde::Deserialize;
use tracing::info;

use crate::{
    address_domain,
    alias::{AliasDirectory, AliasRecord, LookupFuture},
};

/// The type of match for a forward mapping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Matches an exact address (e.g. "info@example.com").
    ExactAddress,
    /// Matches every mailbox of a domain (e.g. "@example.com").
    Domain,
    /// Matches a mailbox name on any domain (e.g. "info").
    LocalPart,
}

impl MatchType {
    /// Determines the match type from the way a mapping key is written.
    pub fn of(pattern: &str) -> Self {
        if pattern.starts_with('@') {
            MatchType::Domain
        } else if pattern.contains('@') {
            MatchType::ExactAddress
        } else {
            MatchType::LocalPart
        }
    }

    fn specificity(self) -> u8 {
        match self {
            MatchType::ExactAddress => 0,
            MatchType::Domain => 1,
            MatchType::LocalPart => 2,
        }
    }
}

/// Forward mapping entry as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardRule {
    /// Alias pattern, an address, `@domain` or a bare mailbox name.
    pub alias: String,

    /// Mailbox the alias forwards to.
    pub target: String,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    match_type: MatchType,
    pattern: String,
    target: String,
}

impl CompiledRule {
    fn matches(&self, address: &str) -> bool {
        match self.match_type {
            MatchType::ExactAddress => address.eq_ignore_ascii_case(&self.pattern),
            MatchType::Domain => address_domain(address)
                .map(|domain| domain.eq_ignore_ascii_case(&self.pattern[1..]))
                .unwrap_or(false),
            MatchType::LocalPart => address
                .rsplit_once('@')
                .map(|(local, _)| local.eq_ignore_ascii_case(&self.pattern))
                .unwrap_or(false),
        }
    }
}

/// Alias directory backed by a fixed forward mapping.
///
/// Rules are evaluated in specificity order: exact address, then domain,
/// then mailbox name. Mapped targets carry no reputation counters, so they
/// are never suppressed.
#[derive(Debug, Clone)]
pub struct StaticAliasDirectory {
    rules: Vec<CompiledRule>,
}

impl StaticAliasDirectory {
    /// Creates a new [`StaticAliasDirectory`], sorting the rules by specificity.
    pub fn new(rules: &[ForwardRule]) -> Self {
        let mut rules: Vec<CompiledRule> = rules
            .iter()
            .map(|rule| CompiledRule {
                match_type: MatchType::of(&rule.alias),
                pattern: rule.alias.to_ascii_lowercase(),
                target: rule.target.clone(),
            })
            .collect();
        rules.sort_by_key(|rule| rule.match_type.specificity());
        info!(rules = rules.len(), "Static alias directory initialized");
        Self { rules }
    }

    /// Resolves the target mailbox for an address, if any rule matches.
    pub fn resolve(&self, address: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(address))
            .map(|rule| rule.target.as_str())
    }
}

impl AliasDirectory for StaticAliasDirectory {
    fn lookup<'a>(&'a self, address: &'a str) -> LookupFuture<'a> {
        Box::pin(async move { Ok(self.resolve(address).map(AliasRecord::new)) })
    }

    fn name(&self) -> &str {
        "static"
    }
}
