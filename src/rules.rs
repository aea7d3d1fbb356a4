use std::net::IpAddr;

use regex::{Regex, RegexBuilder};

use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RewriteAction {
    /// Disabled entry, for example `r:` with no value.
    Skip,
    Proxy(String),
    Resolver(String),
    InterfaceIp(IpAddr),
    Dns(String),
    UrlSubstitution(String),
}

impl RewriteAction {
    fn parse(row: usize, token: &str) -> Result<Self, Error> {
        if token.is_empty() {
            return Err(Error::InvalidRewriteRule {
                row,
                message: "empty rewrite entry".to_owned(),
            });
        }

        if let Some(value) = token.strip_prefix("p:") {
            return Ok(non_empty(value).map_or(Self::Skip, |value| Self::Proxy(value.to_owned())));
        }
        if let Some(value) = token.strip_prefix("r:") {
            return Ok(non_empty(value).map_or(Self::Skip, |value| Self::Resolver(value.to_owned())));
        }
        if let Some(value) = token.strip_prefix("i:") {
            let Some(value) = non_empty(value) else {
                return Ok(Self::Skip);
            };
            let ip = value.parse().map_err(|_| Error::InvalidRewriteRule {
                row,
                message: format!("interface `{value}` is not an ip address"),
            })?;
            return Ok(Self::InterfaceIp(ip));
        }
        if token.starts_with(|first: char| first.is_ascii_digit()) {
            return Ok(Self::Dns(token.to_owned()));
        }
        Ok(Self::UrlSubstitution(token.to_owned()))
    }

    const fn is_dns(&self) -> bool {
        matches!(self, Self::Dns(_))
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

#[derive(Clone, Debug)]
pub struct RewriteRule {
    glob: String,
    pattern: Regex,
    actions: Vec<RewriteAction>,
}

impl RewriteRule {
    fn parse<S: AsRef<str>>(row_index: usize, row: &[S]) -> Result<Self, Error> {
        let Some((glob, tokens)) = row.split_last() else {
            return Err(Error::InvalidRewriteRule {
                row: row_index,
                message: "rule row is empty".to_owned(),
            });
        };
        let glob = glob.as_ref().trim();
        if glob.is_empty() {
            return Err(Error::InvalidRewriteRule {
                row: row_index,
                message: "rule pattern is empty".to_owned(),
            });
        }

        let pattern = compile_glob(glob).map_err(|source| Error::InvalidRewriteRule {
            row: row_index,
            message: format!("pattern `{glob}` does not compile: {source}"),
        })?;
        let mut actions = tokens
            .iter()
            .map(|token| RewriteAction::parse(row_index, token.as_ref().trim()))
            .collect::<Result<Vec<_>, _>>()?;
        // stable, so the relative order of everything else is kept
        actions.sort_by_key(RewriteAction::is_dns);

        Ok(Self {
            glob: glob.to_owned(),
            pattern,
            actions,
        })
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn actions(&self) -> &[RewriteAction] {
        &self.actions
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }
}

pub(crate) fn compile_glob(glob: &str) -> Result<Regex, regex::Error> {
    let pattern = regex::escape(glob).replace(r"\*", ".*");
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

/// Ordered rewrite rules; the first rule matching a URL wins.
#[derive(Clone, Debug, Default)]
pub struct RewriteRuleSet {
    rules: Vec<RewriteRule>,
}

impl RewriteRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse<R, S>(rows: R) -> Result<Self, Error>
    where
        R: IntoIterator,
        R::Item: AsRef<[S]>,
        S: AsRef<str>,
    {
        let mut rule_set = Self::new();
        rule_set.set_rules(rows)?;
        Ok(rule_set)
    }

    /// Replaces every rule. On error the previous rules are left untouched.
    pub fn set_rules<R, S>(&mut self, rows: R) -> Result<(), Error>
    where
        R: IntoIterator,
        R::Item: AsRef<[S]>,
        S: AsRef<str>,
    {
        let rules = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| RewriteRule::parse(index, row.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.rules = rules;
        Ok(())
    }

    pub fn matching(&self, url: &str) -> Option<&RewriteRule> {
        self.rules.iter().find(|rule| rule.matches(url))
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
