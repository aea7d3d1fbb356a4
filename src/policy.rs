use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Error;
use crate::identity::{RouteOverride, RouteTarget};
use crate::proxy::ProxyConfig;
use crate::resolver::{Resolver, resolver_for};
use crate::rules::{RewriteAction, RewriteRuleSet};
use crate::tls::TlsProfile;
use crate::util::{lock_unpoisoned, redact_uri_for_logs, url_host};

/// Connect `host` to a literal `target` instead of its DNS answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRewrite {
    pub host: String,
    pub target: String,
}

/// Resolve `host` through `resolver` instead of the system resolver.
#[derive(Clone, Debug)]
pub struct ResolverOverride {
    pub host: String,
    pub resolver: Arc<dyn Resolver>,
}

impl PartialEq for ResolverOverride {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.resolver.nameservers() == other.resolver.nameservers()
    }
}

/// Everything a rewrite rule decided for one URL.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionPolicy {
    pub original_url: String,
    pub effective_url: String,
    pub proxy: Option<ProxyConfig>,
    pub interface_ip: Option<IpAddr>,
    pub dns_rewrite: Option<DnsRewrite>,
    pub resolver_override: Option<ResolverOverride>,
    pub tls: TlsProfile,
}

impl SessionPolicy {
    /// Policy of a URL no rule matches.
    pub fn defaults(url: &str, tls: TlsProfile) -> Self {
        Self {
            original_url: url.to_owned(),
            effective_url: url.to_owned(),
            proxy: None,
            interface_ip: None,
            dns_rewrite: None,
            resolver_override: None,
            tls,
        }
    }

    pub fn url_changed(&self) -> bool {
        self.original_url != self.effective_url
    }

    /// Address override for connections to `host`, if one applies.
    ///
    /// A literal DNS rewrite wins over a resolver override.
    pub(crate) fn route_for(&self, host: &str) -> Option<RouteOverride> {
        if let Some(rewrite) = &self.dns_rewrite
            && rewrite.host.eq_ignore_ascii_case(host)
        {
            return Some(RouteOverride::new(
                host,
                RouteTarget::Literal(rewrite.target.clone()),
            ));
        }
        if let Some(resolver) = &self.resolver_override
            && resolver.host.eq_ignore_ascii_case(host)
        {
            return Some(RouteOverride::new(
                host,
                RouteTarget::Resolver(Arc::clone(&resolver.resolver)),
            ));
        }
        None
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    rules: RewriteRuleSet,
    memo: HashMap<String, Arc<SessionPolicy>>,
}

/// Turns request URLs into [`SessionPolicy`] values, evaluating the rules at
/// most once per distinct URL.
#[derive(Debug)]
pub struct PolicyResolver {
    tls: TlsProfile,
    state: Mutex<PolicyState>,
    evaluations: AtomicUsize,
}

impl PolicyResolver {
    pub fn new(rules: RewriteRuleSet, tls: TlsProfile) -> Self {
        Self {
            tls,
            state: Mutex::new(PolicyState {
                rules,
                memo: HashMap::new(),
            }),
            evaluations: AtomicUsize::new(0),
        }
    }

    pub fn resolve(&self, url: &str) -> Result<Arc<SessionPolicy>, Error> {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(policy) = state.memo.get(url) {
            return Ok(Arc::clone(policy));
        }

        let policy = Arc::new(self.evaluate(&state.rules, url)?);
        state.memo.insert(url.to_owned(), Arc::clone(&policy));
        Ok(policy)
    }

    fn evaluate(&self, rules: &RewriteRuleSet, url: &str) -> Result<SessionPolicy, Error> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let mut policy = SessionPolicy::defaults(url, self.tls.clone());
        let Some(rule) = rules.matching(url) else {
            return Ok(policy);
        };
        debug!(url = %redact_uri_for_logs(url), rule = rule.glob(), "rewrite rule matched");

        for action in rule.actions() {
            match action {
                RewriteAction::Skip => {}
                RewriteAction::Proxy(proxy) => {
                    policy.proxy = Some(ProxyConfig::parse(proxy)?);
                }
                RewriteAction::InterfaceIp(ip) => {
                    policy.interface_ip = Some(*ip);
                }
                RewriteAction::Resolver(nameserver) => {
                    // the host is taken from the URL as rewritten so far
                    if let Some(host) = url_host(&policy.effective_url) {
                        policy.resolver_override = Some(ResolverOverride {
                            host,
                            resolver: resolver_for(nameserver)?,
                        });
                    }
                }
                RewriteAction::UrlSubstitution(replacement) => {
                    policy.effective_url = rule
                        .pattern()
                        .replacen(&policy.effective_url, 1, regex::NoExpand(replacement))
                        .into_owned();
                }
                RewriteAction::Dns(target) => {
                    if let Some(host) = url_host(&policy.effective_url) {
                        policy.dns_rewrite = Some(DnsRewrite {
                            host,
                            target: target.clone(),
                        });
                    }
                }
            }
        }

        Ok(policy)
    }

    /// Replaces the rules and forgets every memoized policy.
    pub fn set_rules(&self, rules: RewriteRuleSet) {
        let mut state = lock_unpoisoned(&self.state);
        state.rules = rules;
        state.memo.clear();
    }

    pub fn rules(&self) -> RewriteRuleSet {
        lock_unpoisoned(&self.state).rules.clone()
    }

    pub fn tls(&self) -> &TlsProfile {
        &self.tls
    }

    /// Number of times rules were actually evaluated.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.state).memo.clear();
    }
}
