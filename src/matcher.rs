//! Compiled bypass/proxy matcher.
//!
//! Hostname patterns of each side are compiled into one [`RegexSet`] and the
//! subnets into sorted, non-overlapping tables per address family. The result
//! is immutable and can be queried concurrently from connection threads.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use regex::{RegexBuilder, RegexSet, RegexSetBuilder};
use tracing::debug;

use crate::acl::Acl;
use crate::error::{AclError, Result};

/// Default regex memory budget per hostname set
pub const DEFAULT_ACL_MEMORY_BUDGET: usize = 8 * 1024 * 1024;

/// Regex memory budget for memory-constrained devices
pub const LOW_MEMORY_ACL_BUDGET: usize = 2 * 1024 * 1024;

/// Immutable matcher built from a finalized [`Acl`].
pub struct CompiledMatcher {
    bypass: bool,
    bypass_hosts: RegexSet,
    proxy_hosts: RegexSet,
    subnets_v4: Box<[Ipv4Net]>,
    subnets_v6: Box<[Ipv6Net]>,
    cache: Option<Mutex<LruCache<String, Option<bool>>>>,
}

impl std::fmt::Debug for CompiledMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledMatcher")
            .field("bypass", &self.bypass)
            .field("bypass_hosts", &self.bypass_hosts.len())
            .field("proxy_hosts", &self.proxy_hosts.len())
            .field("subnets_v4", &self.subnets_v4.len())
            .field("subnets_v6", &self.subnets_v6.len())
            .finish()
    }
}

impl CompiledMatcher {
    /// Compile an ACL. Import URLs are ignored; flatten first.
    pub fn compile(acl: &Acl, memory_budget: usize) -> Result<Self> {
        let bypass_hosts = compile_set("bypass", &acl.bypass_hostnames, memory_budget)?;
        let proxy_hosts = compile_set("proxy", &acl.proxy_hostnames, memory_budget)?;

        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for subnet in &acl.subnets {
            match subnet.to_immutable() {
                IpNet::V4(net) => v4.push(net),
                IpNet::V6(net) => v6.push(net),
            }
        }

        Ok(Self {
            bypass: acl.bypass,
            bypass_hosts,
            proxy_hosts,
            subnets_v4: collapse(v4, |a, b| a.contains(b)),
            subnets_v6: collapse(v6, |a, b| a.contains(b)),
            cache: None,
        })
    }

    /// Compile the rule file at `path`; a missing file compiles to an empty matcher.
    pub fn from_file(path: impl AsRef<Path>, memory_budget: usize) -> Result<Self> {
        Self::compile(&Acl::from_file(path)?, memory_budget)
    }

    /// Enable an LRU cache for hostname lookups (0 disables it)
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache = NonZeroUsize::new(size).map(|size| Mutex::new(LruCache::new(size)));
        self
    }

    /// Global fallback mode for hosts that match no pattern
    pub fn default_bypass(&self) -> bool {
        self.bypass
    }

    pub fn ipv4_table(&self) -> &[Ipv4Net] {
        &self.subnets_v4
    }

    pub fn ipv6_table(&self) -> &[Ipv6Net] {
        &self.subnets_v6
    }

    /// Whether an IPv4 destination should bypass the proxy.
    pub fn should_bypass_ipv4(&self, address: &[u8; 4]) -> bool {
        let ip = Ipv4Addr::from(*address);
        let idx = self.subnets_v4.partition_point(|n| n.network() <= ip);
        let found = idx > 0 && self.subnets_v4[idx - 1].contains(&ip);
        self.bypass ^ found
    }

    /// Whether an IPv6 destination should bypass the proxy.
    pub fn should_bypass_ipv6(&self, address: &[u8; 16]) -> bool {
        let ip = Ipv6Addr::from(*address);
        let idx = self.subnets_v6.partition_point(|n| n.network() <= ip);
        let found = idx > 0 && self.subnets_v6[idx - 1].contains(&ip);
        self.bypass ^ found
    }

    pub fn should_bypass_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.should_bypass_ipv4(&v4.octets()),
            IpAddr::V6(v6) => self.should_bypass_ipv6(&v6.octets()),
        }
    }

    /// Classify a hostname.
    ///
    /// `Some(true)` when a bypass pattern matches, `Some(false)` when a proxy
    /// pattern matches, `None` when the caller should fall back to
    /// [`CompiledMatcher::default_bypass`]. Bypass patterns are checked first.
    pub fn should_bypass_host(&self, host: &str) -> Option<bool> {
        let Some(cache) = &self.cache else {
            return self.match_host(host);
        };

        let mut cache = cache.lock();
        if let Some(cached) = cache.get(host) {
            return *cached;
        }
        // Matching is CPU-only, so computing under the lock is fine.
        let result = self.match_host(host);
        cache.put(host.to_string(), result);
        result
    }

    /// Full decision for a destination that may be an IP literal or a hostname.
    pub fn should_bypass(&self, host: &str) -> bool {
        match host.parse::<IpAddr>() {
            Ok(ip) => self.should_bypass_ip(ip),
            Err(_) => self.should_bypass_host(host).unwrap_or(self.bypass),
        }
    }

    fn match_host(&self, host: &str) -> Option<bool> {
        if self.bypass_hosts.is_match(host) {
            Some(true)
        } else if self.proxy_hosts.is_match(host) {
            Some(false)
        } else {
            None
        }
    }
}

/// Holder of the matcher in use by live connections.
///
/// Installing a new matcher swaps a single reference; the previous matcher
/// is freed once the last in-flight query drops its `Arc`.
#[derive(Debug, Default)]
pub struct MatcherSlot {
    current: RwLock<Option<Arc<CompiledMatcher>>>,
    generation: AtomicU64,
}

impl MatcherSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live matcher, if any.
    pub fn current(&self) -> Option<Arc<CompiledMatcher>> {
        self.current.read().clone()
    }

    /// Number of matchers installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the live matcher, returning the superseded one.
    pub fn install(&self, matcher: CompiledMatcher) -> Option<Arc<CompiledMatcher>> {
        let previous = self.current.write().replace(Arc::new(matcher));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "installed new ACL matcher");
        previous
    }

    /// Compile `acl` and install it. On failure the live matcher is kept.
    pub fn reload(&self, acl: &Acl, memory_budget: usize) -> Result<Option<Arc<CompiledMatcher>>> {
        let matcher = CompiledMatcher::compile(acl, memory_budget)?;
        Ok(self.install(matcher))
    }

    /// Drop the live matcher. Releasing an empty slot returns `None`.
    pub fn release(&self) -> Option<Arc<CompiledMatcher>> {
        self.current.write().take()
    }
}

fn compile_set(side: &str, patterns: &BTreeSet<String>, budget: usize) -> Result<RegexSet> {
    if patterns.is_empty() {
        return Ok(RegexSet::empty());
    }
    let normalized: Vec<Cow<'_, str>> = patterns.iter().map(|p| normalize_pattern(p)).collect();

    RegexSetBuilder::new(&normalized)
        .case_insensitive(true)
        .size_limit(budget)
        .dfa_size_limit(budget)
        .build()
        .map_err(|set_err| {
            // Find the pattern responsible, falling back to the whole set
            for (raw, pattern) in patterns.iter().zip(&normalized) {
                if let Err(e) = RegexBuilder::new(&**pattern)
                    .case_insensitive(true)
                    .size_limit(budget)
                    .build()
                {
                    return AclError::RegexCompile {
                        pattern: raw.clone(),
                        budget,
                        message: e.to_string(),
                    };
                }
            }
            AclError::RegexCompile {
                pattern: format!("<{side} set: {} patterns>", patterns.len()),
                budget,
                message: set_err.to_string(),
            }
        })
}

/// A leading bare `*` is a glob wildcard in hand-written lists.
fn normalize_pattern(pattern: &str) -> Cow<'_, str> {
    if pattern.starts_with('*') {
        Cow::Owned(format!(".{pattern}"))
    } else {
        Cow::Borrowed(pattern)
    }
}

/// Sort networks and drop those already covered by a preceding entry.
///
/// Sorted by network address, a kept entry can only be covered by the last
/// kept entry, so the result is disjoint and binary-searchable.
fn collapse<N: Ord + Copy>(mut nets: Vec<N>, covers: impl Fn(&N, &N) -> bool) -> Box<[N]> {
    nets.sort();
    let mut kept: Vec<N> = Vec::with_capacity(nets.len());
    for net in nets {
        match kept.last() {
            Some(last) if covers(last, &net) => {}
            _ => kept.push(net),
        }
    }
    kept.into_boxed_slice()
}
