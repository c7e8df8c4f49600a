//! In-memory access control list.
//!
//! An [`Acl`] is the deduplicated, sorted form of one or more rule files:
//! hostname patterns per side, the subnets of the non-default side, pending
//! import URLs and the global fallback mode.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::fetch::Fetch;
use crate::parser::{self, RuleSink};
use crate::subnet::Subnet;

/// Access control list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    /// Hostname patterns routed directly
    pub bypass_hostnames: BTreeSet<String>,
    /// Hostname patterns routed through the proxy
    pub proxy_hostnames: BTreeSet<String>,
    /// Subnets of the side that is not the default
    pub subnets: BTreeSet<Subnet>,
    /// Unresolved imports, in declaration order
    pub import_urls: Vec<String>,
    /// Global fallback: bypass everything that does not match
    pub bypass: bool,
}

struct AclSink<'a> {
    bypass_hostnames: &'a mut BTreeSet<String>,
    proxy_hostnames: &'a mut BTreeSet<String>,
    import_urls: &'a mut Vec<String>,
}

impl RuleSink for AclSink<'_> {
    fn bypass_hostname(&mut self, pattern: &str) {
        self.bypass_hostnames.insert(pattern.to_string());
    }

    fn proxy_hostname(&mut self, pattern: &str) {
        self.proxy_hostnames.insert(pattern.to_string());
    }

    fn import_url(&mut self, url: &str) {
        push_unique(self.import_urls, url);
    }
}

impl Acl {
    /// Create an empty proxy-all list
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a rule set from text.
    pub fn from_text(text: &str, default_bypass: bool) -> Result<Self> {
        let mut acl = Self::new();
        acl.load_text(text, default_bypass)?;
        Ok(acl)
    }

    /// Parse a rule set from a reader, honouring `cancel` between lines.
    pub fn from_reader<R: BufRead>(
        reader: R,
        default_bypass: bool,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut acl = Self::new();
        acl.load_reader(reader, default_bypass, cancel)?;
        Ok(acl)
    }

    /// Load a cached rule file; a missing or unreadable file yields an empty list.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut acl = Self::new();
        acl.load_file(path)?;
        Ok(acl)
    }

    /// Replace the contents with the rules in `text`.
    pub fn load_text(&mut self, text: &str, default_bypass: bool) -> Result<&mut Self> {
        self.load_reader(text.as_bytes(), default_bypass, &CancellationToken::new())
    }

    /// Replace the contents with the rules read from `reader`.
    ///
    /// On error the list is left cleared.
    pub fn load_reader<R: BufRead>(
        &mut self,
        reader: R,
        default_bypass: bool,
        cancel: &CancellationToken,
    ) -> Result<&mut Self> {
        self.clear();
        let mut sink = AclSink {
            bypass_hostnames: &mut self.bypass_hostnames,
            proxy_hostnames: &mut self.proxy_hostnames,
            import_urls: &mut self.import_urls,
        };
        let (bypass, subnets) = parser::parse(reader, default_bypass, &mut sink, cancel)?;
        self.bypass = bypass;
        self.subnets.extend(subnets);
        Ok(self)
    }

    /// Replace the contents with a cached rule file.
    ///
    /// I/O failures leave the list untouched; only parse errors are returned.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        match File::open(path) {
            Ok(file) => self.load_reader(BufReader::new(file), false, &CancellationToken::new()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "rule file unavailable, keeping current rules");
                Ok(self)
            }
        }
    }

    /// Overlay `other` onto this list.
    ///
    /// All sets are unioned and the global mode is taken from `other`, so the
    /// last merged list decides the fallback.
    pub fn merge(&mut self, other: &Acl) -> &mut Self {
        self.bypass_hostnames
            .extend(other.bypass_hostnames.iter().cloned());
        self.proxy_hostnames
            .extend(other.proxy_hostnames.iter().cloned());
        self.subnets.extend(other.subnets.iter().copied());
        for url in &other.import_urls {
            push_unique(&mut self.import_urls, url);
        }
        self.bypass = other.bypass;
        self
    }

    /// Resolve `#IMPORT_URL` directives up to `depth` levels deep.
    ///
    /// Each import is parsed with this list's mode as its starting mode. An
    /// import that ends up in the other mode keeps its hostname rules but its
    /// subnets are dropped. Imports are cleared afterwards, even when
    /// `depth` is zero. On error the list is left unchanged.
    pub fn flatten(
        &mut self,
        depth: usize,
        fetch: &dyn Fetch,
        cancel: &CancellationToken,
    ) -> Result<&mut Self> {
        let mut imported = Acl::new();
        if depth > 0 {
            for url in &self.import_urls {
                let body = fetch.get(url)?;
                let mut child = Acl::from_reader(BufReader::new(body), self.bypass, cancel)?;
                child.flatten(depth - 1, fetch, cancel)?;
                if child.bypass != self.bypass {
                    warn!(
                        url = %url,
                        "imported rule set has a conflicting mode, discarding its subnets"
                    );
                    child.subnets.clear();
                }
                imported.bypass_hostnames.extend(child.bypass_hostnames);
                imported.proxy_hostnames.extend(child.proxy_hostnames);
                imported.subnets.extend(child.subnets);
            }
        }
        self.bypass_hostnames.extend(imported.bypass_hostnames);
        self.proxy_hostnames.extend(imported.proxy_hostnames);
        self.subnets.extend(imported.subnets);
        self.import_urls.clear();
        Ok(self)
    }

    /// Serialize back to the rule-set text format.
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.bypass_hostnames.is_empty()
            && self.proxy_hostnames.is_empty()
            && self.subnets.is_empty()
            && self.import_urls.is_empty()
    }

    /// Reset to an empty proxy-all list.
    pub fn clear(&mut self) -> &mut Self {
        self.bypass_hostnames.clear();
        self.proxy_hostnames.clear();
        self.subnets.clear();
        self.import_urls.clear();
        self.bypass = false;
        self
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.bypass {
            "[bypass_all]\n"
        } else {
            "[proxy_all]\n"
        })?;

        // Subnets always belong to the list that is not the default
        let subnets = self.subnets.iter().map(Subnet::to_string);
        let (bypass_list, proxy_list): (Vec<String>, Vec<String>) = if self.bypass {
            (
                self.bypass_hostnames.iter().cloned().collect(),
                subnets.chain(self.proxy_hostnames.iter().cloned()).collect(),
            )
        } else {
            (
                subnets.chain(self.bypass_hostnames.iter().cloned()).collect(),
                self.proxy_hostnames.iter().cloned().collect(),
            )
        };

        if !bypass_list.is_empty() {
            f.write_str("[bypass_list]\n")?;
            for line in &bypass_list {
                writeln!(f, "{line}")?;
            }
        }
        if !proxy_list.is_empty() {
            f.write_str("[proxy_list]\n")?;
            for line in &proxy_list {
                writeln!(f, "{line}")?;
            }
        }
        for url in &self.import_urls {
            writeln!(f, "#IMPORT_URL <{url}>")?;
        }
        Ok(())
    }
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    if !urls.iter().any(|u| u == url) {
        urls.push(url.to_string());
    }
}
