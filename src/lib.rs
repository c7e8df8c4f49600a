//! ACL Router - bypass/proxy rule sets and per-outbound traffic accounting
//!
//! This library provides:
//! - Parsing and serialization of `.acl` rule-set files
//! - Recursive resolution of `#IMPORT_URL` directives
//! - Compilation into an immutable matcher (regex sets and sorted subnet tables)
//! - An on-disk rule-set cache with a background syncer
//! - A traffic looper turning engine byte deltas into speeds and totals
//!
//! # Example
//!
//! ```rust
//! use acl_router::{Acl, CompiledMatcher, DEFAULT_ACL_MEMORY_BUDGET};
//!
//! let text = "
//! [proxy_all]
//! [bypass_list]
//! 10.0.0.0/8
//! (^|\\.)example\\.cn$
//! ";
//!
//! let acl = Acl::from_text(text, false).unwrap();
//! let matcher = CompiledMatcher::compile(&acl, DEFAULT_ACL_MEMORY_BUDGET).unwrap();
//!
//! assert!(matcher.should_bypass_ipv4(&[10, 1, 2, 3]));
//! assert!(!matcher.should_bypass_ipv4(&[8, 8, 8, 8]));
//! assert_eq!(matcher.should_bypass_host("www.example.cn"), Some(true));
//! assert_eq!(matcher.should_bypass_host("example.com"), None);
//! ```
//!
//! # Rule Syntax
//!
//! ```text
//! [bypass_all] | [proxy_all]
//! [bypass_list] | [black_list]
//! <hostname-regex-or-subnet-per-line>
//! [proxy_list] | [white_list]
//! <hostname-regex-or-subnet-per-line>
//! [outbound_block_list]
//! #IMPORT_URL <https://...>
//! ```
//!
//! | Line | Meaning |
//! |------|---------|
//! | `[bypass_all]` | Unlisted destinations go direct |
//! | `[proxy_all]` | Unlisted destinations go through the proxy (default) |
//! | `10.0.0.0/8` | Subnet, kept only in the list opposite to the default mode |
//! | `(^\|\.)x\.com$` | Hostname regex, matched case-insensitively |
//! | `[outbound_block_list]` | Legacy section, parsed and discarded |
//! | `#IMPORT_URL <url>` | Merge a remote rule set, may trail any line |

pub mod acl;
pub mod config;
pub mod error;
pub mod fetch;
pub mod matcher;
pub mod parser;
pub mod store;
pub mod subnet;
#[cfg(feature = "async")]
pub mod syncer;
#[cfg(feature = "async")]
pub mod traffic;

// Re-export commonly used items
pub use acl::Acl;
pub use config::EngineConfig;
pub use error::{AclError, FetchErrorKind, Result};
pub use fetch::{Fetch, HttpFetcher, StaticFetcher};
pub use matcher::{
    CompiledMatcher, MatcherSlot, DEFAULT_ACL_MEMORY_BUDGET, LOW_MEMORY_ACL_BUDGET,
};
pub use parser::{parse, parse_str, RuleSink};
pub use store::RuleSetStore;
pub use subnet::Subnet;

#[cfg(feature = "async")]
pub use syncer::{AclSyncer, AlwaysReady, DeviceConditions, SyncOptions};
#[cfg(feature = "async")]
pub use traffic::{
    Direction, NoopStore, ProxyEngine, RoutingTable, SpeedSnapshot, TagGroup, TrafficData,
    TrafficEntity, TrafficEvent, TrafficLooper, TrafficLooperHandle, TrafficStore,
};

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_full_workflow() {
        let rules_text = r#"
# Everything unlisted goes through the proxy
[proxy_all]

[bypass_list]
192.168.0.0/16
(^|\.)cn$
#IMPORT_URL <https://rules.example/lan.acl>

[proxy_list]
(^|\.)google\.com$
"#;

        let fetch = StaticFetcher::new().with(
            "https://rules.example/lan.acl",
            "[bypass_list]\n10.0.0.0/8\n(^|\\.)local$\n",
        );

        // Parse rules
        let mut acl = Acl::from_text(rules_text, false).unwrap();
        assert_eq!(acl.import_urls, vec!["https://rules.example/lan.acl"]);

        // Resolve imports
        acl.flatten(5, &fetch, &CancellationToken::new()).unwrap();
        assert!(acl.import_urls.is_empty());
        assert_eq!(acl.subnets.len(), 2);

        // Compile
        let matcher = CompiledMatcher::compile(&acl, DEFAULT_ACL_MEMORY_BUDGET).unwrap();
        assert!(!matcher.default_bypass());

        // Private subnets -> direct
        assert!(matcher.should_bypass_ipv4(&[192, 168, 1, 1]));
        assert!(matcher.should_bypass_ipv4(&[10, 20, 30, 40]));
        assert!(!matcher.should_bypass_ipv4(&[8, 8, 8, 8]));

        // Hostname lists
        assert_eq!(matcher.should_bypass_host("www.baidu.cn"), Some(true));
        assert_eq!(matcher.should_bypass_host("printer.local"), Some(true));
        assert_eq!(matcher.should_bypass_host("mail.google.com"), Some(false));
        assert_eq!(matcher.should_bypass_host("unknown.org"), None);

        // Unknown -> default mode
        assert!(!matcher.should_bypass("unknown.org"));

        // The flattened list survives a round trip
        let reparsed = Acl::from_text(&acl.serialize(), acl.bypass).unwrap();
        assert_eq!(reparsed, acl);
    }
}
