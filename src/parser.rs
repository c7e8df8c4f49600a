//! Line parser for the `.acl` rule-set format.

use std::io::BufRead;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{AclError, Result};
use crate::subnet::Subnet;

/// Regex pattern for the import directive carried in a line comment
/// Format: #IMPORT_URL <https://example.com/list.acl>
static IMPORT_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^IMPORT_URL\s*<(.+)>\s*$").expect("IMPORT_URL_PATTERN: hardcoded regex is invalid")
});

/// Receives hostname patterns and import URLs as the parser discovers them.
pub trait RuleSink {
    /// A pattern found in a bypass section
    fn bypass_hostname(&mut self, pattern: &str);

    /// A pattern found in a proxy section
    fn proxy_hostname(&mut self, pattern: &str);

    /// An `#IMPORT_URL <...>` directive
    fn import_url(&mut self, _url: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Bypass,
    Proxy,
    Discard,
}

/// Parse a rule set line by line.
///
/// Lines before the first list header go to the proxy list when
/// `default_bypass` is true and to the bypass list otherwise, so the same bare
/// list parses differently depending on the caller's starting mode.
///
/// Returns the final global mode and the subnets of the list that is *not*
/// the default: the bypass subnets under `[proxy_all]`, the proxy subnets
/// under `[bypass_all]`.
pub fn parse<R: BufRead, S: RuleSink + ?Sized>(
    reader: R,
    default_bypass: bool,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<(bool, Vec<Subnet>)> {
    let mut bypass = default_bypass;
    let mut bypass_subnets = Vec::new();
    let mut proxy_subnets = Vec::new();
    let mut section = if default_bypass {
        Section::Proxy
    } else {
        Section::Bypass
    };

    for line in reader.lines() {
        if cancel.is_cancelled() {
            return Err(AclError::Cancelled);
        }
        let line = line?;

        // Split off the comment and pick up an import directive from it
        let content = match line.split_once('#') {
            Some((content, comment)) => {
                if let Some(url) = import_url(comment) {
                    sink.import_url(url);
                }
                content
            }
            None => line.as_str(),
        };
        let input = content.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "[outbound_block_list]" => section = Section::Discard,
            "[black_list]" | "[bypass_list]" => section = Section::Bypass,
            "[white_list]" | "[proxy_list]" => section = Section::Proxy,
            "[reject_all]" | "[bypass_all]" => bypass = true,
            "[accept_all]" | "[proxy_all]" => bypass = false,
            _ if input.starts_with('[') => {
                return Err(AclError::UnrecognizedBlock(input.to_string()));
            }
            _ => match (section, Subnet::parse(input)) {
                (Section::Discard, _) => {}
                (Section::Bypass, Some(subnet)) => bypass_subnets.push(subnet),
                (Section::Proxy, Some(subnet)) => proxy_subnets.push(subnet),
                (Section::Bypass, None) => sink.bypass_hostname(input),
                (Section::Proxy, None) => sink.proxy_hostname(input),
            },
        }
    }

    let subnets = if bypass {
        proxy_subnets
    } else {
        bypass_subnets
    };
    Ok((bypass, subnets))
}

/// Parse a rule set held in memory.
pub fn parse_str<S: RuleSink + ?Sized>(
    text: &str,
    default_bypass: bool,
    sink: &mut S,
) -> Result<(bool, Vec<Subnet>)> {
    parse(text.as_bytes(), default_bypass, sink, &CancellationToken::new())
}

fn import_url(comment: &str) -> Option<&str> {
    IMPORT_URL_PATTERN
        .captures(comment.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}
