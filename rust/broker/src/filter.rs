//! Exclusion filters: wildcard pattern sets for text indicator types and a
//! binary prefix trie for `ip` CIDR lists.

use std::net::IpAddr;

use anyhow::Context;
use ipnet::IpNet;
use regex::{Regex, RegexBuilder};

/// A set of wildcard patterns matched case-insensitively against the whole
/// value. `*` and `%` match any run of characters, `?` and `_` a single
/// character, `#` a digit. `[...]` classes pass through (`[!` negates),
/// `~x` escapes `x`, and `(`, `)`, `|`, `{`, `}` keep their regex meaning
/// so patterns can carry alternations and counts.
pub struct WildcardSet {
    patterns: Vec<Regex>,
}

impl WildcardSet {
    pub fn compile(items: &[String]) -> anyhow::Result<WildcardSet> {
        let mut patterns = Vec::with_capacity(items.len());
        for item in items {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            patterns.push(
                compile_pattern(item).with_context(|| format!("wildcard pattern {item:?}"))?,
            );
        }
        Ok(WildcardSet { patterns })
    }

    pub fn matches(&self, value: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(value))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn compile_pattern(pattern: &str) -> anyhow::Result<Regex> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let mut in_class = false;
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_class {
            if ch == ']' {
                in_class = false;
            }
            re.push(ch);
            continue;
        }
        match ch {
            '*' | '%' => re.push_str(".*"),
            '?' | '_' => re.push('.'),
            '#' => re.push_str(r"\d"),
            '[' => {
                in_class = true;
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
            }
            '~' => {
                if let Some(next) = chars.next() {
                    push_literal(&mut re, next);
                }
            }
            '(' | ')' | '|' | '{' | '}' => re.push(ch),
            other => push_literal(&mut re, other),
        }
    }
    re.push('$');
    let regex = RegexBuilder::new(&re).case_insensitive(true).build()?;
    Ok(regex)
}

fn push_literal(re: &mut String, ch: char) {
    let mut buf = [0u8; 4];
    re.push_str(&regex::escape(ch.encode_utf8(&mut buf)));
}

/// Binary trie over network prefixes, one per address family. Lookup walks
/// the address bits and answers whether any inserted prefix covers them.
#[derive(Default)]
pub struct IpTrie {
    v4: TrieNode,
    v6: TrieNode,
}

#[derive(Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    terminal: bool,
}

impl IpTrie {
    pub fn new() -> IpTrie {
        IpTrie::default()
    }

    /// Build a trie from CIDR strings. Bare addresses get a host prefix.
    pub fn from_items(items: &[String]) -> anyhow::Result<IpTrie> {
        let mut trie = IpTrie::new();
        for item in items {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            trie.insert(parse_cidr(item)?);
        }
        Ok(trie)
    }

    pub fn insert(&mut self, net: IpNet) {
        match net {
            IpNet::V4(net) => {
                let bits = u32::from(net.network()) as u128;
                insert_bits(&mut self.v4, bits, 32, net.prefix_len());
            }
            IpNet::V6(net) => {
                let bits = u128::from(net.network());
                insert_bits(&mut self.v6, bits, 128, net.prefix_len());
            }
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(addr) => walk(&self.v4, u32::from(addr) as u128, 32),
            IpAddr::V6(addr) => walk(&self.v6, u128::from(addr), 128),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.v4.terminal
            && self.v4.children.iter().all(Option::is_none)
            && !self.v6.terminal
            && self.v6.children.iter().all(Option::is_none)
    }
}

fn parse_cidr(item: &str) -> anyhow::Result<IpNet> {
    if let Ok(net) = item.parse::<IpNet>() {
        return Ok(net);
    }
    let addr: IpAddr = item
        .parse()
        .with_context(|| format!("CIDR or address {item:?}"))?;
    Ok(IpNet::from(addr))
}

fn insert_bits(root: &mut TrieNode, bits: u128, addr_len: u32, prefix_len: u8) {
    let mut node = root;
    for i in 0..prefix_len as u32 {
        let bit = ((bits >> (addr_len - 1 - i)) & 1) as usize;
        node = node.children[bit].get_or_insert_with(Default::default);
    }
    node.terminal = true;
}

fn walk(root: &TrieNode, bits: u128, addr_len: u32) -> bool {
    let mut node = root;
    if node.terminal {
        return true;
    }
    for i in 0..addr_len {
        let bit = ((bits >> (addr_len - 1 - i)) & 1) as usize;
        match &node.children[bit] {
            Some(next) => {
                node = next;
                if node.terminal {
                    return true;
                }
            }
            None => return false,
        }
    }
    false
}

/// Exclusion filter for one indicator type: CIDRs for `ip`, wildcard
/// patterns for everything else.
pub enum ValueFilter {
    Wildcards(WildcardSet),
    Cidrs(IpTrie),
}

impl ValueFilter {
    pub fn for_type(type_name: &str, items: &[String]) -> anyhow::Result<ValueFilter> {
        if type_name == "ip" {
            Ok(ValueFilter::Cidrs(IpTrie::from_items(items)?))
        } else {
            Ok(ValueFilter::Wildcards(WildcardSet::compile(items)?))
        }
    }

    pub fn empty_for(type_name: &str) -> ValueFilter {
        if type_name == "ip" {
            ValueFilter::Cidrs(IpTrie::new())
        } else {
            ValueFilter::Wildcards(WildcardSet {
                patterns: Vec::new(),
            })
        }
    }

    /// Whether the value is excluded. Values an `ip` filter cannot parse
    /// are let through.
    pub fn excludes(&self, value: &str) -> bool {
        match self {
            ValueFilter::Wildcards(set) => set.matches(value),
            ValueFilter::Cidrs(trie) => value
                .parse::<IpAddr>()
                .map(|addr| trie.contains(addr))
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> WildcardSet {
        let owned: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        WildcardSet::compile(&owned).expect("patterns compile")
    }

    #[test]
    fn star_matches_any_run() {
        let s = set(&["*.example.com"]);
        assert!(s.matches("www.example.com"));
        assert!(s.matches("a.b.example.com"));
        assert!(!s.matches("example.com"));
        assert!(!s.matches("www.example.com.evil"));
    }

    #[test]
    fn matching_ignores_case() {
        let s = set(&["*.Example.COM"]);
        assert!(s.matches("WWW.eXaMpLe.com"));
    }

    #[test]
    fn question_mark_and_digit_classes() {
        let s = set(&["mail?.test", "host##.test"]);
        assert!(s.matches("mail1.test"));
        assert!(!s.matches("mail12.test"));
        assert!(s.matches("host42.test"));
        assert!(!s.matches("hostab.test"));
    }

    #[test]
    fn negated_class_and_escape() {
        let s = set(&["[!a]x.test", "literal~*.test"]);
        assert!(s.matches("bx.test"));
        assert!(!s.matches("ax.test"));
        assert!(s.matches("literal*.test"));
        assert!(!s.matches("literalX.test"));
    }

    #[test]
    fn dots_are_literal() {
        let s = set(&["a.b"]);
        assert!(s.matches("a.b"));
        assert!(!s.matches("aXb"));
    }

    #[test]
    fn trie_covers_inserted_prefixes() {
        let trie = IpTrie::from_items(&[
            "10.0.0.0/8".to_string(),
            "192.0.2.1".to_string(),
            "2001:db8::/32".to_string(),
        ])
        .expect("valid cidrs");

        assert!(trie.contains("10.1.2.3".parse().unwrap()));
        assert!(trie.contains("192.0.2.1".parse().unwrap()));
        assert!(!trie.contains("192.0.2.2".parse().unwrap()));
        assert!(!trie.contains("11.0.0.1".parse().unwrap()));
        assert!(trie.contains("2001:db8:1::1".parse().unwrap()));
        assert!(!trie.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn nested_prefixes_match_on_the_shortest() {
        let trie = IpTrie::from_items(&["10.0.0.0/8".to_string(), "10.1.0.0/16".to_string()])
            .expect("valid cidrs");
        assert!(trie.contains("10.200.0.1".parse().unwrap()));
        assert!(trie.contains("10.1.5.5".parse().unwrap()));
    }

    #[test]
    fn empty_trie_matches_nothing() {
        let trie = IpTrie::new();
        assert!(trie.is_empty());
        assert!(!trie.contains("0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn bad_cidr_is_an_error() {
        assert!(IpTrie::from_items(&["not-an-ip".to_string()]).is_err());
    }

    #[test]
    fn value_filter_lets_unparseable_ips_through() {
        let filter =
            ValueFilter::for_type("ip", &["10.0.0.0/8".to_string()]).expect("valid filter");
        assert!(filter.excludes("10.9.9.9"));
        assert!(!filter.excludes("example.com"));
    }
}
