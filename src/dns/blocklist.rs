//! Ad-domain blocklist
//!
//! Domains are stored in a trie keyed by reversed labels, so blocking
//! `ads.example` also blocks every name below it. Lists are plain text, one
//! domain per line; `#` comments and an optional `kind:` qualifier (as in
//! `domain:ads.example`) are accepted.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

/// Membership test for ad domains
pub trait Blocklist: Send + Sync {
    fn is_blocked(&self, name: &str) -> bool;
}

/// Blocklist that blocks nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlocklist;

impl Blocklist for NoBlocklist {
    fn is_blocked(&self, _name: &str) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct LabelNode {
    blocked: bool,
    children: HashMap<String, LabelNode>,
}

/// Reversed-label trie of blocked domains
#[derive(Debug, Default)]
pub struct DomainBlocklist {
    root: LabelNode,
    len: usize,
}

impl DomainBlocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a list file
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let list = Self::parse(&content);
        info!(
            "Loaded {} blocked domains from {}",
            list.len(),
            path.as_ref().display()
        );
        Ok(list)
    }

    pub fn parse(content: &str) -> Self {
        let mut list = Self::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let domain = line.rsplit(':').next().unwrap_or(line);
            list.insert(domain);
        }
        list
    }

    pub fn insert(&mut self, domain: &str) {
        let mut node = &mut self.root;
        let mut any = false;
        for label in labels(domain) {
            node = node.children.entry(label).or_default();
            any = true;
        }
        if any && !node.blocked {
            node.blocked = true;
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Blocklist for DomainBlocklist {
    fn is_blocked(&self, name: &str) -> bool {
        let mut node = &self.root;
        for label in labels(name) {
            match node.children.get(&label) {
                Some(child) if child.blocked => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        false
    }
}

/// Lowercased labels, TLD first
fn labels(name: &str) -> impl Iterator<Item = String> + '_ {
    name.trim_end_matches('.')
        .rsplit('.')
        .filter(|label| !label.is_empty())
        .map(|label| label.to_ascii_lowercase())
}
