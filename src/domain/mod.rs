//! Domain filtering
//!
//! Decides per destination whether traffic routes through the tunnel.
//! The suffix set is replaced wholesale (copy-on-write); the per-host:port
//! decision cache is cleared atomically on every replacement, so no decision
//! computed against an old set can survive a reload.

pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

/// Domain filter errors
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(String),
}

/// Suffix set plus memoized per-destination decisions
#[derive(Default)]
pub struct DomainFilter {
    /// Lowercase, dot-trimmed suffixes; swapped wholesale, never mutated
    /// in place while readers hold the previous set
    domains: RwLock<Arc<HashSet<String>>>,
    /// Literal `host:port` -> "routes through tunnel"
    cache: RwLock<HashMap<String, bool>>,
}

impl DomainFilter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the current suffix set
    pub fn domains(&self) -> Arc<HashSet<String>> {
        self.domains.read().expect("domain lock poisoned").clone()
    }

    /// Snapshot of the match cache
    pub fn match_cache(&self) -> HashMap<String, bool> {
        self.cache.read().expect("cache lock poisoned").clone()
    }

    /// Replace the suffix set and clear the cache in one step.
    /// Entries are normalized: trimmed, lowercased, empties dropped.
    pub fn replace(&self, domains: impl IntoIterator<Item = String>) {
        let normalized: HashSet<String> = domains
            .into_iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        *self.domains.write().expect("domain lock poisoned") = Arc::new(normalized);
        self.clear_cache();
    }

    /// Drop all memoized decisions
    pub fn clear_cache(&self) {
        self.cache.write().expect("cache lock poisoned").clear();
    }

    /// Should `host_port` be routed through the tunnel?
    ///
    /// Memoized under the literal `host:port` key. The hostname part is
    /// lowercased and dot-trimmed, then tested for suffix membership:
    /// `example.com` matches `a.example.com` and `example.com` itself but
    /// not `notexample.com`.
    pub fn should_tunnel(&self, host_port: &str) -> bool {
        if let Some(&decision) = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .get(host_port)
        {
            return decision;
        }

        let host = host_port.split(':').next().unwrap_or(host_port);
        let host = host.trim_matches('.').to_lowercase();

        let domains = self.domains();
        let decision = domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));

        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(host_port.to_string(), decision);
        decision
    }

    /// Load the suffix set from newline-delimited file contents
    pub fn load_from_str(&self, contents: &str) {
        self.replace(contents.lines().map(|l| l.to_string()));
        info!(
            domains = self.domains().len(),
            "domain filter list loaded"
        );
    }

    /// Reload from the filter file; a missing file clears set and cache
    pub fn reload_from_file(&self, path: &Path) -> Result<(), DomainError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                self.load_from_str(&contents);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.replace(std::iter::empty());
                info!("domain filter file removed, filter cleared");
                Ok(())
            }
            Err(e) => Err(DomainError::Io(e)),
        }
    }

    /// Rewrite the filter file wholesale from the current set
    pub fn flush(&self, path: &Path) -> Result<(), DomainError> {
        let domains = self.domains();
        let mut lines: Vec<&str> = domains.iter().map(|d| d.as_str()).collect();
        lines.sort_unstable();
        std::fs::write(path, lines.join("\n"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(domains: &[&str]) -> Arc<DomainFilter> {
        let filter = DomainFilter::new();
        filter.replace(domains.iter().map(|d| d.to_string()));
        filter
    }

    #[test]
    fn suffix_matching() {
        let filter = filter_with(&["example.com", "test.org"]);

        assert!(filter.should_tunnel("example.com:443"));
        assert!(filter.should_tunnel("a.example.com:443"));
        assert!(filter.should_tunnel("deep.a.example.com:80"));
        assert!(filter.should_tunnel("sub.test.org:8080"));

        // A bare suffix overlap is not a match
        assert!(!filter.should_tunnel("notexample.com:443"));
        assert!(!filter.should_tunnel("example.org:443"));
        assert!(!filter.should_tunnel("com:443"));
    }

    #[test]
    fn matching_is_case_insensitive_and_dot_trimmed() {
        let filter = filter_with(&["Example.COM"]);

        assert!(filter.should_tunnel("EXAMPLE.com:443"));
        assert!(filter.should_tunnel("WWW.Example.Com:80"));
        assert!(filter.should_tunnel("example.com.:443"));
    }

    #[test]
    fn decisions_are_memoized_per_host_port() {
        let filter = filter_with(&["example.com"]);

        assert!(filter.match_cache().is_empty());
        assert!(filter.should_tunnel("example.com:443"));
        assert_eq!(filter.match_cache().len(), 1);
        assert_eq!(filter.match_cache().get("example.com:443"), Some(&true));

        // Second call is a cache hit; same answer, no new entries
        assert!(filter.should_tunnel("example.com:443"));
        assert_eq!(filter.match_cache().len(), 1);

        assert!(!filter.should_tunnel("other.net:80"));
        assert_eq!(filter.match_cache().get("other.net:80"), Some(&false));
    }

    #[test]
    fn replacing_the_set_clears_the_cache() {
        let filter = filter_with(&["example.com"]);
        assert!(filter.should_tunnel("example.com:443"));
        assert!(!filter.should_tunnel("fresh.net:443"));
        assert_eq!(filter.match_cache().len(), 2);

        filter.replace(vec!["fresh.net".to_string()]);
        assert!(filter.match_cache().is_empty());

        // Re-evaluated against the new set, never the old decision
        assert!(!filter.should_tunnel("example.com:443"));
        assert!(filter.should_tunnel("fresh.net:443"));
    }

    #[test]
    fn load_normalizes_lines() {
        let filter = DomainFilter::new();
        filter.load_from_str("  Example.com \n\ntest.org\r\n   \nTEST.ORG\n");

        let domains = filter.domains();
        assert_eq!(domains.len(), 2);
        assert!(domains.contains("example.com"));
        assert!(domains.contains("test.org"));
    }

    #[test]
    fn flush_and_reload_roundtrip() {
        let path = std::env::temp_dir().join(format!("passage-domains-{}.txt", std::process::id()));
        let filter = filter_with(&["example.com", "test.org"]);

        filter.flush(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = written.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["example.com", "test.org"]);

        let reloaded = DomainFilter::new();
        reloaded.reload_from_file(&path).unwrap();
        assert_eq!(*reloaded.domains(), *filter.domains());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_clears_filter() {
        let filter = filter_with(&["example.com"]);
        assert!(filter.should_tunnel("example.com:443"));

        filter
            .reload_from_file(Path::new("/nonexistent/passage-domains.txt"))
            .unwrap();
        assert!(filter.domains().is_empty());
        assert!(filter.match_cache().is_empty());
        assert!(!filter.should_tunnel("example.com:443"));
    }
}
