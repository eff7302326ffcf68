//! The current set of hosts, each with an attached `HostClient`.

use crate::host_client::{ForestConfiguration, HostClient};
use crate::types::HostRef;
use std::collections::HashMap;
use std::sync::Arc;

/// One cluster host and the client used to write to it.
#[derive(Clone)]
pub struct HostEntry {
    pub host: HostRef,
    pub client: Arc<dyn HostClient>,
}

/// Ordered set of currently-writable hosts. Index is the round-robin key.
///
/// Replaced atomically on topology change by [`HostRoster::rebuild`]; the
/// old array is never mutated in place.
#[derive(Clone)]
pub struct HostRoster {
    entries: Vec<HostEntry>,
}

impl HostRoster {
    pub fn new(entries: Vec<HostEntry>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_at(&self, index: usize) -> Option<&HostEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[HostEntry] {
        &self.entries
    }

    pub fn contains_host(&self, host: &HostRef) -> bool {
        self.entries.iter().any(|e| &e.host == host)
    }

    /// Rebuild the roster from a fresh `ForestConfiguration` read,
    /// constructing a fresh `HostClient` for each newly-seen host, reusing
    /// existing entries for hosts still present, and return the set of
    /// hosts that left.
    ///
    /// The caller supplies `make_client` so the roster module stays
    /// decoupled from how a concrete `HostClient` is constructed.
    pub fn rebuild(
        &self,
        cfg: &dyn ForestConfiguration,
        make_client: impl Fn(&str) -> Arc<dyn HostClient>,
    ) -> RebuildResult {
        let new_hosts = cfg.hosts();
        let mut old_by_host: HashMap<HostRef, HostEntry> = self
            .entries
            .iter()
            .cloned()
            .map(|e| (e.host.clone(), e))
            .collect();

        let mut new_entries = Vec::with_capacity(new_hosts.len());
        for host_name in &new_hosts {
            let host = HostRef(host_name.clone());
            let entry = match old_by_host.remove(&host) {
                Some(reused) => reused,
                None => HostEntry {
                    host: host.clone(),
                    client: make_client(host_name),
                },
            };
            new_entries.push(entry);
        }

        // Anything left in old_by_host departed.
        let removed: Vec<HostRef> = old_by_host.into_keys().collect();

        RebuildResult {
            roster: HostRoster::new(new_entries),
            removed,
        }
    }
}

impl Default for HostRoster {
    fn default() -> Self {
        Self::empty()
    }
}

pub struct RebuildResult {
    pub roster: HostRoster,
    pub removed: Vec<HostRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_client::{MockHostClient, StaticForestConfiguration};

    fn entry(host: &str) -> HostEntry {
        HostEntry {
            host: HostRef(host.to_string()),
            client: MockHostClient::new(host),
        }
    }

    #[test]
    fn rebuild_reuses_entries_for_hosts_still_present() {
        let roster = HostRoster::new(vec![entry("a"), entry("b")]);
        let original_a_ptr = Arc::as_ptr(&roster.entry_at(0).unwrap().client);

        let cfg = StaticForestConfiguration::new(["a", "c"]);
        let result = roster.rebuild(&cfg, |h| MockHostClient::new(h));

        assert_eq!(result.roster.len(), 2);
        assert_eq!(result.removed, vec![HostRef("b".to_string())]);
        assert_eq!(
            Arc::as_ptr(&result.roster.entry_at(0).unwrap().client),
            original_a_ptr,
            "host a's client should be reused, not recreated"
        );
    }

    #[test]
    fn rebuild_preserves_new_order() {
        let roster = HostRoster::empty();
        let cfg = StaticForestConfiguration::new(["x", "y", "z"]);
        let result = roster.rebuild(&cfg, |h| MockHostClient::new(h));

        let hosts: Vec<_> = result.roster.entries().iter().map(|e| e.host.0.clone()).collect();
        assert_eq!(hosts, vec!["x", "y", "z"]);
    }
}
