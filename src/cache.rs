//! Process-wide DN -> login cache, shared by all proxy sessions.

use dashmap::DashMap;

/// Maps canonical entry DNs (as returned by the directory in
/// SearchResultEntry.objectName) to the login the client searched for.
/// Consulted at bind time to pass the short login, not the DN, to the
/// second-factor service.
///
/// Keys are exact, case-preserved strings: the directory is the authority on
/// DN canonicalization. Entries are overwritten on re-observation; there is
/// no TTL.
#[derive(Debug, Default)]
pub struct DnLoginCache {
    map: DashMap<String, String>,
}

impl DnLoginCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dn: &str) -> Option<String> {
        self.map.get(dn).map(|v| v.value().clone())
    }

    pub fn put(&self, dn: String, login: String) {
        self.map.insert(dn, login);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
