//! Membership ledger for one discovery cluster

use crate::keys::member_prefix;
use crate::urls_map::UrlsMap;
use crate::{Error, LedgerError};

/// One registered member as observed in the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MemberRecord {
    registry_key: String,
    peer_urls_map: String,
    create_revision: i64,
}

impl MemberRecord {
    /// Registered `name=url` payload.
    #[must_use]
    pub(crate) fn peer_urls_map(&self) -> &str {
        &self.peer_urls_map
    }

    /// Revision at which the registry created the key.
    #[cfg(test)]
    #[must_use]
    pub(crate) const fn create_revision(&self) -> i64 {
        self.create_revision
    }
}

/// Members observed for one cluster token, kept in ascending
/// `create_revision` order.
///
/// When more nodes register than the cluster size allows, the earliest
/// registrations win. Every node sorts by the same registry revisions, so all
/// of them agree on who made the cut.
#[derive(Clone, Debug)]
pub struct ClusterLedger {
    member_prefix: String,
    members: Vec<MemberRecord>,
}

impl ClusterLedger {
    /// Creates an empty ledger for `token`.
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            member_prefix: member_prefix(token),
            members: Vec::new(),
        }
    }

    /// Records a registration.
    ///
    /// # Errors
    ///
    /// Rejects keys outside the member prefix, values without `=`, and keys
    /// already present. A rejected entry leaves the ledger untouched.
    pub fn add(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        create_revision: i64,
    ) -> Result<(), LedgerError> {
        let registry_key = key.into();
        let peer_urls_map = value.into();

        if !registry_key.starts_with(&self.member_prefix) {
            return Err(LedgerError::InvalidRegistryKey);
        }

        if !peer_urls_map.contains('=') {
            return Err(LedgerError::InvalidPeerInfo);
        }

        if self.contains(&registry_key) {
            return Err(LedgerError::DuplicatePeer);
        }

        self.members.push(MemberRecord {
            registry_key,
            peer_urls_map,
            create_revision,
        });
        // Stable, so equal revisions keep insertion order.
        self.members.sort_by_key(|member| member.create_revision);

        Ok(())
    }

    /// Number of recorded members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether no member has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `key` has been recorded.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.members.iter().any(|member| member.registry_key == key)
    }

    /// Recorded members in revision order.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn members(&self) -> &[MemberRecord] {
        &self.members
    }

    /// Whether the cluster is already full of members other than `self_key`.
    ///
    /// Scanning stops at the last permitted slot: a `self_key` sitting exactly
    /// at index `cluster_size - 1` still counts as a member, anything later
    /// does not. A `None` key (an observer) is never found.
    #[must_use]
    pub fn is_full_without(&self, self_key: Option<&str>, cluster_size: usize) -> bool {
        for (index, member) in self.members.iter().enumerate() {
            if self_key == Some(member.registry_key.as_str()) {
                return false;
            }
            if index + 1 >= cluster_size {
                return true;
            }
        }
        false
    }

    /// Joins the payloads of the first `cluster_size` members with `,`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`], carrying the joined string, if it is not
    /// a valid `name=url` list.
    pub fn render_initial_cluster(&self, cluster_size: usize) -> Result<String, Error> {
        let cluster = self
            .members
            .iter()
            .take(cluster_size)
            .map(MemberRecord::peer_urls_map)
            .collect::<Vec<_>>()
            .join(",");

        match UrlsMap::parse(&cluster) {
            Ok(_) => Ok(cluster),
            Err(source) => Err(Error::InvalidUrl { cluster, source }),
        }
    }
}
