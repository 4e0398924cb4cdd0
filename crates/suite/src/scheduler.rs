//! Partitioning of the selected tests into cluster groups.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::catalog::{Catalog, SharingMode};

/// Identifier of the group hosting every shared test.
pub const SHARED_GROUP: &str = "shared";

/// One unit of infrastructure and the tests that run on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterGroup {
    /// Group identifier: `shared` or the name of the custom test.
    pub id: String,
    /// Member tests, in name order.
    pub members: BTreeSet<String>,
    /// Number of VMs to provision.
    pub nodes: u32,
    /// Placement of the members.
    pub sharing: SharingMode,
    /// Flavor override; `None` uses the provider default.
    pub flavor: Option<String>,
}

impl ClusterGroup {
    /// Whether this is the shared group.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.sharing == SharingMode::Shared
    }
}

/// Builds cluster groups from the catalog.
pub struct ClusterGroupScheduler<'a> {
    catalog: &'a Catalog,
    shared_nodes: Option<u32>,
}

impl<'a> ClusterGroupScheduler<'a> {
    /// `shared_nodes` overrides the shared group's node count.
    #[must_use]
    pub fn new(catalog: &'a Catalog, shared_nodes: Option<u32>) -> Self {
        Self {
            catalog,
            shared_nodes,
        }
    }

    /// Partition the selected tests.
    ///
    /// The shared group, if any, comes first, followed by one group per
    /// custom test in name order. An empty result means there is nothing to
    /// run.
    #[must_use]
    pub fn schedule(&self) -> Vec<ClusterGroup> {
        let mut shared = BTreeSet::new();
        let mut groups = Vec::new();

        for test in self.catalog.selected() {
            match test.sharing {
                SharingMode::Shared => {
                    shared.insert(test.name.clone());
                }
                SharingMode::Custom => groups.push(ClusterGroup {
                    id: test.name.clone(),
                    members: BTreeSet::from([test.name.clone()]),
                    nodes: test.nodes.unwrap_or(1),
                    sharing: SharingMode::Custom,
                    flavor: test.flavor.clone(),
                }),
            }
        }

        if !shared.is_empty() {
            let members = u32::try_from(shared.len()).unwrap_or(u32::MAX);
            groups.insert(
                0,
                ClusterGroup {
                    id: SHARED_GROUP.to_string(),
                    nodes: self.shared_nodes.unwrap_or(members),
                    members: shared,
                    sharing: SharingMode::Shared,
                    flavor: None,
                },
            );
        }

        groups
    }
}
