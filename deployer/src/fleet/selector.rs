//! Tag-based partition of fleet groups into current and previous builds

use fleet_api::{FleetGroup, BUILD_ID_TAG, DEPLOY_TAG};

/// Selects the groups belonging to a deploy and splits them by build.
///
/// Groups keep the provider's enumeration order. More than one group can match
/// the current build; all of them are returned.
#[derive(Debug, Clone, Copy)]
pub struct FleetSelector<'a> {
    deploy: &'a str,
    build_id: &'a str,
}

impl<'a> FleetSelector<'a> {
    pub fn new(deploy: &'a str, build_id: &'a str) -> Self {
        Self { deploy, build_id }
    }

    /// Groups tagged with this deploy, regardless of build
    pub fn matching<'g>(&self, groups: &'g [FleetGroup]) -> Vec<&'g FleetGroup> {
        groups
            .iter()
            .filter(|g| g.tag(DEPLOY_TAG) == Some(self.deploy))
            .collect()
    }

    /// Groups created by the current build
    pub fn current<'g>(&self, groups: &'g [FleetGroup]) -> Vec<&'g FleetGroup> {
        self.partition(groups).0
    }

    /// Groups created by any other build
    pub fn previous<'g>(&self, groups: &'g [FleetGroup]) -> Vec<&'g FleetGroup> {
        self.partition(groups).1
    }

    /// `(current, previous)` in one pass
    pub fn partition<'g>(
        &self,
        groups: &'g [FleetGroup],
    ) -> (Vec<&'g FleetGroup>, Vec<&'g FleetGroup>) {
        self.matching(groups)
            .into_iter()
            .partition(|g| g.tag(BUILD_ID_TAG) == Some(self.build_id))
    }

    /// Most recently created group for this deploy
    pub fn latest<'g>(&self, groups: &'g [FleetGroup]) -> Option<&'g FleetGroup> {
        self.matching(groups)
            .into_iter()
            .max_by_key(|g| g.created_time)
    }
}
