//! Fleet selector properties

use std::collections::BTreeMap;

use proptest::prelude::*;

use fleet_api::{FleetGroup, BUILD_ID_TAG, DEPLOY_TAG};
use fleetroll::fleet::FleetSelector;

use crate::support::group;

fn tagged(index: usize, deploy: Option<&str>, build: Option<&str>) -> FleetGroup {
    let mut tags = BTreeMap::new();
    if let Some(deploy) = deploy {
        tags.insert(DEPLOY_TAG.to_string(), deploy.to_string());
    }
    if let Some(build) = build {
        tags.insert(BUILD_ID_TAG.to_string(), build.to_string());
    }
    group(&format!("group-{}", index), 1, tags)
}

fn arb_groups() -> impl Strategy<Value = Vec<FleetGroup>> {
    let deploy = prop::option::of(prop::sample::select(vec!["app", "other", ""]));
    let build = prop::option::of(prop::sample::select(vec!["abc", "111", "222"]));
    prop::collection::vec((deploy, build), 0..24).prop_map(|tags| {
        tags.into_iter()
            .enumerate()
            .map(|(i, (d, b))| tagged(i, d, b))
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_partition_is_exact(groups in arb_groups()) {
        let selector = FleetSelector::new("app", "abc");
        let (current, previous) = selector.partition(&groups);
        let matching = selector.matching(&groups);

        prop_assert_eq!(current.len() + previous.len(), matching.len());
        for g in &current {
            prop_assert_eq!(g.tag(BUILD_ID_TAG), Some("abc"));
            prop_assert!(!previous.iter().any(|p| p.name == g.name));
        }
        for g in &previous {
            prop_assert_eq!(g.tag(DEPLOY_TAG), Some("app"));
            prop_assert_ne!(g.tag(BUILD_ID_TAG), Some("abc"));
        }

        // enumeration order is kept
        let positions: Vec<usize> = current
            .iter()
            .map(|g| groups.iter().position(|x| x.name == g.name).unwrap())
            .collect();
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_four_group_scenario() {
    let groups = vec![
        tagged(1, Some("app"), Some("abc")),
        tagged(2, Some("app"), Some("111")),
        tagged(3, Some("app"), Some("222")),
        tagged(4, Some("other"), Some("abc")),
    ];
    let selector = FleetSelector::new("app", "abc");
    let names = |gs: Vec<&FleetGroup>| gs.iter().map(|g| g.name.clone()).collect::<Vec<_>>();

    assert_eq!(names(selector.current(&groups)), vec!["group-1"]);
    assert_eq!(names(selector.previous(&groups)), vec!["group-2", "group-3"]);
}
