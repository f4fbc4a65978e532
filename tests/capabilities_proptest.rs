//! Property-based tests for capability parsing and combination.
//!
//! Checks that `CapabilitySet` partitions every advertised URI into exactly
//! one half, ignores advertisement order, and that `merge` lets the argument
//! win without touching the receiver.

use netmount::capabilities::CapabilityOrigin;
use netmount::types::QName;
use netmount::CapabilitySet;
use proptest::prelude::*;

fn module_uri(name: &str) -> String {
    format!("urn:example:{name}?module={name}&revision=2020-01-01")
}

fn plain_uri(name: &str) -> String {
    format!("urn:ietf:params:netconf:capability:{name}:1.0")
}

fn module_name(name: &str) -> QName {
    QName::with_revision(format!("urn:example:{name}"), "2020-01-01", name)
}

fn names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z][a-z0-9-]{0,11}", 0..12).prop_map(|set| set.into_iter().collect())
}

fn advertised() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    (names(), names())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_every_uri_lands_in_exactly_one_half((modules, plain) in advertised()) {
        let uris: Vec<String> = modules.iter().map(|m| module_uri(m))
            .chain(plain.iter().map(|p| plain_uri(p)))
            .collect();
        let caps = CapabilitySet::from_advertised(&uris);

        prop_assert_eq!(caps.module_caps().len(), modules.len());
        prop_assert_eq!(caps.non_module_caps().len(), plain.len());
        for module in &modules {
            prop_assert!(caps.contains_module_capability(&module_name(module)));
            prop_assert!(!caps.contains_non_module_capability(&module_uri(module)));
        }
        for name in &plain {
            prop_assert!(caps.contains_non_module_capability(&plain_uri(name)));
        }
    }

    #[test]
    fn test_advertisement_order_does_not_matter(
        uris in advertised()
            .prop_map(|(modules, plain)| {
                modules.iter().map(|m| module_uri(m))
                    .chain(plain.iter().map(|p| plain_uri(p)))
                    .collect::<Vec<_>>()
            })
            .prop_flat_map(|uris| (Just(uris.clone()), Just(uris).prop_shuffle()))
    ) {
        let (original, shuffled) = uris;
        prop_assert_eq!(
            CapabilitySet::from_advertised(&original),
            CapabilitySet::from_advertised(&shuffled)
        );
    }

    #[test]
    fn test_merge_prefers_argument_and_keeps_receiver((device, user) in (advertised(), advertised())) {
        let device_uris: Vec<String> = device.0.iter().map(|m| module_uri(m))
            .chain(device.1.iter().map(|p| plain_uri(p)))
            .collect();
        let user_uris: Vec<String> = user.0.iter().map(|m| module_uri(m))
            .chain(user.1.iter().map(|p| plain_uri(p)))
            .collect();

        let base = CapabilitySet::from_advertised(&device_uris);
        let extra = CapabilitySet::from_strings(&user_uris, CapabilityOrigin::UserDefined);
        let merged = base.merge(&extra);

        for module in &user.0 {
            prop_assert_eq!(merged.module_caps()[&module_name(module)], CapabilityOrigin::UserDefined);
        }
        for name in &device.1 {
            prop_assert!(merged.contains_non_module_capability(&plain_uri(name)));
            prop_assert_eq!(base.non_module_caps()[&plain_uri(name)], CapabilityOrigin::DeviceAdvertised);
        }
        for name in &user.1 {
            prop_assert_eq!(merged.non_module_caps()[&plain_uri(name)], CapabilityOrigin::UserDefined);
        }
    }
}
