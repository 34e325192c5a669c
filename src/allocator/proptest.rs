//! Property-Based Tests for the Port-Slot Allocator
//!
//! # Test Properties
//!
//! 1. **Mapping Inverse**: slot_for_ports(ports_for_slot(s)) = s
//! 2. **Alignment**: any range off a slot boundary is rejected
//! 3. **Conservation**: used slots never exceed ips × slots_per_ip
//! 4. **Exclusivity**: no (ip, port) pair is handed to two targets
//! 5. **Stability**: feeding an allocation back as `previous` reproduces it

#![cfg(test)]

use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;

use super::{allocate, SlotLayout, Target, TOTAL_PORTS};
use crate::crd::IpFamily;

// =============================================================================
// Property Strategies
// =============================================================================

/// Power-of-two slot sizes from 1 to 32768 ports.
fn ports_per_target_strategy() -> impl Strategy<Value = u32> {
    (0u32..=15).prop_map(|shift| 1u32 << shift)
}

/// Large slot sizes so small pools fill up quickly.
fn large_ports_per_target_strategy() -> impl Strategy<Value = u32> {
    (12u32..=15).prop_map(|shift| 1u32 << shift)
}

fn pool_strategy() -> impl Strategy<Value = Vec<IpAddr>> {
    (0usize..=3, 0usize..=2).prop_map(|(v4, v6)| {
        let mut pool: Vec<IpAddr> = (0..v4)
            .map(|i| IpAddr::V4(Ipv4Addr::new(203, 0, 113, i as u8 + 1)))
            .collect();
        pool.extend((0..v6).map(|i| IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i as u16 + 1))));
        pool
    })
}

fn targets_strategy() -> impl Strategy<Value = Vec<Target>> {
    prop::collection::vec((any::<bool>(), any::<bool>()), 0..40).prop_map(|flags| {
        flags
            .into_iter()
            .enumerate()
            .map(|(i, (v4, v6))| {
                let mut families = BTreeSet::new();
                if v4 || !v6 {
                    families.insert(IpFamily::IPv4);
                }
                if v6 {
                    families.insert(IpFamily::IPv6);
                }
                Target {
                    uid: format!("uid-{:03}", i),
                    name: format!("nic-{}", i),
                    families,
                }
            })
            .collect()
    })
}

// =============================================================================
// Mapping Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_slot_mapping_inverts(ports_per_target in ports_per_target_strategy(), seed in any::<u32>()) {
        let layout = SlotLayout::new(ports_per_target).unwrap();
        let slot = seed % layout.slots_per_ip();

        let (port, end_port) = layout.ports_for_slot(slot).unwrap();
        prop_assert_eq!(layout.slot_for_ports(port, end_port), Some(slot));
        prop_assert_eq!(u32::from(end_port) - u32::from(port) + 1, ports_per_target);
    }

    #[test]
    fn prop_misaligned_ranges_rejected(
        ports_per_target in ports_per_target_strategy(),
        port in any::<u16>(),
        end_port in any::<u16>(),
    ) {
        let layout = SlotLayout::new(ports_per_target).unwrap();
        if let Some(slot) = layout.slot_for_ports(port, end_port) {
            prop_assert_eq!(layout.ports_for_slot(slot), Some((port, end_port)));
        }
    }

    #[test]
    fn prop_slots_fit_port_range(ports_per_target in ports_per_target_strategy()) {
        let layout = SlotLayout::new(ports_per_target).unwrap();
        prop_assert!(layout.slots_per_ip() * ports_per_target <= TOTAL_PORTS);
        prop_assert!(layout.ports_for_slot(layout.slots_per_ip()).is_none());
    }
}

// =============================================================================
// Allocation Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_allocation_conserves_slots(
        ports_per_target in large_ports_per_target_strategy(),
        pool in pool_strategy(),
        targets in targets_strategy(),
    ) {
        let layout = SlotLayout::new(ports_per_target).unwrap();
        let allocation = allocate(&layout, &pool, &targets, &[]).unwrap();

        let capacity = pool.len() as u32 * layout.slots_per_ip();
        prop_assert!(allocation.slots_used <= capacity);
        prop_assert_eq!(allocation.ports_used, allocation.slots_used * ports_per_target);

        let mut seen = HashSet::new();
        let mut assignments = 0u32;
        for destination in &allocation.destinations {
            let mut families = HashSet::new();
            for entry in &destination.ips {
                prop_assert!(seen.insert((entry.ip.clone(), entry.port)), "slot handed out twice");
                let ip: IpAddr = entry.ip.parse().unwrap();
                prop_assert!(families.insert(IpFamily::of(&ip)), "family assigned twice");
                prop_assert!(layout.slot_for_ports(entry.port, entry.end_port).is_some());
                assignments += 1;
            }
        }
        prop_assert_eq!(assignments, allocation.slots_used);
        prop_assert_eq!(
            allocation.destinations.len() + allocation.dropped.len(),
            targets.len()
        );
    }

    #[test]
    fn prop_destinations_sorted_by_uid(
        pool in pool_strategy(),
        targets in targets_strategy(),
    ) {
        let layout = SlotLayout::new(2048).unwrap();
        let allocation = allocate(&layout, &pool, &targets, &[]).unwrap();

        let uids: Vec<&str> = allocation.destinations.iter().map(|d| d.uid.as_str()).collect();
        let mut sorted = uids.clone();
        sorted.sort();
        prop_assert_eq!(uids, sorted);
    }

    #[test]
    fn prop_reallocation_is_stable(
        ports_per_target in large_ports_per_target_strategy(),
        pool in pool_strategy(),
        targets in targets_strategy(),
    ) {
        let layout = SlotLayout::new(ports_per_target).unwrap();
        let first = allocate(&layout, &pool, &targets, &[]).unwrap();
        let second = allocate(&layout, &pool, &targets, &first.destinations).unwrap();
        prop_assert_eq!(first, second);
    }
}
