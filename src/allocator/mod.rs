//! NAT Port-Slot Allocator
//!
//! Each public IP of a NAT gateway exposes the ephemeral port range
//! 1024..=65535, cut into fixed-size slots of `ports_per_target` ports. A
//! target (network interface) receives one slot per IP family it needs.
//!
//! Allocation is stateless per call: bitmaps are rebuilt from the pool, valid
//! previous assignments are kept, and missing ones are filled first-fit.
//!
//! ```text
//! slot k  <->  [1024 + k * ports_per_target, 1024 + (k + 1) * ports_per_target - 1]
//! ```

mod bitset;
#[cfg(test)]
mod proptest;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::crd::{parse_ip, IpFamily, NatDestination, NatDestinationIp};
use crate::error::{Error, Result};

pub use bitset::SlotBitmap;

/// First port handed out to targets.
pub const MIN_PORT: u16 = 1024;
/// Last port handed out to targets.
pub const MAX_PORT: u16 = 65535;
/// Size of the ephemeral port range per IP.
pub const TOTAL_PORTS: u32 = (MAX_PORT as u32) - (MIN_PORT as u32) + 1;

// =============================================================================
// Slot Layout
// =============================================================================

/// Mapping between slot indexes and port ranges for one slot size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    ports_per_target: u32,
    slots_per_ip: u32,
}

impl SlotLayout {
    /// Layout for `ports_per_target`, which must be a power of two no larger
    /// than the port range.
    pub fn new(ports_per_target: u32) -> Result<Self> {
        if !ports_per_target.is_power_of_two() || ports_per_target > TOTAL_PORTS {
            return Err(Error::Validation(format!(
                "ports per network interface must be a power of two between 1 and {}, got {}",
                TOTAL_PORTS, ports_per_target
            )));
        }
        Ok(Self {
            ports_per_target,
            slots_per_ip: TOTAL_PORTS / ports_per_target,
        })
    }

    pub fn ports_per_target(&self) -> u32 {
        self.ports_per_target
    }

    pub fn slots_per_ip(&self) -> u32 {
        self.slots_per_ip
    }

    /// Port range `(port, end_port)` of `slot`.
    pub fn ports_for_slot(&self, slot: u32) -> Option<(u16, u16)> {
        if slot >= self.slots_per_ip {
            return None;
        }
        let port = MIN_PORT as u32 + slot * self.ports_per_target;
        let end_port = port + self.ports_per_target - 1;
        Some((u16::try_from(port).ok()?, u16::try_from(end_port).ok()?))
    }

    /// Slot of the range `(port, end_port)`; `None` unless it is exactly one
    /// slot-aligned range.
    pub fn slot_for_ports(&self, port: u16, end_port: u16) -> Option<u32> {
        let offset = u32::from(port).checked_sub(MIN_PORT as u32)?;
        if offset % self.ports_per_target != 0 {
            return None;
        }
        if u32::from(end_port) != u32::from(port) + self.ports_per_target - 1 {
            return None;
        }
        let slot = offset / self.ports_per_target;
        (slot < self.slots_per_ip).then_some(slot)
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// A network interface that needs port ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub uid: String,
    pub name: String,
    /// Families needing one slot each.
    pub families: BTreeSet<IpFamily>,
}

/// Result of one allocator call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Destinations sorted by target UID.
    pub destinations: Vec<NatDestination>,
    pub slots_used: u32,
    pub ports_used: u32,
    /// Names of targets that got no slot at all.
    pub dropped: Vec<String>,
}

struct PoolEntry {
    ip: IpAddr,
    slots: SlotBitmap,
}

/// Compute port ranges for `targets` from `pool`, keeping valid assignments
/// found in `previous`.
///
/// Previous destinations are re-validated in target UID order, so when two
/// destinations claim the same slot the lower UID keeps it.
pub fn allocate(
    layout: &SlotLayout,
    pool: &[IpAddr],
    targets: &[Target],
    previous: &[NatDestination],
) -> Result<Allocation> {
    let mut entries: Vec<PoolEntry> = Vec::with_capacity(pool.len());
    let mut by_ip: HashMap<IpAddr, usize> = HashMap::new();
    for ip in pool {
        if by_ip.contains_key(ip) {
            continue;
        }
        by_ip.insert(*ip, entries.len());
        entries.push(PoolEntry {
            ip: *ip,
            slots: SlotBitmap::new(layout.slots_per_ip()),
        });
    }

    let targets: BTreeMap<&str, &Target> = targets.iter().map(|t| (t.uid.as_str(), t)).collect();
    let mut assigned: BTreeMap<&str, BTreeMap<IpFamily, NatDestinationIp>> = BTreeMap::new();

    // Reuse pass.
    let mut previous: Vec<&NatDestination> = previous.iter().collect();
    previous.sort_by(|a, b| a.uid.cmp(&b.uid));

    for destination in previous {
        let Some((&uid, &target)) = targets.get_key_value(destination.uid.as_str()) else {
            continue;
        };

        for entry in &destination.ips {
            let Some(ip) = parse_ip(&entry.ip) else {
                debug!(nic = %target.name, ip = %entry.ip, "Dropping unparsable assignment");
                continue;
            };
            let family = IpFamily::of(&ip);
            let Some(&index) = by_ip.get(&ip) else {
                debug!(nic = %target.name, ip = %ip, "Dropping assignment for IP no longer in pool");
                continue;
            };
            if !target.families.contains(&family) {
                continue;
            }
            let families = assigned.entry(uid).or_default();
            if families.contains_key(&family) {
                debug!(nic = %target.name, family = %family, "Dropping duplicate family assignment");
                continue;
            }
            let Some(slot) = layout.slot_for_ports(entry.port, entry.end_port) else {
                debug!(nic = %target.name, port = entry.port, end_port = entry.end_port, "Dropping misaligned assignment");
                continue;
            };
            if !entries[index].slots.set(slot) {
                debug!(nic = %target.name, ip = %ip, slot, "Dropping assignment for slot already taken");
                continue;
            }
            families.insert(
                family,
                NatDestinationIp {
                    ip: ip.to_string(),
                    port: entry.port,
                    end_port: entry.end_port,
                },
            );
        }
    }

    // Allocation pass.
    for (&uid, &target) in &targets {
        for family in &target.families {
            if assigned.get(uid).is_some_and(|f| f.contains_key(family)) {
                continue;
            }

            let free = entries
                .iter_mut()
                .filter(|e| IpFamily::of(&e.ip) == *family)
                .find_map(|e| e.slots.first_free().map(|slot| (e, slot)));
            let Some((entry, slot)) = free else {
                continue;
            };

            let (port, end_port) = layout.ports_for_slot(slot).ok_or_else(|| {
                Error::Invariant(format!("free slot {} has no port range", slot))
            })?;
            if layout.slot_for_ports(port, end_port) != Some(slot) {
                return Err(Error::Invariant(format!(
                    "slot {} maps to ports {}-{} which do not map back",
                    slot, port, end_port
                )));
            }
            entry.slots.set(slot);

            assigned.entry(uid).or_default().insert(
                *family,
                NatDestinationIp {
                    ip: entry.ip.to_string(),
                    port,
                    end_port,
                },
            );
        }
    }

    let mut allocation = Allocation::default();
    for (&uid, &target) in &targets {
        match assigned.remove(uid) {
            Some(families) if !families.is_empty() => {
                allocation.destinations.push(NatDestination {
                    uid: uid.to_string(),
                    name: target.name.clone(),
                    ips: families.into_values().collect(),
                });
            }
            _ => {
                warn!(nic = %target.name, "No free port range for network interface");
                allocation.dropped.push(target.name.clone());
            }
        }
    }

    allocation.slots_used = entries.iter().map(|e| e.slots.used()).sum();
    allocation.ports_used = allocation.slots_used * layout.ports_per_target();
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn target(uid: &str, families: &[IpFamily]) -> Target {
        Target {
            uid: uid.into(),
            name: format!("nic-{}", uid),
            families: families.iter().copied().collect(),
        }
    }

    fn v4(uid: &str) -> Target {
        target(uid, &[IpFamily::IPv4])
    }

    // =========================================================================
    // Slot Layout
    // =========================================================================

    #[test]
    fn test_layout_rejects_non_power_of_two() {
        assert_matches!(SlotLayout::new(0), Err(Error::Validation(_)));
        assert_matches!(SlotLayout::new(3000), Err(Error::Validation(_)));
        assert_matches!(SlotLayout::new(65536), Err(Error::Validation(_)));
        assert!(SlotLayout::new(2048).is_ok());
    }

    #[test]
    fn test_layout_slot_counts() {
        assert_eq!(TOTAL_PORTS, 64512);
        assert_eq!(SlotLayout::new(2).unwrap().slots_per_ip(), 32256);
        assert_eq!(SlotLayout::new(2048).unwrap().slots_per_ip(), 31);
        assert_eq!(SlotLayout::new(1).unwrap().slots_per_ip(), 64512);
    }

    #[test]
    fn test_ports_for_slot() {
        let layout = SlotLayout::new(2048).unwrap();
        assert_eq!(layout.ports_for_slot(0), Some((1024, 3071)));
        assert_eq!(layout.ports_for_slot(30), Some((62464, 64511)));
        assert_eq!(layout.ports_for_slot(31), None);

        let layout = SlotLayout::new(1).unwrap();
        assert_eq!(layout.ports_for_slot(64511), Some((65535, 65535)));
    }

    #[test]
    fn test_slot_for_ports_rejects_misaligned() {
        let layout = SlotLayout::new(2048).unwrap();
        assert_eq!(layout.slot_for_ports(3072, 5119), Some(1));
        assert_eq!(layout.slot_for_ports(3073, 5120), None);
        assert_eq!(layout.slot_for_ports(3072, 5120), None);
        assert_eq!(layout.slot_for_ports(1000, 3047), None);
        assert_eq!(layout.slot_for_ports(64512, 65535), None);
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    #[test]
    fn test_two_targets_one_ip() {
        let layout = SlotLayout::new(2).unwrap();
        let pool = [ip("203.0.113.1")];

        let allocation = allocate(&layout, &pool, &[v4("b"), v4("a")], &[]).unwrap();

        assert_eq!(allocation.ports_used, 4);
        assert_eq!(allocation.destinations.len(), 2);
        assert_eq!(allocation.destinations[0].uid, "a");
        assert_eq!(allocation.destinations[0].ips[0].port, 1024);
        assert_eq!(allocation.destinations[0].ips[0].end_port, 1025);
        assert_eq!(allocation.destinations[1].ips[0].port, 1026);
    }

    #[test]
    fn test_previous_assignment_kept() {
        let layout = SlotLayout::new(2).unwrap();
        let pool = [ip("203.0.113.1")];
        let previous = vec![NatDestination {
            uid: "b".into(),
            name: "nic-b".into(),
            ips: vec![NatDestinationIp {
                ip: "203.0.113.1".into(),
                port: 1030,
                end_port: 1031,
            }],
        }];

        let allocation = allocate(&layout, &pool, &[v4("a"), v4("b")], &previous).unwrap();
        assert_eq!(allocation.destinations[1].ips[0].port, 1030);
        assert_eq!(allocation.destinations[0].ips[0].port, 1024);
    }

    #[test]
    fn test_invalid_previous_assignments_dropped() {
        let layout = SlotLayout::new(2).unwrap();
        let pool = [ip("203.0.113.1")];
        let previous = vec![
            NatDestination {
                uid: "a".into(),
                name: "nic-a".into(),
                ips: vec![
                    NatDestinationIp {
                        ip: "198.51.100.9".into(),
                        port: 1024,
                        end_port: 1025,
                    },
                    NatDestinationIp {
                        ip: "203.0.113.1".into(),
                        port: 1031,
                        end_port: 1032,
                    },
                ],
            },
            NatDestination {
                uid: "gone".into(),
                name: "nic-gone".into(),
                ips: vec![NatDestinationIp {
                    ip: "203.0.113.1".into(),
                    port: 1024,
                    end_port: 1025,
                }],
            },
        ];

        let allocation = allocate(&layout, &pool, &[v4("a")], &previous).unwrap();
        assert_eq!(allocation.destinations.len(), 1);
        assert_eq!(allocation.destinations[0].ips.len(), 1);
        assert_eq!(allocation.destinations[0].ips[0].port, 1024);
        assert_eq!(allocation.ports_used, 2);
    }

    #[test]
    fn test_slot_conflict_lower_uid_wins() {
        let layout = SlotLayout::new(2).unwrap();
        let pool = [ip("203.0.113.1")];
        let same_slot = |uid: &str| NatDestination {
            uid: uid.into(),
            name: format!("nic-{}", uid),
            ips: vec![NatDestinationIp {
                ip: "203.0.113.1".into(),
                port: 1100,
                end_port: 1101,
            }],
        };

        let allocation = allocate(
            &layout,
            &pool,
            &[v4("a"), v4("b")],
            &[same_slot("b"), same_slot("a")],
        )
        .unwrap();
        assert_eq!(allocation.destinations[0].uid, "a");
        assert_eq!(allocation.destinations[0].ips[0].port, 1100);
        assert_eq!(allocation.destinations[1].ips[0].port, 1024);
    }

    #[test]
    fn test_full_gateway_drops_targets() {
        let layout = SlotLayout::new(32768).unwrap();
        assert_eq!(layout.slots_per_ip(), 1);
        let pool = [ip("203.0.113.1")];

        let allocation = allocate(&layout, &pool, &[v4("a"), v4("b")], &[]).unwrap();
        assert_eq!(allocation.destinations.len(), 1);
        assert_eq!(allocation.dropped, vec!["nic-b".to_string()]);
        assert_eq!(allocation.ports_used, 32768);
    }

    #[test]
    fn test_dual_stack_target() {
        let layout = SlotLayout::new(1024).unwrap();
        let pool = [ip("2001:db8::1"), ip("203.0.113.1")];

        let allocation = allocate(
            &layout,
            &pool,
            &[target("a", &[IpFamily::IPv4, IpFamily::IPv6])],
            &[],
        )
        .unwrap();
        let ips = &allocation.destinations[0].ips;
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0].ip, "203.0.113.1");
        assert_eq!(ips[1].ip, "2001:db8::1");
        assert_eq!(allocation.ports_used, 2048);
    }

    #[test]
    fn test_first_fit_exhausts_ip_in_pool_order() {
        let layout = SlotLayout::new(32768).unwrap();
        let pool = [ip("203.0.113.2"), ip("203.0.113.1")];

        let allocation = allocate(&layout, &pool, &[v4("a"), v4("b")], &[]).unwrap();
        assert_eq!(allocation.destinations[0].ips[0].ip, "203.0.113.2");
        assert_eq!(allocation.destinations[1].ips[0].ip, "203.0.113.1");
    }

    #[test]
    fn test_target_without_family_in_pool_dropped() {
        let layout = SlotLayout::new(2).unwrap();
        let pool = [ip("203.0.113.1")];

        let allocation =
            allocate(&layout, &pool, &[target("a", &[IpFamily::IPv6])], &[]).unwrap();
        assert!(allocation.destinations.is_empty());
        assert_eq!(allocation.dropped, vec!["nic-a".to_string()]);
        assert_eq!(allocation.ports_used, 0);
    }
}
