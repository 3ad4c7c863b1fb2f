// ── Ingress-rule diffing ──
//
// Pure comparison of two rule sets, producing the minimal open/close
// operations that take the current set to the wanted one. Rules are first
// folded into a per-port-range CIDR map, so overlapping rules for the same
// range merge before comparison.

use std::collections::{BTreeMap, BTreeSet};

use portward_api::{IngressRule, PortRange};

/// CIDR meaning "reachable from anywhere". A rule with no source CIDRs is
/// read as this.
pub const ALL_SOURCES: &str = "0.0.0.0/0";

/// Compute the rules to open and to close to bring `current` into
/// agreement with `wanted`.
///
/// Both outputs are sorted by `(protocol, from_port, to_port, cidrs)` so
/// cloud calls and their logs are deterministic.
pub fn diff_rules(
    current: &[IngressRule],
    wanted: &[IngressRule],
) -> (Vec<IngressRule>, Vec<IngressRule>) {
    let current_cidrs = port_cidrs(current);
    let wanted_cidrs = port_cidrs(wanted);

    let mut to_open = Vec::new();
    let mut to_close = Vec::new();

    for (port_range, wanted) in &wanted_cidrs {
        match current_cidrs.get(port_range) {
            // The whole port range is new: open it with the full wanted set.
            None => to_open.push(IngressRule::new(*port_range, wanted.iter().cloned())),
            Some(current) => {
                let open: Vec<_> = wanted.difference(current).cloned().collect();
                if !open.is_empty() {
                    to_open.push(IngressRule::new(*port_range, open));
                }
                let close: Vec<_> = current.difference(wanted).cloned().collect();
                if !close.is_empty() {
                    to_close.push(IngressRule::new(*port_range, close));
                }
            }
        }
    }

    for (port_range, current) in &current_cidrs {
        // The whole port range is gone: close it with the full current set.
        if !wanted_cidrs.contains_key(port_range) {
            to_close.push(IngressRule::new(*port_range, current.iter().cloned()));
        }
    }

    to_open.sort();
    to_close.sort();
    (to_open, to_close)
}

/// Fold rules into a map of port range to union of source CIDRs, reading
/// an empty CIDR set as [`ALL_SOURCES`].
fn port_cidrs(rules: &[IngressRule]) -> BTreeMap<PortRange, BTreeSet<String>> {
    let mut result: BTreeMap<PortRange, BTreeSet<String>> = BTreeMap::new();
    for rule in rules {
        let cidrs = result.entry(rule.port_range).or_default();
        if rule.source_cidrs.is_empty() {
            cidrs.insert(ALL_SOURCES.to_string());
        } else {
            cidrs.extend(rule.source_cidrs.iter().cloned());
        }
    }
    result
}
