//! Picks storage nodes for new chunk parts and replication targets.
//!
//! Selection is a smooth weighted round-robin over the registered
//! servers, weighted by free space: each round every candidate's carry
//! accumulator grows by its weight and the largest carry wins, paying the
//! total weight back. Long-run allocation ratios approach the weight
//! ratios without any server starving.

use std::collections::BTreeMap;

use sfs_types::{Labels, MediaLabel};

pub type ServerId = u64;

#[derive(Clone, Debug)]
pub struct ServerEntry {
    pub id: ServerId,
    pub label: MediaLabel,
    pub ip: u32,
    /// Free space drives the weight.
    pub weight: u64,
    pub active_replications: u32,
    pub replication_limit: u32,
}

#[derive(Clone, Debug)]
struct Candidate {
    entry: ServerEntry,
    carry: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct ChooserOptions {
    /// Refuse to place two parts of one chunk on servers sharing an IP.
    pub avoid_same_ip: bool,
}

impl Default for ChooserOptions {
    fn default() -> Self {
        Self { avoid_same_ip: true }
    }
}

pub struct ServerChooser {
    servers: BTreeMap<ServerId, Candidate>,
    options: ChooserOptions,
}

impl ServerChooser {
    pub fn new(options: ChooserOptions) -> Self {
        Self {
            servers: BTreeMap::new(),
            options,
        }
    }

    pub fn add_server(&mut self, entry: ServerEntry) {
        self.servers.insert(entry.id, Candidate { entry, carry: 0 });
    }

    pub fn remove_server(&mut self, id: ServerId) {
        self.servers.remove(&id);
    }

    pub fn update_weight(&mut self, id: ServerId, weight: u64) {
        if let Some(candidate) = self.servers.get_mut(&id) {
            candidate.entry.weight = weight;
        }
    }

    pub fn note_replication_started(&mut self, id: ServerId) {
        if let Some(candidate) = self.servers.get_mut(&id) {
            candidate.entry.active_replications += 1;
        }
    }

    pub fn note_replication_finished(&mut self, id: ServerId) {
        if let Some(candidate) = self.servers.get_mut(&id) {
            candidate.entry.active_replications =
                candidate.entry.active_replications.saturating_sub(1);
        }
    }

    fn is_eligible(&self, candidate: &Candidate, required: &MediaLabel, used: &[ServerId]) -> bool {
        let entry = &candidate.entry;
        if !entry.label.matches(required) {
            return false;
        }
        if entry.active_replications >= entry.replication_limit {
            return false;
        }
        if used.contains(&entry.id) {
            return false;
        }
        if self.options.avoid_same_ip {
            let ip = entry.ip;
            if used
                .iter()
                .filter_map(|id| self.servers.get(id))
                .any(|other| other.entry.ip == ip)
            {
                return false;
            }
        }
        true
    }

    /// One round of the weighted round-robin among eligible servers.
    fn choose_one(&mut self, required: &MediaLabel, used: &[ServerId]) -> Option<ServerId> {
        let eligible: Vec<ServerId> = self
            .servers
            .values()
            .filter(|candidate| self.is_eligible(candidate, required, used))
            .map(|candidate| candidate.entry.id)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let mut total_weight = 0i64;
        let mut best: Option<(i64, ServerId)> = None;
        for id in &eligible {
            let candidate = self.servers.get_mut(id).unwrap();
            // a weightless server may still win eventually: floor of 1
            let weight = candidate.entry.weight.max(1) as i64;
            total_weight += weight;
            candidate.carry += weight;
            if best.map_or(true, |(carry, _)| candidate.carry > carry) {
                best = Some((candidate.carry, *id));
            }
        }
        let (_, winner) = best.unwrap();
        self.servers.get_mut(&winner).unwrap().carry -= total_weight;
        Some(winner)
    }

    /// Choose servers for a part's label multiset: explicit labels first,
    /// wildcard slots last, `used` growing along the way so one chunk
    /// never lands twice on the same server (or IP, when configured).
    pub fn choose_servers_for_labels(
        &mut self,
        labels: &Labels,
        used: &mut Vec<ServerId>,
    ) -> Vec<ServerId> {
        let mut chosen = Vec::new();
        for (label, &count) in labels.iter().filter(|(label, _)| !label.is_wildcard()) {
            for _ in 0..count {
                if let Some(id) = self.choose_one(label, used) {
                    used.push(id);
                    chosen.push(id);
                }
            }
        }
        let wildcard_count = labels.get(&MediaLabel::WILDCARD).copied().unwrap_or(0);
        for _ in 0..wildcard_count {
            if let Some(id) = self.choose_one(&MediaLabel::WILDCARD, used) {
                used.push(id);
                chosen.push(id);
            }
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: ServerId, label: &str, ip: u32, weight: u64) -> ServerEntry {
        ServerEntry {
            id,
            label: MediaLabel::new(label).unwrap(),
            ip,
            weight,
            active_replications: 0,
            replication_limit: 10,
        }
    }

    fn chooser(entries: Vec<ServerEntry>, avoid_same_ip: bool) -> ServerChooser {
        let mut chooser = ServerChooser::new(ChooserOptions { avoid_same_ip });
        for server in entries {
            chooser.add_server(server);
        }
        chooser
    }

    fn labels(entries: &[(&str, u32)]) -> Labels {
        entries
            .iter()
            .map(|(name, count)| (MediaLabel::new(name).unwrap(), *count))
            .collect()
    }

    #[test]
    fn explicit_labels_are_satisfied_first() {
        let mut chooser = chooser(
            vec![
                entry(1, "A", 1, 100),
                entry(2, "A", 2, 100),
                entry(3, "B", 3, 100),
            ],
            false,
        );
        let mut used = Vec::new();
        let chosen = chooser.choose_servers_for_labels(&labels(&[("A", 1), ("_", 1)]), &mut used);
        assert_eq!(chosen.len(), 2);
        // the first pick carries label A
        let first = chosen[0];
        assert!(first == 1 || first == 2);
        // no server repeats
        assert_ne!(chosen[0], chosen[1]);
    }

    #[test]
    fn allocation_follows_weights() {
        let mut chooser = chooser(
            vec![entry(1, "_", 1, 300), entry(2, "_", 2, 100)],
            false,
        );
        let mut counts = BTreeMap::new();
        for _ in 0..400 {
            let mut used = Vec::new();
            let chosen = chooser.choose_servers_for_labels(&labels(&[("_", 1)]), &mut used);
            *counts.entry(chosen[0]).or_insert(0u32) += 1;
        }
        // 3:1 weights give a 3:1 allocation
        assert_eq!(counts[&1], 300);
        assert_eq!(counts[&2], 100);
    }

    #[test]
    fn replication_budget_is_respected() {
        let mut chooser = chooser(vec![entry(1, "_", 1, 100), entry(2, "_", 2, 100)], false);
        for _ in 0..10 {
            chooser.note_replication_started(1);
        }
        for _ in 0..20 {
            let mut used = Vec::new();
            let chosen = chooser.choose_servers_for_labels(&labels(&[("_", 1)]), &mut used);
            assert_eq!(chosen, vec![2]);
        }
        chooser.note_replication_finished(1);
        let mut found_one = false;
        for _ in 0..4 {
            let mut used = Vec::new();
            found_one |= chooser.choose_servers_for_labels(&labels(&[("_", 1)]), &mut used) == vec![1];
        }
        assert!(found_one);
    }

    #[test]
    fn same_ip_avoidance() {
        let mut chooser = chooser(
            vec![entry(1, "_", 7, 100), entry(2, "_", 7, 100), entry(3, "_", 8, 100)],
            true,
        );
        let mut used = Vec::new();
        let chosen = chooser.choose_servers_for_labels(&labels(&[("_", 3)]), &mut used);
        // only two distinct IPs exist
        assert_eq!(chosen.len(), 2);
        let ips: Vec<u32> = chosen
            .iter()
            .map(|id| if *id == 3 { 8 } else { 7 })
            .collect();
        assert_ne!(ips[0], ips[1]);
    }

    #[test]
    fn label_mismatch_yields_nothing() {
        let mut chooser = chooser(vec![entry(1, "A", 1, 100)], false);
        let mut used = Vec::new();
        let chosen = chooser.choose_servers_for_labels(&labels(&[("B", 1)]), &mut used);
        assert!(chosen.is_empty());
        // the wildcard label on a server does not satisfy an explicit
        // requirement either
        let mut chooser = chooser_with_wildcard_server();
        let mut used = Vec::new();
        assert!(chooser
            .choose_servers_for_labels(&labels(&[("A", 1)]), &mut used)
            .is_empty());
    }

    fn chooser_with_wildcard_server() -> ServerChooser {
        chooser(vec![entry(1, "_", 1, 100)], false)
    }
}
