// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Actor placement.
//!
//! Given the live peer set and the actor specs, produce an assignment of
//! every (spec, replica-slot) to a peer such that replicas spread across
//! peers before doubling up, an instance already running somewhere stays
//! put while its peer is live, and each topic partition of a spec's inputs
//! is owned by exactly one of its instances.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::actor::ActorDef;

use super::{Health, Peer};

/// Setting key carrying an instance's replica slot.
pub const SETTING_SLOT: &str = "slot";
/// Setting key carrying an instance's topic partition slices, JSON-encoded.
pub const SETTING_PARTS: &str = "parts";

/// A scheduling unit: an actor definition, how many replicas to run, and
/// which topics its replicas divide between themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSpec {
    pub def: ActorDef,
    pub replicas: usize,
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl ActorSpec {
    pub fn new(def: ActorDef, replicas: usize) -> ActorSpec {
        ActorSpec {
            def,
            replicas,
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> ActorSpec {
        self.inputs = inputs;
        self
    }

    pub fn id(&self) -> String {
        self.def.id()
    }
}

/// One placed replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Concrete definition for this replica; its name carries the slot and
    /// its settings carry the slot and partition slices.
    pub def: ActorDef,
    /// Owning spec id.
    pub spec: String,
    pub slot: usize,
    pub topic_slices: BTreeMap<String, Vec<i32>>,
}

/// Assignment of instances to peers.
pub type PeerSched = BTreeMap<String, Vec<Instance>>;

/// Compute a schedule. `prev` makes the result stable: an instance keeps its
/// previous peer whenever that peer is still live and the slot still exists.
pub fn peer_sched(
    peers: &BTreeMap<String, Peer>,
    specs: &[ActorSpec],
    parts: &HashMap<String, Vec<i32>>,
    prev: Option<&PeerSched>,
) -> PeerSched {
    let live: Vec<&str> = peers
        .values()
        .filter(|p| p.health == Health::Active)
        .map(|p| p.name.as_str())
        .collect();

    let mut sched = PeerSched::new();
    if live.is_empty() {
        return sched;
    }

    // Where did each (spec, slot) live before, if anywhere still live?
    let mut kept: HashMap<(String, usize), &str> = HashMap::new();
    if let Some(prev) = prev {
        for (peer, instances) in prev {
            if !live.contains(&peer.as_str()) {
                continue;
            }
            for inst in instances {
                kept.insert((inst.spec.clone(), inst.slot), peer.as_str());
            }
        }
    }

    let mut load: BTreeMap<&str, usize> = live.iter().map(|p| (*p, 0usize)).collect();
    for ((spec, slot), peer) in &kept {
        // Only count slots that still exist under the current specs.
        if specs
            .iter()
            .any(|s| s.id() == *spec && *slot < s.replicas)
        {
            *load.get_mut(peer).expect("kept peer is live") += 1;
        }
    }

    let mut ordered: Vec<&ActorSpec> = specs.iter().collect();
    ordered.sort_by_key(|s| s.id());

    for spec in ordered {
        let spec_id = spec.id();
        for slot in 0..spec.replicas {
            let peer = match kept.get(&(spec_id.clone(), slot)) {
                Some(peer) => *peer,
                None => {
                    let peer = *load
                        .iter()
                        .min_by_key(|(name, count)| (**count, **name))
                        .map(|(name, _)| name)
                        .expect("at least one live peer");
                    *load.get_mut(peer).expect("peer is live") += 1;
                    peer
                }
            };

            let topic_slices = slice_topics(spec, slot, parts);
            let def = instance_def(spec, slot, &topic_slices);
            sched.entry(peer.to_string()).or_default().push(Instance {
                def,
                spec: spec_id.clone(),
                slot,
                topic_slices,
            });
        }
    }

    sched
}

/// Slot `i` of a spec with `n` replicas owns every partition whose index in
/// the topic's partition list is ≡ i (mod n).
fn slice_topics(
    spec: &ActorSpec,
    slot: usize,
    parts: &HashMap<String, Vec<i32>>,
) -> BTreeMap<String, Vec<i32>> {
    let mut slices = BTreeMap::new();
    for topic in &spec.inputs {
        let Some(topic_parts) = parts.get(topic) else {
            continue;
        };
        let slice: Vec<i32> = topic_parts
            .iter()
            .enumerate()
            .filter(|(i, _)| i % spec.replicas == slot)
            .map(|(_, p)| *p)
            .collect();
        slices.insert(topic.clone(), slice);
    }
    slices
}

fn instance_def(
    spec: &ActorSpec,
    slot: usize,
    topic_slices: &BTreeMap<String, Vec<i32>>,
) -> ActorDef {
    let mut def = spec.def.clone();
    def.name = format!("{}-{}", def.name, slot);
    def.settings
        .insert(SETTING_SLOT.to_string(), slot.to_string());
    if !topic_slices.is_empty() {
        if let Ok(json) = serde_json::to_string(topic_slices) {
            def.settings.insert(SETTING_PARTS.to_string(), json);
        }
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;

    fn active_peers(names: &[&str]) -> BTreeMap<String, Peer> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Peer {
                        name: n.to_string(),
                        rank: super::super::Rank::Follower,
                        health: Health::Active,
                        last_seen_unix: utils::unix_nanos(),
                    },
                )
            })
            .collect()
    }

    fn test_specs() -> Vec<ActorSpec> {
        let topics = vec!["topic1".to_string(), "topic2".to_string()];
        vec![
            ActorSpec::new(ActorDef::new("f1", "f1"), 11).with_inputs(topics.clone()),
            ActorSpec::new(ActorDef::new("f2", "f2"), 7).with_inputs(topics),
        ]
    }

    fn test_parts() -> HashMap<String, Vec<i32>> {
        let mut parts = HashMap::new();
        parts.insert("topic1".to_string(), (0..12).collect());
        parts.insert("topic2".to_string(), (0..15).collect());
        parts
    }

    #[test]
    fn test_total_assigned_count() {
        let peers = active_peers(&["host1-123-0", "host1-345-0", "host1-678-0"]);
        let sched = peer_sched(&peers, &test_specs(), &test_parts(), None);

        let total: usize = sched.values().map(|v| v.len()).sum();
        assert_eq!(total, 18);
    }

    #[test]
    fn test_replicas_spread_before_doubling() {
        let peers = active_peers(&["host1-123-0", "host1-345-0", "host1-678-0"]);
        let sched = peer_sched(&peers, &test_specs(), &test_parts(), None);

        let counts: Vec<usize> = sched.values().map(|v| v.len()).collect();
        let max = counts.iter().max().unwrap();
        let min = counts.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced schedule: {:?}", counts);
    }

    #[test]
    fn test_every_partition_owned_exactly_once() {
        let peers = active_peers(&["host1-123-0", "host1-345-0", "host1-678-0"]);
        let specs = test_specs();
        let parts = test_parts();
        let sched = peer_sched(&peers, &specs, &parts, None);

        // Per spec and topic, collect every assigned partition.
        for spec in &specs {
            for topic in &spec.inputs {
                let mut seen: Vec<i32> = Vec::new();
                for instances in sched.values() {
                    for inst in instances.iter().filter(|i| i.spec == spec.id()) {
                        seen.extend(inst.topic_slices.get(topic).unwrap());
                    }
                }
                seen.sort_unstable();
                let mut expected = parts.get(topic).unwrap().clone();
                expected.sort_unstable();
                assert_eq!(seen, expected, "spec {} topic {}", spec.id(), topic);
            }
        }
    }

    #[test]
    fn test_stable_under_membership_change() {
        let specs = test_specs();
        let parts = test_parts();
        let peers3 = active_peers(&["host1-123-0", "host1-345-0", "host1-678-0"]);
        let first = peer_sched(&peers3, &specs, &parts, None);

        // One peer leaves; survivors keep everything they had.
        let peers2 = active_peers(&["host1-123-0", "host1-345-0"]);
        let second = peer_sched(&peers2, &specs, &parts, Some(&first));

        for peer in ["host1-123-0", "host1-345-0"] {
            let before: Vec<(String, usize)> = first
                .get(peer)
                .unwrap()
                .iter()
                .map(|i| (i.spec.clone(), i.slot))
                .collect();
            let after: Vec<(String, usize)> = second
                .get(peer)
                .unwrap()
                .iter()
                .map(|i| (i.spec.clone(), i.slot))
                .collect();
            for slot in &before {
                assert!(after.contains(slot), "{:?} moved off {}", slot, peer);
            }
        }

        let total: usize = second.values().map(|v| v.len()).sum();
        assert_eq!(total, 18);
    }

    #[test]
    fn test_no_live_peers_yields_empty_schedule() {
        let peers = BTreeMap::new();
        let sched = peer_sched(&peers, &test_specs(), &test_parts(), None);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_instance_def_carries_slot_and_parts() {
        let peers = active_peers(&["host1-123-0"]);
        let specs = vec![ActorSpec::new(ActorDef::new("f1", "f1"), 2)
            .with_inputs(vec!["topic1".to_string()])];
        let mut parts = HashMap::new();
        parts.insert("topic1".to_string(), vec![0, 1, 2, 3]);

        let sched = peer_sched(&peers, &specs, &parts, None);
        let instances = sched.get("host1-123-0").unwrap();
        assert_eq!(instances.len(), 2);

        for inst in instances {
            assert_eq!(inst.def.name, format!("f1-{}", inst.slot));
            assert_eq!(
                inst.def.settings.get(SETTING_SLOT).unwrap(),
                &inst.slot.to_string()
            );
            let parts_json = inst.def.settings.get(SETTING_PARTS).unwrap();
            let decoded: BTreeMap<String, Vec<i32>> = serde_json::from_str(parts_json).unwrap();
            assert_eq!(decoded, inst.topic_slices);
        }

        // Interleaved slices: slot 0 gets 0,2 and slot 1 gets 1,3.
        let slot0 = instances.iter().find(|i| i.slot == 0).unwrap();
        assert_eq!(slot0.topic_slices.get("topic1").unwrap(), &vec![0, 2]);
        let slot1 = instances.iter().find(|i| i.slot == 1).unwrap();
        assert_eq!(slot1.topic_slices.get("topic1").unwrap(), &vec![1, 3]);
    }
}
