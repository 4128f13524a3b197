// src/core/topology/parse.rs

//! Parsing of the discovery command replies: `SENTINEL MASTERS`/`SLAVES`
//! property maps, `CLUSTER NODES` records and `CLUSTER SLOTS` ranges.
//!
//! Parse failures never propagate: the holder drops the response and retries
//! on the next tick.

use crate::core::keyshard::NUM_SLOTS;
use crate::core::reply::ReplyData;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// One master or replica record from a sentinel reply, reduced to the fields
/// the topology needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelInstance {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl SentinelInstance {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Converts a sentinel reply (array of flat key/value arrays) into property
/// maps. Malformed entries are skipped.
pub fn parse_property_maps(data: &ReplyData) -> Vec<HashMap<String, String>> {
    let Some(entries) = data.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let fields = entry.as_array()?;
            let mut properties = HashMap::new();
            for pair in fields.chunks(2) {
                if let [key, value] = pair {
                    properties.insert(key.as_text()?, value.as_text()?);
                }
            }
            Some(properties)
        })
        .collect()
}

/// Whether a sentinel-reported node is usable: not down, not disconnected,
/// and for replicas with a healthy master link and non-zero priority.
pub fn sentinel_node_is_active(properties: &HashMap<String, String>) -> bool {
    let flags: HashSet<&str> = properties
        .get("flags")
        .map(|f| f.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let master = flags.contains("master");
    let slave = flags.contains("slave");
    if !master && !slave {
        return false;
    }
    if flags.contains("s_down") || flags.contains("o_down") || flags.contains("disconnected") {
        return false;
    }
    if slave
        && properties.get("master-link-status").map(String::as_str) != Some("ok")
    {
        return false;
    }
    if slave && properties.get("slave-priority").map(String::as_str) == Some("0") {
        return false;
    }
    true
}

/// Extracts active instances from a parsed sentinel reply. `name_override`
/// tags `SENTINEL SLAVES` entries with their master's shard name.
pub fn parse_sentinel_instances(
    data: &ReplyData,
    name_override: Option<&str>,
) -> Vec<SentinelInstance> {
    parse_property_maps(data)
        .into_iter()
        .filter(sentinel_node_is_active)
        .filter_map(|properties| {
            let name = match name_override {
                Some(name) => name.to_string(),
                None => properties.get("name")?.clone(),
            };
            let host = properties.get("ip")?.clone();
            let port = properties.get("port")?.parse().ok()?;
            Some(SentinelInstance { name, host, port })
        })
        .collect()
}

/// Extracts the "host:port" set from a `CLUSTER NODES` reply: one record per
/// line, second whitespace field is `host:port@cport`.
pub fn parse_cluster_nodes(data: &ReplyData) -> Option<BTreeSet<String>> {
    let text = data.as_text()?;
    let mut result = BTreeSet::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let address_field = line.split_whitespace().nth(1)?;
        let host_port = address_field.split('@').next()?;
        // A record without a port is unusable; reject the whole response.
        host_port.rfind(':')?;
        result.insert(host_port.to_string());
    }
    Some(result)
}

/// One shard of a parsed `CLUSTER SLOTS` reply.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClusterShardInfo {
    pub master: String,
    pub replicas: BTreeSet<String>,
    pub slot_ranges: Vec<(u16, u16)>,
}

/// The aggregated view of one `CLUSTER SLOTS` response: shards sorted by
/// master address, ranges merged per shard.
pub type ClusterShardInfos = Vec<ClusterShardInfo>;

fn parse_slots_node(node: &ReplyData) -> Option<String> {
    let fields = node.as_array()?;
    let host = fields.first()?.as_text()?;
    let port = fields.get(1)?.as_integer()?;
    Some(format!("{host}:{port}"))
}

/// Parses a `CLUSTER SLOTS` reply. Returns `None` for malformed responses
/// and for responses whose ranges do not partition `[0, 16383]` completely:
/// those are dropped rather than installed.
pub fn parse_cluster_slots(data: &ReplyData) -> Option<ClusterShardInfos> {
    let ranges = data.as_array()?;
    let mut by_master: BTreeMap<String, ClusterShardInfo> = BTreeMap::new();
    let mut covered = vec![false; NUM_SLOTS];

    for range in ranges {
        let fields = range.as_array()?;
        let slot_min = u16::try_from(fields.first()?.as_integer()?).ok()?;
        let slot_max = u16::try_from(fields.get(1)?.as_integer()?).ok()?;
        if slot_min > slot_max || usize::from(slot_max) >= NUM_SLOTS {
            return None;
        }
        let master = parse_slots_node(fields.get(2)?)?;
        let replicas: BTreeSet<String> = fields[3..]
            .iter()
            .filter_map(parse_slots_node)
            .collect();

        let entry = by_master
            .entry(master.clone())
            .or_insert_with(|| ClusterShardInfo {
                master,
                replicas: BTreeSet::new(),
                slot_ranges: Vec::new(),
            });
        entry.replicas.extend(replicas);
        entry.slot_ranges.push((slot_min, slot_max));
        for slot in slot_min..=slot_max {
            if covered[usize::from(slot)] {
                // Overlapping ranges cannot be installed.
                return None;
            }
            covered[usize::from(slot)] = true;
        }
    }

    if covered.iter().any(|c| !c) {
        return None;
    }

    let mut infos: ClusterShardInfos = by_master.into_values().collect();
    for info in &mut infos {
        info.slot_ranges.sort_unstable();
    }
    Some(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bulk(s: &str) -> ReplyData {
        ReplyData::String(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn property_entry(pairs: &[(&str, &str)]) -> ReplyData {
        ReplyData::Array(
            pairs
                .iter()
                .flat_map(|(k, v)| [bulk(k), bulk(v)])
                .collect(),
        )
    }

    #[test]
    fn filters_down_and_broken_nodes() {
        let reply = ReplyData::Array(vec![
            property_entry(&[
                ("name", "cache"),
                ("ip", "10.0.0.1"),
                ("port", "6379"),
                ("flags", "master"),
            ]),
            property_entry(&[
                ("name", "sessions"),
                ("ip", "10.0.0.2"),
                ("port", "6379"),
                ("flags", "master,s_down"),
            ]),
            property_entry(&[
                ("name", "queue"),
                ("ip", "10.0.0.3"),
                ("port", "6379"),
                ("flags", "sentinel"),
            ]),
        ]);
        let instances = parse_sentinel_instances(&reply, None);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "cache");
        assert_eq!(instances[0].host_port(), "10.0.0.1:6379");
    }

    #[test]
    fn filters_bad_replicas() {
        let reply = ReplyData::Array(vec![
            property_entry(&[
                ("ip", "10.0.0.4"),
                ("port", "6379"),
                ("flags", "slave"),
                ("master-link-status", "ok"),
                ("slave-priority", "100"),
            ]),
            property_entry(&[
                ("ip", "10.0.0.5"),
                ("port", "6379"),
                ("flags", "slave"),
                ("master-link-status", "err"),
                ("slave-priority", "100"),
            ]),
            property_entry(&[
                ("ip", "10.0.0.6"),
                ("port", "6379"),
                ("flags", "slave"),
                ("master-link-status", "ok"),
                ("slave-priority", "0"),
            ]),
        ]);
        let instances = parse_sentinel_instances(&reply, Some("cache"));
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].host_port(), "10.0.0.4:6379");
        assert_eq!(instances[0].name, "cache");
    }

    #[test]
    fn cluster_nodes_strips_cport() {
        let reply = bulk(concat!(
            "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected\n",
            "67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922\n",
        ));
        let nodes = parse_cluster_nodes(&reply).unwrap();
        assert!(nodes.contains("127.0.0.1:30004"));
        assert!(nodes.contains("127.0.0.1:30002"));
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn cluster_nodes_rejects_malformed_lines() {
        assert!(parse_cluster_nodes(&bulk("onlyonefield\n")).is_none());
        assert!(parse_cluster_nodes(&ReplyData::Nil).is_none());
    }

    fn slots_entry(min: i64, max: i64, nodes: &[(&str, i64)]) -> ReplyData {
        let mut fields = vec![ReplyData::Integer(min), ReplyData::Integer(max)];
        for (host, port) in nodes {
            fields.push(ReplyData::Array(vec![bulk(host), ReplyData::Integer(*port)]));
        }
        ReplyData::Array(fields)
    }

    #[test]
    fn cluster_slots_full_partition_parses() {
        let reply = ReplyData::Array(vec![
            slots_entry(0, 8191, &[("10.0.0.1", 7000), ("10.0.0.2", 7000)]),
            slots_entry(8192, 16383, &[("10.0.0.3", 7000)]),
        ]);
        let infos = parse_cluster_slots(&reply).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].master, "10.0.0.1:7000");
        assert!(infos[0].replicas.contains("10.0.0.2:7000"));
        assert_eq!(infos[0].slot_ranges, vec![(0, 8191)]);
    }

    #[test]
    fn cluster_slots_rejects_partial_coverage() {
        let reply = ReplyData::Array(vec![slots_entry(0, 100, &[("10.0.0.1", 7000)])]);
        assert!(parse_cluster_slots(&reply).is_none());
    }

    #[test]
    fn cluster_slots_rejects_overlap() {
        let reply = ReplyData::Array(vec![
            slots_entry(0, 16383, &[("10.0.0.1", 7000)]),
            slots_entry(100, 200, &[("10.0.0.2", 7000)]),
        ]);
        assert!(parse_cluster_slots(&reply).is_none());
    }
}
