//! Persisted network records, one per NIC.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Network;

/// One NIC's persisted state, keyed by generated network id. A VM with
/// two NICs has two records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    #[serde(flatten)]
    pub network: Network,
    /// Owning VM.
    pub vm_id: String,
    /// CNI interface name inside the netns (eth0, eth1, ...).
    pub if_name: String,
    /// Persisted MAC so a VM keeps its address across host reboots.
    pub mac: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NetworkIndex {
    #[serde(default)]
    pub networks: HashMap<String, NetworkRecord>,
}

impl crate::store::Index for NetworkIndex {}

impl NetworkIndex {
    /// Detached copies of all records belonging to `vm_id`, ordered by
    /// interface name.
    pub fn by_vm_id(&self, vm_id: &str) -> Vec<NetworkRecord> {
        let mut records: Vec<NetworkRecord> = self
            .networks
            .values()
            .filter(|r| r.vm_id == vm_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.if_name.cmp(&b.if_name));
        records
    }

    /// Unique VM ids present in the records.
    pub fn vm_ids(&self) -> std::collections::HashSet<String> {
        self.networks.values().map(|r| r.vm_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, vm: &str, if_name: &str) -> NetworkRecord {
        NetworkRecord {
            network: Network {
                id: id.to_string(),
                net_type: "bridge".to_string(),
                ip: "10.4.0.5".to_string(),
                gateway: "10.4.0.1".to_string(),
                netmask: "255.255.255.0".to_string(),
                hostname: "vm".to_string(),
            },
            vm_id: vm.to_string(),
            if_name: if_name.to_string(),
            mac: "02:00:00:00:00:01".to_string(),
        }
    }

    #[test]
    fn by_vm_id_orders_by_interface() {
        let mut idx = NetworkIndex::default();
        idx.networks.insert("n2".into(), record("n2", "vm1", "eth1"));
        idx.networks.insert("n1".into(), record("n1", "vm1", "eth0"));
        idx.networks.insert("n3".into(), record("n3", "vm2", "eth0"));

        let recs = idx.by_vm_id("vm1");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].if_name, "eth0");
        assert_eq!(recs[1].if_name, "eth1");
        assert_eq!(idx.vm_ids().len(), 2);
    }

    #[test]
    fn record_json_flattens_network() {
        let rec = record("n1", "vm1", "eth0");
        let json = serde_json::to_value(&rec).unwrap();
        // Network fields sit at the top level next to vm_id/if_name.
        assert_eq!(json["id"], "n1");
        assert_eq!(json["vm_id"], "vm1");
        assert_eq!(json["ip"], "10.4.0.5");
    }
}
