//! Cloud-init NoCloud seed generation for cloud-image VMs.

pub mod fat12;

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::vmm::index::VmRecord;

pub const CIDATA_SERIAL: &str = "cocoon-cidata";
const CIDATA_LABEL: &str = "CIDATA";

/// Builds and writes the VM's cidata disk to its run dir. Called at
/// create time (DHCP fallback) and again when NICs are attached before
/// first boot (static addressing).
pub async fn write_cidata(rec: &VmRecord, conf: &Config) -> Result<()> {
    let files = cidata_files(rec, conf);
    let path = rec.cidata_path();
    let image = tokio::task::spawn_blocking(move || fat12::build_fat12(CIDATA_LABEL, &files))
        .await
        .context("cidata build task")??;
    tokio::fs::write(&path, image)
        .await
        .with_context(|| format!("write cidata {}", path.display()))
}

/// The three NoCloud files, deterministic for a given record.
fn cidata_files(rec: &VmRecord, conf: &Config) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    files.insert("meta-data".to_string(), meta_data(rec).into_bytes());
    files.insert("user-data".to_string(), user_data(conf).into_bytes());
    files.insert(
        "network-config".to_string(),
        network_config(rec, conf).into_bytes(),
    );
    files
}

fn meta_data(rec: &VmRecord) -> String {
    format!(
        "instance-id: cocoon-{}\nlocal-hostname: {}\n",
        rec.id, rec.config.name
    )
}

fn user_data(conf: &Config) -> String {
    let mut out = String::from("#cloud-config\n");
    if let Some(password) = &conf.root_password {
        out.push_str(&format!(
            "ssh_pwauth: true\nchpasswd:\n  expire: false\n  users:\n    - name: root\n      password: {password}\n      type: text\n",
        ));
    }
    out
}

/// Netplan-style v2 network config. With assigned NICs, each ethN gets
/// its static address; otherwise DHCP on the first interface.
fn network_config(rec: &VmRecord, conf: &Config) -> String {
    let mut out = String::from("version: 2\nethernets:\n");
    let dns = conf.dns_servers();
    let dns_block = if dns.is_empty() {
        String::new()
    } else {
        format!("      nameservers:\n        addresses: [{}]\n", dns.join(", "))
    };

    if rec.network_configs.is_empty() {
        out.push_str("  eth0:\n    dhcp4: true\n");
        return out;
    }

    for (i, nic) in rec.network_configs.iter().enumerate() {
        let prefix = netmask_to_prefix(&nic.network.netmask);
        out.push_str(&format!(
            "  eth{i}:\n    match:\n      macaddress: {}\n    set-name: eth{i}\n    addresses: [{}/{}]\n",
            nic.mac, nic.network.ip, prefix
        ));
        if !nic.network.gateway.is_empty() {
            out.push_str(&format!(
                "    routes:\n      - to: default\n        via: {}\n",
                nic.network.gateway
            ));
        }
        // Indentation inside an interface block is 4 spaces deeper.
        if !dns_block.is_empty() {
            out.push_str(&dns_block.replace("      ", "    "));
        }
    }
    out
}

fn netmask_to_prefix(netmask: &str) -> u8 {
    netmask
        .split('.')
        .filter_map(|o| o.parse::<u8>().ok())
        .map(|o| o.count_ones() as u8)
        .sum()
}
