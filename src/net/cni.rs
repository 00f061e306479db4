//! CNI conflist loading and plugin execution.
//!
//! Plugins follow the CNI exec protocol: the command and attachment
//! identity travel in `CNI_*` environment variables, the network config
//! on stdin, and the result comes back as JSON on stdout. A conflist is
//! executed plugin by plugin, threading `prevResult` forward on ADD and
//! running in reverse order on DEL.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// A parsed .conflist file.
#[derive(Debug, Clone, Deserialize)]
pub struct Conflist {
    pub name: String,
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    pub plugins: Vec<Value>,
}

/// Loads the first (lexicographically) .conflist under `conf_dir`.
/// Returns None when the directory has none; the provider then reports
/// NotConfigured instead of failing outright.
pub fn load_conflist(conf_dir: &Path) -> Result<Option<Conflist>> {
    let Ok(entries) = std::fs::read_dir(conf_dir) else {
        return Ok(None);
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "conflist").unwrap_or(false))
        .collect();
    files.sort();

    let Some(path) = files.first() else {
        return Ok(None);
    };
    let data = std::fs::read(path)
        .with_context(|| format!("read conflist {}", path.display()))?;
    let conflist: Conflist = serde_json::from_slice(&data)
        .with_context(|| format!("parse conflist {}", path.display()))?;
    if conflist.plugins.is_empty() {
        bail!("conflist {} has no plugins", path.display());
    }
    Ok(Some(conflist))
}

/// Identity of one attachment: which container (VM), which netns, which
/// interface.
pub struct RuntimeConf<'a> {
    pub container_id: &'a str,
    pub netns: &'a Path,
    pub if_name: &'a str,
}

/// Guest-side addressing parsed out of the final ADD result.
#[derive(Debug, Clone)]
pub struct CniResult {
    pub ip: String,
    pub gateway: String,
    pub netmask: String,
}

/// Runs ADD through every plugin in order. Returns the addressing from
/// the final result.
pub async fn add_network_list(
    bin_dir: &Path,
    conflist: &Conflist,
    rt: &RuntimeConf<'_>,
) -> Result<CniResult> {
    let mut prev_result: Option<Value> = None;
    for plugin in &conflist.plugins {
        let result = exec_plugin(bin_dir, conflist, plugin, "ADD", rt, prev_result.take()).await?;
        prev_result = Some(result);
    }
    parse_result(prev_result.context("CNI ADD produced no result")?, rt)
}

/// Runs DEL through every plugin in reverse order, best-effort.
pub async fn del_network_list(
    bin_dir: &Path,
    conflist: &Conflist,
    rt: &RuntimeConf<'_>,
) -> Result<()> {
    for plugin in conflist.plugins.iter().rev() {
        if let Err(e) = exec_plugin(bin_dir, conflist, plugin, "DEL", rt, None).await {
            warn!(
                container_id = rt.container_id,
                if_name = rt.if_name,
                error = %format!("{e:#}"),
                "CNI DEL failed"
            );
        }
    }
    Ok(())
}

async fn exec_plugin(
    bin_dir: &Path,
    conflist: &Conflist,
    plugin: &Value,
    command: &str,
    rt: &RuntimeConf<'_>,
    prev_result: Option<Value>,
) -> Result<Value> {
    let plugin_type = plugin["type"]
        .as_str()
        .context("plugin config missing \"type\"")?
        .to_string();
    let bin = bin_dir.join(&plugin_type);

    // Stdin config: the plugin object, plus the list-level name/version
    // and the previous plugin's result.
    let mut conf = plugin.clone();
    conf["name"] = json!(conflist.name);
    conf["cniVersion"] = json!(conflist.cni_version);
    if let Some(prev) = prev_result {
        conf["prevResult"] = prev;
    }

    debug!(plugin = %plugin_type, command, container_id = rt.container_id, "exec CNI plugin");
    let mut child = tokio::process::Command::new(&bin)
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", rt.container_id)
        .env("CNI_NETNS", rt.netns)
        .env("CNI_IFNAME", rt.if_name)
        .env("CNI_PATH", bin_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("exec CNI plugin {}", bin.display()))?;

    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child.stdin.take().context("plugin stdin")?;
        stdin
            .write_all(conf.to_string().as_bytes())
            .await
            .context("write plugin config")?;
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("wait for CNI plugin {plugin_type}"))?;
    if !output.status.success() {
        // Plugins report structured errors on stdout.
        let msg = serde_json::from_slice::<Value>(&output.stdout)
            .ok()
            .and_then(|v| v["msg"].as_str().map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).into_owned());
        bail!("CNI {command} via {plugin_type}: {msg}");
    }

    if output.stdout.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&output.stdout)
        .with_context(|| format!("parse result of CNI plugin {plugin_type}"))
}

/// Extracts IP, gateway, and netmask from a CNI result.
fn parse_result(result: Value, rt: &RuntimeConf<'_>) -> Result<CniResult> {
    let ips = result["ips"]
        .as_array()
        .filter(|a| !a.is_empty())
        .with_context(|| format!("CNI returned no IPs for {}", rt.container_id))?;
    let first = &ips[0];

    let address = first["address"]
        .as_str()
        .context("CNI result missing ips[0].address")?;
    let (ip, prefix) = address
        .split_once('/')
        .with_context(|| format!("CNI address {address:?} not in CIDR form"))?;
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("bad prefix length in {address:?}"))?;

    Ok(CniResult {
        ip: ip.to_string(),
        gateway: first["gateway"].as_str().unwrap_or_default().to_string(),
        netmask: prefix_to_netmask(prefix),
    })
}

fn prefix_to_netmask(prefix: u8) -> String {
    let bits: u32 = if prefix >= 32 {
        u32::MAX
    } else {
        !(u32::MAX >> prefix)
    };
    let octets = bits.to_be_bytes();
    format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn netmask_conversion() {
        assert_eq!(prefix_to_netmask(24), "255.255.255.0");
        assert_eq!(prefix_to_netmask(16), "255.255.0.0");
        assert_eq!(prefix_to_netmask(30), "255.255.255.252");
        assert_eq!(prefix_to_netmask(0), "0.0.0.0");
        assert_eq!(prefix_to_netmask(32), "255.255.255.255");
    }

    #[test]
    fn parses_add_result() {
        let rt = RuntimeConf {
            container_id: "vm1",
            netns: Path::new("/var/run/netns/cocoon-vm1"),
            if_name: "eth0",
        };
        let result = json!({
            "cniVersion": "1.0.0",
            "ips": [{"address": "10.88.0.5/16", "gateway": "10.88.0.1"}]
        });
        let parsed = parse_result(result, &rt).unwrap();
        assert_eq!(parsed.ip, "10.88.0.5");
        assert_eq!(parsed.gateway, "10.88.0.1");
        assert_eq!(parsed.netmask, "255.255.0.0");

        let empty = json!({"ips": []});
        assert!(parse_result(empty, &rt).is_err());
    }

    #[test]
    fn conflist_loading() {
        let dir = TempDir::new().unwrap();
        assert!(load_conflist(dir.path()).unwrap().is_none());
        assert!(load_conflist(Path::new("/no/such/dir")).unwrap().is_none());

        std::fs::write(
            dir.path().join("10-cocoon.conflist"),
            r#"{"name": "cocoon-net", "cniVersion": "1.0.0",
                "plugins": [{"type": "bridge"}, {"type": "firewall"}]}"#,
        )
        .unwrap();
        let conflist = load_conflist(dir.path()).unwrap().unwrap();
        assert_eq!(conflist.name, "cocoon-net");
        assert_eq!(conflist.plugins.len(), 2);

        // Malformed conflists are an error, not silently unconfigured.
        std::fs::write(dir.path().join("00-bad.conflist"), b"{oops").unwrap();
        assert!(load_conflist(dir.path()).is_err());
    }
}
