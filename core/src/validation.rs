//! Field-level checks for incoming messages and settings documents

use serde_json::Value;

use crate::crypto::{KeyBundle, ROOT_TOKEN_PREFIX};
use crate::error::{CoreError, CoreResult};
use crate::services::node_registry::MAX_SERIAL;
use crate::types::{HeartbeatMessage, InviteRequest, JoinRequest};

const MAX_NODES: usize = MAX_SERIAL as usize;

fn violation(msg: impl Into<String>) -> CoreError {
    CoreError::SchemaViolation(msg.into())
}

/// RFC 1123 hostname: dot separated labels of letters, digits and hyphens
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn check_hostname(field: &str, value: &str) -> CoreResult<()> {
    if is_valid_hostname(value) {
        Ok(())
    } else {
        Err(violation(format!("{} must be a valid hostname", field)))
    }
}

fn check_serial(field: &str, serial: u8) -> CoreResult<()> {
    if (1..=MAX_SERIAL).contains(&serial) {
        Ok(())
    } else {
        Err(violation(format!("{} must be between 1 and {}", field, MAX_SERIAL)))
    }
}

fn check_version(version: &str) -> CoreResult<()> {
    if (2..=64).contains(&version.len()) {
        Ok(())
    } else {
        Err(violation("version must be 2 to 64 characters"))
    }
}

fn is_checksum(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn validate_heartbeat(msg: &HeartbeatMessage) -> CoreResult<()> {
    check_hostname("from.fqdn", &msg.from.fqdn)?;
    check_hostname("to.fqdn", &msg.to.fqdn)?;
    check_serial("from.serial", msg.from.serial)?;
    if let Some(leader) = msg.cluster_leader {
        check_serial("cluster_leader.serial", leader.serial)?;
    }
    check_version(&msg.version)?;
    if msg.settings_serial < 0 {
        return Err(violation("settings_serial must not be negative"));
    }
    if msg.settings_serial > 0 && !is_checksum(&msg.checksum) {
        return Err(violation(
            "checksum must be a hex SHA-256 digest when settings_serial is set",
        ));
    }
    if msg.nodes.len() > MAX_NODES {
        return Err(violation(format!("nodes must not list more than {} entries", MAX_NODES)));
    }
    Ok(())
}

pub fn validate_join(req: &JoinRequest) -> CoreResult<()> {
    check_hostname("you", &req.you)?;
    check_hostname("join", &req.join)?;
    if let Some(settings) = &req.settings {
        if !settings.data.is_object() {
            return Err(violation("settings.data must be an object"));
        }
    }
    if let Some(keys) = &req.keys {
        validate_keys(keys)?;
    }
    Ok(())
}

pub fn validate_invite(req: &InviteRequest) -> CoreResult<()> {
    check_hostname("you", &req.you)?;
    check_hostname("join", &req.join)
}

pub fn validate_keys(keys: &KeyBundle) -> CoreResult<()> {
    let token_ok = keys.mrt.len() == 68
        && keys.mrt.starts_with(ROOT_TOKEN_PREFIX)
        && keys.mrt[ROOT_TOKEN_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase());
    if !token_ok {
        return Err(violation("keys.mrt is not a valid root token"));
    }
    if keys.jwt.is_empty() || keys.rcrt.is_empty() || keys.icrt.is_empty() {
        return Err(violation("keys bundle is incomplete"));
    }
    Ok(())
}

// ============================================================================
// Settings documents
// ============================================================================

/// Check a settings document and bring it into canonical shape.
///
/// A top-level `nodes` list is accepted as shorthand for
/// `deployment.nodes`. Node FQDNs are lowercased.
pub fn normalize_settings(mut data: Value) -> CoreResult<Value> {
    let Some(root) = data.as_object_mut() else {
        return Err(CoreError::SettingsInvalid("settings must be an object".into()));
    };

    if let Some(nodes) = root.remove("nodes") {
        let deployment = root
            .entry("deployment")
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(deployment) = deployment.as_object_mut() else {
            return Err(CoreError::SettingsInvalid("deployment must be an object".into()));
        };
        deployment.entry("nodes").or_insert(nodes);
    }

    let Some(deployment) = root.get_mut("deployment").and_then(Value::as_object_mut) else {
        return Err(CoreError::SettingsInvalid("deployment is required".into()));
    };

    let brokers = normalize_fqdn_list(deployment.get("nodes"), "deployment.nodes")?;
    if brokers.is_empty() {
        return Err(CoreError::SettingsInvalid(
            "deployment.nodes must list at least one node".into(),
        ));
    }
    let flanking = match deployment.get("flanking_nodes") {
        None | Some(Value::Null) => Vec::new(),
        list => normalize_fqdn_list(list, "deployment.flanking_nodes")?,
    };

    let mut all: Vec<&String> = brokers.iter().chain(flanking.iter()).collect();
    let total = all.len();
    if total > MAX_NODES {
        return Err(CoreError::SettingsInvalid(format!(
            "a cluster holds at most {} nodes",
            MAX_NODES
        )));
    }
    all.sort();
    all.dedup();
    if all.len() != total {
        return Err(CoreError::SettingsInvalid("node FQDNs must be unique".into()));
    }

    deployment.insert("nodes".into(), Value::from(brokers));
    if !flanking.is_empty() {
        deployment.insert("flanking_nodes".into(), Value::from(flanking));
    }

    Ok(data)
}

fn normalize_fqdn_list(value: Option<&Value>, field: &str) -> CoreResult<Vec<String>> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Err(CoreError::SettingsInvalid(format!("{} must be a list", field)));
    };

    items
        .iter()
        .map(|item| {
            let fqdn = item
                .as_str()
                .map(str::to_lowercase)
                .ok_or_else(|| CoreError::SettingsInvalid(format!("{} must hold strings", field)))?;
            if !is_valid_hostname(&fqdn) {
                return Err(CoreError::SettingsInvalid(format!(
                    "{} holds an invalid FQDN: {}",
                    field, fqdn
                )));
            }
            Ok(fqdn)
        })
        .collect()
}

fn string_list(data: &Value, pointer: &str) -> Vec<String> {
    data.pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Broker node FQDNs of a normalized settings document, in serial order
pub fn broker_nodes(data: &Value) -> Vec<String> {
    string_list(data, "/deployment/nodes")
}

pub fn flanking_nodes(data: &Value) -> Vec<String> {
    string_list(data, "/deployment/flanking_nodes")
}

pub fn display_name(data: &Value) -> String {
    data.pointer("/deployment/display_name")
        .and_then(Value::as_str)
        .unwrap_or("Morio Cluster")
        .to_string()
}

/// Lowercased FQDN with any port stripped, as taken from a Host header
pub fn fqdn_from_host(host: &str) -> Option<String> {
    let name = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let name = name.trim().to_lowercase();
    is_valid_hostname(&name).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterRef, FqdnRef, NodeRef, StatusColor, StatusSummary};
    use serde_json::json;
    use uuid::Uuid;

    fn heartbeat(settings_serial: i64, checksum: &str) -> HeartbeatMessage {
        HeartbeatMessage {
            from: NodeRef {
                fqdn: "b.example.com".into(),
                uuid: Uuid::new_v4(),
                serial: 2,
            },
            to: FqdnRef {
                fqdn: "a.example.com".into(),
            },
            cluster: ClusterRef { uuid: Uuid::new_v4() },
            cluster_leader: None,
            version: "0.1.0".into(),
            settings_serial,
            status: StatusSummary {
                code: 0,
                color: StatusColor::Green,
            },
            nodes: Default::default(),
            broadcast: false,
            uptime: 1,
            checksum: checksum.into(),
            action: None,
            settings: None,
        }
    }

    #[test]
    fn test_heartbeat_checksum_required_with_settings() {
        assert!(validate_heartbeat(&heartbeat(0, "")).is_ok());
        assert!(validate_heartbeat(&heartbeat(42, &"ab".repeat(32))).is_ok());

        let not_hex = "zz".repeat(32);
        for bad in ["", "abc", not_hex.as_str()] {
            let err = validate_heartbeat(&heartbeat(42, bad)).unwrap_err();
            assert_eq!(err.code(), "morio.core.schema.violation");
        }
    }

    #[test]
    fn test_hostnames() {
        assert!(is_valid_hostname("a.example.com"));
        assert!(is_valid_hostname("node-1"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-a.example.com"));
        assert!(!is_valid_hostname("a..example.com"));
        assert!(!is_valid_hostname("a_b.example.com"));
    }

    #[test]
    fn test_nodes_shorthand() {
        let data = normalize_settings(json!({"nodes": ["A.example.com"]})).unwrap();
        assert_eq!(broker_nodes(&data), vec!["a.example.com"]);
        assert!(data.get("nodes").is_none());
        assert_eq!(display_name(&data), "Morio Cluster");
    }

    #[test]
    fn test_settings_rejections() {
        for bad in [
            json!([]),
            json!({}),
            json!({"deployment": {"nodes": []}}),
            json!({"deployment": {"nodes": ["not a host"]}}),
            json!({"deployment": {"nodes": ["a.example.com"], "flanking_nodes": ["a.example.com"]}}),
            json!({"deployment": {"nodes": (1..=10).map(|i| format!("n{}.example.com", i)).collect::<Vec<_>>()}}),
        ] {
            let err = normalize_settings(bad).unwrap_err();
            assert_eq!(err.code(), "morio.core.settings.invalid");
        }
    }

    #[test]
    fn test_flanking_nodes() {
        let data = normalize_settings(json!({
            "deployment": {
                "nodes": ["a.example.com", "b.example.com"],
                "flanking_nodes": ["f.example.com"],
                "display_name": "Unit"
            }
        }))
        .unwrap();
        assert_eq!(flanking_nodes(&data), vec!["f.example.com"]);
        assert_eq!(display_name(&data), "Unit");
    }

    #[test]
    fn test_fqdn_from_host() {
        assert_eq!(fqdn_from_host("A.Example.com:3007").as_deref(), Some("a.example.com"));
        assert_eq!(fqdn_from_host("a.example.com").as_deref(), Some("a.example.com"));
        assert_eq!(fqdn_from_host("bad host"), None);
    }
}
