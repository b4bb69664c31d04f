use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::types::{now_ms, LeaderRef, NodeRole};

/// Identity of this node within its cluster, fixed once set up or joined
#[derive(Debug, Clone, PartialEq)]
pub struct LocalNode {
    pub uuid: Uuid,
    pub serial: u8,
    pub fqdn: String,
    pub role: NodeRole,
    pub cluster: Uuid,
    pub cluster_name: String,
}

impl LocalNode {
    pub fn as_leader_ref(&self) -> LeaderRef {
        LeaderRef {
            serial: self.serial,
            uuid: self.uuid,
        }
    }
}

/// Store the local identity (single row)
pub fn save_identity(conn: &Connection, node: &LocalNode) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO identity (id, node_uuid, node_serial, fqdn, role, cluster_uuid, cluster_name, applied_serial, created_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        rusqlite::params![
            node.uuid.to_string(),
            node.serial,
            node.fqdn,
            node.role.as_str(),
            node.cluster.to_string(),
            node.cluster_name,
            now_ms()
        ],
    )
    .context("Failed to store identity")?;

    Ok(())
}

/// Load the local identity and the last applied settings serial
pub fn load_identity(conn: &Connection) -> Result<Option<(LocalNode, i64)>> {
    let row = conn
        .query_row(
            "SELECT node_uuid, node_serial, fqdn, role, cluster_uuid, cluster_name, applied_serial FROM identity WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u8>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()
        .context("Failed to query identity")?;

    let Some((uuid, serial, fqdn, role, cluster, cluster_name, applied)) = row else {
        return Ok(None);
    };

    let node = LocalNode {
        uuid: Uuid::parse_str(&uuid).context("Invalid node uuid")?,
        serial,
        fqdn,
        role: role.parse().map_err(anyhow::Error::msg)?,
        cluster: Uuid::parse_str(&cluster).context("Invalid cluster uuid")?,
        cluster_name,
    };

    Ok(Some((node, applied)))
}

pub fn set_applied_serial(conn: &Connection, serial: i64) -> Result<()> {
    conn.execute(
        "UPDATE identity SET applied_serial = ?1 WHERE id = 1",
        rusqlite::params![serial],
    )
    .context("Failed to update applied serial")?;

    Ok(())
}
