//! Cluster master discovery.
//!
//! Each master emits its own expiration events and owns its own slice of the
//! key space, so listeners and recovery must run once per master. The master
//! set is read fresh from `CLUSTER NODES` on every startup.

use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use tracing::{debug, info, warn};

use crate::broker::config::ClusterConfig;
use crate::error::{StorageError, StorageResult};
use crate::storage::redis::RedisNode;

/// A master as listed by `CLUSTER NODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterNode {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Parse `CLUSTER NODES` output into the set of live masters.
///
/// Line layout: `<id> <ip:port@cport[,hostname]> <flags> <master> ...`.
/// Masters flagged `fail` or `noaddr` are left out.
pub fn parse_cluster_nodes(output: &str) -> Vec<MasterNode> {
    let mut masters = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(id), Some(address), Some(flags)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let flags: Vec<&str> = flags.split(',').collect();
        if !flags.contains(&"master") || flags.contains(&"fail") || flags.contains(&"noaddr") {
            continue;
        }
        let host_port = address.split(['@', ',']).next().unwrap_or_default();
        let Some((host, port)) = host_port.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        if host.is_empty() || port == 0 {
            continue;
        }
        masters.push(MasterNode {
            id: id.to_string(),
            host: host.to_string(),
            port,
        });
    }
    masters
}

fn with_credentials(mut info: ConnectionInfo, config: &ClusterConfig) -> ConnectionInfo {
    if config.username.is_some() {
        info.redis.username = config.username.clone();
    }
    if config.password.is_some() {
        info.redis.password = config.password.clone();
    }
    info
}

fn master_connection_info(master: &MasterNode, config: &ClusterConfig) -> ConnectionInfo {
    let info = ConnectionInfo {
        addr: ConnectionAddr::Tcp(master.host.clone(), master.port),
        redis: Default::default(),
    };
    with_credentials(info, config)
}

async fn cluster_nodes(entry: &str, config: &ClusterConfig) -> StorageResult<String> {
    let info = with_credentials(entry.into_connection_info()?, config);
    let client = redis::Client::open(info)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let output: String = redis::cmd("CLUSTER")
        .arg("NODES")
        .query_async(&mut conn)
        .await?;
    Ok(output)
}

/// Ask the first reachable entry point for the current master set.
#[tracing::instrument(skip_all, fields(entry_points = config.nodes.len()))]
pub async fn resolve_masters(config: &ClusterConfig) -> StorageResult<Vec<RedisNode>> {
    let mut last_error = None;
    for entry in &config.nodes {
        match cluster_nodes(entry, config).await {
            Ok(output) => {
                let masters = parse_cluster_nodes(&output);
                info!(%entry, masters = masters.len(), "resolved cluster topology");
                let mut nodes = Vec::with_capacity(masters.len());
                for master in &masters {
                    debug!(id = %master.id, host = %master.host, port = master.port, "master node");
                    nodes.push(RedisNode::open(master_connection_info(master, config))?);
                }
                if nodes.is_empty() {
                    return Err(StorageError::Topology(format!(
                        "{entry} reported no live master nodes"
                    )));
                }
                return Ok(nodes);
            }
            Err(e) => {
                warn!(%entry, error = %e, "cluster entry point unreachable");
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => StorageError::Topology(format!("no entry point reachable: {e}")),
        None => StorageError::Topology("no entry points configured".to_string()),
    })
}
