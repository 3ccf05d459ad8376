//! Tree topology descriptions
//!
//! One statement per parent, terminated by `;`:
//!
//! ```text
//! fe-host:0 => cp-host:1 cp-host:2 ;
//! cp-host:1 => leaf-a:3 ;
//! ```
//!
//! A statement without `=>` declares a single node (a tree with no internal
//! nodes). Leaves are nodes that never appear on the left-hand side.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::{AttachPoint, Rank, TransportError};

/// A node of the tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyNode {
    pub host: String,
    pub rank: Rank,
}

/// A parsed tree description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    root: TopologyNode,
    leaves: Vec<TopologyNode>,
}

impl Topology {
    /// Read and parse a topology file
    pub fn load(path: &Path) -> Result<Self, TransportError> {
        debug!(path = %path.display(), "Topology::load: called");
        let content = fs::read_to_string(path)
            .map_err(|e| TransportError::Topology(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse a topology description
    pub fn parse(content: &str) -> Result<Self, TransportError> {
        let mut root: Option<TopologyNode> = None;
        let mut parents = HashSet::new();
        let mut seen = Vec::new();

        for statement in content.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }

            let (parent, children) = match statement.split_once("=>") {
                Some((parent, children)) => (parent.trim(), children.split_whitespace().collect::<Vec<_>>()),
                None => (statement, Vec::new()),
            };

            let parent = parse_node(parent)?;
            if root.is_none() {
                root = Some(parent.clone());
            }
            if !children.is_empty() {
                parents.insert(parent.clone());
            }
            if !seen.contains(&parent) {
                seen.push(parent);
            }
            for child in children {
                let child = parse_node(child)?;
                if !seen.contains(&child) {
                    seen.push(child);
                }
            }
        }

        let root = root.ok_or_else(|| TransportError::Topology("empty topology".to_string()))?;
        let leaves: Vec<TopologyNode> = seen.into_iter().filter(|n| !parents.contains(n)).collect();

        debug!(root = ?root, leaves = leaves.len(), "Topology::parse: parsed");
        Ok(Self { root, leaves })
    }

    /// A coordinator with `num_leaves` leaf processes directly below it
    pub fn flat(host: &str, num_leaves: usize) -> Self {
        let root = TopologyNode {
            host: host.to_string(),
            rank: 0,
        };
        let leaves = (1..=num_leaves as Rank)
            .map(|rank| TopologyNode {
                host: host.to_string(),
                rank,
            })
            .collect::<Vec<_>>();
        if leaves.is_empty() {
            return Self {
                root: root.clone(),
                leaves: vec![root],
            };
        }
        Self { root, leaves }
    }

    pub fn root(&self) -> &TopologyNode {
        &self.root
    }

    pub fn leaves(&self) -> &[TopologyNode] {
        &self.leaves
    }

    /// Attach points of the leaves; each listens on `base_port + rank`
    pub fn attach_points(&self, base_port: u16) -> Result<Vec<AttachPoint>, TransportError> {
        self.leaves
            .iter()
            .map(|leaf| {
                let port = u16::try_from(leaf.rank)
                    .ok()
                    .and_then(|offset| base_port.checked_add(offset))
                    .ok_or_else(|| {
                        TransportError::Topology(format!(
                            "rank {} of {} does not fit a port above {}",
                            leaf.rank, leaf.host, base_port
                        ))
                    })?;
                Ok(AttachPoint {
                    host: leaf.host.clone(),
                    port,
                    rank: leaf.rank,
                })
            })
            .collect()
    }
}

fn parse_node(text: &str) -> Result<TopologyNode, TransportError> {
    let (host, rank) = text
        .rsplit_once(':')
        .ok_or_else(|| TransportError::Topology(format!("expected host:rank, got '{}'", text)))?;
    if host.is_empty() {
        return Err(TransportError::Topology(format!("missing host in '{}'", text)));
    }
    let rank = rank
        .parse::<Rank>()
        .map_err(|_| TransportError::Topology(format!("invalid rank in '{}'", text)))?;
    Ok(TopologyNode {
        host: host.to_string(),
        rank,
    })
}
