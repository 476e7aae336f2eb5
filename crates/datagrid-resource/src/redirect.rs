//! Hierarchy resolution ("redirect")
//!
//! Each candidate root is asked for a vote. Leaves compute the vote from
//! their host and the object's replicas; composites add themselves to the
//! hierarchy and forward to exactly one child. The top level keeps the
//! highest vote, first candidate winning ties.

use crate::object::{FileObject, ObjectRef};
use crate::tree::{ResourceNode, ResourceTree};
use datagrid_common::{
    ClientConnection, Error, HierarchyParser, Operation, ReplicaInfo, Result,
};
use tracing::{debug, warn};

pub const VOTE_LOCAL: f32 = 1.0;
pub const VOTE_REMOTE: f32 = 0.5;
pub const VOTE_LOW: f32 = 0.25;
pub const VOTE_NONE: f32 = 0.0;

/// Outcome of a successful resolution
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedHierarchy {
    pub hier: String,
    pub vote: f32,
    pub root: String,
    pub leaf: String,
    pub leaf_host: String,
    /// Leaf lives on the host running this server
    pub local: bool,
}

/// Leaf vote for a create
pub fn vote_for_create(node: &ResourceNode, host: &str) -> Result<f32> {
    if node.is_down() {
        return Err(Error::ResourceDown(node.name().to_string()));
    }
    Ok(if node.host() == host {
        VOTE_LOCAL
    } else {
        VOTE_REMOTE
    })
}

/// Leaf vote for an open or write
#[must_use]
pub fn vote_for_open(node: &ResourceNode, file: &FileObject, host: &str) -> f32 {
    if node.is_down() {
        return VOTE_NONE;
    }
    let Some(replica) = file
        .replicas
        .iter()
        .find(|r| datagrid_common::hierarchy::last_resource(&r.resc_hier) == node.name())
    else {
        return VOTE_NONE;
    };
    match file.repl_requested {
        Some(requested) if requested != replica.repl_num => VOTE_LOW,
        None if replica.is_dirty => VOTE_LOW,
        _ if node.host() == host => VOTE_LOCAL,
        _ => VOTE_REMOTE,
    }
}

/// Vote and hierarchy from one candidate root
pub fn request_vote(
    tree: &ResourceTree,
    comm: &ClientConnection,
    root: &str,
    op: Operation,
    file: &FileObject,
) -> Result<(f32, String)> {
    let id = tree.id_of(root)?;
    let mut parser = HierarchyParser::new();
    let mut object = ObjectRef::File(file.detached());
    let vote = tree.resolve_from(id, comm, op, &mut object, &mut parser)?;
    Ok((vote, parser.to_string()))
}

/// Pick the hierarchy for `op` among `candidates`
///
/// A create aimed at a single candidate surfaces that candidate's error
/// (a down resource is an error, not a low vote). With several
/// candidates, failures are skipped and the first one is reported only if
/// no candidate produced a vote.
pub fn resolve_resource_hierarchy(
    tree: &ResourceTree,
    comm: &ClientConnection,
    op: Operation,
    file: &FileObject,
    candidates: &[String],
) -> Result<ResolvedHierarchy> {
    let mut best: Option<(f32, String, &str)> = None;
    let mut first_error = None;

    for root in candidates {
        match request_vote(tree, comm, root, op, file) {
            Ok((vote, hier)) => {
                debug!(
                    "Redirect {} for {}: {} voted {} via \"{}\"",
                    op, file.logical_path, root, vote, hier
                );
                if vote > best.as_ref().map_or(VOTE_NONE, |b| b.0) {
                    best = Some((vote, hier, root.as_str()));
                }
            }
            Err(e) => {
                if op == Operation::Create && candidates.len() == 1 {
                    return Err(e);
                }
                warn!(
                    "Redirect {} for {}: candidate {} failed: {}",
                    op, file.logical_path, root, e
                );
                first_error.get_or_insert(e);
            }
        }
    }

    let Some((vote, hier, root)) = best else {
        return Err(match first_error {
            Some(e) if op == Operation::Create => e,
            _ => Error::NoResourceAvailable(format!("{} of {}", op, file.logical_path)),
        });
    };

    let leaf = tree.leaf_of_hier(&hier)?;
    Ok(ResolvedHierarchy {
        vote,
        root: root.to_string(),
        leaf: leaf.name().to_string(),
        leaf_host: leaf.host().to_string(),
        local: leaf.host() == tree.local_host(),
        hier,
    })
}

/// Distinct root resources of the replicas, in catalog order
#[must_use]
pub fn candidates_for_open(replicas: &[ReplicaInfo]) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    for replica in replicas {
        let root = replica.root_resource();
        if !root.is_empty() && !roots.iter().any(|r| r == root) {
            roots.push(root.to_string());
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceTreeBuilder;
    use datagrid_common::config::ResourceConfig;
    use datagrid_common::{ReplicaStatus, ResourceStatus};

    fn replica(repl_num: i32, hier: &str, good: bool) -> ReplicaInfo {
        ReplicaInfo {
            obj_path: "/zoneA/home/u/f.txt".into(),
            repl_num,
            resc_hier: hier.into(),
            resc_name: datagrid_common::hierarchy::first_resource(hier).into(),
            status: if good {
                ReplicaStatus::good()
            } else {
                ReplicaStatus::DIRTY
            },
            ..ReplicaInfo::default()
        }
    }

    fn two_host_tree() -> ResourceTree {
        ResourceTreeBuilder::new()
            .local_host("hostA")
            .resource(ResourceConfig::new("rescA", "unixfilesystem").with_host("hostA").with_vault("/va"))
            .resource(ResourceConfig::new("rescB", "unixfilesystem").with_host("hostB").with_vault("/vb"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_same_host_votes_one() {
        let tree = two_host_tree();
        let comm = ClientConnection::new("hostA", "u", "zoneA");
        let file = FileObject::for_vote("/zoneA/home/u/f.txt", &[], None);
        let resolved = resolve_resource_hierarchy(
            &tree,
            &comm,
            Operation::Create,
            &file,
            &["rescA".to_string()],
        )
        .unwrap();
        assert!((resolved.vote - 1.0).abs() < f32::EPSILON);
        assert_eq!(resolved.hier, "rescA");
        assert!(resolved.local);
    }

    #[test]
    fn test_open_prefers_clean_remote_over_dirty_local() {
        let tree = two_host_tree();
        let comm = ClientConnection::new("hostB", "u", "zoneA");
        let replicas = vec![replica(0, "rescA", true), replica(1, "rescB", false)];
        let file = FileObject::for_vote("/zoneA/home/u/f.txt", &replicas, None);

        let (vote_a, _) = request_vote(&tree, &comm, "rescA", Operation::Open, &file).unwrap();
        let (vote_b, _) = request_vote(&tree, &comm, "rescB", Operation::Open, &file).unwrap();
        assert!((vote_a - 0.5).abs() < f32::EPSILON);
        assert!((vote_b - 0.25).abs() < f32::EPSILON);

        let candidates = candidates_for_open(&replicas);
        let resolved =
            resolve_resource_hierarchy(&tree, &comm, Operation::Open, &file, &candidates).unwrap();
        assert_eq!(resolved.hier, "rescA");
        assert!(resolved.local);
    }

    #[test]
    fn test_open_is_deterministic() {
        let tree = two_host_tree();
        let comm = ClientConnection::new("hostA", "u", "zoneA");
        let replicas = vec![replica(0, "rescA", true), replica(1, "rescB", true)];
        let file = FileObject::for_vote("/zoneA/home/u/f.txt", &replicas, Some(1));
        let candidates = candidates_for_open(&replicas);
        let first =
            resolve_resource_hierarchy(&tree, &comm, Operation::Open, &file, &candidates).unwrap();
        let second =
            resolve_resource_hierarchy(&tree, &comm, Operation::Open, &file, &candidates).unwrap();
        assert_eq!(first, second);
        // requested replica 1 lives on rescB; rescA only gets the low vote
        assert_eq!(first.hier, "rescB");
        assert!((first.vote - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_ties_go_to_first_candidate() {
        let tree = two_host_tree();
        let comm = ClientConnection::new("hostC", "u", "zoneA");
        let file = FileObject::for_vote("/zoneA/home/u/f.txt", &[], None);
        let resolved = resolve_resource_hierarchy(
            &tree,
            &comm,
            Operation::Create,
            &file,
            &["rescB".to_string(), "rescA".to_string()],
        )
        .unwrap();
        assert_eq!(resolved.hier, "rescB");
    }

    #[test]
    fn test_create_on_down_resource_is_an_error() {
        let tree = two_host_tree();
        tree.set_status("rescA", ResourceStatus::Down).unwrap();
        let comm = ClientConnection::new("hostA", "u", "zoneA");
        let file = FileObject::for_vote("/zoneA/home/u/f.txt", &[], None);
        let err = resolve_resource_hierarchy(
            &tree,
            &comm,
            Operation::Create,
            &file,
            &["rescA".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ResourceDown(ref name) if name == "rescA"));

        // with an alternative the down candidate is skipped
        let resolved = resolve_resource_hierarchy(
            &tree,
            &comm,
            Operation::Create,
            &file,
            &["rescA".to_string(), "rescB".to_string()],
        )
        .unwrap();
        assert_eq!(resolved.hier, "rescB");
    }

    #[test]
    fn test_open_on_down_resource_votes_zero() {
        let tree = two_host_tree();
        tree.set_status("rescA", ResourceStatus::Down).unwrap();
        let comm = ClientConnection::new("hostA", "u", "zoneA");
        let replicas = vec![replica(0, "rescA", true)];
        let file = FileObject::for_vote("/zoneA/home/u/f.txt", &replicas, None);
        let (vote, hier) = request_vote(&tree, &comm, "rescA", Operation::Open, &file).unwrap();
        assert!(vote.abs() < f32::EPSILON);
        assert_eq!(hier, "rescA");

        let err = resolve_resource_hierarchy(
            &tree,
            &comm,
            Operation::Open,
            &file,
            &candidates_for_open(&replicas),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoResourceAvailable(_)));
    }

    #[test]
    fn test_candidates_for_open_dedups() {
        let replicas = vec![
            replica(0, "rr/a", true),
            replica(1, "rr/b", true),
            replica(2, "solo", true),
        ];
        assert_eq!(candidates_for_open(&replicas), vec!["rr", "solo"]);
    }
}
