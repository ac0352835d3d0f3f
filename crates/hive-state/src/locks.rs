//! Cluster-wide advisory locks.
//!
//! A lock request is a [`Lock`] record under `locks.<name>` in the
//! requester's own dataset. Nobody ever writes a lock on behalf of another
//! node, so the cluster view of a lock is built only from each requester's
//! own tree. Among competing requests the earliest `requested_at` wins and
//! the node name breaks ties.

use rand::Rng;
use tracing::debug;

use crate::cluster::ClusterState;
use crate::error::StateResult;
use crate::tree::lookup;
use crate::types::{Lock, NodeName, lock_path, unix_now};

impl ClusterState {
    /// Publish a lock request in the local dataset and return its id.
    /// A previous request of ours for the same name is replaced.
    pub fn request_lock(&self, name: &str) -> StateResult<String> {
        let id = format!("{:016x}", rand::thread_rng().r#gen::<u64>());
        let lock = Lock {
            requester: self.local_name().to_string(),
            id: id.clone(),
            requested_at: unix_now(),
        };
        self.local_tree().set_as(&lock_path(name), &lock)?;
        debug!(lock = %name, %id, "lock requested");
        Ok(id)
    }

    /// Withdraw our request for `name`. Returns true if one existed.
    pub fn release_lock(&self, name: &str) -> StateResult<bool> {
        let released = self.local_tree().unset(&lock_path(name))?;
        if released {
            debug!(lock = %name, "lock released");
        }
        Ok(released)
    }

    /// All current requests for `name`, each read from its requester's tree.
    pub fn lock_requests(&self, name: &str) -> Vec<Lock> {
        let mut requests = Vec::new();
        if let Ok(Some(lock)) = self.local_tree().get_as::<Lock, _>(&lock_path(name)) {
            requests.push(lock);
        }
        for peer in self.peer_names() {
            let Some(data) = self.peer_data(&peer) else {
                continue;
            };
            let Some(raw) = lookup(&data, &lock_path(name)) else {
                continue;
            };
            match serde_json::from_value::<Lock>(raw.clone()) {
                Ok(lock) if lock.requester == peer => requests.push(lock),
                // A lock record naming another requester is not trusted.
                _ => {}
            }
        }
        requests
    }

    /// The winning request for `name`, if any.
    pub fn lock_holder(&self, name: &str) -> Option<Lock> {
        self.lock_requests(name).into_iter().min_by(|a, b| {
            a.requested_at
                .total_cmp(&b.requested_at)
                .then_with(|| a.requester.cmp(&b.requester))
        })
    }

    /// Whether our request `id` holds `name` and every beating peer has
    /// seen our current dataset, so no earlier competing request can still
    /// be in flight unnoticed by them.
    pub fn lock_granted(&self, name: &str, id: &str) -> bool {
        let Some(holder) = self.lock_holder(name) else {
            return false;
        };
        if holder.requester != self.local_name() || holder.id != id {
            return false;
        }
        let beating: Vec<NodeName> = self.beating_peers().into_iter().collect();
        let gens = self.generations();
        let local_gen = gens.local_gen();
        beating.iter().all(|peer| {
            gens.installed(peer) > 0 && gens.acked_by(peer).is_some_and(|ack| ack >= local_gen)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster() -> ClusterState {
        ClusterState::new("n1", &["n1".into(), "n2".into(), "n3".into()])
    }

    fn peer_lock(requester: &str, id: &str, at: f64) -> serde_json::Value {
        json!({"locks": {"deploy": {"requester": requester, "id": id, "requested_at": at}}})
    }

    #[test]
    fn single_requester_holds() {
        let c = cluster();
        let id = c.request_lock("deploy").unwrap();
        let holder = c.lock_holder("deploy").unwrap();
        assert_eq!(holder.requester, "n1");
        assert_eq!(holder.id, id);
    }

    #[test]
    fn earliest_request_wins() {
        let c = cluster();
        c.request_lock("deploy").unwrap();
        c.install_peer("n2", peer_lock("n2", "aa", 1.0));
        assert_eq!(c.lock_holder("deploy").unwrap().requester, "n2");
    }

    #[test]
    fn name_breaks_ties() {
        let c = cluster();
        c.install_peer("n3", peer_lock("n3", "bb", 5.0));
        c.install_peer("n2", peer_lock("n2", "aa", 5.0));
        assert_eq!(c.lock_holder("deploy").unwrap().requester, "n2");
    }

    #[test]
    fn foreign_records_are_ignored() {
        let c = cluster();
        // n2's tree claims n3 holds the lock; only n3's own tree counts.
        c.install_peer("n2", peer_lock("n3", "zz", 1.0));
        assert!(c.lock_holder("deploy").is_none());
    }

    #[test]
    fn release_withdraws_request() {
        let c = cluster();
        c.request_lock("deploy").unwrap();
        assert!(c.release_lock("deploy").unwrap());
        assert!(!c.release_lock("deploy").unwrap());
        assert!(c.lock_holder("deploy").is_none());
    }

    #[test]
    fn granted_waits_for_beating_peers() {
        let c = cluster();
        let id = c.request_lock("deploy").unwrap();
        let generation = c.commit_local().unwrap();
        assert!(c.lock_granted("deploy", &id));

        c.set_beating("hb#1", "n2", true);
        assert!(!c.lock_granted("deploy", &id));

        c.install_peer("n2", json!({}));
        {
            let mut gens = c.generations();
            gens.set_installed("n2", 3);
            gens.set_acked("n2", generation);
        }
        assert!(c.lock_granted("deploy", &id));
        assert!(!c.lock_granted("deploy", "other"));
    }
}
