//! Favourite node auto-management
//!
//! Eligibility depends on the local node's role. A relay-capable local node
//! favourites zero-hop relays; a base client favourites every zero-hop node;
//! other roles auto-favourite nothing. Auto favourites are tracked apart from
//! operator favourites, and an operator un-favourite locks the node out of
//! auto-management until the operator favourites it again.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::node_store::{Node, NodeRole, NodeStore};
use crate::types::{NodeNum, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FavoriteRemoval {
    /// Not heard within the stale window
    Stale,
    /// Hop distance or role no longer qualifies
    Ineligible,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FavoriteChange {
    Added { node: NodeNum, automatic: bool },
    Removed { node: NodeNum, reason: FavoriteRemoval },
}

impl FavoriteChange {
    pub fn node(&self) -> NodeNum {
        match self {
            FavoriteChange::Added { node, .. } | FavoriteChange::Removed { node, .. } => *node,
        }
    }
}

/// Whether `remote` qualifies for auto-favouriting under `local_role`
pub fn is_eligible(local_role: NodeRole, remote: &Node) -> bool {
    if remote.hops_away != Some(0) {
        return false;
    }
    if local_role.is_relay_capable() {
        remote.role.is_relay_capable()
    } else {
        local_role.is_base_client()
    }
}

impl NodeStore {
    /// Operator favourite toggle; `None` when the node is unknown or nothing
    /// changed
    pub fn set_favorite(&mut self, num: NodeNum, favorite: bool) -> Option<FavoriteChange> {
        let node = self.node_mut(num)?;
        let changed = node.is_favorite != favorite;
        node.is_favorite = favorite;
        node.auto_favorite = false;
        node.favorite_locked = !favorite;
        info!(node = %num, favorite, "Favourite set by operator");
        changed.then(|| {
            if favorite {
                FavoriteChange::Added {
                    node: num,
                    automatic: false,
                }
            } else {
                FavoriteChange::Removed {
                    node: num,
                    reason: FavoriteRemoval::Manual,
                }
            }
        })
    }

    /// Auto-favourite `num` if it has just become eligible
    pub fn evaluate_auto_favorite(&mut self, num: NodeNum, now: Timestamp) -> Option<FavoriteChange> {
        if !self.config.auto_favorites || Some(num) == self.local_node() {
            return None;
        }
        let local_role = self.local_role();
        let stale_ms = self.config.favorite_stale_secs.saturating_mul(1000);
        let node = self.node_mut(num)?;
        if node.is_favorite || node.favorite_locked || !is_eligible(local_role, node) {
            return None;
        }
        if node.last_heard.map_or(true, |heard| now - heard > stale_ms) {
            return None;
        }
        node.is_favorite = true;
        node.auto_favorite = true;
        debug!(node = %num, role = ?node.role, "Auto-favourited zero-hop node");
        Some(FavoriteChange::Added {
            node: num,
            automatic: true,
        })
    }

    /// Drop auto favourites that went stale or stopped qualifying
    ///
    /// Operator favourites are never touched.
    pub fn sweep_auto_favorites(&mut self, now: Timestamp) -> Vec<FavoriteChange> {
        let local_role = self.local_role();
        let stale_ms = self.config.favorite_stale_secs.saturating_mul(1000);
        let mut changes = Vec::new();

        for num in self.node_nums() {
            let Some(node) = self.node_mut(num) else {
                continue;
            };
            if !node.auto_favorite {
                continue;
            }
            let reason = if node.last_heard.map_or(true, |heard| now - heard > stale_ms) {
                FavoriteRemoval::Stale
            } else if !is_eligible(local_role, node) {
                FavoriteRemoval::Ineligible
            } else {
                continue;
            };
            node.is_favorite = false;
            node.auto_favorite = false;
            changes.push(FavoriteChange::Removed { node: num, reason });
        }

        if !changes.is_empty() {
            info!(removed = changes.len(), "Favourite sweep removed auto favourites");
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeStoreConfig;
    use crate::protocol::schema::{Role, User};

    const LOCAL: NodeNum = NodeNum::new(1);

    fn store_with_local(role: Role) -> NodeStore {
        let mut store = NodeStore::new(NodeStoreConfig::default());
        store.set_local_node(LOCAL);
        store.apply_node_info(
            LOCAL,
            &User {
                role: role as i32,
                ..Default::default()
            },
            None,
            Timestamp::new(0),
        );
        store
    }

    fn heard(store: &mut NodeStore, num: u32, role: Role, hops: u8, at: Timestamp) -> NodeNum {
        let num = NodeNum::new(num);
        store.apply_node_info(
            num,
            &User {
                role: role as i32,
                ..Default::default()
            },
            None,
            at,
        );
        store.record_message_hops(num, hops);
        num
    }

    #[test]
    fn test_router_favourites_only_zero_hop_relays() {
        let mut store = store_with_local(Role::Router);
        let now = Timestamp::new(1_000);
        let relay = heard(&mut store, 2, Role::Repeater, 0, now);
        let client = heard(&mut store, 3, Role::Client, 0, now);
        let far_relay = heard(&mut store, 4, Role::Router, 2, now);

        assert!(matches!(
            store.evaluate_auto_favorite(relay, now),
            Some(FavoriteChange::Added { automatic: true, .. })
        ));
        assert_eq!(store.evaluate_auto_favorite(client, now), None);
        assert_eq!(store.evaluate_auto_favorite(far_relay, now), None);
    }

    #[test]
    fn test_base_client_favourites_any_zero_hop() {
        let mut store = store_with_local(Role::ClientBase);
        let now = Timestamp::new(1_000);
        let client = heard(&mut store, 3, Role::Client, 0, now);
        assert!(store.evaluate_auto_favorite(client, now).is_some());
        assert!(store.get(client).unwrap().auto_favorite);
    }

    #[test]
    fn test_plain_client_favourites_nothing() {
        let mut store = store_with_local(Role::Client);
        let now = Timestamp::new(1_000);
        let relay = heard(&mut store, 2, Role::Router, 0, now);
        assert_eq!(store.evaluate_auto_favorite(relay, now), None);
    }

    #[test]
    fn test_manual_unfavourite_not_reapplied() {
        let mut store = store_with_local(Role::ClientBase);
        let now = Timestamp::new(1_000);
        let node = heard(&mut store, 5, Role::Client, 0, now);
        store.evaluate_auto_favorite(node, now);

        assert_eq!(
            store.set_favorite(node, false),
            Some(FavoriteChange::Removed {
                node,
                reason: FavoriteRemoval::Manual
            })
        );
        assert_eq!(store.evaluate_auto_favorite(node, now), None);
        assert!(!store.get(node).unwrap().is_favorite);
    }

    #[test]
    fn test_sweep_removes_stale_and_ineligible() {
        let mut store = store_with_local(Role::ClientBase);
        let start = Timestamp::new(0);
        let stale = heard(&mut store, 6, Role::Client, 0, start);
        let moved = heard(&mut store, 7, Role::Client, 0, start);
        let manual = heard(&mut store, 8, Role::Client, 3, start);
        store.evaluate_auto_favorite(stale, start);
        store.evaluate_auto_favorite(moved, start);
        store.set_favorite(manual, true);

        let later = start.add_seconds(store.config().favorite_stale_secs + 1);
        store.touch(moved, later);
        store.touch(manual, later);
        store.record_message_hops(moved, 2);

        let changes = store.sweep_auto_favorites(later);
        assert_eq!(
            changes,
            vec![
                FavoriteChange::Removed {
                    node: stale,
                    reason: FavoriteRemoval::Stale
                },
                FavoriteChange::Removed {
                    node: moved,
                    reason: FavoriteRemoval::Ineligible
                },
            ]
        );
        assert!(store.get(manual).unwrap().is_favorite);
    }
}
