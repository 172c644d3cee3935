use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::types::{DeviceId, PeerView};

/// Last known position of every device in the live feed.
///
/// Rebuilt wholesale from each snapshot; there is no other way to change it.
/// Entries older than the retention window only disappear when the next
/// snapshot arrives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerSet {
    peers: HashMap<DeviceId, PeerView>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl PeerSet {
    pub fn from_snapshot(snapshot: Vec<PeerView>, refreshed_at: DateTime<Utc>) -> Self {
        let peers = snapshot
            .into_iter()
            .map(|peer| (peer.device_id.clone(), peer))
            .collect();
        Self {
            peers,
            refreshed_at: Some(refreshed_at),
        }
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&PeerView> {
        self.peers.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Peers for the renderer: everyone but `local`, ordered by name.
    pub fn visible(&self, local: &DeviceId) -> Vec<&PeerView> {
        let mut out: Vec<_> = self
            .peers
            .values()
            .filter(|peer| &peer.device_id != local)
            .collect();
        out.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoPosition;

    fn peer(id: &str, name: &str) -> PeerView {
        PeerView {
            device_id: DeviceId::new(id),
            display_name: name.into(),
            position: GeoPosition::new(35.0, 139.0),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn visible_never_contains_the_local_device() {
        let local = DeviceId::new("me");
        let set = PeerSet::from_snapshot(
            vec![peer("me", "Me"), peer("b", "Bo"), peer("a", "Al")],
            Utc::now(),
        );

        assert_eq!(set.len(), 3);
        assert!(set.get(&local).is_some());
        let names: Vec<_> = set.visible(&local).iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["Al", "Bo"]);
    }

    #[test]
    fn each_snapshot_replaces_the_previous_one() {
        let first = PeerSet::from_snapshot(vec![peer("a", "A"), peer("b", "B")], Utc::now());
        assert_eq!(first.len(), 2);

        let second = PeerSet::from_snapshot(vec![peer("c", "C")], Utc::now());
        assert_eq!(second.len(), 1);
        assert!(second.get(&DeviceId::new("a")).is_none());
        assert!(second.refreshed_at().is_some());
        assert!(PeerSet::default().is_empty());
    }
}
