//! Ring ordering of participants

use crate::PeerId;

/// Ring successor and predecessor of `local` among `peers`
///
/// Participants are ordered lexicographically by relay id and the order
/// wraps around. `peers` must not contain `local`. Returns `None` when there
/// are no other peers.
pub fn ring_neighbors<'a, I>(local: &PeerId, peers: I) -> Option<(PeerId, PeerId)>
where
    I: IntoIterator<Item = &'a PeerId>,
{
    let mut sorted: Vec<&PeerId> = peers.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort();

    // first peer above us is next, the one before it (cyclically) is prev
    let pos = sorted.partition_point(|p| *p <= local);
    let next = sorted[pos % sorted.len()];
    let prev = sorted[(pos + sorted.len() - 1) % sorted.len()];
    Some((next.clone(), prev.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<PeerId> {
        list.iter().map(|s| PeerId::from(*s)).collect()
    }

    #[test]
    fn test_middle_of_ring() {
        let peers = ids(&["b", "f"]);
        let (next, prev) = ring_neighbors(&PeerId::from("d"), &peers).unwrap();
        assert_eq!(next.as_str(), "f");
        assert_eq!(prev.as_str(), "b");
    }

    #[test]
    fn test_wraps_at_maximum() {
        let peers = ids(&["d", "b"]);
        let (next, prev) = ring_neighbors(&PeerId::from("f"), &peers).unwrap();
        assert_eq!(next.as_str(), "b");
        assert_eq!(prev.as_str(), "d");
    }

    #[test]
    fn test_wraps_at_minimum() {
        let peers = ids(&["d", "f"]);
        let (next, prev) = ring_neighbors(&PeerId::from("b"), &peers).unwrap();
        assert_eq!(next.as_str(), "d");
        assert_eq!(prev.as_str(), "f");
    }

    #[test]
    fn test_two_party_ring() {
        let peers = ids(&["b"]);
        let (next, prev) = ring_neighbors(&PeerId::from("a"), &peers).unwrap();
        assert_eq!(next, prev);
        assert_eq!(next.as_str(), "b");
    }

    #[test]
    fn test_alone() {
        assert!(ring_neighbors(&PeerId::from("a"), &Vec::new()).is_none());
    }
}
