//! Best-path selection for the fast cadence.
//!
//! Up to three paths per destination, balancing three axes: the lowest
//! observed RTT (current best performance), the fewest hops (the stable
//! baseline route), and maximum disjointness from the already chosen ones
//! (a failure that is uncorrelated with the others).

use std::collections::HashSet;

use crate::prober::table::{PathState, PathStatus};

const MAX_SELECTED: usize = 3;

/// Select up to three paths from a destination's table snapshot.
pub fn select_optimal_paths(paths: &[PathStatus]) -> Vec<PathStatus> {
    // Down and timed-out paths sit out this round; the next sweep can
    // rehabilitate them.
    let active: Vec<&PathStatus> = paths
        .iter()
        .filter(|p| !matches!(p.state, PathState::Down | PathState::Timeout))
        .collect();

    if active.len() <= MAX_SELECTED {
        return active.into_iter().cloned().collect();
    }

    // Shortest path by hop count; ties go to the first encountered.
    let shortest = *active
        .iter()
        .min_by_key(|p| p.path.hop_count())
        .expect("active is non-empty");

    // Lowest RTT among paths that actually have one. Unprobed paths carry
    // 0.0 and must not win this axis.
    let lowest_rtt = active
        .iter()
        .filter(|p| p.last_rtt_ms > 0.0)
        .min_by(|a, b| a.last_rtt_ms.total_cmp(&b.last_rtt_ms))
        .copied();

    let mut selected: Vec<PathStatus> = vec![shortest.clone()];
    if let Some(lowest) = lowest_rtt {
        if lowest.fingerprint != shortest.fingerprint {
            selected.push(lowest.clone());
        }
    }

    // Fill the remaining slots with the candidates most disjoint from the
    // seed set.
    let chosen: HashSet<_> = selected.iter().map(|p| p.fingerprint).collect();
    let mut ranked: Vec<(&PathStatus, usize)> = active
        .iter()
        .filter(|p| !chosen.contains(&p.fingerprint))
        .map(|&candidate| (candidate, disjointness(candidate, &selected)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    for (candidate, _) in ranked {
        if selected.len() >= MAX_SELECTED {
            break;
        }
        selected.push(candidate.clone());
    }
    selected
}

/// Sum over the seed set of the number of candidate interfaces that do not
/// appear in that seed path.
fn disjointness(candidate: &PathStatus, selected: &[PathStatus]) -> usize {
    selected
        .iter()
        .map(|seed| {
            let seed_interfaces: HashSet<String> = seed
                .path
                .interfaces
                .iter()
                .map(|i| i.to_string())
                .collect();
            candidate
                .path
                .interfaces
                .iter()
                .filter(|i| !seed_interfaces.contains(&i.to_string()))
                .count()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scion::addr::{Asn, Isd, IsdAsn};
    use crate::scion::path::{Fingerprint, Path, PathInterface};
    use bytes::Bytes;

    /// Build a status whose interface ids are given explicitly; the
    /// fingerprint follows from them.
    fn status(ids: &[u64], state: PathState, rtt_ms: f64) -> PathStatus {
        let path = Path {
            dataplane: Bytes::new(),
            underlay: None,
            interfaces: ids
                .iter()
                .map(|&id| PathInterface {
                    ia: IsdAsn::new(Isd(1), Asn(id / 100 + 1)),
                    id,
                })
                .collect(),
        };
        let fingerprint = Fingerprint::of(&path);
        PathStatus {
            state,
            path,
            fingerprint,
            last_rtt_ms: rtt_ms,
        }
    }

    #[test]
    fn small_active_set_is_returned_whole() {
        let table = vec![
            status(&[1, 2], PathState::Probed, 10.0),
            status(&[3, 4], PathState::Idle, 0.0),
            status(&[5, 6], PathState::Timeout, 0.0),
        ];
        let selected = select_optimal_paths(&table);
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|p| p.state != PathState::Timeout));
    }

    #[test]
    fn down_and_timeout_paths_never_selected() {
        let table = vec![
            status(&[1, 2], PathState::Down, 0.0),
            status(&[3, 4], PathState::Timeout, 0.0),
        ];
        assert!(select_optimal_paths(&table).is_empty());
    }

    #[test]
    fn unknown_paths_stay_in_the_pool() {
        let table = vec![status(&[1, 2], PathState::Unknown, 0.0)];
        assert_eq!(select_optimal_paths(&table).len(), 1);
    }

    /// Five active paths (hops, rtt): A(2, 80), B(3, 40), C(4, 90),
    /// D(5, 50), E(3, 70). Shortest is A, lowest RTT is B; the third pick
    /// is the highest disjointness score against {A, B}.
    #[test]
    fn picks_shortest_lowest_rtt_and_most_disjoint() {
        let a = status(&[1, 2], PathState::Probed, 80.0);
        let b = status(&[1, 3, 4], PathState::Probed, 40.0);
        let c = status(&[1, 3, 5, 6], PathState::Probed, 90.0);
        let d = status(&[10, 11, 12, 13, 14], PathState::Probed, 50.0);
        let e = status(&[2, 3, 15], PathState::Probed, 70.0);
        let table = vec![a.clone(), b.clone(), c.clone(), d.clone(), e.clone()];

        let selected = select_optimal_paths(&table);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].fingerprint, a.fingerprint);
        assert_eq!(selected[1].fingerprint, b.fingerprint);
        // D shares no interface with A or B: score 10, the clear winner.
        assert_eq!(selected[2].fingerprint, d.fingerprint);

        let fingerprints: HashSet<_> = selected.iter().map(|p| p.fingerprint).collect();
        assert_eq!(fingerprints.len(), 3);
    }

    #[test]
    fn same_shortest_and_lowest_rtt_seeds_one_path() {
        // A wins both axes; two disjoint fillers complete the set.
        let a = status(&[1, 2], PathState::Probed, 10.0);
        let b = status(&[1, 3, 4], PathState::Probed, 40.0);
        let c = status(&[5, 6, 7], PathState::Probed, 50.0);
        let d = status(&[1, 2, 8], PathState::Probed, 60.0);
        let table = vec![a.clone(), b, c.clone(), d];

        let selected = select_optimal_paths(&table);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].fingerprint, a.fingerprint);
        // C is fully disjoint from A and ranks first among the fillers.
        assert_eq!(selected[1].fingerprint, c.fingerprint);
    }

    #[test]
    fn never_returns_more_than_three() {
        let table: Vec<_> = (0..10)
            .map(|i| status(&[i, i + 100, i + 200], PathState::Probed, 10.0 + i as f64))
            .collect();
        assert_eq!(select_optimal_paths(&table).len(), 3);
    }
}
