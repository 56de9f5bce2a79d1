use std::sync::Arc;

use crate::worker::WorkerSession;

/// Order workers by descending score, best first.
///
/// Scores are read once per worker. Workers with equal scores keep their
/// snapshot order.
pub fn rank_workers(workers: Vec<Arc<WorkerSession>>) -> Vec<Arc<WorkerSession>> {
    let mut scored: Vec<(f64, Arc<WorkerSession>)> =
        workers.into_iter().map(|w| (w.score(), w)).collect();

    // sort_by is stable
    scored.sort_by(|(a, _), (b, _)| b.total_cmp(a));

    scored.into_iter().map(|(_, w)| w).collect()
}

/// Clamp a target's quota to `[0, available]`
pub fn clamp_quota(share_diff: i64, available: usize) -> usize {
    if share_diff <= 0 {
        return 0;
    }
    usize::try_from(share_diff).map_or(available, |need| need.min(available))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sessions(scores: &[f64]) -> Vec<Arc<WorkerSession>> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| Arc::new(WorkerSession::with_score(format!("rig{}", i), *s)))
            .collect()
    }

    fn ids(workers: &[Arc<WorkerSession>]) -> Vec<String> {
        workers.iter().map(|w| w.id().to_string()).collect()
    }

    #[test]
    fn test_highest_score_first() {
        let ranked = rank_workers(sessions(&[1.0, 5.0, 3.0]));
        assert_eq!(ids(&ranked), vec!["rig1", "rig2", "rig0"]);
    }

    #[test]
    fn test_equal_scores_keep_order() {
        let ranked = rank_workers(sessions(&[2.0, 7.0, 2.0, 2.0]));
        assert_eq!(ids(&ranked), vec!["rig1", "rig0", "rig2", "rig3"]);
    }

    #[test]
    fn test_clamp_quota() {
        assert_eq!(clamp_quota(-4, 10), 0);
        assert_eq!(clamp_quota(0, 10), 0);
        assert_eq!(clamp_quota(3, 10), 3);
        assert_eq!(clamp_quota(2, 1), 1);
        assert_eq!(clamp_quota(i64::MAX, 7), 7);
        assert_eq!(clamp_quota(5, 0), 0);
    }

    proptest! {
        #[test]
        fn prop_ranking_is_stable_and_descending(scores in prop::collection::vec(0u8..4, 0..40)) {
            let scores: Vec<f64> = scores.into_iter().map(f64::from).collect();
            let ranked = rank_workers(sessions(&scores));
            prop_assert_eq!(ranked.len(), scores.len());

            for pair in ranked.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.score() >= b.score());
                if a.score() == b.score() {
                    // ids are rig<snapshot index>
                    let ia: usize = a.id().as_str()[3..].parse().unwrap();
                    let ib: usize = b.id().as_str()[3..].parse().unwrap();
                    prop_assert!(ia < ib);
                }
            }
        }

        #[test]
        fn prop_quota_within_bounds(diff in any::<i64>(), available in 0usize..1000) {
            let quota = clamp_quota(diff, available);
            prop_assert!(quota <= available);
            if diff > 0 && (diff as u64) <= available as u64 {
                prop_assert_eq!(quota, diff as usize);
            }
        }
    }
}
