//! Tuner-capacity conflict resolution over overlapping recordings.
//!
//! The overlap graph is held as an index-based adjacency map rather than as
//! object back-references, so the recording set stays a plain value
//! collection.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::dvr::models::{ScheduledRecording, TunerSource};

/// Mark lower-priority recordings that cannot be captured within their tuner
/// source's capacity (`will_record = false`). Also fills each recording's
/// symmetric conflict set.
///
/// Recordings are visited once, ascending by priority order (ties broken by
/// remote id). A recording marked as losing is excluded from every later
/// capacity computation and never revisited.
pub fn resolve_conflicts(recordings: &mut [ScheduledRecording], tuners: &[TunerSource]) {
    if recordings.is_empty() {
        return;
    }

    let capacities: HashMap<i64, u32> = tuners.iter().map(|t| (t.id, t.capacity)).collect();

    // Full undirected overlap graph
    let mut adjacency: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); recordings.len()];
    for i in 0..recordings.len() {
        for j in (i + 1)..recordings.len() {
            if recordings[i].overlaps(&recordings[j]) {
                adjacency[i].insert(j);
                adjacency[j].insert(i);
            }
        }
    }
    for (i, neighbors) in adjacency.iter().enumerate() {
        recordings[i].conflicts = neighbors
            .iter()
            .map(|&j| recordings[j].remote_id.clone())
            .collect();
    }

    let mut order: Vec<usize> = (0..recordings.len()).collect();
    order.sort_by(|&a, &b| priority_cmp(&recordings[a], &recordings[b]));

    for &i in &order {
        if !recordings[i].will_record {
            continue;
        }

        let capacity = tuner_capacity(&capacities, &recordings[i]) as usize;

        // Conflicts that are still in the running
        let live: Vec<usize> = adjacency[i]
            .iter()
            .copied()
            .filter(|&j| recordings[j].will_record)
            .collect();

        if live.len() + 1 <= capacity {
            continue;
        }

        // This recording and its live conflicts all compete for the same
        // tuners; keep the highest-priority `capacity` of them. Conflicts of
        // conflicts outside this set do not count against it.
        let mut contenders = live;
        contenders.push(i);
        contenders.sort_by(|&a, &b| priority_cmp(&recordings[a], &recordings[b]));

        debug!(
            "Capacity {} exceeded around {}; contenders: {:?}",
            capacity,
            recordings[i].remote_id,
            contenders
                .iter()
                .map(|&j| recordings[j].remote_id.as_str())
                .collect::<Vec<_>>()
        );

        for &loser in contenders.iter().skip(capacity) {
            recordings[loser].will_record = false;
        }
    }

    info!(
        "Conflicts found: {}",
        recordings.iter().filter(|r| !r.will_record).count()
    );
}

fn tuner_capacity(capacities: &HashMap<i64, u32>, rec: &ScheduledRecording) -> u32 {
    let known = rec.tuner_source_id.and_then(|id| capacities.get(&id).copied());
    match known {
        Some(c) if c >= 1 => c,
        _ => {
            warn!(
                "Recording {} has an unrecognized tuner source {:?}, assuming 1 tuner",
                rec.remote_id, rec.tuner_source_id
            );
            1
        }
    }
}

/// Deterministic ordering: priority order first, remote id as tiebreak.
fn priority_cmp(a: &ScheduledRecording, b: &ScheduledRecording) -> std::cmp::Ordering {
    a.priority_order
        .total_cmp(&b.priority_order)
        .then_with(|| a.remote_id.cmp(&b.remote_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvr::models::MetadataKind;
    use chrono::{DateTime, Duration, Local, TimeZone};

    fn local(h: u32, mi: u32) -> DateTime<Local> {
        Local
            .from_local_datetime(
                &chrono::NaiveDate::from_ymd_opt(2026, 3, 10)
                    .unwrap()
                    .and_hms_opt(h, mi, 0)
                    .unwrap(),
            )
            .unwrap()
    }

    fn rec(
        id: &str,
        priority: f64,
        start: DateTime<Local>,
        end: DateTime<Local>,
        source: i64,
    ) -> ScheduledRecording {
        let mut r = ScheduledRecording::new(id.to_string(), 1, MetadataKind::Episode, priority);
        r.start_time = Some(start);
        r.end_time = Some(end);
        r.tuner_source_id = Some(source);
        r
    }

    fn tuner(id: i64, capacity: u32) -> TunerSource {
        TunerSource { id, capacity }
    }

    #[test]
    fn conflict_sets_are_symmetric() {
        let mut recs = vec![
            rec("a", 1.0, local(9, 0), local(10, 0), 1),
            rec("b", 2.0, local(9, 30), local(10, 30), 1),
            rec("c", 3.0, local(10, 15), local(11, 0), 1),
            rec("d", 4.0, local(12, 0), local(13, 0), 1),
        ];
        resolve_conflicts(&mut recs, &[tuner(1, 8)]);

        for i in 0..recs.len() {
            for j in 0..recs.len() {
                assert_eq!(
                    recs[i].conflicts.contains(&recs[j].remote_id),
                    recs[j].conflicts.contains(&recs[i].remote_id),
                    "asymmetry between {} and {}",
                    recs[i].remote_id,
                    recs[j].remote_id
                );
            }
        }
        assert!(recs[3].conflicts.is_empty());
    }

    #[test]
    fn overlapping_pair_on_single_tuner_keeps_higher_priority() {
        // Scenario: X(1, 09:00-10:00) vs Y(2, 09:30-10:30), capacity 1
        let mut recs = vec![
            rec("x", 1.0, local(9, 0), local(10, 0), 1),
            rec("y", 2.0, local(9, 30), local(10, 30), 1),
        ];
        resolve_conflicts(&mut recs, &[tuner(1, 1)]);

        assert!(recs[0].will_record);
        assert!(!recs[1].will_record);
    }

    #[test]
    fn priority_precedence_is_order_independent() {
        // Same scenario with the lower-priority recording listed first
        let mut recs = vec![
            rec("y", 2.0, local(9, 30), local(10, 30), 1),
            rec("x", 1.0, local(9, 0), local(10, 0), 1),
        ];
        resolve_conflicts(&mut recs, &[tuner(1, 1)]);

        assert!(!recs[0].will_record);
        assert!(recs[1].will_record);
    }

    #[test]
    fn three_way_overlap_on_two_tuners_drops_lowest_priority() {
        // Scenario: three mutually overlapping recordings, capacity 2
        let mut recs = vec![
            rec("a", 1.0, local(9, 0), local(10, 0), 1),
            rec("b", 2.0, local(9, 0), local(10, 0), 1),
            rec("c", 3.0, local(9, 0), local(10, 0), 1),
        ];
        resolve_conflicts(&mut recs, &[tuner(1, 2)]);

        assert!(recs[0].will_record);
        assert!(recs[1].will_record);
        assert!(!recs[2].will_record);
    }

    #[test]
    fn equal_priorities_break_ties_by_remote_id() {
        let mut recs = vec![
            rec("b", 1.0, local(9, 0), local(10, 0), 1),
            rec("a", 1.0, local(9, 0), local(10, 0), 1),
        ];
        resolve_conflicts(&mut recs, &[tuner(1, 1)]);

        assert!(!recs[0].will_record);
        assert!(recs[1].will_record);
    }

    #[test]
    fn unknown_tuner_source_defaults_to_one() {
        let mut recs = vec![
            rec("a", 1.0, local(9, 0), local(10, 0), 99),
            rec("b", 2.0, local(9, 0), local(10, 0), 99),
        ];
        // Tuner 99 is not in the list
        resolve_conflicts(&mut recs, &[tuner(1, 4)]);

        assert!(recs[0].will_record);
        assert!(!recs[1].will_record);
    }

    #[test]
    fn disjoint_conflicts_of_a_loser_are_freed_up() {
        // a(1) overlaps both b(2) and c(3); b and c do not overlap each
        // other. Capacity 1: a wins, b and c both lose to a.
        let mut recs = vec![
            rec("a", 1.0, local(9, 0), local(11, 0), 1),
            rec("b", 2.0, local(9, 0), local(9, 30), 1),
            rec("c", 3.0, local(10, 30), local(11, 0), 1),
        ];
        resolve_conflicts(&mut recs, &[tuner(1, 1)]);

        assert!(recs[0].will_record);
        assert!(!recs[1].will_record);
        assert!(!recs[2].will_record);
    }

    #[test]
    fn losers_do_not_count_against_later_capacity() {
        // d(4) overlaps c(3) only. c already lost to a+b on capacity 2, so d
        // must still record.
        let mut recs = vec![
            rec("a", 1.0, local(9, 0), local(10, 0), 1),
            rec("b", 2.0, local(9, 0), local(10, 0), 1),
            rec("c", 3.0, local(9, 0), local(10, 0), 1),
            rec("d", 4.0, local(9, 30), local(10, 30), 1),
        ];
        resolve_conflicts(&mut recs, &[tuner(1, 2)]);

        assert!(recs[0].will_record);
        assert!(recs[1].will_record);
        assert!(!recs[2].will_record);
        assert!(recs[3].will_record);
    }

    #[test]
    fn capacity_bound_holds_at_every_instant() {
        let mut recs = vec![
            rec("a", 1.0, local(9, 0), local(10, 0), 1),
            rec("b", 2.0, local(9, 15), local(10, 15), 1),
            rec("c", 3.0, local(9, 30), local(10, 30), 1),
            rec("d", 4.0, local(9, 45), local(10, 45), 1),
            rec("e", 5.0, local(10, 20), local(11, 0), 1),
            rec("f", 1.5, local(9, 10), local(9, 40), 2),
            rec("g", 2.5, local(9, 20), local(9, 50), 2),
        ];
        let tuners = [tuner(1, 2), tuner(2, 1)];
        resolve_conflicts(&mut recs, &tuners);

        // Probe at every minute of the day's schedule
        let mut t = local(8, 0);
        while t < local(12, 0) {
            for src in &tuners {
                let active = recs
                    .iter()
                    .filter(|r| {
                        r.will_record
                            && r.tuner_source_id == Some(src.id)
                            && r.effective_start().unwrap() <= t
                            && r.effective_end().unwrap() > t
                    })
                    .count();
                assert!(
                    active <= src.capacity as usize,
                    "capacity exceeded on source {} at {}",
                    src.id,
                    t
                );
            }
            t += Duration::minutes(1);
        }
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut recs = vec![
            rec("a", 1.0, local(9, 0), local(10, 0), 1),
            rec("b", 2.0, local(9, 30), local(10, 30), 1),
            rec("c", 3.0, local(9, 45), local(10, 45), 1),
        ];
        let tuners = [tuner(1, 2)];
        resolve_conflicts(&mut recs, &tuners);
        let first: Vec<bool> = recs.iter().map(|r| r.will_record).collect();

        // Re-running on a freshly rebuilt identical set yields the same verdicts
        let mut again = vec![
            rec("a", 1.0, local(9, 0), local(10, 0), 1),
            rec("b", 2.0, local(9, 30), local(10, 30), 1),
            rec("c", 3.0, local(9, 45), local(10, 45), 1),
        ];
        resolve_conflicts(&mut again, &tuners);
        let second: Vec<bool> = again.iter().map(|r| r.will_record).collect();
        assert_eq!(first, second);
    }
}
