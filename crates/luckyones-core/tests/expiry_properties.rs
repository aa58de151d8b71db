//! Deadline queue ordering properties

use std::time::Duration;

use luckyones_core::{AttachmentId, ExpiryScheduler, ExpiryTarget};
use luckyones_harness::SimInstant;
use proptest::prelude::*;

fn at(secs: u64) -> SimInstant {
    SimInstant::default() + Duration::from_secs(secs)
}

proptest! {
    /// Whatever order deadlines are scheduled in, one sweep fires exactly
    /// the due ones, earliest first, ties in scheduling order.
    #[test]
    fn prop_fires_due_entries_in_deadline_order(
        deadlines in prop::collection::vec(0u64..100, 1..60),
        now in 0u64..120,
    ) {
        let scheduler = ExpiryScheduler::new();
        for (index, secs) in deadlines.iter().enumerate() {
            scheduler.schedule(at(*secs), ExpiryTarget::Attachment(AttachmentId(index as u128)));
        }

        let mut fired = Vec::new();
        let count = scheduler.tick(at(now), |f| fired.push(f));

        let mut expected: Vec<(u64, usize)> = deadlines
            .iter()
            .enumerate()
            .filter(|(_, secs)| **secs <= now)
            .map(|(index, secs)| (*secs, index))
            .collect();
        expected.sort_unstable();

        prop_assert_eq!(count, expected.len());
        prop_assert_eq!(scheduler.pending(), deadlines.len() - expected.len());
        let observed: Vec<(SimInstant, ExpiryTarget)> =
            fired.iter().map(|f| (f.at, f.target)).collect();
        let wanted: Vec<(SimInstant, ExpiryTarget)> = expected
            .iter()
            .map(|(secs, index)| {
                (at(*secs), ExpiryTarget::Attachment(AttachmentId(*index as u128)))
            })
            .collect();
        prop_assert_eq!(observed, wanted);
    }

    /// Sweeping in many small steps fires the same sequence as one sweep.
    #[test]
    fn prop_incremental_sweeps_match_single_sweep(
        deadlines in prop::collection::vec(0u64..50, 1..40),
        step in 1u64..10,
    ) {
        let single = ExpiryScheduler::new();
        let stepped = ExpiryScheduler::new();
        for (index, secs) in deadlines.iter().enumerate() {
            let target = ExpiryTarget::Attachment(AttachmentId(index as u128));
            single.schedule(at(*secs), target);
            stepped.schedule(at(*secs), target);
        }

        let mut all_at_once = Vec::new();
        single.tick(at(60), |f| all_at_once.push(f.target));

        let mut incremental = Vec::new();
        let mut now = 0;
        while now <= 60 {
            stepped.tick(at(now), |f| incremental.push(f.target));
            now += step;
        }
        stepped.tick(at(60), |f| incremental.push(f.target));

        prop_assert_eq!(all_at_once, incremental);
        prop_assert_eq!(stepped.next_deadline(), None);
    }
}
