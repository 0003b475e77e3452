use proptest::prelude::*;
use midiforge_core::{
    LoadOptions, Scope, Score,
    fixtures::{demo_score_bytes, silent_middle_track_score_bytes},
};

fn options() -> LoadOptions {
    LoadOptions {
        threads: 2,
        ..LoadOptions::default()
    }
}

fn no_panic_load(bytes: &[u8]) -> bool {
    std::panic::catch_unwind(|| {
        if let Ok(score) = Score::from_bytes("corrupt.mid", bytes, &options()) {
            if let Some(timeline) = score.timeline(Scope::WholeFile) {
                let _ = timeline.count();
            }
        }
    })
    .is_ok()
}

/// Checks the count and ordering invariants of every timeline a score offers.
fn timelines_are_consistent(score: &Score) -> bool {
    let isolated: u64 = score.isolated_event_counts().iter().sum();
    if isolated != score.total_event_count() {
        return false;
    }

    let mut scopes = vec![Scope::WholeFile];
    scopes.extend((0..score.track_count()).map(Scope::Track));
    scopes.into_iter().all(|scope| {
        let Some(timeline) = score.timeline(scope) else {
            return false;
        };
        let events: Vec<_> = timeline.collect();
        let ordered = events.windows(2).all(|pair| pair[0].tick <= pair[1].tick);
        let non_negative = events.iter().all(|event| event.delta_seconds >= 0.0);
        ordered && non_negative && events.len() as u64 == score.event_count(scope)
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_midi_bytes_do_not_panic(raw in prop::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert!(no_panic_load(&raw));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn truncated_midi_payloads_do_not_panic(prefix_len in 0usize..512usize) {
        let mut payload = demo_score_bytes();
        payload.truncate(prefix_len.min(payload.len()));
        prop_assert!(no_panic_load(&payload));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn mutated_midi_payloads_keep_timelines_consistent(index in 0usize..512usize, delta in any::<u8>()) {
        let mut payload = silent_middle_track_score_bytes();
        let target = index % payload.len();
        payload[target] ^= delta.max(1);

        prop_assert!(no_panic_load(&payload));
        if let Ok(score) = Score::from_bytes("mutated.mid", &payload, &options()) {
            prop_assert!(timelines_are_consistent(&score));
        }
    }
}

#[test]
fn fixture_scores_have_consistent_timelines() {
    for bytes in [demo_score_bytes(), silent_middle_track_score_bytes()] {
        let score = Score::from_bytes("fixture.mid", &bytes, &options()).expect("fixture should load");
        assert!(timelines_are_consistent(&score));
    }
}
