use midiforge_core::{
    EngineKind, LoadOptions, RtsSettings, SchedulerSettings, Score, SynthFactory, SynthSettings,
    fingerprint::{read_fingerprint, render_fingerprint, write_fingerprint},
    fixtures::demo_score_bytes,
};

fn demo_score() -> Score {
    Score::from_bytes("demo.mid", &demo_score_bytes(), &LoadOptions::default())
        .expect("demo fixture should load")
}

fn rts_settings() -> SchedulerSettings {
    SchedulerSettings {
        rts: RtsSettings {
            enabled: true,
            fluctuation_percent: 20.0,
            ..RtsSettings::default()
        },
        ..SchedulerSettings::default()
    }
}

#[test]
fn repeated_renders_share_a_fingerprint() {
    for engine in [EngineKind::Tone, EngineKind::Chip] {
        let factory = SynthFactory::new(SynthSettings {
            engine,
            ..SynthSettings::default()
        });
        let settings = rts_settings();

        let first = render_fingerprint(&demo_score(), &factory, &settings)
            .expect("first render should succeed");
        let second = render_fingerprint(&demo_score(), &factory, &settings)
            .expect("second render should succeed");

        assert_eq!(first, second, "{engine:?} render drifted between runs");
        assert!(first.frames > 0);
    }
}

#[test]
fn rts_changes_the_render() {
    let factory = SynthFactory::new(SynthSettings::default());
    let plain = render_fingerprint(&demo_score(), &factory, &SchedulerSettings::default())
        .expect("plain render should succeed");
    let jittered = render_fingerprint(&demo_score(), &factory, &rts_settings())
        .expect("rts render should succeed");

    assert_ne!(plain.pcm_hash, jittered.pcm_hash);
}

#[test]
fn fingerprint_survives_disk_round_trip() {
    let temp_dir = tempfile::tempdir().expect("tempdir should work");
    let path = temp_dir.path().join("demo.fingerprint.json");
    let factory = SynthFactory::new(SynthSettings::default());

    let fingerprint = render_fingerprint(&demo_score(), &factory, &SchedulerSettings::default())
        .expect("render should succeed");
    write_fingerprint(&path, &fingerprint).expect("fingerprint should write");

    let reloaded = read_fingerprint(&path).expect("fingerprint should read");
    assert_eq!(reloaded, fingerprint);
}
