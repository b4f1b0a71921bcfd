use reverie::{
    FrameIndex, GeneratorSettings, InterpMode, Keyframe, OutputSettings, Sampler, Timeline,
    interpolate_settings,
};

fn key(frame: u64, strength: f64, steps: u32, mode: InterpMode) -> Keyframe {
    let generator = GeneratorSettings {
        prompt: format!("key {frame}"),
        image_strength: strength,
        seed_blend: strength,
        steps,
        ..GeneratorSettings::default()
    };
    Keyframe::new(frame, generator, mode)
}

fn three_keys() -> Timeline {
    Timeline::new(
        10,
        vec![
            key(9, 0.9, 30, InterpMode::Linear),
            key(0, 0.0, 10, InterpMode::Linear),
            key(5, 0.5, 20, InterpMode::Hold),
        ],
        OutputSettings::default(),
    )
    .unwrap()
}

#[test]
fn keys_resolve_to_themselves() {
    let t = three_keys();
    for k in t.keys() {
        assert_eq!(t.resolve_settings(k.frame), k.generator);
    }
    let frames: Vec<u64> = t.keys().iter().map(|k| k.frame.0).collect();
    assert_eq!(frames, vec![0, 5, 9]);
}

#[test]
fn linear_segments_blend_numeric_fields() {
    let t = three_keys();
    let g = t.resolve_settings(FrameIndex(2));
    assert!((g.image_strength - 0.2).abs() < 1e-9);
    assert!((g.seed_blend - 0.2).abs() < 1e-9);
    assert_eq!(g.steps, 14);
    assert_eq!(g.prompt, "key 0");

    let explicit = interpolate_settings(
        &t.keys()[0].generator,
        &t.keys()[1].generator,
        0.4,
        InterpMode::Linear,
    );
    assert_eq!(g, explicit);
}

#[test]
fn hold_segments_keep_the_left_key() {
    let t = three_keys();
    let left = &t.keys()[1].generator;
    for f in 5..9 {
        assert_eq!(&t.resolve_settings(FrameIndex(f)), left);
    }
}

#[test]
fn frames_outside_the_keys_are_clamped() {
    let t = Timeline::new(
        20,
        vec![
            key(4, 0.25, 10, InterpMode::Linear),
            key(8, 0.75, 10, InterpMode::Linear),
        ],
        OutputSettings::default(),
    )
    .unwrap();
    assert_eq!(t.resolve_settings(FrameIndex(0)), t.keys()[0].generator);
    assert_eq!(t.resolve_settings(FrameIndex(19)), t.keys()[1].generator);
    assert_eq!(t.resolve_settings(FrameIndex(500)), t.keys()[1].generator);
}

#[test]
fn interpolation_stays_between_neighbouring_keys() {
    let t = three_keys();
    for (frame, params) in t.frames() {
        let s = params.generator.image_strength;
        assert!((0.0..=0.9).contains(&s), "frame {frame}: {s}");
        assert!((10..=30).contains(&params.generator.steps));
    }
    let strengths: Vec<f64> = t.frames().map(|(_, p)| p.generator.image_strength).collect();
    assert!(strengths.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn editing_keys_keeps_the_timeline_resolvable() {
    let mut t = three_keys();
    t.set_key(key(5, 0.1, 12, InterpMode::Linear));
    assert_eq!(t.keys().len(), 3);
    assert_eq!(t.resolve_settings(FrameIndex(5)).image_strength, 0.1);

    t.remove_key(FrameIndex(5)).unwrap();
    t.remove_key(FrameIndex(9)).unwrap();
    assert!(t.remove_key(FrameIndex(0)).is_err());
    assert!(t.remove_key(FrameIndex(3)).is_err());

    let only = t.keys()[0].generator.clone();
    assert!(t.frames().all(|(_, p)| p.generator == only));
}

#[test]
fn output_settings_are_shared_by_every_frame() {
    let mut t = three_keys();
    t.output_mut().width = 320;
    t.output_mut().height = 200;
    assert!(t.frames().all(|(_, p)| p.output.width == 320));

    let n = t.resolve(FrameIndex(7)).normalized();
    assert_eq!((n.output.width, n.output.height), (320, 192));
}

#[test]
fn eta_only_reaches_ddim() {
    let mut g = GeneratorSettings {
        ddim_eta: 0.4,
        ..GeneratorSettings::default()
    };
    let t = Timeline::constant(1, g.clone(), OutputSettings::default()).unwrap();
    assert_eq!(t.resolve(FrameIndex(0)).normalized().generator.ddim_eta, 0.0);

    g.sampler = Sampler::Ddim;
    let t = Timeline::constant(1, g, OutputSettings::default()).unwrap();
    assert_eq!(t.resolve(FrameIndex(0)).normalized().generator.ddim_eta, 0.4);
}
