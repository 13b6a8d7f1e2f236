//! End-to-end integer golden tests: small hand-computed networks run
//! through the full engine against the simulator backend.

use std::time::Duration;

use yolo2_driver::{SimBus, SimPool};
use yolo2_models::prelude::*;

const BASE: u64 = 0x4000_0000;

fn config() -> EngineConfig {
    EngineConfig {
        layer_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// conv(identity) -> maxpool -> 1x1 head -> region, all at Q0.
///
/// The first convolution's two filters are a center-tap identity and a
/// center-tap doubler, the pool reduces 4x4 to 2x2, and the head wires
/// the identity plane into the objectness channel. Every intermediate
/// value is hand-checkable.
#[test]
fn straight_chain_golden() {
    let mut b = NetworkBuilder::new(4, 4, 1);
    b.conv(2, 3, 1, true, true);
    b.maxpool(2, 2);
    b.conv(6, 1, 1, false, false);
    b.region(1, 1, true);
    let net = b.finish().unwrap();

    // conv0: filter0 center tap 1, filter1 center tap 2.
    let mut w = vec![0i16; 18 + 12];
    w[4] = 1;
    w[13] = 2;
    // head: objectness (channel 4) reads plane 0, class reads plane 1.
    w[18 + 8] = 1;
    w[18 + 11] = 1;
    let weights = WeightSet::new(w, vec![0; 8], &net).unwrap();
    let tables = QTables::new(vec![0, 0], vec![0, 0], vec![0, 0, 0], &net).unwrap();

    let mut pool = SimPool::new(BASE, 2048);
    let bus = SimBus::new(pool.backing(), pool.base_phys());
    let mut engine = InferenceEngine::new(
        bus,
        &mut pool,
        net,
        weights,
        tables,
        &[(1.0, 1.0)],
        config(),
    )
    .unwrap();

    let image: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    let dets = engine.run(&image, 64, 64).unwrap();

    // Pooled identity plane is [6, 8, 14, 16]; each cell clears the
    // threshold and no boxes overlap, so all four survive.
    assert_eq!(dets.len(), 4);
    assert_eq!(engine.hw_layers_run(), 3);

    let top = &dets[0];
    assert!((top.prob - sigmoid(16.0)).abs() < 1e-4);
    assert!((top.bbox.x - 0.75).abs() < 1e-6);
    assert!((top.bbox.y - 0.75).abs() < 1e-6);
    // exp(0) * anchor 1.0 over the 2-cell grid.
    assert!((top.bbox.w - 0.5).abs() < 1e-6);
    assert!((top.bbox.h - 0.5).abs() < 1e-6);
    assert!((dets[3].prob - sigmoid(6.0)).abs() < 1e-4);

    // A second frame reuses the arena and gives the same answer.
    let again = engine.run(&image, 64, 64).unwrap();
    assert_eq!(again.len(), 4);
    assert!((again[0].prob - top.prob).abs() < 1e-6);
    assert_eq!(engine.hw_layers_run(), 6);
}

/// conv(scale) -> 1x1 head -> region on an 8-wide image, so rows carry
/// no alignment padding and the head tensor is fully determined.
///
/// conv0 doubles through Q1 (filters x1 and x3, output at Qa=1); the
/// head shifts back to Q0, wiring channel 0 into objectness and
/// channel 1 into the class plane. The final tensor is therefore the
/// image itself on plane 4 and the tripled image on plane 5.
fn flat_rows_net() -> (Network, WeightSet, QTables) {
    let mut b = NetworkBuilder::new(8, 2, 1);
    b.conv(2, 1, 1, true, true);
    b.conv(6, 1, 1, false, false);
    b.region(1, 1, true);
    let net = b.finish().unwrap();

    let mut w = vec![0i16; 2 + 12];
    w[0] = 1; // conv0 f0 <- ch0
    w[1] = 3; // conv0 f1 <- 3 * ch0
    w[2 + 4 * 2] = 1; // head objectness <- ch0
    w[2 + 5 * 2 + 1] = 1; // head class <- ch1
    let weights = WeightSet::new(w, vec![0; 8], &net).unwrap();
    let tables = QTables::new(vec![0, 0], vec![0, 0], vec![0, 1, 0], &net).unwrap();
    (net, weights, tables)
}

/// The complete head tensor, word for word against the dump.
#[test]
fn head_tensor_matches_golden_words() {
    let (net, weights, tables) = flat_rows_net();
    let mut pool = SimPool::new(BASE, 2048);
    let bus = SimBus::new(pool.backing(), pool.base_phys());
    let dump = std::env::temp_dir().join("yolo2_head_tensor_golden");
    let mut engine = InferenceEngine::new(
        bus,
        &mut pool,
        net,
        weights,
        tables,
        &[(1.0, 1.0)],
        EngineConfig {
            dump_dir: Some(dump.clone()),
            ..config()
        },
    )
    .unwrap();

    let image: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    engine.run(&image, 64, 64).unwrap();

    // Head conv is layer 1: 6 planes of 2x8, 96 words, no padding.
    let raw = std::fs::read(dump.join("layer_01.bin")).unwrap();
    let words: Vec<i16> = raw
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    // Box planes are all zero; plane 4 is the image, plane 5 is the
    // image tripled (x2 into Q1, then x1/x3 taps and a 1-bit shift
    // back down).
    let mut expected = vec![0i16; 96];
    for v in 1..=16i16 {
        expected[64 + (v as usize - 1)] = v;
        expected[80 + (v as usize - 1)] = 3 * v;
    }
    assert_eq!(words, expected);

    std::fs::remove_dir_all(&dump).ok();
}

/// A dump directory that cannot be created must not abort the run.
#[test]
fn unwritable_dump_dir_is_not_fatal() {
    let (net, weights, tables) = flat_rows_net();
    let mut pool = SimPool::new(BASE, 2048);
    let bus = SimBus::new(pool.backing(), pool.base_phys());
    let mut engine = InferenceEngine::new(
        bus,
        &mut pool,
        net,
        weights,
        tables,
        &[(1.0, 1.0)],
        EngineConfig {
            dump_dir: Some("/dev/null/layer-dumps".into()),
            ..config()
        },
    )
    .unwrap();

    let image: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    let dets = engine.run(&image, 64, 64).unwrap();
    assert!(!dets.is_empty());
}

/// A miniature passthrough: a backbone tap is routed, reorged, Q-aligned
/// down two bits, and merged with the main path, mirroring the shape of
/// the full network's layers 25-28.
#[test]
fn passthrough_merge_golden() {
    let mut b = NetworkBuilder::new(4, 4, 2);
    b.conv(2, 1, 1, true, true); // 0: identity x8 (Q0 -> Q3)
    b.maxpool(2, 2); // 1
    b.conv(4, 1, 1, true, false); // 2: plane0 x4, at Q1
    b.route(&[0]); // 3: tap
    b.reorg(2); // 4: 4x4x2 -> 2x2x8, aligned Q3 -> Q1
    b.route(&[4, 2]); // 5: 12 channels
    b.conv(6, 1, 1, false, false); // 6: head
    b.region(1, 1, true); // 7
    let net = b.finish().unwrap();

    // conv0 is a channel identity; conv2 reads plane 0 with weight 1
    // on all four filters; the head's objectness channel reads route
    // channel 8 (the first conv2 plane).
    let mut w = vec![0i16; 4 + 8 + 72];
    w[0] = 1; // conv0 m0 <- ch0
    w[3] = 1; // conv0 m1 <- ch1
    for m in 0..4 {
        w[4 + m * 2] = 1;
    }
    w[12 + 4 * 12 + 8] = 1;
    let weights = WeightSet::new(w, vec![0; 12], &net).unwrap();
    // Activations: input Q0, conv0 out Q3, conv2 out Q1, head out Q0.
    let tables =
        QTables::new(vec![0, 0, 0], vec![0, 0, 0], vec![0, 3, 1, 0], &net).unwrap();

    let mut pool = SimPool::new(BASE, 4096);
    let bus = SimBus::new(pool.backing(), pool.base_phys());
    let dump = std::env::temp_dir().join("yolo2_passthrough_golden");
    let mut engine = InferenceEngine::new(
        bus,
        &mut pool,
        net,
        weights,
        tables,
        &[(1.0, 1.0)],
        EngineConfig {
            dump_dir: Some(dump.clone()),
            ..config()
        },
    )
    .unwrap();

    let image: Vec<f32> = (1..=32).map(|v| v as f32).collect();
    let dets = engine.run(&image, 64, 64).unwrap();

    // Head objectness = conv2 plane0 brought back to Q0: the pooled
    // plane0 maxima [6, 8, 14, 16], same as the straight chain.
    assert_eq!(dets.len(), 4);
    assert!((dets[0].prob - sigmoid(16.0)).abs() < 1e-4);
    assert!((dets[0].bbox.x - 0.75).abs() < 1e-6);

    // The dumped reorg output is the conv0 buffer (inputs x8 at Q3)
    // shuffled and rounded down to Q1 (values x2).
    let raw = std::fs::read(dump.join("layer_04.bin")).unwrap();
    let words: Vec<i16> = raw
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    // Plane 0 of the 2x2x8 output, rows padded to 8 words.
    assert_eq!(words[0], 2); // input 1
    assert_eq!(words[1], 6); // input 3
    assert_eq!(words[8], 10); // input 5
    assert_eq!(words[9], 14); // input 7
    // Plane 1 starts two padded rows in.
    assert_eq!(words[16], 34); // input 17

    std::fs::remove_dir_all(&dump).ok();
}
