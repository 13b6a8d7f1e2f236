//! Feature-map placement inside the shared DMA arena.
//!
//! The whole network runs in one physically-contiguous arena. Straight
//! chains ping-pong between the two ends: a layer reads one end and
//! writes the other, so consecutive buffers never collide. Outputs
//! that stay live past the next layer — route sources and anything
//! consumed further downstream — are parked in a band stack that grows
//! down from the bottom end, and ping-pong writes on that end land
//! below the live stack.
//!
//! Bands are popped only from the end of the stack once dead; a dead
//! band beneath a live one stays reserved. This forfeits a little
//! memory in exchange for placements that never move, which keeps
//! every buffer address stable from the moment it is written.
//!
//! Route outputs alias their first source when the sources sit
//! adjacent in memory (the planner orders bands so that the common
//! reorg-plus-backbone merge does); otherwise the route gets its own
//! band and the engine concatenates on the CPU.
//!
//! A 512-word guard sits at offset zero; the core's burst engine can
//! overrun reads by a few beats and must never land before the arena.

use crate::error::{ModelError, Result};
use crate::network::{LayerKind, Network};

/// Guard band at the start of the arena, in words.
pub const GUARD_WORDS: usize = 512;

/// Where one layer's buffers live, as word offsets into the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// One offset per input edge, in the layer's input order.
    pub input_offsets: Vec<usize>,
    /// Output buffer offset.
    pub output_offset: usize,
    /// Route only: sources are not adjacent, concatenate on the CPU.
    pub copy_route: bool,
}

/// A fully-resolved arena plan.
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    /// Total arena size in words, guard included.
    pub arena_words: usize,
    /// Offset of the network input buffer (start of the ping-pong
    /// region, just past the guard).
    pub input_offset: usize,
    /// Size of the ping-pong region in words.
    pub region_words: usize,
    /// Per-layer buffer placements.
    pub placements: Vec<Placement>,
}

/// Which end of the ping-pong region a buffer occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    /// At the top end (starts at the guard boundary).
    Top,
    /// On the bottom end; the value is the distance from the region's
    /// bottom boundary to the buffer start.
    Bottom(usize),
}

#[derive(Debug)]
struct Band {
    size: usize,
    /// Last layer index that reads this band.
    dies_after: usize,
}

/// Plan the arena for a network.
///
/// # Errors
///
/// Returns [`ModelError::LayoutFailed`] if a route source was never
/// placed or liveness cannot be resolved. The plan itself always fits:
/// the region is sized to the worst simultaneous top/bottom usage.
pub fn plan(net: &Network) -> Result<MemoryPlan> {
    let layers = net.layers();
    let consumers = net.consumers();

    // Last layer that reads each output, looking through routes: a
    // band consumed by a route must outlive the route's own readers.
    let dies_after = |i: usize| -> usize {
        let mut last = i;
        for &c in &consumers[i] {
            last = last.max(c);
            if matches!(layers[c].kind, LayerKind::Route) {
                for &cc in &consumers[c] {
                    last = last.max(cc);
                }
            }
        }
        last
    };

    // Retained outputs leave the ping-pong cadence: anything a route
    // reads, or anything still needed after the next layer.
    let retained = |i: usize| -> bool {
        consumers[i]
            .iter()
            .any(|&c| c > i + 1 || matches!(layers[c].kind, LayerKind::Route))
    };

    let mut locs: Vec<Loc> = Vec::with_capacity(layers.len());
    let mut copy_route = vec![false; layers.len()];
    let mut stack: Vec<Band> = Vec::new();
    let mut region_words = 0usize;

    let input_loc = Loc::Top;
    let input_size = net.input_words();

    for (i, layer) in layers.iter().enumerate() {
        // Free bands from the end of the stack whose readers are done.
        while stack.last().is_some_and(|b| b.dies_after < i) {
            stack.pop();
        }
        let reserve: usize = stack.iter().map(|b| b.size).sum();

        let in_loc = |edge: usize| -> Loc {
            if layer.inputs.is_empty() {
                input_loc
            } else {
                locs[layer.inputs[edge]]
            }
        };
        let in_size = |edge: usize| -> usize {
            if layer.inputs.is_empty() {
                input_size
            } else {
                layers[layer.inputs[edge]].out_words()
            }
        };

        let size = layer.out_words();
        let loc = match &layer.kind {
            LayerKind::Region { .. } => in_loc(0),
            LayerKind::Route => {
                let adjacent = layer.inputs.windows(2).all(|pair| {
                    match (locs[pair[0]], locs[pair[1]]) {
                        (Loc::Bottom(a), Loc::Bottom(b)) => {
                            // Next source starts where the previous ends.
                            b == a - layers[pair[0]].out_words()
                        }
                        _ => false,
                    }
                });
                if adjacent {
                    locs[layer.inputs[0]]
                } else {
                    tracing::debug!(layer = i, "route sources not adjacent, CPU concat");
                    copy_route[i] = true;
                    let dist = reserve + size;
                    stack.push(Band {
                        size,
                        dies_after: dies_after(i),
                    });
                    Loc::Bottom(dist)
                }
            }
            _ if retained(i) => {
                let dist = reserve + size;
                stack.push(Band {
                    size,
                    dies_after: dies_after(i),
                });
                Loc::Bottom(dist)
            }
            _ => match in_loc(0) {
                Loc::Top => Loc::Bottom(reserve + size),
                Loc::Bottom(_) => Loc::Top,
            },
        };

        // Worst simultaneous usage of the two ends for this layer.
        let mut top = 0usize;
        let mut bottom: usize = stack.iter().map(|b| b.size).sum();
        let mut note = |l: Loc, s: usize| match l {
            Loc::Top => top = top.max(s),
            Loc::Bottom(d) => bottom = bottom.max(d),
        };
        for e in 0..layer.inputs.len().max(1) {
            note(in_loc(e), in_size(e));
        }
        note(loc, size);
        region_words = region_words.max(top + bottom);

        locs.push(loc);
    }

    // Materialize offsets now that the region size is known.
    let bottom_base = GUARD_WORDS + region_words;
    let resolve = |l: Loc| -> usize {
        match l {
            Loc::Top => GUARD_WORDS,
            Loc::Bottom(d) => bottom_base - d,
        }
    };

    let mut placements = Vec::with_capacity(layers.len());
    for (i, layer) in layers.iter().enumerate() {
        let input_offsets = if layer.inputs.is_empty() {
            vec![resolve(input_loc)]
        } else {
            layer.inputs.iter().map(|&p| resolve(locs[p])).collect()
        };
        placements.push(Placement {
            input_offsets,
            output_offset: resolve(locs[i]),
            copy_route: copy_route[i],
        });
    }

    tracing::info!(
        arena_words = bottom_base,
        region_words,
        "Arena planned ({} layers)",
        layers.len()
    );

    Ok(MemoryPlan {
        arena_words: bottom_base,
        input_offset: GUARD_WORDS,
        region_words,
        placements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoo::yolov2_coco;

    #[test]
    fn every_input_chains_to_its_producer() {
        let net = yolov2_coco();
        let plan = plan(&net).unwrap();
        for (i, layer) in net.layers().iter().enumerate() {
            for (e, &p) in layer.inputs.iter().enumerate() {
                assert_eq!(
                    plan.placements[i].input_offsets[e], plan.placements[p].output_offset,
                    "layer {i} edge {e} does not read layer {p}'s output"
                );
            }
        }
    }

    #[test]
    fn region_matches_the_two_largest_neighbours() {
        let net = yolov2_coco();
        let plan = plan(&net).unwrap();
        // Input 416x416x3 plus the first conv output is not the peak;
        // conv0's output plus pool1's output is.
        assert_eq!(plan.region_words, 416 * 416 * 32 + 208 * 208 * 32);
        assert_eq!(plan.arena_words, GUARD_WORDS + plan.region_words);
    }

    #[test]
    fn passthrough_bands_stack_below_the_bottom() {
        let net = yolov2_coco();
        let plan = plan(&net).unwrap();
        let bottom = plan.arena_words;
        let route16 = 26 * 32 * 512;
        let conv24 = 13 * 16 * 1024;
        let reorg27 = 13 * 16 * 256;

        // Backbone tap: layer 16's output is parked for the route.
        assert_eq!(plan.placements[16].output_offset, bottom - route16);
        // Layer 26 reads the route alias of that band.
        assert_eq!(plan.placements[26].input_offsets[0], bottom - route16);
        // Layer 24 parks beneath it, reorg output beneath that.
        assert_eq!(
            plan.placements[24].output_offset,
            bottom - route16 - conv24
        );
        assert_eq!(
            plan.placements[27].output_offset,
            bottom - route16 - conv24 - reorg27
        );
        // The merge route aliases the reorg band and runs into conv24.
        assert_eq!(
            plan.placements[28].output_offset,
            plan.placements[27].output_offset
        );
        assert!(!plan.placements[28].copy_route);
    }

    #[test]
    fn head_reclaims_the_stack_once_bands_die() {
        let net = yolov2_coco();
        let plan = plan(&net).unwrap();
        let bottom = plan.arena_words;
        // By layer 30 every band has been read for the last time, so
        // its output lands directly at the bottom.
        assert_eq!(plan.placements[30].output_offset, bottom - 13 * 16 * 425);
        // The region head reads it in place.
        assert_eq!(
            plan.placements[31].input_offsets[0],
            plan.placements[30].output_offset
        );
    }

    #[test]
    fn non_adjacent_route_falls_back_to_copy() {
        use crate::network::NetworkBuilder;
        let mut b = NetworkBuilder::new(16, 16, 8);
        b.conv(8, 1, 1, true, true); // 0: parked, the route reads it
        b.conv(8, 1, 1, true, true); // 1
        b.conv(8, 1, 1, true, true); // 2: parked beneath band 0
        // Concatenation order [0, 2] runs against the stacking order,
        // so the sources cannot be aliased.
        b.route(&[0, 2]);
        let net = b.finish().unwrap();
        let plan = plan(&net).unwrap();
        assert!(plan.placements[3].copy_route);
    }
}
