//! Built-in network descriptions.
//!
//! Only one network ships today: YOLOv2 trained on COCO, the topology
//! the accelerator bitstream was co-designed with. The description is
//! built programmatically; there is no cfg-file parser.

use crate::network::{Network, NetworkBuilder};

/// YOLOv2 COCO anchor priors, (w, h) pairs in grid-cell units.
pub const YOLOV2_ANCHORS: [(f32, f32); 5] = [
    (0.572_73, 0.677_385),
    (1.874_46, 2.062_53),
    (3.338_43, 5.474_34),
    (7.882_82, 3.527_78),
    (9.770_52, 9.168_28),
];

/// Number of COCO classes.
pub const COCO_CLASSES: usize = 80;

/// Build the YOLOv2 COCO network (416×416 input, 13×13×425 head).
///
/// # Panics
///
/// Never panics; the topology below is validated at test time.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn yolov2_coco() -> Network {
    let mut b = NetworkBuilder::new(416, 416, 3);
    b.conv(32, 3, 1, true, true); // 0
    b.maxpool(2, 2); // 1
    b.conv(64, 3, 1, true, true); // 2
    b.maxpool(2, 2); // 3
    b.conv(128, 3, 1, true, true); // 4
    b.conv(64, 1, 1, true, true); // 5
    b.conv(128, 3, 1, true, true); // 6
    b.maxpool(2, 2); // 7
    b.conv(256, 3, 1, true, true); // 8
    b.conv(128, 1, 1, true, true); // 9
    b.conv(256, 3, 1, true, true); // 10
    b.maxpool(2, 2); // 11
    b.conv(512, 3, 1, true, true); // 12
    b.conv(256, 1, 1, true, true); // 13
    b.conv(512, 3, 1, true, true); // 14
    b.conv(256, 1, 1, true, true); // 15
    b.conv(512, 3, 1, true, true); // 16
    b.maxpool(2, 2); // 17
    b.conv(1024, 3, 1, true, true); // 18
    b.conv(512, 1, 1, true, true); // 19
    b.conv(1024, 3, 1, true, true); // 20
    b.conv(512, 1, 1, true, true); // 21
    b.conv(1024, 3, 1, true, true); // 22
    b.conv(1024, 3, 1, true, true); // 23
    b.conv(1024, 3, 1, true, true); // 24
    b.route(&[16]); // 25
    b.conv(64, 1, 1, true, true); // 26
    b.reorg(2); // 27
    b.route(&[27, 24]); // 28
    b.conv(1024, 3, 1, true, true); // 29
    b.conv(425, 1, 1, false, false); // 30
    b.region(COCO_CLASSES, 5, true); // 31
    b.finish().expect("yolov2 topology is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LayerKind;

    #[test]
    fn yolov2_coco_shapes() {
        let net = yolov2_coco();
        let l = net.layers();
        assert_eq!(l.len(), 32);
        // Backbone tail.
        assert_eq!((l[16].out_w, l[16].out_h, l[16].out_c), (26, 26, 512));
        assert_eq!((l[24].out_w, l[24].out_h, l[24].out_c), (13, 13, 1024));
        // Passthrough branch.
        assert_eq!((l[26].out_w, l[26].out_h, l[26].out_c), (26, 26, 64));
        assert_eq!((l[27].out_w, l[27].out_h, l[27].out_c), (13, 13, 256));
        assert_eq!(l[28].out_c, 256 + 1024);
        // Head.
        assert_eq!((l[30].out_w, l[30].out_h, l[30].out_c), (13, 13, 425));
        assert!(matches!(l[31].kind, LayerKind::Region { classes: 80, .. }));
        assert_eq!(net.conv_count(), 23);
    }

    #[test]
    fn yolov2_edges_match_the_passthrough() {
        let net = yolov2_coco();
        assert_eq!(net.layers()[25].inputs, vec![16]);
        assert_eq!(net.layers()[28].inputs, vec![27, 24]);
        let consumers = net.consumers();
        assert_eq!(consumers[16], vec![17, 25]);
        assert_eq!(consumers[24], vec![28]);
    }
}
