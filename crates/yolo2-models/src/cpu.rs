//! Layers the accelerator cannot run, executed on the host.
//!
//! Only two: the reorg shuffle (a data movement, not arithmetic) and
//! the copy form of a route. Both operate on buffers pulled out of
//! DMA memory, with the hardware's 8-element row padding stripped
//! first and re-applied before write-back.

use yolo2_chip::align_row_8;

/// Drop the row padding from a hardware buffer: `rows` rows of `w`
/// useful elements, each stored at a stride of `align_row_8(w)`.
#[must_use]
pub fn strip_row_padding(src: &[i16], w: usize, rows: usize) -> Vec<i16> {
    let stride = align_row_8(w);
    let mut out = Vec::with_capacity(w * rows);
    for r in 0..rows {
        out.extend_from_slice(&src[r * stride..r * stride + w]);
    }
    out
}

/// Re-apply row padding for write-back; pad elements are zeroed.
#[must_use]
pub fn pad_rows(src: &[i16], w: usize, rows: usize) -> Vec<i16> {
    let stride = align_row_8(w);
    let mut out = vec![0i16; stride * rows];
    for r in 0..rows {
        out[r * stride..r * stride + w].copy_from_slice(&src[r * w..(r + 1) * w]);
    }
    out
}

/// The reorg shuffle, in the exact index convention the network was
/// trained with (the gather form: each output element fetches from
/// its strided source position).
///
/// For a feature map of `in_w`×`in_h`×`in_c` call this with
/// `w = in_w`, `h = in_h * in_c / stride²`, `c = stride²`; the result
/// reads as the `in_w/stride` × `in_h/stride` × `in_c·stride²` output.
#[must_use]
pub fn reorg(x: &[i16], w: usize, h: usize, c: usize, stride: usize) -> Vec<i16> {
    debug_assert_eq!(x.len(), w * h * c);
    let mut out = vec![0i16; x.len()];
    let c_out = c / (stride * stride);
    for k in 0..c {
        let c2 = k % c_out;
        let offset = k / c_out;
        for j in 0..h {
            let h2 = j * stride + offset / stride;
            for i in 0..w {
                let w2 = i * stride + offset % stride;
                let in_index = i + w * (j + h * k);
                let out_index = w2 + w * stride * (h2 + h * stride * c2);
                out[in_index] = x[out_index];
            }
        }
    }
    out
}

/// Channel concatenation for routes whose sources cannot be aliased.
#[must_use]
pub fn route_concat(sources: &[Vec<i16>]) -> Vec<i16> {
    let mut out = Vec::with_capacity(sources.iter().map(Vec::len).sum());
    for s in sources {
        out.extend_from_slice(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_and_pad_round_trip() {
        // 3 useful elements per row, stride 8.
        let padded: Vec<i16> = (0..16).collect();
        let stripped = strip_row_padding(&padded, 3, 2);
        assert_eq!(stripped, vec![0, 1, 2, 8, 9, 10]);
        let back = pad_rows(&stripped, 3, 2);
        assert_eq!(&back[0..3], &[0, 1, 2]);
        assert_eq!(&back[3..8], &[0; 5]);
        assert_eq!(&back[8..11], &[8, 9, 10]);
    }

    #[test]
    fn reorg_matches_the_trained_convention() {
        // 2x2x4 input, stride 2: w=2, h = 2*4/4 = 2, c = 4.
        let x: Vec<i16> = (0..16).collect();
        let out = reorg(&x, 2, 2, 4, 2);
        assert_eq!(
            out,
            vec![0, 2, 8, 10, 1, 3, 9, 11, 4, 6, 12, 14, 5, 7, 13, 15]
        );
    }

    #[test]
    fn reorg_is_a_permutation() {
        let x: Vec<i16> = (0..4 * 8 * 4).collect();
        let mut out = reorg(&x, 4, 8, 4, 2);
        out.sort_unstable();
        assert_eq!(out, x);
    }

    #[test]
    fn route_concat_keeps_source_order() {
        let out = route_concat(&[vec![1, 2], vec![3], vec![4, 5]]);
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }
}
