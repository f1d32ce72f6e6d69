//! YUV 4:2:0 repacking and YUV to RGB conversion
//!
//! Every supported sensor layout is first compacted into NV21 (full Y plane
//! followed by interleaved V,U samples at quarter resolution) so a single
//! kernel does the color math. The matrix is full-range BT.601 as used by
//! JFIF, in 16.16 fixed point.

use super::convert::ConvertError;
use super::frame::Plane;

/// Chroma plane size for 4:2:0 subsampling, rounding odd sizes up
#[inline]
pub fn chroma_dims(width: usize, height: usize) -> (usize, usize) {
    ((width + 1) / 2, (height + 1) / 2)
}

/// Byte length of a compact NV21 image
pub fn nv21_len(width: usize, height: usize) -> usize {
    let (cw, ch) = chroma_dims(width, height);
    width * height + 2 * cw * ch
}

/// Smallest buffer that can hold `rows x cols` samples of `sample_len` bytes
fn required_len(
    plane: &Plane,
    rows: usize,
    cols: usize,
    sample_len: usize,
) -> Option<usize> {
    if rows == 0 || cols == 0 {
        return Some(0);
    }
    (rows - 1)
        .checked_mul(plane.row_stride)?
        .checked_add((cols - 1).checked_mul(plane.pixel_stride)?)?
        .checked_add(sample_len)
}

fn check_plane(
    plane: &Plane,
    index: usize,
    rows: usize,
    cols: usize,
    sample_len: usize,
) -> Result<(), ConvertError> {
    if plane.pixel_stride == 0 {
        return Err(ConvertError::InvalidStride { index });
    }
    let needed = required_len(plane, rows, cols, sample_len)
        .ok_or(ConvertError::InvalidStride { index })?;
    if plane.data.len() < needed {
        return Err(ConvertError::PlaneTooShort {
            index,
            needed,
            actual: plane.data.len(),
        });
    }
    Ok(())
}

fn copy_luma(width: usize, height: usize, y: &Plane, out: &mut Vec<u8>) {
    if y.pixel_stride == 1 {
        for row in 0..height {
            let start = row * y.row_stride;
            out.extend_from_slice(&y.data[start..start + width]);
        }
    } else {
        for row in 0..height {
            let base = row * y.row_stride;
            out.extend((0..width).map(|col| y.data[base + col * y.pixel_stride]));
        }
    }
}

/// Repack independent Y, U and V planes into compact NV21 in `out`.
pub fn repack_yuv420(
    width: usize,
    height: usize,
    y: &Plane,
    u: &Plane,
    v: &Plane,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    let (cw, ch) = chroma_dims(width, height);
    check_plane(y, 0, height, width, 1)?;
    check_plane(u, 1, ch, cw, 1)?;
    check_plane(v, 2, ch, cw, 1)?;

    out.clear();
    out.reserve(nv21_len(width, height));
    copy_luma(width, height, y, out);

    for row in 0..ch {
        let u_base = row * u.row_stride;
        let v_base = row * v.row_stride;
        for col in 0..cw {
            out.push(v.data[v_base + col * v.pixel_stride]);
            out.push(u.data[u_base + col * u.pixel_stride]);
        }
    }
    Ok(())
}

/// Compact a Y plane plus interleaved VU plane into NV21 in `out`.
///
/// Each chroma sample of the VU plane is a V byte immediately followed by its
/// U byte; `pixel_stride` is the distance between consecutive pairs.
pub fn repack_nv21(
    width: usize,
    height: usize,
    y: &Plane,
    vu: &Plane,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    let (cw, ch) = chroma_dims(width, height);
    check_plane(y, 0, height, width, 1)?;
    check_plane(vu, 1, ch, cw, 2)?;

    out.clear();
    out.reserve(nv21_len(width, height));
    copy_luma(width, height, y, out);

    for row in 0..ch {
        let base = row * vu.row_stride;
        if vu.pixel_stride == 2 {
            out.extend_from_slice(&vu.data[base..base + cw * 2]);
        } else {
            for col in 0..cw {
                let at = base + col * vu.pixel_stride;
                out.push(vu.data[at]);
                out.push(vu.data[at + 1]);
            }
        }
    }
    Ok(())
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Full-range BT.601 conversion of one sample
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;

    let r = y + ((91_881 * v + 32_768) >> 16);
    let g = y - ((22_554 * u + 46_802 * v + 32_768) >> 16);
    let b = y + ((116_130 * u + 32_768) >> 16);
    [clamp(r), clamp(g), clamp(b)]
}

/// Decode compact NV21 into interleaved RGB.
///
/// `nv21` must be `nv21_len(width, height)` bytes and `rgb` exactly
/// `width * height * 3`.
pub fn nv21_to_rgb(width: usize, height: usize, nv21: &[u8], rgb: &mut [u8]) {
    let (cw, _) = chroma_dims(width, height);
    let (luma, chroma) = nv21.split_at(width * height);

    for row in 0..height {
        let luma_row = &luma[row * width..(row + 1) * width];
        let chroma_row = &chroma[(row / 2) * cw * 2..];
        let out_row = &mut rgb[row * width * 3..(row + 1) * width * 3];

        for (col, (&y, px)) in luma_row.iter().zip(out_row.chunks_exact_mut(3)).enumerate() {
            let pair = (col / 2) * 2;
            let v = chroma_row[pair];
            let u = chroma_row[pair + 1];
            px.copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_is_gray() {
        assert_eq!(yuv_to_rgb(128, 128, 128), [128, 128, 128]);
        assert_eq!(yuv_to_rgb(0, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(255, 128, 128), [255, 255, 255]);
    }

    #[test]
    fn strong_v_is_red() {
        let [r, g, b] = yuv_to_rgb(128, 128, 255);
        assert!(r > 240);
        assert!(g < 60);
        assert!(b < 140 && b > 120);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        assert_eq!(chroma_dims(3, 3), (2, 2));
        assert_eq!(nv21_len(3, 3), 9 + 8);
    }

    #[test]
    fn planar_repack_interleaves_v_then_u() {
        let y = Plane::packed(vec![10, 11, 12, 13], 2);
        let u = Plane::packed(vec![1], 1);
        let v = Plane::packed(vec![2], 1);
        let mut out = Vec::new();
        repack_yuv420(2, 2, &y, &u, &v, &mut out).unwrap();
        assert_eq!(out, vec![10, 11, 12, 13, 2, 1]);
    }

    #[test]
    fn padded_rows_are_skipped() {
        // Row stride 4 with 2 bytes of padding per row
        let y = Plane::packed(vec![1, 2, 0xEE, 0xEE, 3, 4, 0xEE, 0xEE], 4);
        let vu = Plane::new(vec![9, 8, 0xEE, 0xEE], 4, 2);
        let mut out = Vec::new();
        repack_nv21(2, 2, &y, &vu, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 9, 8]);
    }

    #[test]
    fn semi_planar_u_v_planes_are_read_with_pixel_stride() {
        // Semi-planar output: U and V are views over the same interleaved bytes
        let y = Plane::packed(vec![0; 16], 4);
        let u = Plane::new(vec![1, 2, 3, 4, 5, 6, 7], 4, 2);
        let v = Plane::new(vec![2, 3, 4, 5, 6, 7, 8], 4, 2);
        let mut out = Vec::new();
        repack_yuv420(4, 4, &y, &u, &v, &mut out).unwrap();
        assert_eq!(&out[16..], &[2, 1, 4, 3, 6, 5, 8, 7]);
    }

    #[test]
    fn short_plane_is_reported() {
        let y = Plane::packed(vec![0; 3], 2);
        let vu = Plane::new(vec![0; 2], 2, 2);
        let err = repack_nv21(2, 2, &y, &vu, &mut Vec::new()).unwrap_err();
        assert_eq!(
            err,
            ConvertError::PlaneTooShort {
                index: 0,
                needed: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn kernel_shares_chroma_across_two_by_two_block() {
        let nv21 = vec![200, 200, 200, 200, 128, 128];
        let mut rgb = vec![0; 12];
        nv21_to_rgb(2, 2, &nv21, &mut rgb);
        assert!(rgb.iter().all(|&c| c == 200));
    }
}
