//! SSE2 specializations of the packing paths for WidthMajor sources.
//!
//! These mirror the scalar reference path byte for byte: a register tile
//! is loaded as rows, requantized 16 lanes at a time, then transposed into
//! cells with two rounds of interleaves (8-bit interleaves produce
//! DepthMajor 4x2 cells, 16-bit interleaves produce WidthMajor ones). The
//! store order is a layout contract with the kernel, so the tests compare
//! whole packs against the scalar path. Only baseline SSE2 is used, which
//! every x86_64 target has, so there is no runtime feature detection.

use std::arch::x86_64::{
    __m128i, _mm_add_epi16, _mm_add_epi32, _mm_and_si128, _mm_loadu_si128, _mm_mullo_epi16,
    _mm_packus_epi16, _mm_set1_epi16, _mm_set1_epi8, _mm_setzero_si128, _mm_slli_epi16,
    _mm_srli_epi16, _mm_srli_si128, _mm_storel_epi64, _mm_storeu_si128, _mm_sub_epi16,
    _mm_unpackhi_epi16, _mm_unpackhi_epi8, _mm_unpacklo_epi16, _mm_unpacklo_epi8, _mm_xor_si128,
};

use super::{PackRng, PackedSideBlock};
use crate::format::{CellOrder, KernelSideFormat, MAX_CELLS, REGISTER_SIZE};
use crate::map::{SideMap, SideMapOrder};
use crate::requantize::{max_value, Rounding, RoundingMode};

/// Shift each u8 lane of `x` left by `N` bits.
///
/// SSE2 has no 8-bit shifts, so shift 16-bit lanes and mask off the bits
/// that crossed a byte boundary.
#[inline]
fn shl_u8x16<const N: i32>(x: __m128i) -> __m128i {
    let mask = (((0xffu16 << N) & 0xff) as u8) as i8;
    unsafe { _mm_and_si128(_mm_slli_epi16::<N>(x), _mm_set1_epi8(mask)) }
}

/// Shift each u8 lane of `x` right by `N` bits.
#[inline]
fn shr_u8x16<const N: i32>(x: __m128i) -> __m128i {
    let mask = ((0xffu16 >> N) as u8) as i8;
    unsafe { _mm_and_si128(_mm_srli_epi16::<N>(x), _mm_set1_epi8(mask)) }
}

/// Vector counterpart of [`crate::rng::Xorshift8`]: sixteen independent
/// 8-bit Xorshift states advanced lane-wise.
///
/// The lanes are seeded by iterating Xorshift8(7,7,1) from the seed byte,
/// a different permutation than the (7,5,3) steady-state update. Seeding
/// with the same permutation the generator runs on would make every lane a
/// time-shifted copy of its neighbour, producing perfectly correlated
/// rounding offsets.
pub(crate) struct Xorshift8x16 {
    state: __m128i,
}

impl Xorshift8x16 {
    pub fn with_seed(seed: u8) -> Xorshift8x16 {
        assert_ne!(seed, 0, "xorshift seed must be nonzero");
        let mut s = seed;
        let mut lanes = [0u8; 16];
        for lane in lanes.iter_mut() {
            *lane = s;
            // Xorshift8(7,7,1).
            s ^= s << 7;
            s ^= s >> 7;
            s ^= s << 1;
        }
        // Safety: `lanes` is a readable 16-byte buffer.
        let state = unsafe { _mm_loadu_si128(lanes.as_ptr() as *const __m128i) };
        Xorshift8x16 { state }
    }

    /// Return sixteen bytes in `[1, 255]` and advance every lane.
    #[inline]
    pub fn next_vector(&mut self) -> __m128i {
        let result = self.state;
        // Xorshift8(7,5,3), lane-wise.
        let x = self.state;
        self.state = unsafe {
            let x = _mm_xor_si128(x, shl_u8x16::<7>(x));
            let x = _mm_xor_si128(x, shr_u8x16::<5>(x));
            _mm_xor_si128(x, shl_u8x16::<3>(x))
        };
        result
    }
}

/// Requantize sixteen source bytes at once. Bit-identical to the scalar
/// [`crate::requantize::requantize`] for the same rounding offsets.
///
/// The exact integer divide by 255 uses the identity
/// `y/255 = (y + 1 + (y >> 8)) >> 8`, valid for `y` in `[0, 65534]`.
/// Substituting `x = y + 1` gives `(x - 1)/255 = (x + ((x - 1) >> 8)) >> 8`,
/// which lets the generator's nonzero byte serve directly as the
/// "offset plus one" term and saves a subtraction.
#[inline]
fn requantize_x16<const BITS: u32, R: Rounding>(src: __m128i, prng: &mut Xorshift8x16) -> __m128i {
    if BITS == 8 {
        return src;
    }

    let offset_plus_one = match R::MODE {
        RoundingMode::Nearest => unsafe { _mm_set1_epi8(128u8 as i8) },
        RoundingMode::Probabilistic => prng.next_vector(),
    };

    unsafe {
        let zero = _mm_setzero_si128();
        let max = _mm_set1_epi16(max_value(BITS) as i16);
        let one = _mm_set1_epi16(1);

        // x = src * max + offset_plus_one, in sixteen u16 lanes. The largest
        // value is 255 * 127 + 255 = 32640, so the lanes cannot wrap.
        let x_lo = _mm_add_epi16(
            _mm_mullo_epi16(_mm_unpacklo_epi8(src, zero), max),
            _mm_unpacklo_epi8(offset_plus_one, zero),
        );
        let x_hi = _mm_add_epi16(
            _mm_mullo_epi16(_mm_unpackhi_epi8(src, zero), max),
            _mm_unpackhi_epi8(offset_plus_one, zero),
        );

        // (x - 1) / 255 = (x + ((x - 1) >> 8)) >> 8
        let r_lo =
            _mm_srli_epi16::<8>(_mm_add_epi16(x_lo, _mm_srli_epi16::<8>(_mm_sub_epi16(x_lo, one))));
        let r_hi =
            _mm_srli_epi16::<8>(_mm_add_epi16(x_hi, _mm_srli_epi16::<8>(_mm_sub_epi16(x_hi, one))));

        // Results are at most 127, so the saturating pack is exact.
        _mm_packus_epi16(r_lo, r_hi)
    }
}

/// Pack one complete WidthMajor source tile into DepthMajor 4x2 cells.
///
/// # Safety
///
/// Caller must ensure the source map covers a full
/// `KERNEL_WIDTH x REGISTER_SIZE` tile (asserted in debug builds).
pub(crate) unsafe fn pack_tile_depth_major<F: KernelSideFormat, const BITS: u32, R: Rounding>(
    src: &SideMap,
    dst: &mut PackedSideBlock<F>,
    start_width: usize,
    prng: &mut PackRng,
) {
    debug_assert_eq!(F::CELL_ORDER, CellOrder::DepthMajor);
    debug_assert_eq!(F::CELL_WIDTH, 4);
    debug_assert_eq!(F::CELL_DEPTH, 2);
    debug_assert_eq!(src.order(), SideMapOrder::WidthMajor);
    debug_assert_eq!(src.width(), F::KERNEL_WIDTH);
    debug_assert_eq!(src.depth(), REGISTER_SIZE);

    let cells = F::CELLS;
    let stride = src.stride();
    let src_data = src.data();
    assert!(src_data.len() >= (4 * cells - 1) * stride + REGISTER_SIZE);

    let multiplier = dst.rank_one_update_multiplier();
    let (data, updates) = dst.tile_dest();
    assert!(data.len() >= 4 * cells * REGISTER_SIZE);

    let zero = _mm_setzero_si128();
    let src_ptr = src_data.as_ptr();

    // Load and requantize the source rows.
    let mut rows = [zero; 4 * MAX_CELLS];
    for (i, row) in rows.iter_mut().enumerate().take(4 * cells) {
        let line = _mm_loadu_si128(src_ptr.add(i * stride) as *const __m128i);
        *row = requantize_x16::<BITS, R>(line, &mut prng.vector);
    }

    // Two rounds of byte interleaves transpose each group of four rows
    // into DepthMajor 4x2 cells: first rows (0,2) and (1,3) of the group,
    // then the results pairwise.
    let mut zip2 = [[[zero; 2]; 2]; MAX_CELLS];
    for c in 0..cells {
        let (r0, r1, r2, r3) = (rows[4 * c], rows[4 * c + 1], rows[4 * c + 2], rows[4 * c + 3]);
        zip2[c][0] = [_mm_unpacklo_epi8(r0, r2), _mm_unpackhi_epi8(r0, r2)];
        zip2[c][1] = [_mm_unpacklo_epi8(r1, r3), _mm_unpackhi_epi8(r1, r3)];
    }
    // zip4[c][outer][inner] holds depths 8*outer + 4*inner .. +4, as four
    // width-contiguous groups of four bytes.
    let mut zip4 = [[[zero; 2]; 2]; MAX_CELLS];
    for c in 0..cells {
        zip4[c][0] = [
            _mm_unpacklo_epi8(zip2[c][0][0], zip2[c][1][0]),
            _mm_unpackhi_epi8(zip2[c][0][0], zip2[c][1][0]),
        ];
        zip4[c][1] = [
            _mm_unpacklo_epi8(zip2[c][0][1], zip2[c][1][1]),
            _mm_unpackhi_epi8(zip2[c][0][1], zip2[c][1][1]),
        ];
    }

    // Store the cells, one depth-pair group at a time across all cells.
    let out_ptr = data.as_mut_ptr();
    let mut out = 0;
    for outer in 0..2 {
        for inner in 0..2 {
            for cell in zip4.iter().take(cells) {
                _mm_storel_epi64(out_ptr.add(out) as *mut __m128i, cell[outer][inner]);
                out += 8;
            }
            for cell in zip4.iter().take(cells) {
                _mm_storel_epi64(
                    out_ptr.add(out) as *mut __m128i,
                    _mm_srli_si128::<8>(cell[outer][inner]),
                );
                out += 8;
            }
        }
    }

    // Sum along the depth dimension with widening adds (u8 -> u16 -> u32)
    // and fold into the rank-one-update vector. Byte j of every zipped
    // vector belongs to width index j % 4, so each u32 lane ends up
    // holding the total for one width index of the cell.
    for (c, cell) in zip4.iter().enumerate().take(cells) {
        let mut sums = zero;
        for half in cell {
            for &v in half {
                let s16 = _mm_add_epi16(_mm_unpacklo_epi8(v, zero), _mm_unpackhi_epi8(v, zero));
                let s32 = _mm_add_epi32(
                    _mm_unpacklo_epi16(s16, zero),
                    _mm_unpackhi_epi16(s16, zero),
                );
                sums = _mm_add_epi32(sums, s32);
            }
        }
        let mut lanes = [0i32; 4];
        _mm_storeu_si128(lanes.as_mut_ptr() as *mut __m128i, sums);
        for (i, lane) in lanes.into_iter().enumerate() {
            updates[start_width + 4 * c + i] += lane * multiplier;
        }
    }

    dst.seek_forward_n_cells(cells * REGISTER_SIZE / F::CELL_DEPTH);
}

/// Pack one complete WidthMajor source tile into WidthMajor 4x2 cells.
///
/// Same shape as [`pack_tile_depth_major`], but the interleaves operate on
/// 16-bit units: each u16 carries a depth pair of one row, so the
/// transposed cells come out width-major.
///
/// # Safety
///
/// Caller must ensure the source map covers a full
/// `KERNEL_WIDTH x REGISTER_SIZE` tile (asserted in debug builds).
pub(crate) unsafe fn pack_tile_width_major<F: KernelSideFormat, const BITS: u32, R: Rounding>(
    src: &SideMap,
    dst: &mut PackedSideBlock<F>,
    start_width: usize,
    prng: &mut PackRng,
) {
    debug_assert_eq!(F::CELL_ORDER, CellOrder::WidthMajor);
    debug_assert_eq!(F::CELL_WIDTH, 4);
    debug_assert_eq!(F::CELL_DEPTH, 2);
    debug_assert_eq!(src.order(), SideMapOrder::WidthMajor);
    debug_assert_eq!(src.width(), F::KERNEL_WIDTH);
    debug_assert_eq!(src.depth(), REGISTER_SIZE);

    let cells = F::CELLS;
    let stride = src.stride();
    let src_data = src.data();
    assert!(src_data.len() >= (4 * cells - 1) * stride + REGISTER_SIZE);

    let multiplier = dst.rank_one_update_multiplier();
    let (data, updates) = dst.tile_dest();
    assert!(data.len() >= 4 * cells * REGISTER_SIZE);

    let zero = _mm_setzero_si128();
    let src_ptr = src_data.as_ptr();

    let mut rows = [zero; 4 * MAX_CELLS];
    for (i, row) in rows.iter_mut().enumerate().take(4 * cells) {
        let line = _mm_loadu_si128(src_ptr.add(i * stride) as *const __m128i);
        *row = requantize_x16::<BITS, R>(line, &mut prng.vector);
    }

    let mut zip2 = [[[zero; 2]; 2]; MAX_CELLS];
    for c in 0..cells {
        let (r0, r1, r2, r3) = (rows[4 * c], rows[4 * c + 1], rows[4 * c + 2], rows[4 * c + 3]);
        zip2[c][0] = [_mm_unpacklo_epi16(r0, r2), _mm_unpackhi_epi16(r0, r2)];
        zip2[c][1] = [_mm_unpacklo_epi16(r1, r3), _mm_unpackhi_epi16(r1, r3)];
    }
    let mut zip4 = [[[zero; 2]; 2]; MAX_CELLS];
    for c in 0..cells {
        zip4[c][0] = [
            _mm_unpacklo_epi16(zip2[c][0][0], zip2[c][1][0]),
            _mm_unpackhi_epi16(zip2[c][0][0], zip2[c][1][0]),
        ];
        zip4[c][1] = [
            _mm_unpacklo_epi16(zip2[c][0][1], zip2[c][1][1]),
            _mm_unpackhi_epi16(zip2[c][0][1], zip2[c][1][1]),
        ];
    }

    let out_ptr = data.as_mut_ptr();
    let mut out = 0;
    for outer in 0..2 {
        for inner in 0..2 {
            for cell in zip4.iter().take(cells) {
                _mm_storel_epi64(out_ptr.add(out) as *mut __m128i, cell[outer][inner]);
                out += 8;
            }
            for cell in zip4.iter().take(cells) {
                _mm_storel_epi64(
                    out_ptr.add(out) as *mut __m128i,
                    _mm_srli_si128::<8>(cell[outer][inner]),
                );
                out += 8;
            }
        }
    }

    // Pairwise byte sums collapse each u16's depth pair; u16 lane j then
    // belongs to width index j % 4, and the final halves-add plus widen
    // leaves one u32 total per width index.
    let byte_mask = _mm_set1_epi16(0x00ff);
    for (c, cell) in zip4.iter().enumerate().take(cells) {
        let mut sums16 = zero;
        for half in cell {
            for &v in half {
                let pair = _mm_add_epi16(_mm_and_si128(v, byte_mask), _mm_srli_epi16::<8>(v));
                sums16 = _mm_add_epi16(sums16, pair);
            }
        }
        let sums = _mm_add_epi32(
            _mm_unpacklo_epi16(sums16, zero),
            _mm_unpackhi_epi16(sums16, zero),
        );
        let mut lanes = [0i32; 4];
        _mm_storeu_si128(lanes.as_mut_ptr() as *mut __m128i, sums);
        for (i, lane) in lanes.into_iter().enumerate() {
            updates[start_width + 4 * c + i] += lane * multiplier;
        }
    }

    dst.seek_forward_n_cells(cells * REGISTER_SIZE / F::CELL_DEPTH);
}

#[cfg(test)]
mod tests {
    use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_storeu_si128};

    use super::{requantize_x16, Xorshift8x16};
    use crate::requantize::{requantize, Nearest, Probabilistic, Rounding};
    use crate::rng::Xorshift8;

    fn to_array(v: __m128i) -> [u8; 16] {
        let mut out = [0u8; 16];
        unsafe { _mm_storeu_si128(out.as_mut_ptr() as *mut __m128i, v) };
        out
    }

    fn from_array(a: [u8; 16]) -> __m128i {
        unsafe { _mm_loadu_si128(a.as_ptr() as *const __m128i) }
    }

    #[test]
    fn test_lanes_distinct() {
        let mut rng = Xorshift8x16::with_seed(Xorshift8::DEFAULT_SEED);
        let lanes = to_array(rng.next_vector());
        for i in 0..16 {
            assert_ne!(lanes[i], 0);
            for j in i + 1..16 {
                assert_ne!(lanes[i], lanes[j], "lanes {} and {} collide", i, j);
            }
        }
    }

    #[test]
    fn test_lanes_run_scalar_xorshift() {
        // Each lane must evolve exactly like a scalar Xorshift8(7,5,3)
        // seeded with that lane's initial value; this pins down the
        // synthesized byte shifts.
        let mut rng = Xorshift8x16::with_seed(Xorshift8::DEFAULT_SEED);
        let seeds = to_array(rng.next_vector());
        let mut scalar: Vec<Xorshift8> =
            seeds.into_iter().map(Xorshift8::with_seed).collect();
        for lane in scalar.iter_mut() {
            lane.next_byte();
        }

        for _ in 0..300 {
            let lanes = to_array(rng.next_vector());
            for (lane, scalar) in lanes.into_iter().zip(scalar.iter_mut()) {
                assert_eq!(lane, scalar.next_byte());
            }
        }
    }

    #[test]
    fn test_divide_by_255_identity() {
        for y in 0u32..=65534 {
            assert_eq!((y + 1 + (y >> 8)) >> 8, y / 255);
        }
    }

    fn check_nearest_matches_scalar<const BITS: u32>() {
        let mut vec_rng = Xorshift8x16::with_seed(Xorshift8::DEFAULT_SEED);
        let mut scalar_rng = Xorshift8::new();
        for chunk_start in (0..=255u32).step_by(16) {
            let src: [u8; 16] = std::array::from_fn(|i| (chunk_start as usize + i) as u8);
            let out = to_array(requantize_x16::<BITS, Nearest>(from_array(src), &mut vec_rng));
            for (s, o) in src.into_iter().zip(out) {
                assert_eq!(
                    o,
                    requantize::<BITS, Nearest>(s, &mut scalar_rng),
                    "bits {} src {}",
                    BITS,
                    s
                );
            }
        }
    }

    #[test]
    fn test_requantize_x16_matches_scalar_nearest() {
        check_nearest_matches_scalar::<1>();
        check_nearest_matches_scalar::<2>();
        check_nearest_matches_scalar::<3>();
        check_nearest_matches_scalar::<4>();
        check_nearest_matches_scalar::<5>();
        check_nearest_matches_scalar::<6>();
        check_nearest_matches_scalar::<7>();
        check_nearest_matches_scalar::<8>();
    }

    #[test]
    fn test_requantize_x16_probabilistic_mean() {
        // Same expectation as the scalar probabilistic mean test, but
        // through the vector generator: lanes are independent xorshift
        // streams, so the sample mean converges to src * max / 255.
        let mut rng = Xorshift8x16::with_seed(Xorshift8::DEFAULT_SEED);
        let src = from_array([200; 16]);
        let draws = 100_000;
        let mut total = 0u64;
        for _ in 0..draws {
            let out = to_array(requantize_x16::<4, Probabilistic>(src, &mut rng));
            total += out.into_iter().map(u64::from).sum::<u64>();
        }
        let mean = total as f64 / (draws * 16) as f64;
        let expected = 200.0 * 15.0 / 255.0;
        assert!(
            (mean - expected).abs() < 0.01,
            "mean {} expected {}",
            mean,
            expected
        );
    }

    #[test]
    fn test_requantize_x16_range() {
        fn check_range<const BITS: u32, R: Rounding>(rng: &mut Xorshift8x16) {
            for chunk_start in (0..=255u32).step_by(16) {
                let src: [u8; 16] = std::array::from_fn(|i| (chunk_start as usize + i) as u8);
                let out = to_array(requantize_x16::<BITS, R>(from_array(src), rng));
                for o in out {
                    assert!(o <= crate::requantize::max_value(BITS));
                }
            }
        }

        let mut rng = Xorshift8x16::with_seed(99);
        check_range::<1, Probabilistic>(&mut rng);
        check_range::<4, Probabilistic>(&mut rng);
        check_range::<5, Nearest>(&mut rng);
        check_range::<7, Probabilistic>(&mut rng);
    }
}
