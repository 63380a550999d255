//! Requantization of 8-bit source values to narrower bit depths.
//!
//! The multiplication's inputs and outputs are 8-bit, but packed blocks may
//! use fewer bits per entry (for example 7 bits on the LHS and 5 on the
//! RHS) so that compute kernels can use narrower accumulators. Packing is
//! where the narrowing happens: every source byte in `[0, 255]` is mapped
//! to `[0, max_value(BITS)]` on its way into the packed block.

use crate::rng::Xorshift8;

/// Largest representable value at a bit depth: `(1 << bits) - 1`.
pub const fn max_value(bits: u32) -> u8 {
    assert!(bits >= 1 && bits <= 8);
    ((1u32 << bits) - 1) as u8
}

/// How requantized values are rounded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RoundingMode {
    /// Deterministic round-to-nearest. Unbiased over a uniform continuum of
    /// inputs, but not over the skewed value distributions of real
    /// activations, where the residual bias compounds linearly with
    /// accumulation depth.
    Nearest,
    /// Random rounding offset. Unbiased over any input distribution, at
    /// the cost of doubling the per-sample variance, so the accumulated
    /// error grows with the square root of the depth rather than linearly.
    Probabilistic,
}

/// Accumulation depth at which probabilistic rounding starts to win over
/// nearest rounding, for bit depths below 8.
///
/// This constant is empirical: the crossover between nearest rounding's
/// linear bias growth and probabilistic rounding's doubled variance was
/// measured on reference activation matrices rather than derived from a
/// model, and landed at a depth on the order of a hundred.
pub const PROBABILISTIC_ROUNDING_THRESHOLD: usize = 100;

/// Depth threshold above which [`choose_rounding_mode`] selects
/// probabilistic rounding at the given bit depth. At 8 bits requantization
/// is the identity, so rounding never applies.
pub const fn probabilistic_rounding_threshold(bits: u32) -> usize {
    if bits == 8 {
        usize::MAX
    } else {
        PROBABILISTIC_ROUNDING_THRESHOLD
    }
}

/// Select the rounding mode for packing a block whose full accumulation
/// depth is `depth`. Selection happens once per pack, not per tile, so that
/// every tile of a block rounds the same way.
pub fn choose_rounding_mode(bits: u32, depth: usize) -> RoundingMode {
    if depth >= probabilistic_rounding_threshold(bits) {
        RoundingMode::Probabilistic
    } else {
        RoundingMode::Nearest
    }
}

/// Compile-time selector for the rounding mode, so that [`requantize`]
/// monomorphizes per mode and the offset computation inlines into the
/// packing inner loop.
pub trait Rounding {
    const MODE: RoundingMode;

    /// The rounding offset plus one, in `[1, 255]`.
    ///
    /// Working with `offset + 1` instead of the offset itself lets the
    /// nonzero byte from the generator be used directly, and saves a
    /// subtraction in the vectorized divide by 255 (see the x86_64
    /// specialization).
    fn offset_plus_one(prng: &mut Xorshift8) -> u8;
}

/// Marker for [`RoundingMode::Nearest`].
pub struct Nearest;

impl Rounding for Nearest {
    const MODE: RoundingMode = RoundingMode::Nearest;

    #[inline]
    fn offset_plus_one(_prng: &mut Xorshift8) -> u8 {
        128
    }
}

/// Marker for [`RoundingMode::Probabilistic`].
pub struct Probabilistic;

impl Rounding for Probabilistic {
    const MODE: RoundingMode = RoundingMode::Probabilistic;

    #[inline]
    fn offset_plus_one(prng: &mut Xorshift8) -> u8 {
        prng.next_byte()
    }
}

/// Requantize a source value in `[0, 255]` to `[0, max_value(BITS)]`.
///
/// Computes `(src * max_value(BITS) + offset) / 255` with an exact integer
/// divide. Right-shifting by 8 would divide by 256 rather than 255 and skew
/// every output downward; truncating (offset 0) biases toward zero. Nearest
/// rounding uses offset 127; probabilistic rounding draws the offset
/// uniformly from `[0, 254]`, which makes the expected output equal to
/// `src * max_value(BITS) / 255` for any input distribution.
///
/// At `BITS == 8` this is the identity and the whole function folds away.
#[inline]
pub fn requantize<const BITS: u32, R: Rounding>(src: u8, prng: &mut Xorshift8) -> u8 {
    if BITS == 8 {
        return src;
    }
    let scaled = src as u16 * max_value(BITS) as u16;
    let offset_plus_one = R::offset_plus_one(prng) as u16;
    // scaled <= 255 * 127 and offset_plus_one <= 255, so no overflow.
    ((scaled + offset_plus_one - 1) / 255) as u8
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        choose_rounding_mode, max_value, probabilistic_rounding_threshold, requantize, Nearest,
        Probabilistic, Rounding, RoundingMode, PROBABILISTIC_ROUNDING_THRESHOLD,
    };
    use crate::rng::Xorshift8;

    fn requantize_each_bit<R: Rounding>(src: u8, prng: &mut Xorshift8) -> [u8; 8] {
        [
            requantize::<1, R>(src, prng),
            requantize::<2, R>(src, prng),
            requantize::<3, R>(src, prng),
            requantize::<4, R>(src, prng),
            requantize::<5, R>(src, prng),
            requantize::<6, R>(src, prng),
            requantize::<7, R>(src, prng),
            requantize::<8, R>(src, prng),
        ]
    }

    #[test]
    fn test_max_value() {
        assert_eq!(max_value(1), 1);
        assert_eq!(max_value(5), 31);
        assert_eq!(max_value(7), 127);
        assert_eq!(max_value(8), 255);
    }

    proptest! {
        #[test]
        fn test_requantize_range(src in any::<u8>(), seed in 1u8..=255) {
            let mut prng = Xorshift8::with_seed(seed);
            for (i, out) in requantize_each_bit::<Probabilistic>(src, &mut prng)
                .into_iter()
                .enumerate()
            {
                prop_assert!(out <= max_value(i as u32 + 1));
            }
        }

        #[test]
        fn test_nearest_is_deterministic(src in any::<u8>(), seed in 1u8..=255) {
            let mut a = Xorshift8::with_seed(seed);
            let mut b = Xorshift8::new();
            prop_assert_eq!(
                requantize_each_bit::<Nearest>(src, &mut a),
                requantize_each_bit::<Nearest>(src, &mut b)
            );
        }
    }

    #[test]
    fn test_endpoints_preserved() {
        // 0 maps to 0 and 255 maps to the maximum value at every bit depth
        // and under both rounding modes.
        let mut prng = Xorshift8::new();
        for _ in 0..512 {
            assert_eq!(requantize_each_bit::<Probabilistic>(0, &mut prng), [0; 8]);
            assert_eq!(
                requantize_each_bit::<Probabilistic>(255, &mut prng),
                [1, 3, 7, 15, 31, 63, 127, 255]
            );
        }
        assert_eq!(requantize_each_bit::<Nearest>(0, &mut prng), [0; 8]);
        assert_eq!(
            requantize_each_bit::<Nearest>(255, &mut prng),
            [1, 3, 7, 15, 31, 63, 127, 255]
        );
    }

    #[test]
    fn test_eight_bit_identity() {
        let mut prng = Xorshift8::new();
        for src in 0..=255u8 {
            assert_eq!(requantize::<8, Nearest>(src, &mut prng), src);
            assert_eq!(requantize::<8, Probabilistic>(src, &mut prng), src);
        }
    }

    #[test]
    fn test_five_bit_nearest_table() {
        #[derive(Debug)]
        struct Case {
            src: u8,
            expected: u8,
        }

        let cases = [
            Case { src: 0, expected: 0 },
            Case { src: 4, expected: 0 },
            Case { src: 5, expected: 1 },
            Case {
                src: 128,
                expected: 16,
            },
            Case {
                src: 255,
                expected: 31,
            },
        ];

        let mut prng = Xorshift8::new();
        for case in cases {
            assert_eq!(
                requantize::<5, Nearest>(case.src, &mut prng),
                case.expected,
                "case {:?}",
                case
            );
        }
    }

    #[test]
    fn test_probabilistic_mean() {
        // The expected value of a probabilistically rounded output is the
        // exact rational src * max / 255. The generator's offsets are
        // uniform over [0, 254] once per period, so the sample mean over
        // many draws converges tightly.
        #[derive(Debug)]
        struct Case {
            src: u8,
            bits: u32,
            draws: usize,
            tolerance: f64,
        }

        let cases = [
            Case {
                src: 200,
                bits: 4,
                draws: 1_000_000,
                tolerance: 0.005,
            },
            Case {
                src: 77,
                bits: 5,
                draws: 100_000,
                tolerance: 0.01,
            },
            Case {
                src: 3,
                bits: 1,
                draws: 100_000,
                tolerance: 0.01,
            },
            Case {
                src: 131,
                bits: 7,
                draws: 100_000,
                tolerance: 0.01,
            },
        ];

        for case in cases {
            let mut prng = Xorshift8::new();
            let mut total = 0u64;
            for _ in 0..case.draws {
                let out = match case.bits {
                    1 => requantize::<1, Probabilistic>(case.src, &mut prng),
                    4 => requantize::<4, Probabilistic>(case.src, &mut prng),
                    5 => requantize::<5, Probabilistic>(case.src, &mut prng),
                    7 => requantize::<7, Probabilistic>(case.src, &mut prng),
                    _ => unreachable!(),
                };
                total += out as u64;
            }
            let mean = total as f64 / case.draws as f64;
            let expected = case.src as f64 * max_value(case.bits) as f64 / 255.0;
            assert!(
                (mean - expected).abs() < case.tolerance,
                "case {:?}: mean {} expected {}",
                case,
                mean,
                expected
            );
        }
    }

    #[test]
    fn test_choose_rounding_mode() {
        assert_eq!(choose_rounding_mode(5, 4), RoundingMode::Nearest);
        assert_eq!(choose_rounding_mode(5, 4096), RoundingMode::Probabilistic);
        assert_eq!(
            choose_rounding_mode(5, PROBABILISTIC_ROUNDING_THRESHOLD),
            RoundingMode::Probabilistic
        );
        assert_eq!(
            choose_rounding_mode(5, PROBABILISTIC_ROUNDING_THRESHOLD - 1),
            RoundingMode::Nearest
        );

        // 8-bit packing never rounds, so it never goes probabilistic.
        assert_eq!(choose_rounding_mode(8, 1 << 20), RoundingMode::Nearest);
        assert_eq!(probabilistic_rounding_threshold(8), usize::MAX);
    }
}
