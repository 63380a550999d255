//! Packing core of a low-precision matrix multiplication library.
//!
//! The library multiplies matrices of unsigned 8-bit integers, but packed
//! operands may internally use fewer bits per entry (for example 7 on the
//! LHS and 5 on the RHS) so kernels can run with narrower accumulators;
//! inputs and outputs stay 8-bit either way. This crate implements the
//! packing stage, which does three things at once:
//!
//! - reorders a block of a source matrix into the cell layout a compute
//!   kernel consumes ([`packing`]),
//! - requantizes every byte from `[0, 255]` to the packed bit depth with a
//!   rounding policy that avoids systematic bias ([`requantize`]), and
//! - accumulates the per-width-index sums ("rank-one update") the
//!   accumulation step uses to correct for unsigned quantization offsets.
//!
//! The LHS and RHS share one code path by being addressed in (width,
//! depth) coordinates rather than (row, column); see [`map`]. Bit depth,
//! rounding mode and cell format are compile-time parameters so the inner
//! loop monomorphizes per combination. A scalar reference path is always
//! available; on x86_64 the WidthMajor packing paths are vectorized with
//! SSE2 and produce byte-identical output.

mod iter;

pub mod format;
pub mod map;
pub mod packing;
pub mod requantize;
pub mod rng;


pub use format::{
    CellOrder, DepthMajorCells, KernelSideFormat, WidthMajorCells, MAX_CELLS, REGISTER_SIZE,
};
pub use map::{MapOrder, MatrixMap, SideMap, SideMapOrder};
pub use packing::{
    pack_lhs, pack_lhs_seeded, pack_rhs, pack_rhs_seeded, PackedSideBlock, SideBlockParams,
    CACHE_LINE_SIZE,
};
pub use requantize::{
    choose_rounding_mode, max_value, probabilistic_rounding_threshold, requantize, Nearest,
    Probabilistic, Rounding, RoundingMode, PROBABILISTIC_ROUNDING_THRESHOLD,
};
pub use rng::Xorshift8;
