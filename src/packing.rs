//! Packing blocks of the LHS and RHS into the storage layout expected by
//! compute kernels.
//!
//! Packing rewrites an L2-sized block of a source matrix into a
//! [`PackedSideBlock`], requantizing every byte to the packed bit depth on
//! the way (see [`crate::requantize`]) and accumulating the per-width-index
//! sums that the later accumulation step applies as a rank-one correction.
//! Because the destination layout depends on the kernel format, everything
//! here is generic over [`KernelSideFormat`].
//!
//! The packed layout is traversal-ordered rather than random-access: bytes
//! are appended in exactly the order the kernel will read them. An L2 block
//! is a sequence of L1-depth slices; within a slice, each kernel-width
//! strip is a contiguous *run* of register tiles; within a tile, cells are
//! emitted `CELLS` at a time along the width for each cell-depth group.
//! Boundary tiles (source narrower or shallower than a full tile) are
//! zero-extended before packing, which is safe because requantization maps
//! zero to zero under every rounding mode.

use std::marker::PhantomData;
use std::ops::Range;

use crate::format::{KernelSideFormat, MAX_CELLS, REGISTER_SIZE};
use crate::iter::{range_chunks, range_chunks_exact};
use crate::map::{MapOrder, MatrixMap, SideMap, SideMapOrder};
use crate::requantize::{
    choose_rounding_mode, requantize, Nearest, Probabilistic, Rounding, RoundingMode,
};
use crate::rng::Xorshift8;

#[cfg(target_arch = "x86_64")]
pub(crate) mod x86_64;

/// Assumed data cache line size, used as the prefetch stride.
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache-blocking parameters of one packed side.
///
/// The L2 parameters fix the overall size of the packed block; the L1
/// parameters, together with the kernel format, fix the fine traversal
/// order. Tuning these to the cache hierarchy is the caller's concern; this
/// module only requires them to be consistent with the kernel format,
/// which [`PackedSideBlock::new`] asserts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SideBlockParams {
    pub l1_width: usize,
    pub l1_depth: usize,
    pub l2_width: usize,
    pub l2_depth: usize,
}

impl SideBlockParams {
    /// Return the smallest valid parameters covering a `width x depth`
    /// source block, with the given L1 slice shape. `l1_width` must be a
    /// multiple of the format's kernel width and `l1_depth` a multiple of
    /// [`REGISTER_SIZE`].
    pub fn covering<F: KernelSideFormat>(
        width: usize,
        depth: usize,
        l1_width: usize,
        l1_depth: usize,
    ) -> SideBlockParams {
        SideBlockParams {
            l1_width,
            l1_depth,
            l2_width: width.next_multiple_of(F::KERNEL_WIDTH),
            l2_depth: depth.next_multiple_of(REGISTER_SIZE),
        }
    }
}

/// A packed block of either the LHS or RHS (whence the generic "side"
/// name), laid out in the storage order expected by kernels consuming
/// format `F`, together with its rank-one-update vector.
///
/// The block is filled by [`pack_lhs`] / [`pack_rhs`] and read by the
/// compute kernel. Writing is strictly sequential through a cursor,
/// because the traversal-ordered layout would be intricate to random
/// access; [`seek_run`](PackedSideBlock::seek_run) repositions the cursor
/// at run boundaries and the tile packers advance it cell by cell.
pub struct PackedSideBlock<F: KernelSideFormat> {
    params: SideBlockParams,
    /// Packed bytes, `l2_width * l2_depth` of them.
    data: Vec<u8>,
    /// One 32-bit sum per width index, multiplied by
    /// `rank_one_update_multiplier`.
    rank_one_update: Vec<i32>,
    rank_one_update_multiplier: i32,
    /// Sequential write position in `data`.
    pos: usize,
    _format: PhantomData<F>,
}

impl<F: KernelSideFormat> PackedSideBlock<F> {
    /// Create a zeroed packed block.
    ///
    /// `rank_one_update_multiplier` scales every sum added into the
    /// rank-one-update vector; it is typically plus or minus the other
    /// operand's quantization zero point, depending on sign conventions.
    pub fn new(params: SideBlockParams, rank_one_update_multiplier: i32) -> PackedSideBlock<F> {
        assert!(F::CELLS <= MAX_CELLS, "cell count exceeds MAX_CELLS");
        assert!(
            params.l1_width > 0 && params.l1_width % F::KERNEL_WIDTH == 0,
            "l1_width must be a positive multiple of the kernel width"
        );
        assert!(
            params.l1_depth > 0 && params.l1_depth % REGISTER_SIZE == 0,
            "l1_depth must be a positive multiple of REGISTER_SIZE"
        );
        assert!(
            params.l2_width % F::KERNEL_WIDTH == 0,
            "l2_width must be a multiple of the kernel width"
        );
        assert!(
            params.l2_depth % REGISTER_SIZE == 0,
            "l2_depth must be a multiple of REGISTER_SIZE"
        );
        PackedSideBlock {
            params,
            data: vec![0; params.l2_width * params.l2_depth],
            rank_one_update: vec![0; params.l2_width],
            rank_one_update_multiplier,
            pos: 0,
            _format: PhantomData,
        }
    }

    pub fn params(&self) -> SideBlockParams {
        self.params
    }

    /// The packed bytes, in kernel traversal order.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The rank-one-update vector: for each width index, the multiplier
    /// times the sum of the packed entries at that index.
    pub fn rank_one_update(&self) -> &[i32] {
        &self.rank_one_update
    }

    pub fn rank_one_update_multiplier(&self) -> i32 {
        self.rank_one_update_multiplier
    }

    /// Reposition the write cursor at the start of the run for the
    /// kernel-width strip at `start_width` within the L1 slice starting at
    /// `start_depth`.
    pub fn seek_run(&mut self, start_width: usize, start_depth: usize) {
        let kernel_run_depth = self.params.l1_depth.min(self.params.l2_depth - start_depth);
        self.pos = self.params.l2_width * start_depth + start_width * kernel_run_depth;
    }

    /// Advance the write cursor by `n` cells.
    pub fn seek_forward_n_cells(&mut self, n: usize) {
        self.pos += n * F::CELL_SIZE;
    }

    /// The writable remainder of the packed buffer from the cursor on,
    /// alongside the rank-one-update vector.
    pub(crate) fn tile_dest(&mut self) -> (&mut [u8], &mut [i32]) {
        (&mut self.data[self.pos..], &mut self.rank_one_update)
    }

    pub(crate) fn reset_rank_one_update(&mut self) {
        self.rank_one_update.fill(0);
    }
}

/// Pseudo-random state owned by one pack: the scalar generator for the
/// reference path and, where a vectorized path exists, its vector
/// counterpart. Both are seeded from the same byte so a pack is fully
/// reproducible from its seed.
pub(crate) struct PackRng {
    pub scalar: Xorshift8,
    #[cfg(target_arch = "x86_64")]
    pub vector: x86_64::Xorshift8x16,
}

impl PackRng {
    fn new(seed: u8) -> PackRng {
        PackRng {
            scalar: Xorshift8::with_seed(seed),
            #[cfg(target_arch = "x86_64")]
            vector: x86_64::Xorshift8x16::with_seed(seed),
        }
    }
}

/// Pack one complete `KERNEL_WIDTH x REGISTER_SIZE` tile.
///
/// Dispatches to the vectorized specialization when the source is
/// WidthMajor (unit depth stride) and falls back to the scalar reference
/// path otherwise. Both paths write byte-identical layouts and identical
/// rank-one-update sums; with probabilistic rounding they consume their
/// respective generators, so outputs match between paths only statistically.
fn pack_tile<F: KernelSideFormat, const BITS: u32, R: Rounding>(
    src: &SideMap,
    dst: &mut PackedSideBlock<F>,
    start_width: usize,
    prng: &mut PackRng,
) {
    debug_assert_eq!(src.width(), F::KERNEL_WIDTH);
    debug_assert_eq!(src.depth(), REGISTER_SIZE);

    #[cfg(target_arch = "x86_64")]
    if src.order() == SideMapOrder::WidthMajor {
        use crate::format::CellOrder;

        // Safety: SSE2 is a baseline feature of x86_64, and the side map
        // constructor asserted that every row of the tile is in bounds.
        unsafe {
            match F::CELL_ORDER {
                CellOrder::DepthMajor => {
                    x86_64::pack_tile_depth_major::<F, BITS, R>(src, dst, start_width, prng)
                }
                CellOrder::WidthMajor => {
                    x86_64::pack_tile_width_major::<F, BITS, R>(src, dst, start_width, prng)
                }
            }
        }
        return;
    }

    pack_tile_scalar::<F, BITS, R>(src, dst, start_width, &mut prng.scalar);
}

/// Scalar reference path for packing one complete tile.
fn pack_tile_scalar<F: KernelSideFormat, const BITS: u32, R: Rounding>(
    src: &SideMap,
    dst: &mut PackedSideBlock<F>,
    start_width: usize,
    prng: &mut Xorshift8,
) {
    let multiplier = dst.rank_one_update_multiplier();
    let (data, updates) = dst.tile_dest();
    assert!(data.len() >= F::KERNEL_WIDTH * REGISTER_SIZE);

    let mut out = 0;
    for cell_start_depth in (0..REGISTER_SIZE).step_by(F::CELL_DEPTH) {
        for cell_start_width in (0..F::KERNEL_WIDTH).step_by(F::CELL_WIDTH) {
            let cell = src.block(cell_start_width, cell_start_depth, F::CELL_WIDTH, F::CELL_DEPTH);
            for w in 0..F::CELL_WIDTH {
                let mut sum = 0i32;
                for d in 0..F::CELL_DEPTH {
                    let requantized = requantize::<BITS, R>(cell.get(w, d), prng);
                    data[out + F::offset_into_cell(w, d)] = requantized;
                    sum += requantized as i32;
                }
                updates[start_width + cell_start_width + w] += sum * multiplier;
            }
            out += F::CELL_SIZE;
        }
    }

    dst.seek_forward_n_cells(F::CELLS * REGISTER_SIZE / F::CELL_DEPTH);
}

/// Pack a boundary tile smaller than `KERNEL_WIDTH x REGISTER_SIZE`.
///
/// The source is copied into a zeroed local buffer in its own storage
/// order, which zero-extends it to a complete tile; requantization maps
/// zero to zero, so padding entries stay zero in the packed output and
/// contribute nothing to the rank-one update.
fn pack_partial_tile<F: KernelSideFormat, const BITS: u32, R: Rounding>(
    src: &SideMap,
    dst: &mut PackedSideBlock<F>,
    start_width: usize,
    prng: &mut PackRng,
) {
    debug_assert!(src.width() <= F::KERNEL_WIDTH);
    debug_assert!(src.depth() <= REGISTER_SIZE);

    let mut buf = [0u8; 4 * MAX_CELLS * REGISTER_SIZE];
    let buf = &mut buf[..F::KERNEL_WIDTH * REGISTER_SIZE];

    let complete = match src.order() {
        SideMapOrder::WidthMajor => {
            for w in 0..src.width() {
                buf[w * REGISTER_SIZE..w * REGISTER_SIZE + src.depth()]
                    .copy_from_slice(&src.data_at(w, 0)[..src.depth()]);
            }
            SideMap::with_stride(
                buf,
                F::KERNEL_WIDTH,
                REGISTER_SIZE,
                REGISTER_SIZE,
                SideMapOrder::WidthMajor,
            )
        }
        SideMapOrder::DepthMajor => {
            for d in 0..src.depth() {
                buf[d * F::KERNEL_WIDTH..d * F::KERNEL_WIDTH + src.width()]
                    .copy_from_slice(&src.data_at(0, d)[..src.width()]);
            }
            SideMap::with_stride(
                buf,
                F::KERNEL_WIDTH,
                REGISTER_SIZE,
                F::KERNEL_WIDTH,
                SideMapOrder::DepthMajor,
            )
        }
    };

    pack_tile::<F, BITS, R>(&complete, dst, start_width, prng);
}

/// Packs one L2-sized source block into a [`PackedSideBlock`].
///
/// Walks the source in L1-sized slices, kernel-width strips and
/// register-size tiles. The rounding mode is chosen once for the whole
/// pack from the full source depth, then dispatched to compile-time
/// specialized runs so that requantization inlines.
struct SidePacker<'a, F: KernelSideFormat, const BITS: u32> {
    src: SideMap<'a>,
    dst: &'a mut PackedSideBlock<F>,
    rounding_mode: RoundingMode,
    prng: PackRng,
}

impl<'a, F: KernelSideFormat, const BITS: u32> SidePacker<'a, F, BITS> {
    fn new(dst: &'a mut PackedSideBlock<F>, src: SideMap<'a>, seed: u8) -> SidePacker<'a, F, BITS> {
        assert!(BITS >= 1 && BITS <= 8);
        assert!(
            src.width() <= dst.params().l2_width && src.depth() <= dst.params().l2_depth,
            "destination block too small for source block"
        );
        let rounding_mode = choose_rounding_mode(BITS, src.depth());
        SidePacker {
            src,
            dst,
            rounding_mode,
            prng: PackRng::new(seed),
        }
    }

    fn pack_l2(&mut self) {
        self.dst.reset_rank_one_update();
        let params = self.dst.params();
        for depths in range_chunks(0..self.src.depth(), params.l1_depth) {
            for widths in range_chunks(0..self.src.width(), params.l1_width) {
                self.prefetch_l1(&widths, &depths);
                self.pack_l1(widths, depths.clone());
            }
        }
    }

    fn pack_l1(&mut self, widths: Range<usize>, depths: Range<usize>) {
        for strip in range_chunks(widths, F::KERNEL_WIDTH) {
            self.dst.seek_run(strip.start, depths.start);
            match self.rounding_mode {
                RoundingMode::Nearest => self.pack_run::<Nearest>(strip, depths.clone()),
                RoundingMode::Probabilistic => {
                    self.pack_run::<Probabilistic>(strip, depths.clone())
                }
            }
        }
    }

    /// Pack one run: the full depth range of one kernel-width strip.
    fn pack_run<R: Rounding>(&mut self, widths: Range<usize>, depths: Range<usize>) {
        if widths.len() == F::KERNEL_WIDTH {
            // Interior strip: complete tiles are packed straight from the
            // source, only a depth remainder needs zero-extension.
            let mut tiles = range_chunks_exact(depths, REGISTER_SIZE);
            for tile_depths in tiles.by_ref() {
                let tile =
                    self.src
                        .block(widths.start, tile_depths.start, F::KERNEL_WIDTH, REGISTER_SIZE);
                pack_tile::<F, BITS, R>(&tile, self.dst, widths.start, &mut self.prng);
            }
            let rem = tiles.remainder();
            if !rem.is_empty() {
                let tile = self.src.block(widths.start, rem.start, F::KERNEL_WIDTH, rem.len());
                pack_partial_tile::<F, BITS, R>(&tile, self.dst, widths.start, &mut self.prng);
            }
        } else {
            // Boundary strip: every tile needs zero-extension in the width
            // dimension.
            for tile_depths in range_chunks(depths, REGISTER_SIZE) {
                let tile = self
                    .src
                    .block(widths.start, tile_depths.start, widths.len(), tile_depths.len());
                pack_partial_tile::<F, BITS, R>(&tile, self.dst, widths.start, &mut self.prng);
            }
        }
    }

    /// Advisory prefetch of the source data the next L1 pack will read:
    /// cache-line stride along the contiguous dimension, unit stride along
    /// the other. Matters mostly for long L2 depth blocks.
    fn prefetch_l1(&self, widths: &Range<usize>, depths: &Range<usize>) {
        match self.src.order() {
            SideMapOrder::WidthMajor => {
                for d in depths.clone().step_by(CACHE_LINE_SIZE) {
                    for w in widths.clone() {
                        prefetch(self.src.data_at(w, d).as_ptr());
                    }
                }
            }
            SideMapOrder::DepthMajor => {
                for d in depths.clone() {
                    for w in widths.clone().step_by(CACHE_LINE_SIZE) {
                        prefetch(self.src.data_at(w, d).as_ptr());
                    }
                }
            }
        }
    }
}

#[inline(always)]
fn prefetch(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // Safety: prefetching is advisory and has no observable memory effects.
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<{ _MM_HINT_T0 }>(ptr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

/// Pack a block of the LHS matrix into `dst`, using the default generator
/// seed for probabilistic rounding.
pub fn pack_lhs<F: KernelSideFormat, const BITS: u32>(
    dst: &mut PackedSideBlock<F>,
    src: &MatrixMap,
) {
    pack_lhs_seeded::<F, BITS>(dst, src, Xorshift8::DEFAULT_SEED);
}

/// Pack a block of the LHS matrix into `dst`.
///
/// The LHS's width dimension is its rows and its depth dimension its
/// columns, so a RowMajor source becomes a WidthMajor side map. Two packs
/// with the same `seed` produce identical output, including under
/// probabilistic rounding.
pub fn pack_lhs_seeded<F: KernelSideFormat, const BITS: u32>(
    dst: &mut PackedSideBlock<F>,
    src: &MatrixMap,
    seed: u8,
) {
    let order = match src.order() {
        MapOrder::RowMajor => SideMapOrder::WidthMajor,
        MapOrder::ColMajor => SideMapOrder::DepthMajor,
    };
    let side = SideMap::with_stride(src.data(), src.rows(), src.cols(), src.stride(), order);
    SidePacker::<F, BITS>::new(dst, side, seed).pack_l2();
}

/// Pack a block of the RHS matrix into `dst`, using the default generator
/// seed for probabilistic rounding.
pub fn pack_rhs<F: KernelSideFormat, const BITS: u32>(
    dst: &mut PackedSideBlock<F>,
    src: &MatrixMap,
) {
    pack_rhs_seeded::<F, BITS>(dst, src, Xorshift8::DEFAULT_SEED);
}

/// Pack a block of the RHS matrix into `dst`.
///
/// Symmetric to [`pack_lhs_seeded`]: the RHS's width dimension is its
/// columns and its depth dimension its rows, so a ColMajor source becomes
/// a WidthMajor side map.
pub fn pack_rhs_seeded<F: KernelSideFormat, const BITS: u32>(
    dst: &mut PackedSideBlock<F>,
    src: &MatrixMap,
    seed: u8,
) {
    let order = match src.order() {
        MapOrder::ColMajor => SideMapOrder::WidthMajor,
        MapOrder::RowMajor => SideMapOrder::DepthMajor,
    };
    let side = SideMap::with_stride(src.data(), src.cols(), src.rows(), src.stride(), order);
    SidePacker::<F, BITS>::new(dst, side, seed).pack_l2();
}
