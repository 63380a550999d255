//! Compile-time descriptions of the packed layout expected by compute
//! kernels.
//!
//! A packed block is organized as a grid of fixed-shape *cells*. A kernel
//! side format tiles `CELLS` cells along the width dimension; the kernel
//! consumes one `KERNEL_WIDTH x REGISTER_SIZE` register tile per iteration
//! of its inner loop. The formats here use 4x2 cells, in either internal
//! order, which is what the current kernels consume.

/// Depth of a register tile: the number of depth entries a kernel consumes
/// from each packed run per inner-loop iteration.
pub const REGISTER_SIZE: usize = 16;

/// Largest supported cell count per kernel side format. Bounds the size of
/// the fixed scratch buffers used when packing boundary tiles.
pub const MAX_CELLS: usize = 8;

/// Storage order within a cell.
///
/// As with side maps, DepthMajor means entries sharing a depth index are
/// contiguous, WidthMajor means entries sharing a width index are.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellOrder {
    DepthMajor,
    WidthMajor,
}

/// Compile-time description of one side's packed layout.
///
/// Implementations are zero-sized marker types so that a whole format is a
/// single type parameter and the packing inner loops monomorphize per
/// format.
pub trait KernelSideFormat {
    /// Number of cells tiled along the width dimension.
    const CELLS: usize;
    /// Width of one cell.
    const CELL_WIDTH: usize;
    /// Depth of one cell.
    const CELL_DEPTH: usize;
    /// Internal storage order of one cell.
    const CELL_ORDER: CellOrder;
    /// Size of one cell in bytes.
    const CELL_SIZE: usize;
    /// Width of a register tile: `CELL_WIDTH * CELLS`.
    const KERNEL_WIDTH: usize;

    /// Byte offset of entry `(w, d)` within a cell.
    fn offset_into_cell(w: usize, d: usize) -> usize;
}

/// `CELLS` 4x2 cells in DepthMajor order.
pub struct DepthMajorCells<const CELLS: usize>;

impl<const CELLS: usize> KernelSideFormat for DepthMajorCells<CELLS> {
    const CELLS: usize = CELLS;
    const CELL_WIDTH: usize = 4;
    const CELL_DEPTH: usize = 2;
    const CELL_ORDER: CellOrder = CellOrder::DepthMajor;
    const CELL_SIZE: usize = 8;
    const KERNEL_WIDTH: usize = 4 * CELLS;

    #[inline]
    fn offset_into_cell(w: usize, d: usize) -> usize {
        d * Self::CELL_WIDTH + w
    }
}

/// `CELLS` 4x2 cells in WidthMajor order.
pub struct WidthMajorCells<const CELLS: usize>;

impl<const CELLS: usize> KernelSideFormat for WidthMajorCells<CELLS> {
    const CELLS: usize = CELLS;
    const CELL_WIDTH: usize = 4;
    const CELL_DEPTH: usize = 2;
    const CELL_ORDER: CellOrder = CellOrder::WidthMajor;
    const CELL_SIZE: usize = 8;
    const KERNEL_WIDTH: usize = 4 * CELLS;

    #[inline]
    fn offset_into_cell(w: usize, d: usize) -> usize {
        w * Self::CELL_DEPTH + d
    }
}

#[cfg(test)]
mod tests {
    use super::{DepthMajorCells, KernelSideFormat, WidthMajorCells};

    #[test]
    fn test_kernel_width() {
        assert_eq!(DepthMajorCells::<1>::KERNEL_WIDTH, 4);
        assert_eq!(DepthMajorCells::<3>::KERNEL_WIDTH, 12);
        assert_eq!(WidthMajorCells::<2>::KERNEL_WIDTH, 8);
    }

    #[test]
    fn test_offset_into_cell() {
        // DepthMajor: entries sharing a depth index are contiguous, so a
        // cell reads [w0d0 w1d0 w2d0 w3d0 w0d1 w1d1 w2d1 w3d1].
        let depth_major: Vec<usize> = (0..2)
            .flat_map(|d| (0..4).map(move |w| DepthMajorCells::<1>::offset_into_cell(w, d)))
            .collect();
        assert_eq!(depth_major, [0, 1, 2, 3, 4, 5, 6, 7]);

        // WidthMajor: [w0d0 w0d1 w1d0 w1d1 w2d0 w2d1 w3d0 w3d1].
        let width_major: Vec<usize> = (0..4)
            .flat_map(|w| (0..2).map(move |d| WidthMajorCells::<1>::offset_into_cell(w, d)))
            .collect();
        assert_eq!(width_major, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(WidthMajorCells::<1>::offset_into_cell(2, 1), 5);
        assert_eq!(DepthMajorCells::<1>::offset_into_cell(2, 1), 6);
    }
}
