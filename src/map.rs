//! Non-owning views of source matrices.
//!
//! Packing handles the LHS and RHS of a multiplication with a single piece
//! of code. Instead of addressing a source block by (row, column) it is
//! addressed by (width, depth): "depth" is the dimension that the dot
//! product accumulates over (columns of the LHS, rows of the RHS) and
//! "width" is the other one. [`MatrixMap`] is the rows/columns view that
//! callers hold; the pack entry points rebind it as a [`SideMap`].

/// Storage order of a source matrix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapOrder {
    RowMajor,
    ColMajor,
}

/// Non-owning view of a matrix of `u8` entries.
#[derive(Copy, Clone)]
pub struct MatrixMap<'a> {
    data: &'a [u8],
    rows: usize,
    cols: usize,
    stride: usize,
    order: MapOrder,
}

impl<'a> MatrixMap<'a> {
    /// Create a view of a contiguous matrix (stride equal to the minor
    /// dimension).
    pub fn new(data: &'a [u8], rows: usize, cols: usize, order: MapOrder) -> MatrixMap<'a> {
        let stride = match order {
            MapOrder::RowMajor => cols,
            MapOrder::ColMajor => rows,
        };
        Self::with_stride(data, rows, cols, stride, order)
    }

    /// Create a view with an explicit stride between major lines.
    pub fn with_stride(
        data: &'a [u8],
        rows: usize,
        cols: usize,
        stride: usize,
        order: MapOrder,
    ) -> MatrixMap<'a> {
        let (major, minor) = match order {
            MapOrder::RowMajor => (rows, cols),
            MapOrder::ColMajor => (cols, rows),
        };
        assert!(stride >= minor, "stride inconsistent with storage order");
        if rows > 0 && cols > 0 {
            assert!(
                data.len() >= (major - 1) * stride + minor,
                "matrix data shorter than its declared extent"
            );
        }
        MatrixMap {
            data,
            rows,
            cols,
            stride,
            order,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn order(&self) -> MapOrder {
        self.order
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    fn row_stride(&self) -> usize {
        match self.order {
            MapOrder::RowMajor => self.stride,
            MapOrder::ColMajor => 1,
        }
    }

    fn col_stride(&self) -> usize {
        match self.order {
            MapOrder::RowMajor => 1,
            MapOrder::ColMajor => self.stride,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> u8 {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.row_stride() + col * self.col_stride()]
    }

    /// Return a view of a rectangular sub-block. The sub-block must be fully
    /// contained in `self`.
    pub fn block(
        &self,
        start_row: usize,
        start_col: usize,
        rows: usize,
        cols: usize,
    ) -> MatrixMap<'a> {
        assert!(start_row + rows <= self.rows && start_col + cols <= self.cols);
        let offset = start_row * self.row_stride() + start_col * self.col_stride();
        MatrixMap {
            data: &self.data[offset..],
            rows,
            cols,
            stride: self.stride,
            order: self.order,
        }
    }
}

/// Storage order of a side map.
///
/// WidthMajor means that entries sharing a width index are stored
/// contiguously, so moving along the depth dimension has unit stride. For
/// the LHS, whose width dimension is its rows, WidthMajor coincides with
/// RowMajor; for the RHS it coincides with ColMajor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SideMapOrder {
    WidthMajor,
    DepthMajor,
}

/// Non-owning (width, depth)-addressed view of a block of one side.
#[derive(Copy, Clone)]
pub struct SideMap<'a> {
    data: &'a [u8],
    width: usize,
    depth: usize,
    stride: usize,
    order: SideMapOrder,
}

impl<'a> SideMap<'a> {
    pub fn new(data: &'a [u8], width: usize, depth: usize, order: SideMapOrder) -> SideMap<'a> {
        let stride = match order {
            SideMapOrder::WidthMajor => depth,
            SideMapOrder::DepthMajor => width,
        };
        Self::with_stride(data, width, depth, stride, order)
    }

    pub fn with_stride(
        data: &'a [u8],
        width: usize,
        depth: usize,
        stride: usize,
        order: SideMapOrder,
    ) -> SideMap<'a> {
        let (major, minor) = match order {
            SideMapOrder::WidthMajor => (width, depth),
            SideMapOrder::DepthMajor => (depth, width),
        };
        assert!(stride >= minor, "stride inconsistent with storage order");
        if width > 0 && depth > 0 {
            assert!(
                data.len() >= (major - 1) * stride + minor,
                "side map data shorter than its declared extent"
            );
        }
        SideMap {
            data,
            width,
            depth,
            stride,
            order,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn order(&self) -> SideMapOrder {
        self.order
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn width_stride(&self) -> usize {
        match self.order {
            SideMapOrder::WidthMajor => self.stride,
            SideMapOrder::DepthMajor => 1,
        }
    }

    pub fn depth_stride(&self) -> usize {
        match self.order {
            SideMapOrder::WidthMajor => 1,
            SideMapOrder::DepthMajor => self.stride,
        }
    }

    #[inline]
    fn offset(&self, w: usize, d: usize) -> usize {
        w * self.width_stride() + d * self.depth_stride()
    }

    #[inline]
    pub fn get(&self, w: usize, d: usize) -> u8 {
        debug_assert!(w < self.width && d < self.depth);
        self.data[self.offset(w, d)]
    }

    /// Return the underlying data starting at entry `(w, d)`.
    #[inline]
    pub fn data_at(&self, w: usize, d: usize) -> &'a [u8] {
        debug_assert!(w < self.width && d < self.depth);
        &self.data[self.offset(w, d)..]
    }

    /// Return a view of a rectangular sub-block. The sub-block must be fully
    /// contained in `self`.
    pub fn block(
        &self,
        start_width: usize,
        start_depth: usize,
        width: usize,
        depth: usize,
    ) -> SideMap<'a> {
        debug_assert!(start_width + width <= self.width);
        debug_assert!(start_depth + depth <= self.depth);
        SideMap {
            data: &self.data[self.offset(start_width, start_depth)..],
            width,
            depth,
            stride: self.stride,
            order: self.order,
        }
    }
}
