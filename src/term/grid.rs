use bitflags::bitflags;

use super::color::Color;
use super::cursor::CellAttrs;

bitflags! {
    /// Per-cell flags for wide character tracking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct CellFlags: u8 {
        /// This cell holds a wide (2-column) character
        const WIDE_CHAR   = 1 << 0;
        /// This cell is the trailing spacer of a wide character
        const WIDE_SPACER = 1 << 1;
    }
}

/// A single terminal cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub c: char,
    pub fg: Color,
    pub bg: Color,
    pub attrs: CellAttrs,
    pub flags: CellFlags,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            c: ' ',
            fg: Color::Default,
            bg: Color::Default,
            attrs: CellAttrs::empty(),
            flags: CellFlags::empty(),
        }
    }
}

impl Cell {
    /// Create a blank cell carrying the given background color, as produced
    /// by every erase operation (per ECMA-48: attributes are cleared, the
    /// current background is kept).
    pub fn blank(bg: Color) -> Self {
        Self {
            bg,
            ..Default::default()
        }
    }

    /// Create a spacer cell for the trailing half of a wide character.
    pub fn wide_spacer() -> Self {
        Self {
            flags: CellFlags::WIDE_SPACER,
            ..Default::default()
        }
    }

    /// Erase this cell using the cursor's current background color.
    pub fn erase(&mut self, bg: Color) {
        *self = Cell::blank(bg);
    }

    /// True when the cell is indistinguishable from a freshly constructed
    /// one (blank, default colors, no attributes).
    pub fn is_default(&self) -> bool {
        *self == Cell::default()
    }
}

/// A single row in the terminal grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(cols: u16) -> Self {
        Self {
            cells: vec![Cell::default(); cols as usize],
        }
    }

    /// A row of blanks carrying the given background color.
    pub fn blank(cols: u16, bg: Color) -> Self {
        Self {
            cells: vec![Cell::blank(bg); cols as usize],
        }
    }

    /// Erase all cells using the given background color.
    pub fn erase_with_bg(&mut self, bg: Color) {
        for cell in &mut self.cells {
            cell.erase(bg);
        }
    }

    /// The row's text with trailing blanks trimmed, spacer cells skipped.
    pub fn text(&self) -> String {
        self.cells
            .iter()
            .filter(|c| !c.flags.contains(CellFlags::WIDE_SPACER))
            .map(|c| c.c)
            .collect::<String>()
            .trim_end()
            .to_string()
    }
}

/// The fixed-size cell grid backing a screen buffer.
///
/// Width and height are immutable for the lifetime of the grid; a terminal
/// resize allocates a fresh grid and re-renders into it. There is no
/// scrollback: rows scrolled off the top are gone.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub rows: Vec<Row>,
    pub cols: u16,
}

impl Grid {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows: (0..rows).map(|_| Row::new(cols)).collect(),
            cols,
        }
    }

    pub fn row(&self, row: u16) -> &Row {
        &self.rows[row as usize]
    }

    pub fn row_mut(&mut self, row: u16) -> &mut Row {
        &mut self.rows[row as usize]
    }

    /// Write a cell at the given position; out-of-range writes are dropped.
    pub fn set_cell(&mut self, row: u16, col: u16, cell: Cell) {
        if col < self.cols && (row as usize) < self.rows.len() {
            self.rows[row as usize].cells[col as usize] = cell;
        }
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        self.rows
            .get(row as usize)
            .and_then(|r| r.cells.get(col as usize))
    }

    /// Scroll the region [top, bottom] up by one line. The top line of the
    /// region is discarded and a blank line carrying `bg` appears at the
    /// bottom.
    pub fn scroll_up(&mut self, top: u16, bottom: u16, bg: Color) {
        let (top, bottom) = (top as usize, bottom as usize);
        if top > bottom || bottom >= self.rows.len() {
            return;
        }
        self.rows.remove(top);
        self.rows.insert(bottom, Row::blank(self.cols, bg));
    }

    /// Scroll the region [top, bottom] down by one line. The bottom line of
    /// the region is discarded and a blank line carrying `bg` appears at the
    /// top.
    pub fn scroll_down(&mut self, top: u16, bottom: u16, bg: Color) {
        let (top, bottom) = (top as usize, bottom as usize);
        if top > bottom || bottom >= self.rows.len() {
            return;
        }
        self.rows.remove(bottom);
        self.rows.insert(top, Row::blank(self.cols, bg));
    }

    /// Erase cells in a row from start_col to end_col (exclusive), filling
    /// with blanks carrying `bg`.
    pub fn erase_cells(&mut self, row: u16, start_col: u16, end_col: u16, bg: Color) {
        if row as usize >= self.rows.len() {
            return;
        }
        let r = &mut self.rows[row as usize];
        let start = start_col as usize;
        let end = (end_col as usize).min(r.cells.len());
        for i in start..end {
            r.cells[i].erase(bg);
        }
    }

    /// Insert blank cells at position, shifting existing cells right; cells
    /// pushed past the right edge are dropped.
    pub fn insert_cells(&mut self, row: u16, col: u16, count: u16, bg: Color) {
        if row as usize >= self.rows.len() || col >= self.cols {
            return;
        }
        let r = &mut self.rows[row as usize];
        let col = col as usize;
        let count = (count as usize).min(r.cells.len() - col);
        for _ in 0..count {
            r.cells.pop();
            r.cells.insert(col, Cell::blank(bg));
        }
    }

    /// Delete cells at position, shifting the remainder of the row left and
    /// filling the right edge with blanks carrying `bg`.
    pub fn delete_cells(&mut self, row: u16, col: u16, count: u16, bg: Color) {
        if row as usize >= self.rows.len() || col >= self.cols {
            return;
        }
        let r = &mut self.rows[row as usize];
        let col = col as usize;
        let count = (count as usize).min(r.cells.len() - col);
        for _ in 0..count {
            r.cells.remove(col);
            r.cells.push(Cell::blank(bg));
        }
    }
}
