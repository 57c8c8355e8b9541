use super::color::Color;
use bitflags::bitflags;

bitflags! {
    /// Cell text attributes as a compact bitflag set.
    ///
    /// Bold and dim are independent bits; SGR 22 clears both. The underline
    /// variants are likewise independent, and SGR 24 clears all three.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct CellAttrs: u16 {
        const BOLD             = 1 << 0;
        const DIM              = 1 << 1;
        const ITALIC           = 1 << 2;
        const UNDERLINE        = 1 << 3;
        const BLINK            = 1 << 4;
        const REVERSE          = 1 << 5;
        const HIDDEN           = 1 << 6;
        const STRIKETHROUGH    = 1 << 7;
        const DOUBLE_UNDERLINE = 1 << 8;
        const CURLY_UNDERLINE  = 1 << 9;
    }
}

impl CellAttrs {
    /// All underline variants, cleared together by SGR 24.
    pub const ANY_UNDERLINE: CellAttrs = CellAttrs::UNDERLINE
        .union(CellAttrs::DOUBLE_UNDERLINE)
        .union(CellAttrs::CURLY_UNDERLINE);
}

/// Cursor state: position, current pen (colors + attributes), and the
/// DECSC/DECRC saved slot. Visibility is a mode (DECTCEM) and lives in
/// `TerminalModes`.
///
/// `col` may equal the buffer width to represent a pending wrap: the cursor
/// sits past the last column and the next printable character wraps.
#[derive(Debug, Clone)]
pub struct CursorState {
    pub row: u16,
    pub col: u16,
    pub fg: Color,
    pub bg: Color,
    pub attrs: CellAttrs,
    /// Saved cursor for DECSC/DECRC
    saved: Option<SavedCursor>,
}

#[derive(Debug, Clone)]
struct SavedCursor {
    row: u16,
    col: u16,
    fg: Color,
    bg: Color,
    attrs: CellAttrs,
    origin: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            fg: Color::Default,
            bg: Color::Default,
            attrs: CellAttrs::empty(),
            saved: None,
        }
    }
}

impl CursorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save position, pen, and origin mode (DECSC).
    pub fn save(&mut self, origin: bool) {
        self.saved = Some(SavedCursor {
            row: self.row,
            col: self.col,
            fg: self.fg,
            bg: self.bg,
            attrs: self.attrs,
            origin,
        });
    }

    /// Restore the saved slot (DECRC). Returns the saved origin mode, or
    /// None when nothing was saved (the restore is then a no-op).
    pub fn restore(&mut self) -> Option<bool> {
        let saved = self.saved.take()?;
        self.row = saved.row;
        self.col = saved.col;
        self.fg = saved.fg;
        self.bg = saved.bg;
        self.attrs = saved.attrs;
        Some(saved.origin)
    }
}
