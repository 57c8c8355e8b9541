use unicode_width::UnicodeWidthChar;

use super::color::Color;
use super::cursor::{CellAttrs, CursorState};
use super::grid::{Cell, CellFlags, Grid};
use super::modes::TerminalModes;
use super::parser::Perform;

/// Cell-accurate screen state. Implements [`Perform`] so the parser drives
/// it directly.
///
/// Width and height are fixed for the lifetime of a buffer; a terminal
/// resize allocates a fresh buffer and re-renders via [`ScreenBuffer::replay_bytes`].
pub struct ScreenBuffer {
    grid: Grid,
    cursor: CursorState,
    modes: TerminalModes,
    scroll_top: u16,
    scroll_bottom: u16,
    tab_stops: Vec<bool>,
    title: String,
    cols: u16,
    rows: u16,
    /// Response bytes queued by DSR/DA queries; the PTY reader drains these
    /// and writes them back to the child after each chunk.
    pending_responses: Vec<Vec<u8>>,
    /// DEC Special Graphics charset active (ESC ( 0)
    charset_g0_drawing: bool,
    /// Last character passed through `print()`, used by CSI REP (`b`).
    last_printed_char: char,
}

impl ScreenBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        let mut tab_stops = vec![false; cols as usize];
        for i in (0..cols as usize).step_by(8) {
            tab_stops[i] = true;
        }

        Self {
            grid: Grid::new(rows, cols),
            cursor: CursorState::new(),
            modes: TerminalModes::default(),
            scroll_top: 0,
            scroll_bottom: rows - 1,
            tab_stops,
            title: String::new(),
            cols,
            rows,
            pending_responses: Vec::new(),
            charset_g0_drawing: false,
            last_printed_char: ' ',
        }
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        self.grid.cell(row, col)
    }

    /// Cursor position as (col, row). `col` may equal `cols()` when a wrap
    /// is pending.
    pub fn cursor_position(&self) -> (u16, u16) {
        (self.cursor.col, self.cursor.row)
    }

    pub fn cursor(&self) -> &CursorState {
        &self.cursor
    }

    pub fn modes(&self) -> &TerminalModes {
        &self.modes
    }

    pub fn scroll_region(&self) -> (u16, u16) {
        (self.scroll_top, self.scroll_bottom)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Text of one row, trailing blanks trimmed.
    pub fn row_text(&self, row: u16) -> String {
        self.grid
            .rows
            .get(row as usize)
            .map(|r| r.text())
            .unwrap_or_default()
    }

    /// Drain any queued response bytes (DSR, DA) that should be written
    /// back to the PTY.
    pub fn take_pending_responses(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending_responses)
    }

    // --- movement ---

    fn linefeed(&mut self) {
        if self.cursor.row == self.scroll_bottom {
            let (top, bottom, bg) = (self.scroll_top, self.scroll_bottom, self.cursor.bg);
            self.grid.scroll_up(top, bottom, bg);
        } else if self.cursor.row < self.rows - 1 {
            self.cursor.row += 1;
        }
    }

    fn reverse_index(&mut self) {
        if self.cursor.row == self.scroll_top {
            let (top, bottom, bg) = (self.scroll_top, self.scroll_bottom, self.cursor.bg);
            self.grid.scroll_down(top, bottom, bg);
        } else if self.cursor.row > 0 {
            self.cursor.row -= 1;
        }
    }

    fn carriage_return(&mut self) {
        self.cursor.col = 0;
    }

    fn backspace(&mut self) {
        self.cursor.col = self.cursor.col.saturating_sub(1);
    }

    fn tab(&mut self) {
        for i in (self.cursor.col as usize + 1)..self.cols as usize {
            if self.tab_stops[i] {
                self.cursor.col = i as u16;
                return;
            }
        }
        self.cursor.col = self.cols - 1;
    }

    fn set_tab_stop(&mut self) {
        if let Some(stop) = self.tab_stops.get_mut(self.cursor.col as usize) {
            *stop = true;
        }
    }

    fn clear_tab_stops(&mut self, mode: u16) {
        match mode {
            0 => {
                if let Some(stop) = self.tab_stops.get_mut(self.cursor.col as usize) {
                    *stop = false;
                }
            }
            3 => self.tab_stops.iter_mut().for_each(|s| *s = false),
            _ => {}
        }
    }

    fn cursor_up(&mut self, n: u16) {
        let min_row = if self.cursor.row >= self.scroll_top && self.cursor.row <= self.scroll_bottom
        {
            self.scroll_top
        } else {
            0
        };
        self.cursor.row = self.cursor.row.saturating_sub(n).max(min_row);
    }

    fn cursor_down(&mut self, n: u16) {
        let max_row = if self.cursor.row >= self.scroll_top && self.cursor.row <= self.scroll_bottom
        {
            self.scroll_bottom
        } else {
            self.rows - 1
        };
        self.cursor.row = self.cursor.row.saturating_add(n).min(max_row);
    }

    fn cursor_forward(&mut self, n: u16) {
        self.cursor.col = self.cursor.col.saturating_add(n).min(self.cols - 1);
    }

    fn cursor_backward(&mut self, n: u16) {
        self.cursor.col = self.cursor.col.saturating_sub(n).min(self.cols - 1);
    }

    fn cursor_to(&mut self, row: u16, col: u16) {
        let row = row - 1;
        self.cursor.row = if self.modes.origin {
            self.scroll_top.saturating_add(row).min(self.scroll_bottom)
        } else {
            row.min(self.rows - 1)
        };
        self.cursor.col = (col - 1).min(self.cols - 1);
    }

    fn vertical_position(&mut self, row: u16) {
        let row = row - 1;
        self.cursor.row = if self.modes.origin {
            self.scroll_top.saturating_add(row).min(self.scroll_bottom)
        } else {
            row.min(self.rows - 1)
        };
    }

    // --- erase / edit ---

    fn erase_display(&mut self, mode: u16) {
        let (crow, ccol, bg) = (self.cursor.row, self.cursor.col, self.cursor.bg);
        match mode {
            0 => {
                self.grid.erase_cells(crow, ccol, self.cols, bg);
                for r in (crow + 1)..self.rows {
                    self.grid.row_mut(r).erase_with_bg(bg);
                }
            }
            1 => {
                for r in 0..crow {
                    self.grid.row_mut(r).erase_with_bg(bg);
                }
                self.grid.erase_cells(crow, 0, ccol.saturating_add(1), bg);
            }
            // No scrollback is kept, so ED 3 degenerates to ED 2.
            2 | 3 => {
                for r in 0..self.rows {
                    self.grid.row_mut(r).erase_with_bg(bg);
                }
            }
            _ => {}
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let (crow, ccol, bg) = (self.cursor.row, self.cursor.col, self.cursor.bg);
        match mode {
            0 => self.grid.erase_cells(crow, ccol, self.cols, bg),
            1 => self.grid.erase_cells(crow, 0, ccol.saturating_add(1), bg),
            2 => self.grid.row_mut(crow).erase_with_bg(bg),
            _ => {}
        }
    }

    fn insert_lines(&mut self, n: u16) {
        if self.cursor.row >= self.scroll_top && self.cursor.row <= self.scroll_bottom {
            let (row, bottom, bg) = (self.cursor.row, self.scroll_bottom, self.cursor.bg);
            for _ in 0..n.min(self.rows) {
                self.grid.scroll_down(row, bottom, bg);
            }
            self.cursor.col = 0;
        }
    }

    fn delete_lines(&mut self, n: u16) {
        if self.cursor.row >= self.scroll_top && self.cursor.row <= self.scroll_bottom {
            let (row, bottom, bg) = (self.cursor.row, self.scroll_bottom, self.cursor.bg);
            for _ in 0..n.min(self.rows) {
                self.grid.scroll_up(row, bottom, bg);
            }
            self.cursor.col = 0;
        }
    }

    fn erase_chars(&mut self, n: u16) {
        let end = self.cursor.col.saturating_add(n).min(self.cols);
        let (crow, ccol, bg) = (self.cursor.row, self.cursor.col, self.cursor.bg);
        self.grid.erase_cells(crow, ccol, end, bg);
    }

    fn insert_chars(&mut self, n: u16) {
        let (crow, ccol, bg) = (self.cursor.row, self.cursor.col, self.cursor.bg);
        self.grid.insert_cells(crow, ccol, n, bg);
    }

    fn delete_chars(&mut self, n: u16) {
        let (crow, ccol, bg) = (self.cursor.row, self.cursor.col, self.cursor.bg);
        self.grid.delete_cells(crow, ccol, n, bg);
    }

    fn scroll_up_n(&mut self, n: u16) {
        let (top, bottom, bg) = (self.scroll_top, self.scroll_bottom, self.cursor.bg);
        for _ in 0..n.min(self.rows) {
            self.grid.scroll_up(top, bottom, bg);
        }
    }

    fn scroll_down_n(&mut self, n: u16) {
        let (top, bottom, bg) = (self.scroll_top, self.scroll_bottom, self.cursor.bg);
        for _ in 0..n.min(self.rows) {
            self.grid.scroll_down(top, bottom, bg);
        }
    }

    fn set_scroll_region(&mut self, params: &[u32]) {
        let top = param(params, 0, 1) - 1;
        let bottom = param(params, 1, self.rows) - 1;
        if top >= bottom || bottom > self.rows - 1 {
            return;
        }
        self.scroll_top = top;
        self.scroll_bottom = bottom;
        self.cursor.row = if self.modes.origin { self.scroll_top } else { 0 };
        self.cursor.col = 0;
    }

    fn save_cursor(&mut self) {
        let origin = self.modes.origin;
        self.cursor.save(origin);
    }

    fn restore_cursor(&mut self) {
        if let Some(origin) = self.cursor.restore() {
            self.modes.origin = origin;
            self.cursor.row = self.cursor.row.min(self.rows - 1);
            self.cursor.col = self.cursor.col.min(self.cols);
        }
    }

    /// Full reset (RIS): equivalent to a freshly constructed buffer of the
    /// same size. Queued device reports survive so they still reach the PTY.
    fn reset_state(&mut self) {
        let pending = std::mem::take(&mut self.pending_responses);
        *self = ScreenBuffer::new(self.cols, self.rows);
        self.pending_responses = pending;
    }

    fn clear_and_home(&mut self) {
        let bg = self.cursor.bg;
        for r in 0..self.rows {
            self.grid.row_mut(r).erase_with_bg(bg);
        }
        self.cursor.row = 0;
        self.cursor.col = 0;
    }

    // --- modes ---

    fn set_dec_modes(&mut self, params: &[u32], enable: bool) {
        for &p in params {
            match p {
                6 => {
                    self.modes.origin = enable;
                    // DECOM toggle homes the cursor.
                    self.cursor.row = if enable { self.scroll_top } else { 0 };
                    self.cursor.col = 0;
                }
                7 => self.modes.autowrap = enable,
                25 => self.modes.cursor_visible = enable,
                // No second buffer is kept for the alternate screen; enter
                // and leave both clear-and-home for user-visible parity.
                47 | 1047 => {
                    self.modes.alt_screen = enable;
                    self.clear_and_home();
                }
                1048 => {
                    if enable {
                        self.save_cursor();
                    } else {
                        self.restore_cursor();
                    }
                }
                1049 => {
                    if enable {
                        self.save_cursor();
                        self.modes.alt_screen = true;
                        self.clear_and_home();
                    } else {
                        self.modes.alt_screen = false;
                        self.clear_and_home();
                        self.restore_cursor();
                    }
                }
                // Recorded-only modes: the value is kept for attach replay
                // but has no effect on the grid.
                9 => self.modes.mouse_click = enable,
                1000 => self.modes.mouse_tracking = enable,
                1002 => self.modes.mouse_motion = enable,
                1003 => self.modes.mouse_all_motion = enable,
                1004 => self.modes.focus_events = enable,
                1005 => self.modes.utf8_mouse = enable,
                1006 => self.modes.sgr_mouse = enable,
                1015 => self.modes.urxvt_mouse = enable,
                1016 => self.modes.sgr_pixel_mouse = enable,
                2004 => self.modes.bracketed_paste = enable,
                _ => {}
            }
        }
    }

    fn set_ansi_modes(&mut self, params: &[u32], enable: bool) {
        for &p in params {
            match p {
                4 => self.modes.insert = enable,
                20 => self.modes.linefeed_newline = enable,
                _ => {}
            }
        }
    }

    // --- queries ---

    fn device_status(&mut self, kind: u16) {
        match kind {
            5 => self.pending_responses.push(b"\x1b[0n".to_vec()),
            6 => {
                // CPR is origin-relative when DECOM is set.
                let row = if self.modes.origin {
                    self.cursor.row.saturating_sub(self.scroll_top)
                } else {
                    self.cursor.row
                };
                let col = self.cursor.col.min(self.cols - 1);
                let response = format!("\x1b[{};{}R", row + 1, col + 1);
                self.pending_responses.push(response.into_bytes());
            }
            _ => {}
        }
    }

    // --- SGR ---

    fn handle_sgr(&mut self, params: &[u32]) {
        let params = if params.is_empty() { &[0u32][..] } else { params };
        let mut i = 0;

        while i < params.len() {
            match params[i] {
                0 => {
                    self.cursor.attrs = CellAttrs::empty();
                    self.cursor.fg = Color::Default;
                    self.cursor.bg = Color::Default;
                }
                1 => self.cursor.attrs.insert(CellAttrs::BOLD),
                2 => self.cursor.attrs.insert(CellAttrs::DIM),
                3 => self.cursor.attrs.insert(CellAttrs::ITALIC),
                4 => self.cursor.attrs.insert(CellAttrs::UNDERLINE),
                5 => self.cursor.attrs.insert(CellAttrs::BLINK),
                7 => self.cursor.attrs.insert(CellAttrs::REVERSE),
                8 => self.cursor.attrs.insert(CellAttrs::HIDDEN),
                9 => self.cursor.attrs.insert(CellAttrs::STRIKETHROUGH),
                21 => self.cursor.attrs.insert(CellAttrs::DOUBLE_UNDERLINE),
                22 => self.cursor.attrs.remove(CellAttrs::BOLD | CellAttrs::DIM),
                23 => self.cursor.attrs.remove(CellAttrs::ITALIC),
                24 => self.cursor.attrs.remove(CellAttrs::ANY_UNDERLINE),
                25 => self.cursor.attrs.remove(CellAttrs::BLINK),
                27 => self.cursor.attrs.remove(CellAttrs::REVERSE),
                28 => self.cursor.attrs.remove(CellAttrs::HIDDEN),
                29 => self.cursor.attrs.remove(CellAttrs::STRIKETHROUGH),
                30..=37 => self.cursor.fg = Color::Indexed((params[i] - 30) as u8),
                38 => {
                    if let Some(color) = extended_color(params, &mut i) {
                        self.cursor.fg = color;
                    }
                }
                39 => self.cursor.fg = Color::Default,
                40..=47 => self.cursor.bg = Color::Indexed((params[i] - 40) as u8),
                48 => {
                    if let Some(color) = extended_color(params, &mut i) {
                        self.cursor.bg = color;
                    }
                }
                49 => self.cursor.bg = Color::Default,
                90..=97 => self.cursor.fg = Color::Indexed((params[i] - 90 + 8) as u8),
                100..=107 => self.cursor.bg = Color::Indexed((params[i] - 100 + 8) as u8),
                _ => {}
            }
            i += 1;
        }
    }

    // --- printing ---

    fn put_char(&mut self, c: char, width: u16) {
        if self.cursor.col >= self.cols {
            if self.modes.autowrap {
                self.carriage_return();
                self.linefeed();
            } else {
                self.cursor.col = self.cols - 1;
            }
        }

        // A wide character that no longer fits on the row wraps first (or
        // is pulled back when autowrap is off).
        if width == 2 && self.cursor.col + 1 >= self.cols {
            if self.modes.autowrap && self.cols >= 2 {
                self.carriage_return();
                self.linefeed();
            } else {
                self.cursor.col = self.cursor.col.min(self.cols.saturating_sub(width));
            }
        }

        if self.modes.insert {
            let (row, col, bg) = (self.cursor.row, self.cursor.col, self.cursor.bg);
            self.grid.insert_cells(row, col, width, bg);
        }

        let (row, col) = (self.cursor.row, self.cursor.col);
        let cell = Cell {
            c,
            fg: self.cursor.fg,
            bg: self.cursor.bg,
            attrs: self.cursor.attrs,
            flags: if width == 2 {
                CellFlags::WIDE_CHAR
            } else {
                CellFlags::empty()
            },
        };
        self.grid.set_cell(row, col, cell);
        if width == 2 && col + 1 < self.cols {
            self.grid.set_cell(row, col + 1, Cell::wide_spacer());
        }

        // The cursor may rest past the last column only as the pending-wrap
        // state, which exists solely under autowrap.
        let next = col.saturating_add(width);
        self.cursor.col = if self.modes.autowrap {
            next.min(self.cols)
        } else {
            next.min(self.cols - 1)
        };
    }

    fn repeat_last(&mut self, n: u16) {
        let c = self.last_printed_char;
        let width = UnicodeWidthChar::width(c).unwrap_or(1).clamp(1, 2) as u16;
        for _ in 0..n.min(2048) {
            self.put_char(c, width);
        }
    }

    // --- replay ---

    /// Serialize the visible state to an ANSI byte stream that reproduces
    /// it on a fresh terminal (or [`ScreenBuffer`]) of the same size. This
    /// is the authoritative late-attach bootstrap: the output ring may have
    /// lost older bytes, the screen has not.
    pub fn replay_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        out.extend_from_slice(b"\x1b[0m\x1b[2J\x1b[H");
        if self.modes.alt_screen {
            // A client attaching mid-TUI lands on its alternate screen too.
            out.extend_from_slice(b"\x1b[?1047h");
        }

        let mut pen = Pen::default();
        for row in 0..self.rows {
            let cells = &self.grid.row(row).cells;
            let last = match cells.iter().rposition(|c| !c.is_default()) {
                Some(last) => last,
                None => continue,
            };
            out.extend_from_slice(format!("\x1b[{};1H", row + 1).as_bytes());
            for cell in &cells[..=last] {
                if cell.flags.contains(CellFlags::WIDE_SPACER) {
                    continue;
                }
                pen.apply(cell.fg, cell.bg, cell.attrs, &mut out);
                push_char(&mut out, cell.c);
            }
        }

        if (self.scroll_top, self.scroll_bottom) != (0, self.rows - 1) {
            let seq = format!("\x1b[{};{}r", self.scroll_top + 1, self.scroll_bottom + 1);
            out.extend_from_slice(seq.as_bytes());
        }
        for (mode, on) in self.modes.replay_private_modes() {
            let seq = format!("\x1b[?{}{}", mode, if on { 'h' } else { 'l' });
            out.extend_from_slice(seq.as_bytes());
        }
        if self.modes.insert {
            out.extend_from_slice(b"\x1b[4h");
        }
        if self.modes.linefeed_newline {
            out.extend_from_slice(b"\x1b[20h");
        }
        if self.modes.keypad_application {
            out.extend_from_slice(b"\x1b=");
        }
        if !self.title.is_empty() {
            out.extend_from_slice(b"\x1b]0;");
            out.extend_from_slice(self.title.as_bytes());
            out.push(0x07);
        }
        if self.modes.origin {
            out.extend_from_slice(b"\x1b[?6h");
        }

        // Final cursor position; CUP is origin-relative when DECOM is set.
        let cup_row = if self.modes.origin {
            self.cursor.row.saturating_sub(self.scroll_top) + 1
        } else {
            self.cursor.row + 1
        };
        if self.cursor.col >= self.cols {
            // Pending wrap cannot be addressed directly: park on the last
            // printable cell of the row and re-print it.
            let (col0, cell) = match self.grid.cell(self.cursor.row, self.cols - 1) {
                Some(c) if c.flags.contains(CellFlags::WIDE_SPACER) && self.cols >= 2 => {
                    (self.cols - 2, self.grid.cell(self.cursor.row, self.cols - 2))
                }
                other => (self.cols - 1, other),
            };
            let cell = cell.cloned().unwrap_or_default();
            let seq = format!("\x1b[{};{}H", cup_row, col0 + 1);
            out.extend_from_slice(seq.as_bytes());
            pen.apply(cell.fg, cell.bg, cell.attrs, &mut out);
            push_char(&mut out, cell.c);
        } else {
            let seq = format!("\x1b[{};{}H", cup_row, self.cursor.col + 1);
            out.extend_from_slice(seq.as_bytes());
        }

        // Current pen and charset last, so nothing above disturbs them.
        out.extend_from_slice(&sgr_sequence(
            self.cursor.fg,
            self.cursor.bg,
            self.cursor.attrs,
        ));
        if self.charset_g0_drawing {
            out.extend_from_slice(b"\x1b(0");
        }
        out
    }
}

impl Perform for ScreenBuffer {
    fn print(&mut self, c: char) {
        // Apply DEC Special Graphics charset mapping
        let c = if self.charset_g0_drawing {
            dec_line_drawing_char(c)
        } else {
            c
        };
        self.last_printed_char = c;
        // Combining marks print as independent single-width glyphs.
        let width = UnicodeWidthChar::width(c).unwrap_or(1).clamp(1, 2) as u16;
        self.put_char(c, width);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            // BEL is surfaced by the host, not the buffer.
            0x07 => {}
            0x08 => self.backspace(),
            0x09 => self.tab(),
            0x0A | 0x0B | 0x0C => {
                self.linefeed();
                if self.modes.linefeed_newline {
                    self.carriage_return();
                }
            }
            0x0D => self.carriage_return(),
            // C1: IND, NEL, HTS, RI
            0x84 => self.linefeed(),
            0x85 => {
                self.carriage_return();
                self.linefeed();
            }
            0x88 => self.set_tab_stop(),
            0x8D => self.reverse_index(),
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], byte: u8) {
        match (byte, intermediates) {
            (b'c', []) => self.reset_state(),
            (b'D', []) => self.linefeed(),
            (b'E', []) => {
                self.carriage_return();
                self.linefeed();
            }
            (b'H', []) => self.set_tab_stop(),
            (b'M', []) => self.reverse_index(),
            (b'7', []) => self.save_cursor(),
            (b'8', []) => self.restore_cursor(),
            (b'=', []) => self.modes.keypad_application = true,
            (b'>', []) => self.modes.keypad_application = false,
            // SCS G0: DEC Special Graphics (line drawing) / ASCII
            (b'0', [b'(']) => self.charset_g0_drawing = true,
            (b'B', [b'(']) => self.charset_g0_drawing = false,
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &[u32], private: u8, intermediates: &[u8], action: char) {
        if private == b'?' {
            match action {
                'h' => self.set_dec_modes(params, true),
                'l' => self.set_dec_modes(params, false),
                _ => {}
            }
            return;
        }
        if private != 0 || !intermediates.is_empty() {
            // Other marker/intermediate forms (DECSCUSR, DA2, DECRQM, ...)
            // are out of scope for the buffer.
            return;
        }

        match action {
            'A' => self.cursor_up(param(params, 0, 1)),
            'B' => self.cursor_down(param(params, 0, 1)),
            'C' => self.cursor_forward(param(params, 0, 1)),
            'D' => self.cursor_backward(param(params, 0, 1)),
            'E' => {
                self.cursor.col = 0;
                self.cursor_down(param(params, 0, 1));
            }
            'F' => {
                self.cursor.col = 0;
                self.cursor_up(param(params, 0, 1));
            }
            'G' => self.cursor.col = (param(params, 0, 1) - 1).min(self.cols - 1),
            'H' | 'f' => self.cursor_to(param(params, 0, 1), param(params, 1, 1)),
            'J' => self.erase_display(param(params, 0, 0)),
            'K' => self.erase_line(param(params, 0, 0)),
            'L' => self.insert_lines(param(params, 0, 1)),
            'M' => self.delete_lines(param(params, 0, 1)),
            'P' => self.delete_chars(param(params, 0, 1)),
            'S' => self.scroll_up_n(param(params, 0, 1)),
            'T' => self.scroll_down_n(param(params, 0, 1)),
            'X' => self.erase_chars(param(params, 0, 1)),
            '@' => self.insert_chars(param(params, 0, 1)),
            'b' => self.repeat_last(param(params, 0, 1)),
            'c' => {
                // Primary Device Attributes - respond as VT220
                if param(params, 0, 0) == 0 {
                    self.pending_responses.push(b"\x1b[?62;22c".to_vec());
                }
            }
            'd' => self.vertical_position(param(params, 0, 1)),
            'g' => self.clear_tab_stops(param(params, 0, 0)),
            'h' => self.set_ansi_modes(params, true),
            'l' => self.set_ansi_modes(params, false),
            'm' => self.handle_sgr(params),
            'n' => self.device_status(param(params, 0, 0)),
            'r' => self.set_scroll_region(params),
            's' => self.save_cursor(),
            'u' => self.restore_cursor(),
            _ => {}
        }
    }

    fn osc_dispatch(&mut self, command: u32, payload: &[u8]) {
        match command {
            0 | 2 => self.title = String::from_utf8_lossy(payload).to_string(),
            // Other OSC commands (icon name, color queries, clipboard, ...)
            // never alter screen state.
            _ => {}
        }
    }
}

/// Numeric CSI parameter with Zero Default Mode: missing or zero selects
/// `default`. Values are clamped into u16 range for grid arithmetic.
fn param(params: &[u32], idx: usize, default: u16) -> u16 {
    params
        .get(idx)
        .copied()
        .filter(|&v| v != 0)
        .map(|v| v.min(u16::MAX as u32) as u16)
        .unwrap_or(default)
}

/// Consume an extended-color introducer (SGR 38/48) from `params` at `*i`,
/// advancing past the arguments it uses.
fn extended_color(params: &[u32], i: &mut usize) -> Option<Color> {
    *i += 1;
    match params.get(*i)? {
        2 if *i + 3 < params.len() => {
            let (r, g, b) = (
                params[*i + 1].min(255) as u8,
                params[*i + 2].min(255) as u8,
                params[*i + 3].min(255) as u8,
            );
            *i += 3;
            Some(Color::Rgb(r, g, b))
        }
        5 if *i + 1 < params.len() => {
            let idx = params[*i + 1].min(255) as u8;
            *i += 1;
            Some(Color::Indexed(idx))
        }
        _ => None,
    }
}

/// Pen tracker for replay serialization: emits an SGR transition only when
/// the style actually changes.
#[derive(Default)]
struct Pen {
    fg: Color,
    bg: Color,
    attrs: CellAttrs,
}

impl Pen {
    fn apply(&mut self, fg: Color, bg: Color, attrs: CellAttrs, out: &mut Vec<u8>) {
        if (fg, bg, attrs) == (self.fg, self.bg, self.attrs) {
            return;
        }
        out.extend_from_slice(&sgr_sequence(fg, bg, attrs));
        self.fg = fg;
        self.bg = bg;
        self.attrs = attrs;
    }
}

/// Full SGR selecting exactly the given style, starting from a reset.
fn sgr_sequence(fg: Color, bg: Color, attrs: CellAttrs) -> Vec<u8> {
    let mut params: Vec<u16> = vec![0];
    for (flag, code) in [
        (CellAttrs::BOLD, 1),
        (CellAttrs::DIM, 2),
        (CellAttrs::ITALIC, 3),
        (CellAttrs::UNDERLINE, 4),
        (CellAttrs::BLINK, 5),
        (CellAttrs::REVERSE, 7),
        (CellAttrs::HIDDEN, 8),
        (CellAttrs::STRIKETHROUGH, 9),
        (CellAttrs::DOUBLE_UNDERLINE, 21),
        // Curly underline degrades to plain underline on replay.
        (CellAttrs::CURLY_UNDERLINE, 4),
    ] {
        if attrs.contains(flag) {
            params.push(code);
        }
    }
    fg.push_sgr_params(30, &mut params);
    bg.push_sgr_params(40, &mut params);
    let body = params
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(";");
    format!("\x1b[{}m", body).into_bytes()
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Map ASCII to DEC Special Graphics (line-drawing) character.
fn dec_line_drawing_char(c: char) -> char {
    match c {
        '`' => '◆',
        'a' => '▒',
        'j' => '┘',
        'k' => '┐',
        'l' => '┌',
        'm' => '└',
        'n' => '┼',
        'o' => '⎺',
        'p' => '⎻',
        'q' => '─',
        'r' => '⎼',
        's' => '⎽',
        't' => '├',
        'u' => '┤',
        'v' => '┴',
        'w' => '┬',
        'x' => '│',
        'y' => '≤',
        'z' => '≥',
        '{' => 'π',
        '|' => '≠',
        '}' => '£',
        '~' => '·',
        _ => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parser::Parser;

    fn feed_bytes(screen: &mut ScreenBuffer, bytes: &[u8]) {
        let mut parser = Parser::new();
        parser.parse(screen, bytes);
    }

    fn screen_with(cols: u16, rows: u16, bytes: &[u8]) -> ScreenBuffer {
        let mut screen = ScreenBuffer::new(cols, rows);
        feed_bytes(&mut screen, bytes);
        screen
    }

    fn assert_same_visible_state(a: &ScreenBuffer, b: &ScreenBuffer) {
        assert_eq!(a.grid(), b.grid(), "grids differ");
        assert_eq!(a.cursor_position(), b.cursor_position(), "cursor differs");
        assert_eq!(a.scroll_region(), b.scroll_region(), "region differs");
        assert_eq!(a.modes(), b.modes(), "modes differ");
        assert_eq!(a.title(), b.title(), "title differs");
        assert_eq!(a.cursor().fg, b.cursor().fg, "pen fg differs");
        assert_eq!(a.cursor().bg, b.cursor().bg, "pen bg differs");
        assert_eq!(a.cursor().attrs, b.cursor().attrs, "pen attrs differ");
    }

    #[test]
    fn simple_text_and_color() {
        let screen = screen_with(20, 5, b"\x1b[31mHello\x1b[0m \x1b[34mWorld\x1b[0m");
        assert_eq!(screen.row_text(0), "Hello World");
        assert_eq!(screen.cell(0, 0).unwrap().fg, Color::Indexed(1));
        assert_eq!(screen.cell(0, 6).unwrap().fg, Color::Indexed(4));
        assert_eq!(screen.cursor_position(), (11, 0));
    }

    #[test]
    fn cursor_save_restore_with_scroll_region() {
        // Nano regression: DECSTBM homes the cursor, DECRC must bring it back.
        let screen = screen_with(80, 25, b"\x1b[15;30H\x1b7\x1b[3;16r\x1b8");
        assert_eq!(screen.cursor_position(), (29, 14));
        assert_eq!(screen.scroll_region(), (2, 15));
    }

    #[test]
    fn wrap_at_bottom_right_scrolls() {
        let screen = screen_with(10, 3, b"Line0Line0Line1Line1Line2Line2X");
        assert_eq!(screen.row_text(0), "Line1Line1");
        assert_eq!(screen.row_text(1), "Line2Line2");
        assert_eq!(screen.row_text(2), "X");
    }

    #[test]
    fn chunked_csi_parse() {
        let mut screen = ScreenBuffer::new(20, 5);
        let mut parser = Parser::new();
        for chunk in [&b"\x1b"[..], b"[", b"1", b";", b"3", b"1", b"m", b"R"] {
            parser.parse(&mut screen, chunk);
        }
        let cell = screen.cell(0, 0).unwrap();
        assert_eq!(cell.c, 'R');
        assert!(cell.attrs.contains(CellAttrs::BOLD));
        assert_eq!(cell.fg, Color::Indexed(1));
    }

    #[test]
    fn pending_wrap_boundary() {
        let mut screen = ScreenBuffer::new(5, 3);
        feed_bytes(&mut screen, b"abcde");
        // Printing exactly W characters leaves the cursor past the last
        // column, awaiting the next printable.
        assert_eq!(screen.cursor_position(), (5, 0));
        feed_bytes(&mut screen, b"f");
        assert_eq!(screen.cursor_position(), (1, 1));
        assert_eq!(screen.row_text(0), "abcde");
        assert_eq!(screen.row_text(1), "f");
    }

    #[test]
    fn autowrap_off_pins_last_column() {
        let mut screen = ScreenBuffer::new(5, 3);
        feed_bytes(&mut screen, b"\x1b[?7labcdefgh");
        assert_eq!(screen.row_text(0), "abcdh");
        assert_eq!(screen.cursor_position(), (4, 0), "cursor never passes W-1");
        feed_bytes(&mut screen, b"z");
        assert_eq!(screen.row_text(0), "abcdz");
    }

    #[test]
    fn cup_clamps_to_screen() {
        let screen = screen_with(10, 4, b"\x1b[99;99H");
        assert_eq!(screen.cursor_position(), (9, 3));
    }

    #[test]
    fn erase_uses_current_bg_and_clears_attrs() {
        let mut screen = ScreenBuffer::new(10, 3);
        feed_bytes(&mut screen, b"\x1b[1;33;44mXY");
        feed_bytes(&mut screen, b"\x1b[1;1H\x1b[K");
        let cell = screen.cell(0, 0).unwrap();
        assert_eq!(cell.c, ' ');
        assert_eq!(cell.bg, Color::Indexed(4), "erase keeps current bg");
        assert_eq!(cell.fg, Color::Default);
        assert!(cell.attrs.is_empty(), "erase clears attributes");
    }

    #[test]
    fn ed_variants_respect_cursor() {
        let mut screen = ScreenBuffer::new(4, 3);
        feed_bytes(&mut screen, b"aaaa\x1b[2;1Hbbbb\x1b[3;1Hcccc");
        feed_bytes(&mut screen, b"\x1b[2;3H\x1b[0J");
        assert_eq!(screen.row_text(0), "aaaa");
        assert_eq!(screen.row_text(1), "bb");
        assert_eq!(screen.row_text(2), "");

        let mut screen = ScreenBuffer::new(4, 3);
        feed_bytes(&mut screen, b"aaaa\x1b[2;1Hbbbb\x1b[3;1Hcccc");
        feed_bytes(&mut screen, b"\x1b[2;2H\x1b[1J");
        assert_eq!(screen.row_text(0), "");
        assert_eq!(screen.row_text(1), "  bb");
        assert_eq!(screen.row_text(2), "cccc");
    }

    #[test]
    fn il_dl_outside_region_are_noops() {
        let mut screen = ScreenBuffer::new(8, 6);
        feed_bytes(&mut screen, b"top\x1b[2;4r");
        feed_bytes(&mut screen, b"\x1b[6;1H\x1b[2L\x1b[2M");
        assert_eq!(screen.row_text(0), "top");
        let region = screen.scroll_region();
        assert_eq!(region, (1, 3));
    }

    #[test]
    fn ech_does_not_move_cursor() {
        let mut screen = ScreenBuffer::new(10, 2);
        feed_bytes(&mut screen, b"abcdef\x1b[1;2H\x1b[3X");
        assert_eq!(screen.row_text(0), "a   ef");
        assert_eq!(screen.cursor_position(), (1, 0));
    }

    #[test]
    fn dch_shifts_left_ich_inserts() {
        let mut screen = ScreenBuffer::new(8, 2);
        feed_bytes(&mut screen, b"abcdef\x1b[1;2H\x1b[2P");
        assert_eq!(screen.row_text(0), "adef");
        feed_bytes(&mut screen, b"\x1b[2@");
        assert_eq!(screen.row_text(0), "a  def");
    }

    #[test]
    fn origin_mode_offsets_and_bounds_cursor() {
        let mut screen = ScreenBuffer::new(80, 24);
        feed_bytes(&mut screen, b"\x1b[6;21r\x1b[?6h");
        assert_eq!(screen.cursor_position(), (0, 5));

        feed_bytes(&mut screen, b"\x1b[1;1H");
        assert_eq!(screen.cursor_position().1, 5, "origin CUP is region-relative");
        feed_bytes(&mut screen, b"\x1b[99;1H");
        assert_eq!(screen.cursor_position().1, 20, "origin CUP clamps to bottom");

        feed_bytes(&mut screen, b"\x1b[?6l");
        assert_eq!(screen.cursor_position(), (0, 0));
        feed_bytes(&mut screen, b"\x1b[3;1H");
        assert_eq!(screen.cursor_position().1, 2);
    }

    #[test]
    fn cuu_cud_respect_scroll_region() {
        let mut screen = ScreenBuffer::new(80, 24);
        feed_bytes(&mut screen, b"\x1b[6;16r\x1b[11;1H\x1b[20A");
        assert_eq!(screen.cursor_position().1, 5);
        feed_bytes(&mut screen, b"\x1b[11;1H\x1b[20B");
        assert_eq!(screen.cursor_position().1, 15);
        // Outside the region the full screen bounds apply.
        feed_bytes(&mut screen, b"\x1b[21;1H\x1b[20B");
        assert_eq!(screen.cursor_position().1, 23);
    }

    #[test]
    fn scroll_region_linefeed() {
        let mut screen = ScreenBuffer::new(20, 10);
        for i in 0..10u8 {
            let line = format!("\x1b[{};1H{}", i + 1, (b'A' + i) as char);
            feed_bytes(&mut screen, line.as_bytes());
        }
        feed_bytes(&mut screen, b"\x1b[3;6r\x1b[6;1H\n");
        assert_eq!(screen.row_text(0), "A", "above region untouched");
        assert_eq!(screen.row_text(2), "D", "region scrolled up");
        assert_eq!(screen.row_text(5), "", "blank row exposed at bottom");
        assert_eq!(screen.row_text(6), "G", "below region untouched");
    }

    #[test]
    fn invalid_scroll_region_is_ignored() {
        let mut screen = ScreenBuffer::new(20, 10);
        feed_bytes(&mut screen, b"\x1b[7;3r");
        assert_eq!(screen.scroll_region(), (0, 9));
        feed_bytes(&mut screen, b"\x1b[5;99r");
        assert_eq!(screen.scroll_region(), (0, 9));
    }

    #[test]
    fn reverse_index_scrolls_down_at_top() {
        let mut screen = ScreenBuffer::new(10, 3);
        feed_bytes(&mut screen, b"one\r\ntwo\x1b[1;1H\x1bM");
        assert_eq!(screen.row_text(0), "");
        assert_eq!(screen.row_text(1), "one");
        assert_eq!(screen.row_text(2), "two");
    }

    #[test]
    fn sgr_extended_colors() {
        let mut screen = ScreenBuffer::new(10, 2);
        feed_bytes(&mut screen, b"\x1b[38;5;196m");
        assert_eq!(screen.cursor().fg, Color::Indexed(196));
        feed_bytes(&mut screen, b"\x1b[48;2;12;34;56m");
        assert_eq!(screen.cursor().bg, Color::Rgb(12, 34, 56));
        // Colon-separated subparameters arrive collapsed and still parse.
        feed_bytes(&mut screen, b"\x1b[38:5:21m");
        assert_eq!(screen.cursor().fg, Color::Indexed(21));
    }

    #[test]
    fn sgr_bold_dim_are_independent_and_22_clears_both() {
        let mut screen = ScreenBuffer::new(10, 2);
        feed_bytes(&mut screen, b"\x1b[1;2m");
        assert!(screen.cursor().attrs.contains(CellAttrs::BOLD | CellAttrs::DIM));
        feed_bytes(&mut screen, b"\x1b[22m");
        assert!(!screen.cursor().attrs.intersects(CellAttrs::BOLD | CellAttrs::DIM));
    }

    #[test]
    fn sgr_reset_after_print_yields_default_cell() {
        let mut screen = ScreenBuffer::new(10, 2);
        feed_bytes(&mut screen, b"\x1b[1;31;44m\x1b[0mx");
        let cell = screen.cell(0, 0).unwrap();
        assert_eq!(cell.fg, Color::Default);
        assert_eq!(cell.bg, Color::Default);
        assert!(cell.attrs.is_empty());
    }

    #[test]
    fn mode_set_reset_is_idempotent() {
        for mode in [6u16, 7, 25] {
            let mut screen = ScreenBuffer::new(10, 4);
            let set = format!("\x1b[?{}h", mode);
            let reset = format!("\x1b[?{}l", mode);
            feed_bytes(&mut screen, set.as_bytes());
            feed_bytes(&mut screen, set.as_bytes());
            let check = |s: &ScreenBuffer| match mode {
                6 => s.modes().origin,
                7 => s.modes().autowrap,
                _ => s.modes().cursor_visible,
            };
            assert!(check(&screen), "mode {} should be set", mode);
            feed_bytes(&mut screen, reset.as_bytes());
            feed_bytes(&mut screen, reset.as_bytes());
            assert!(!check(&screen), "mode {} should be cleared", mode);
        }
    }

    #[test]
    fn alt_screen_toggles_clear_without_second_buffer() {
        let mut screen = ScreenBuffer::new(10, 3);
        feed_bytes(&mut screen, b"main");
        feed_bytes(&mut screen, b"\x1b[?1049h");
        assert!(screen.modes().alt_screen);
        assert_eq!(screen.row_text(0), "", "enter clears and homes");
        feed_bytes(&mut screen, b"alt");
        feed_bytes(&mut screen, b"\x1b[?1049l");
        assert!(!screen.modes().alt_screen);
        assert_eq!(screen.row_text(0), "", "leave clears again");
        assert_eq!(
            screen.cursor_position(),
            (4, 0),
            "cursor restored to where 1049h saved it"
        );
    }

    #[test]
    fn mouse_and_paste_modes_are_recorded_only() {
        let mut screen = ScreenBuffer::new(10, 3);
        feed_bytes(&mut screen, b"ok\x1b[?1000h\x1b[?1006h\x1b[?2004h");
        assert!(screen.modes().mouse_tracking);
        assert!(screen.modes().sgr_mouse);
        assert!(screen.modes().bracketed_paste);
        assert_eq!(screen.row_text(0), "ok", "grid is untouched");
    }

    #[test]
    fn osc_sets_title() {
        let screen = screen_with(10, 2, b"\x1b]2;my title\x07");
        assert_eq!(screen.title(), "my title");
        let screen = screen_with(10, 2, b"\x1b]52;c;aGk=\x07after");
        assert_eq!(screen.title(), "", "other OSC commands ignored");
        assert_eq!(screen.row_text(0), "after");
    }

    #[test]
    fn tab_stops_default_hts_and_tbc() {
        let mut screen = ScreenBuffer::new(40, 2);
        feed_bytes(&mut screen, b"\tx");
        assert_eq!(screen.cursor_position().0, 9, "default stop at 8");
        feed_bytes(&mut screen, b"\x1b[1;13H\x1bH\x1b[1;1H\t");
        assert_eq!(screen.cursor_position().0, 8);
        feed_bytes(&mut screen, b"\t");
        assert_eq!(screen.cursor_position().0, 12, "HTS stop honored");
        feed_bytes(&mut screen, b"\x1b[3g\x1b[1;1H\t");
        assert_eq!(screen.cursor_position().0, 39, "TBC 3 clears all stops");
    }

    #[test]
    fn rep_repeats_last_printed_char() {
        let mut screen = ScreenBuffer::new(10, 2);
        feed_bytes(&mut screen, b"A\x1b[3b");
        assert_eq!(screen.row_text(0), "AAAA");
    }

    #[test]
    fn insert_mode_shifts_row() {
        let mut screen = ScreenBuffer::new(8, 2);
        feed_bytes(&mut screen, b"abc\x1b[4h\x1b[1;1HX");
        assert_eq!(screen.row_text(0), "Xabc");
        feed_bytes(&mut screen, b"\x1b[4l\x1b[1;1HY");
        assert_eq!(screen.row_text(0), "Yabc");
    }

    #[test]
    fn dec_line_drawing_charset() {
        let mut screen = ScreenBuffer::new(10, 2);
        feed_bytes(&mut screen, b"\x1b(0qx\x1b(Bq");
        assert_eq!(screen.row_text(0), "─│q");
    }

    #[test]
    fn wide_chars_occupy_two_cells() {
        let mut screen = ScreenBuffer::new(6, 2);
        feed_bytes(&mut screen, "漢x".as_bytes());
        assert_eq!(screen.cell(0, 0).unwrap().c, '漢');
        assert!(screen.cell(0, 1).unwrap().flags.contains(CellFlags::WIDE_SPACER));
        assert_eq!(screen.cell(0, 2).unwrap().c, 'x');
        assert_eq!(screen.cursor_position(), (3, 0));
    }

    #[test]
    fn wide_char_at_row_edge_wraps() {
        let mut screen = ScreenBuffer::new(5, 3);
        feed_bytes(&mut screen, "abcd漢".as_bytes());
        assert_eq!(screen.row_text(0), "abcd");
        assert_eq!(screen.cell(1, 0).unwrap().c, '漢');
    }

    #[test]
    fn device_status_reports() {
        let mut screen = ScreenBuffer::new(20, 5);
        feed_bytes(&mut screen, b"\x1b[3;4H\x1b[6n\x1b[5n\x1b[c");
        let responses = screen.take_pending_responses();
        assert_eq!(responses[0], b"\x1b[3;4R".to_vec());
        assert_eq!(responses[1], b"\x1b[0n".to_vec());
        assert_eq!(responses[2], b"\x1b[?62;22c".to_vec());
        assert!(screen.take_pending_responses().is_empty());
    }

    #[test]
    fn ris_matches_fresh_buffer() {
        let mut screen = ScreenBuffer::new(12, 6);
        feed_bytes(
            &mut screen,
            b"\x1b[31;44;1mstuff\x1b[2;4r\x1b[?6h\x1b[?25l\x1b]0;t\x07\x1bc",
        );
        let fresh = ScreenBuffer::new(12, 6);
        assert_same_visible_state(&screen, &fresh);
    }

    #[test]
    fn cursor_coordinates_stay_in_bounds() {
        // Invariant check over an adversarial byte soup.
        let mut screen = ScreenBuffer::new(7, 4);
        let soup: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        feed_bytes(&mut screen, &soup);
        let (col, row) = screen.cursor_position();
        assert!(col <= 7);
        assert!(row < 4);
        let (top, bottom) = screen.scroll_region();
        assert!(top <= bottom && bottom < 4);
    }

    #[test]
    fn replay_reproduces_printable_feed() {
        let mut a = ScreenBuffer::new(10, 4);
        feed_bytes(&mut a, b"hello world this wraps around the region");
        let mut b = ScreenBuffer::new(10, 4);
        feed_bytes(&mut b, &a.replay_bytes());
        assert_same_visible_state(&a, &b);
    }

    #[test]
    fn replay_reproduces_styles_modes_and_pending_wrap() {
        let mut a = ScreenBuffer::new(8, 4);
        feed_bytes(
            &mut a,
            b"\x1b[1;31mred\x1b[0;44m bg\x1b[0m\x1b[2;4r\x1b[?25l\x1b]0;hi\x07\x1b[2;1H12345678",
        );
        // Cursor parked in pending wrap with styled content on screen.
        assert_eq!(a.cursor_position().0, 8);
        let mut b = ScreenBuffer::new(8, 4);
        feed_bytes(&mut b, &a.replay_bytes());
        assert_same_visible_state(&a, &b);
    }

    #[test]
    fn replay_reproduces_origin_mode_cursor() {
        let mut a = ScreenBuffer::new(10, 6);
        feed_bytes(&mut a, b"\x1b[2;5r\x1b[?6hpayload");
        let mut b = ScreenBuffer::new(10, 6);
        feed_bytes(&mut b, &a.replay_bytes());
        assert_same_visible_state(&a, &b);
    }

    #[test]
    fn malformed_sequences_are_ignored() {
        let mut screen = ScreenBuffer::new(10, 3);
        feed_bytes(&mut screen, b"\x1b[999;999;999;1;2;3;4;5;6;7;8;9zok");
        assert_eq!(screen.row_text(0), "ok");
        feed_bytes(&mut screen, b"\x1b[?9999h\x1b[9999X");
        assert_eq!(screen.row_text(0), "ok");
    }
}
