/// Terminal mode flags tracking various DEC and ANSI modes.
///
/// The mouse-tracking, focus, and bracketed-paste bits are recorded only:
/// parsing them must never disturb the grid, but the current value is kept
/// so an attach replay can re-announce them to the client terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalModes {
    /// DECOM: origin mode
    pub origin: bool,
    /// DECAWM: auto-wrap mode
    pub autowrap: bool,
    /// DECTCEM: text cursor visible
    pub cursor_visible: bool,
    /// IRM: insert (vs replace) mode
    pub insert: bool,
    /// LNM: line feed implies carriage return
    pub linefeed_newline: bool,
    /// DECKPAM/DECKPNM: application keypad
    pub keypad_application: bool,
    /// Alternate screen requested (modes 47/1047/1049). No second buffer is
    /// kept; enter and leave clear-and-home for user-visible parity.
    pub alt_screen: bool,
    /// X10 mouse reporting (mode 9)
    pub mouse_click: bool,
    /// Mouse button tracking (mode 1000)
    pub mouse_tracking: bool,
    /// Mouse motion tracking (mode 1002)
    pub mouse_motion: bool,
    /// Mouse all-motion tracking (mode 1003)
    pub mouse_all_motion: bool,
    /// Focus in/out events (mode 1004)
    pub focus_events: bool,
    /// UTF-8 mouse coordinates (mode 1005)
    pub utf8_mouse: bool,
    /// SGR mouse reporting (mode 1006)
    pub sgr_mouse: bool,
    /// urxvt mouse reporting (mode 1015)
    pub urxvt_mouse: bool,
    /// SGR pixel-position mouse reporting (mode 1016)
    pub sgr_pixel_mouse: bool,
    /// Bracketed paste (mode 2004)
    pub bracketed_paste: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            origin: false,
            autowrap: true,
            cursor_visible: true,
            insert: false,
            linefeed_newline: false,
            keypad_application: false,
            alt_screen: false,
            mouse_click: false,
            mouse_tracking: false,
            mouse_motion: false,
            mouse_all_motion: false,
            focus_events: false,
            utf8_mouse: false,
            sgr_mouse: false,
            urxvt_mouse: false,
            sgr_pixel_mouse: false,
            bracketed_paste: false,
        }
    }
}

impl TerminalModes {
    /// DEC private modes currently set that a replay should re-announce,
    /// as (mode number, value) pairs. Defaults that are still at their
    /// default value are omitted.
    pub fn replay_private_modes(&self) -> Vec<(u16, bool)> {
        let mut out = Vec::new();
        if !self.autowrap {
            out.push((7, false));
        }
        if !self.cursor_visible {
            out.push((25, false));
        }
        for (mode, on) in [
            (9, self.mouse_click),
            (1000, self.mouse_tracking),
            (1002, self.mouse_motion),
            (1003, self.mouse_all_motion),
            (1004, self.focus_events),
            (1005, self.utf8_mouse),
            (1006, self.sgr_mouse),
            (1015, self.urxvt_mouse),
            (1016, self.sgr_pixel_mouse),
            (2004, self.bracketed_paste),
        ] {
            if on {
                out.push((mode, true));
            }
        }
        out
    }
}
