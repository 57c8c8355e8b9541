/// Terminal color representation supporting 16-color, 256-color, and truecolor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Default for Color {
    fn default() -> Self {
        Color::Default
    }
}

impl Color {
    /// Append the SGR parameters selecting this color to `params`.
    /// `base` is 30 for foreground, 40 for background.
    pub fn push_sgr_params(&self, base: u16, params: &mut Vec<u16>) {
        match *self {
            Color::Default => params.push(base + 9),
            Color::Indexed(i) if i < 8 => params.push(base + i as u16),
            Color::Indexed(i) if i < 16 => params.push(base + 60 + (i as u16 - 8)),
            Color::Indexed(i) => params.extend([base + 8, 5, i as u16]),
            Color::Rgb(r, g, b) => params.extend([base + 8, 2, r as u16, g as u16, b as u16]),
        }
    }
}
