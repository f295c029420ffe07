//! Machine configuration.

/// Video timing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimingMode {
    /// PAL (6569) - 50Hz, 312 lines, 63 cycles/line.
    #[default]
    Pal,
    /// NTSC (6567) - 60Hz, 263 lines, 65 cycles/line.
    Ntsc,
}

impl TimingMode {
    /// CPU clock frequency in Hz.
    #[must_use]
    pub const fn cpu_clock(self) -> u32 {
        match self {
            TimingMode::Pal => 985_248,
            TimingMode::Ntsc => 1_022_727,
        }
    }

    /// Total raster lines per frame.
    #[must_use]
    pub const fn total_rasters(self) -> u16 {
        match self {
            TimingMode::Pal => 312,
            TimingMode::Ntsc => 263,
        }
    }

    /// CPU cycles per ordinary raster line.
    #[must_use]
    pub const fn normal_cycles(self) -> i32 {
        match self {
            TimingMode::Pal => 63,
            TimingMode::Ntsc => 65,
        }
    }

    /// CPU cycles left over on a bad line (video matrix DMA steals the rest).
    #[must_use]
    pub const fn bad_line_cycles(self) -> i32 {
        match self {
            TimingMode::Pal => 23,
            TimingMode::Ntsc => 25,
        }
    }

    /// Frames per second.
    #[must_use]
    pub const fn fps(self) -> f32 {
        match self {
            TimingMode::Pal => 50.125,
            TimingMode::Ntsc => 59.826,
        }
    }
}

/// Machine hardware configuration.
#[derive(Clone, Copy, Debug)]
pub struct MachineConfig {
    /// Video timing (PAL/NTSC).
    pub timing: TimingMode,
    /// 1541 CPU cycles per raster line. The drive runs a fixed share per
    /// line regardless of bad-line stealing on the main CPU; the 1541
    /// clock is slightly faster than the C64's, hence the extra cycle.
    pub drive_cycles_per_line: i32,
    /// Whether sprite collision detection raises latches and interrupts.
    pub sprite_collisions: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            timing: TimingMode::Pal,
            drive_cycles_per_line: 64,
            sprite_collisions: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pal_timing() {
        let t = TimingMode::Pal;
        assert_eq!(t.total_rasters(), 312);
        assert_eq!(t.normal_cycles(), 63);
        assert_eq!(t.bad_line_cycles(), 23);
    }

    #[test]
    fn defaults_are_pal_with_collisions() {
        let c = MachineConfig::default();
        assert_eq!(c.timing, TimingMode::Pal);
        assert!(c.sprite_collisions);
        assert_eq!(c.drive_cycles_per_line, 64);
    }
}
