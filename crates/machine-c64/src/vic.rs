//! MOS 6569 (VIC-II) video chip, line based.
//!
//! `emulate_line` is called once per raster line. It renders one pixel
//! row of graphics into the chunky frame buffer according to the current
//! register settings and returns the number of cycles left for the CPU
//! in that line. Register writes made by the CPU during a line therefore
//! affect the next line, never the current one.
//!
//! Sprite priority and collision handling is mask based: the renderers
//! emit a one-bit-per-pixel foreground mask aligned to the character
//! grid, and the sprite pass checks its data against a window of that
//! mask. Multicolor sprite data is converted from chunky pairs to two
//! bitplanes first. Sprite-sprite ordering uses the per-pixel occupancy
//! bytes in `spr_coll_buf`.
//!
//! Known deviations, by design of the line model: mid-line register
//! writes are not visible in the current line; collisions are only
//! detected inside the display window; sprites that do not completely
//! fit the chunky bitmap on the right are dropped; and the character
//! generator shadow is not visible to bitmap fetches.

use raster64_core::FrameBuffer;

/// Width of the chunky bitmap in pixels.
pub const DISPLAY_X: usize = 0x180;
/// Height of the chunky bitmap in lines.
pub const DISPLAY_Y: usize = 0x110;

/// First and last raster line of the displayed window.
const FIRST_DISP_LINE: u16 = 0x10;
const LAST_DISP_LINE: u16 = 0x11f;

/// First and last raster line on which bad lines can occur.
const FIRST_DMA_LINE: u16 = 0x30;
const LAST_DMA_LINE: u16 = 0xf7;

// Vertical display window limits for 25-row and 24-row mode.
const ROW25_YSTART: u16 = 0x33;
const ROW25_YSTOP: u16 = 0xfb;
const ROW24_YSTART: u16 = 0x37;
const ROW24_YSTOP: u16 = 0xf7;

// Horizontal display window limits for 40-column and 38-column mode.
const COL40_XSTART: usize = 0x20;
const COL40_XSTOP: usize = 0x160;
const COL38_XSTART: usize = 0x27;
const COL38_XSTOP: usize = 0x157;

/// Offset of the first character's mask byte in `fore_mask_buf`.
const FORE_MASK_OFF: usize = COL40_XSTART / 8;

/// Foreground mask size, with slack for the sprite window reads past the
/// right edge.
const FORE_MASK_LEN: usize = DISPLAY_X / 8 + 8;

/// Double every bit of a byte (sprite X expansion).
const fn expand_bits(byte: u8) -> u16 {
    let mut out = 0u16;
    let mut i = 0;
    while i < 8 {
        if byte & (1 << i) != 0 {
            out |= 0b11 << (i * 2);
        }
        i += 1;
    }
    out
}

/// Double every 2-bit pair of a byte (multicolor sprite X expansion).
const fn expand_pairs(byte: u8) -> u16 {
    let mut out = 0u16;
    let mut i = 0;
    while i < 4 {
        let pair = ((byte >> (i * 2)) & 3) as u16;
        out |= pair << (i * 4);
        out |= pair << (i * 4 + 2);
        i += 1;
    }
    out
}

const fn build_exp_table() -> [u16; 256] {
    let mut t = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        t[i] = expand_bits(i as u8);
        i += 1;
    }
    t
}

const fn build_multi_exp_table() -> [u16; 256] {
    let mut t = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        t[i] = expand_pairs(i as u8);
        i += 1;
    }
    t
}

/// Bit-doubling table for X-expanded hires sprites.
static EXP_TABLE: [u16; 256] = build_exp_table();
/// Pair-doubling table for X-expanded multicolor sprites.
static MULTI_EXP_TABLE: [u16; 256] = build_multi_exp_table();

/// The VIC's view of memory: 16 KiB window into RAM selected by the CIA2
/// bank bits, with the character ROM shadowed at $1000/$9000.
pub struct VicMem<'a> {
    pub ram: &'a [u8; 0x10000],
    pub char_rom: &'a [u8; 0x1000],
}

impl VicMem<'_> {
    fn get(&self, va: u16) -> u8 {
        if va & 0x7000 == 0x1000 {
            self.char_rom[(va & 0x0fff) as usize]
        } else {
            self.ram[va as usize]
        }
    }
}

/// Outcome of one emulated raster line.
#[derive(Clone, Copy, Debug)]
pub struct LineResult {
    /// The raster wrapped to line 0: present the finished frame.
    pub vblank: bool,
    /// Cycles left for the main CPU in this line.
    pub cycles: i32,
    /// The line was a bad line (video matrix DMA ran).
    pub is_bad_line: bool,
}

/// Captured VIC register and pipeline state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VicState {
    pub mx: [u16; 8],
    pub my: [u8; 8],
    pub mx8: u8,
    pub ctrl1: u8,
    pub ctrl2: u8,
    pub lpx: u8,
    pub lpy: u8,
    pub me: u8,
    pub mxe: u8,
    pub mye: u8,
    pub mdp: u8,
    pub mmc: u8,
    pub vbase: u8,
    pub irq_flag: u8,
    pub irq_mask: u8,
    pub clx_spr: u8,
    pub clx_bgr: u8,
    pub ec: u8,
    pub b0c: u8,
    pub b1c: u8,
    pub b2c: u8,
    pub b3c: u8,
    pub mm0: u8,
    pub mm1: u8,
    pub sc: [u8; 8],
    pub irq_raster: u16,
    pub raster_y: u16,
    pub vc: u16,
    pub vc_base: u16,
    pub rc: u8,
    pub sprite_on: u8,
    pub mc: [u8; 8],
    pub display_state: bool,
    pub bad_lines_enabled: bool,
    pub lp_triggered: bool,
    pub border_on: bool,
    pub cia_vabase: u16,
    pub irq_line: bool,
}

/// MOS 6569 state machine and renderer.
pub struct Vic {
    // Raster geometry from the timing mode.
    total_rasters: u16,
    normal_cycles: i32,
    bad_line_cycles: i32,
    sprite_collisions: bool,

    // Sprite registers.
    mx: [u16; 8],
    my: [u8; 8],
    mx8: u8,
    me: u8,
    mxe: u8,
    mye: u8,
    mdp: u8,
    mmc: u8,
    sc: [u8; 8],

    // Control and colour registers.
    ctrl1: u8,
    ctrl2: u8,
    lpx: u8,
    lpy: u8,
    vbase: u8,
    irq_flag: u8,
    irq_mask: u8,
    clx_spr: u8,
    clx_bgr: u8,
    ec: u8,
    b0c: u8,
    b1c: u8,
    b2c: u8,
    b3c: u8,
    mm0: u8,
    mm1: u8,

    // Derived register views, updated on writes.
    x_scroll: u8,
    y_scroll: u8,
    border_40_col: bool,
    display_idx: u8,
    dy_start: u16,
    dy_stop: u16,
    matrix_base: u16,
    char_base: u16,
    bitmap_base: u16,
    cia_vabase: u16,

    // Raster pipeline.
    raster_y: u16,
    irq_raster: u16,
    vc: u16,
    vc_base: u16,
    rc: u8,
    display_state: bool,
    bad_lines_enabled: bool,
    border_on: bool,
    lp_triggered: bool,

    // Sprite pipeline.
    sprite_on: u8,
    mc: [u8; 8],

    // Per-line latches and work buffers.
    matrix_line: [u8; 40],
    color_line: [u8; 40],
    fore_mask_buf: [u8; FORE_MASK_LEN],
    spr_coll_buf: [u8; DISPLAY_X],

    /// Level of the IRQ output to the CPU.
    irq_line: bool,
}

impl Vic {
    #[must_use]
    pub fn new(total_rasters: u16, normal_cycles: i32, bad_line_cycles: i32) -> Self {
        Self {
            total_rasters,
            normal_cycles,
            bad_line_cycles,
            sprite_collisions: true,
            mx: [0; 8],
            my: [0; 8],
            mx8: 0,
            me: 0,
            mxe: 0,
            mye: 0,
            mdp: 0,
            mmc: 0,
            sc: [0; 8],
            ctrl1: 0,
            ctrl2: 0,
            lpx: 0,
            lpy: 0,
            vbase: 0,
            irq_flag: 0,
            irq_mask: 0,
            clx_spr: 0,
            clx_bgr: 0,
            ec: 0,
            b0c: 0,
            b1c: 0,
            b2c: 0,
            b3c: 0,
            mm0: 0,
            mm1: 0,
            x_scroll: 0,
            y_scroll: 0,
            border_40_col: false,
            display_idx: 0,
            dy_start: ROW24_YSTART,
            dy_stop: ROW24_YSTOP,
            matrix_base: 0,
            char_base: 0,
            bitmap_base: 0,
            cia_vabase: 0,
            raster_y: total_rasters - 1,
            irq_raster: 0,
            vc: 0,
            vc_base: 0,
            rc: 7,
            display_state: false,
            bad_lines_enabled: false,
            border_on: false,
            lp_triggered: false,
            sprite_on: 0,
            mc: [63; 8],
            matrix_line: [0; 40],
            color_line: [0; 40],
            fore_mask_buf: [0; FORE_MASK_LEN],
            spr_coll_buf: [0; DISPLAY_X],
            irq_line: false,
        }
    }

    /// Enable or disable sprite collision latching.
    pub fn set_sprite_collisions(&mut self, enabled: bool) {
        self.sprite_collisions = enabled;
    }

    /// Current raster line.
    #[must_use]
    pub fn raster_y(&self) -> u16 {
        self.raster_y
    }

    /// Level of the IRQ output to the CPU.
    #[must_use]
    pub fn irq_line(&self) -> bool {
        self.irq_line
    }

    /// The CIA's VA14/15 outputs changed: move the 16 KiB bank.
    pub fn changed_va(&mut self, va: u16) {
        self.cia_vabase = (va & 3) << 14;
        let vbase = self.vbase;
        self.write_register(0x18, vbase); // refresh the memory pointers
    }

    /// Trigger the light pen and latch its coordinates. Fires only once
    /// per frame.
    pub fn trigger_lightpen(&mut self) {
        if !self.lp_triggered {
            self.lp_triggered = true;
            self.lpx = 0;
            self.lpy = self.raster_y as u8;
            self.irq_flag |= 0x08;
            if self.irq_mask & 0x08 != 0 {
                self.irq_flag |= 0x80;
                self.irq_line = true;
            }
        }
    }

    fn raster_irq(&mut self) {
        self.irq_flag |= 0x01;
        if self.irq_mask & 0x01 != 0 {
            self.irq_flag |= 0x80;
            self.irq_line = true;
        }
    }

    /// Read a VIC register, with read side effects.
    pub fn read_register(&mut self, reg: u8) -> u8 {
        match reg & 0x3f {
            0x1e => {
                let ret = self.clx_spr;
                self.clx_spr = 0;
                ret
            }
            0x1f => {
                let ret = self.clx_bgr;
                self.clx_bgr = 0;
                ret
            }
            r => self.peek_register(r),
        }
    }

    /// Read a VIC register without side effects.
    #[must_use]
    pub fn peek_register(&self, reg: u8) -> u8 {
        match reg & 0x3f {
            r @ (0x00 | 0x02 | 0x04 | 0x06 | 0x08 | 0x0a | 0x0c | 0x0e) => {
                self.mx[(r >> 1) as usize] as u8
            }
            r @ (0x01 | 0x03 | 0x05 | 0x07 | 0x09 | 0x0b | 0x0d | 0x0f) => {
                self.my[(r >> 1) as usize]
            }
            0x10 => self.mx8,
            0x11 => (self.ctrl1 & 0x7f) | ((self.raster_y & 0x100) >> 1) as u8,
            0x12 => self.raster_y as u8,
            0x13 => self.lpx,
            0x14 => self.lpy,
            0x15 => self.me,
            0x16 => self.ctrl2 | 0xc0,
            0x17 => self.mye,
            0x18 => self.vbase | 0x01,
            0x19 => self.irq_flag | 0x70,
            0x1a => self.irq_mask | 0xf0,
            0x1b => self.mdp,
            0x1c => self.mmc,
            0x1d => self.mxe,
            0x1e => self.clx_spr,
            0x1f => self.clx_bgr,
            0x20 => self.ec | 0xf0,
            0x21 => self.b0c | 0xf0,
            0x22 => self.b1c | 0xf0,
            0x23 => self.b2c | 0xf0,
            0x24 => self.b3c | 0xf0,
            0x25 => self.mm0 | 0xf0,
            0x26 => self.mm1 | 0xf0,
            r @ 0x27..=0x2e => self.sc[(r - 0x27) as usize] | 0xf0,
            _ => 0xff,
        }
    }

    /// Write a VIC register.
    pub fn write_register(&mut self, reg: u8, byte: u8) {
        match reg & 0x3f {
            r @ (0x00 | 0x02 | 0x04 | 0x06 | 0x08 | 0x0a | 0x0c | 0x0e) => {
                let n = (r >> 1) as usize;
                self.mx[n] = (self.mx[n] & 0xff00) | u16::from(byte);
            }
            r @ (0x01 | 0x03 | 0x05 | 0x07 | 0x09 | 0x0b | 0x0d | 0x0f) => {
                self.my[(r >> 1) as usize] = byte;
            }
            0x10 => {
                self.mx8 = byte;
                for n in 0..8 {
                    if self.mx8 & (1 << n) != 0 {
                        self.mx[n] |= 0x100;
                    } else {
                        self.mx[n] &= 0xff;
                    }
                }
            }
            0x11 => {
                self.ctrl1 = byte;
                self.y_scroll = byte & 7;

                let new_irq_raster = (self.irq_raster & 0xff) | (u16::from(byte & 0x80) << 1);
                if self.irq_raster != new_irq_raster && self.raster_y == new_irq_raster {
                    self.raster_irq();
                }
                self.irq_raster = new_irq_raster;

                if byte & 8 != 0 {
                    self.dy_start = ROW25_YSTART;
                    self.dy_stop = ROW25_YSTOP;
                } else {
                    self.dy_start = ROW24_YSTART;
                    self.dy_stop = ROW24_YSTOP;
                }

                self.display_idx = ((self.ctrl1 & 0x60) | (self.ctrl2 & 0x10)) >> 4;
            }
            0x12 => {
                let new_irq_raster = (self.irq_raster & 0xff00) | u16::from(byte);
                if self.irq_raster != new_irq_raster && self.raster_y == new_irq_raster {
                    self.raster_irq();
                }
                self.irq_raster = new_irq_raster;
            }
            0x15 => self.me = byte,
            0x16 => {
                self.ctrl2 = byte;
                self.x_scroll = byte & 7;
                self.border_40_col = byte & 8 != 0;
                self.display_idx = ((self.ctrl1 & 0x60) | (self.ctrl2 & 0x10)) >> 4;
            }
            0x17 => self.mye = byte,
            0x18 => {
                self.vbase = byte;
                self.matrix_base = (u16::from(byte & 0xf0) << 6) | self.cia_vabase;
                self.char_base = (u16::from(byte & 0x0e) << 10) | self.cia_vabase;
                self.bitmap_base = (u16::from(byte & 0x08) << 10) | self.cia_vabase;
            }
            0x19 => {
                // Acknowledge the bits written as 1. The CPU IRQ line is
                // released on every write; read-modify-write instructions
                // first write back the original flag value.
                self.irq_flag &= !byte & 0x0f;
                self.irq_line = false;
                if self.irq_flag & self.irq_mask != 0 {
                    self.irq_flag |= 0x80;
                }
            }
            0x1a => {
                self.irq_mask = byte & 0x0f;
                if self.irq_flag & self.irq_mask != 0 {
                    self.irq_flag |= 0x80;
                    self.irq_line = true;
                } else {
                    self.irq_flag &= 0x7f;
                    self.irq_line = false;
                }
            }
            0x1b => self.mdp = byte,
            0x1c => self.mmc = byte,
            0x1d => self.mxe = byte,
            0x20 => self.ec = byte & 0x0f,
            0x21 => self.b0c = byte & 0x0f,
            0x22 => self.b1c = byte & 0x0f,
            0x23 => self.b2c = byte & 0x0f,
            0x24 => self.b3c = byte & 0x0f,
            0x25 => self.mm0 = byte & 0x0f,
            0x26 => self.mm1 = byte & 0x0f,
            r @ 0x27..=0x2e => self.sc[(r - 0x27) as usize] = byte & 0x0f,
            _ => {}
        }
    }

    /// Emulate one raster line.
    ///
    /// Renders the line into `fb` when it falls inside the displayed
    /// window and returns the cycle budget left for the CPU.
    pub fn emulate_line(
        &mut self,
        mem: &VicMem,
        color_ram: &[u8; 1024],
        fb: &mut FrameBuffer,
    ) -> LineResult {
        let mut cycles_left = self.normal_cycles;
        let mut is_bad_line = false;

        let mut raster = self.raster_y + 1;
        if raster == self.total_rasters {
            raster = 0;
            self.vc_base = 0;
            self.lp_triggered = false;
            // The host may have changed the buffer geometry between frames.
            fb.latch();
        }
        self.raster_y = raster;

        if raster == self.irq_raster {
            self.raster_irq();
        }

        // In line $30, the DEN bit decides whether bad lines can occur at
        // all this frame.
        if raster == 0x30 {
            self.bad_lines_enabled = self.ctrl1 & 0x10 != 0;
        }

        if (FIRST_DISP_LINE..=LAST_DISP_LINE).contains(&raster) {
            self.vc = self.vc_base;

            if (FIRST_DMA_LINE..=LAST_DMA_LINE).contains(&raster)
                && (raster & 7) as u8 == self.y_scroll
                && self.bad_lines_enabled
            {
                // Bad line: turn on the display and latch 40 bytes from
                // the video matrix and colour RAM.
                self.display_state = true;
                is_bad_line = true;
                cycles_left = self.bad_line_cycles;
                self.rc = 0;

                for i in 0..40 {
                    let vc = (self.vc + i as u16) & 0x3ff;
                    self.matrix_line[i] = mem.get(self.matrix_base + vc);
                    self.color_line[i] = color_ram[vc as usize];
                }
            }

            if raster == self.dy_stop {
                self.border_on = true;
            }
            if raster == self.dy_start && self.ctrl1 & 0x10 != 0 {
                // The border only opens while DEN is set.
                self.border_on = false;
            }

            let y = (raster - FIRST_DISP_LINE) as usize;
            if !self.border_on {
                self.render_display_line(mem, fb, y);
            } else if let Some(row) = fb.row_mut(y) {
                row.fill(self.ec);
            }

            if !self.border_on && self.display_state {
                self.vc = (self.vc + 40) & 0x3ff;
            }

            // Advance the row counter; overflow drops back to idle.
            if self.rc == 7 {
                self.display_state = false;
                self.vc_base = self.vc;
            } else {
                self.rc += 1;
            }
            if (FIRST_DMA_LINE - 1..=LAST_DMA_LINE - 1).contains(&raster)
                && ((raster + 1) & 7) as u8 == self.y_scroll
                && self.bad_lines_enabled
            {
                self.rc = 0;
            }
        }

        // Sprite data counters advance at the end of every line; each DMA
        // fetch steals two cycles from the CPU.
        if self.me | self.sprite_on != 0 {
            cycles_left -= self.update_sprite_dma(raster);
        }

        debug_assert!(self.vc % 40 == 0);

        LineResult {
            vblank: raster == 0,
            cycles: cycles_left,
            is_bad_line,
        }
    }

    /// Render the graphics, sprites and side borders of one open line.
    fn render_display_line(&mut self, mem: &VicMem, fb: &mut FrameBuffer, y: usize) {
        let Some(row) = fb.row_mut(y) else {
            return;
        };
        if row.len() < DISPLAY_X {
            return;
        }

        // Background fill for the X-scroll gap on the left.
        let shift = self.x_scroll as usize;
        for px in &mut row[COL40_XSTART..COL40_XSTART + shift] {
            *px = self.b0c;
        }

        let gfx_start = COL40_XSTART + shift;
        if self.display_state {
            match self.display_idx {
                0 => self.el_std_text(mem, row, gfx_start),
                1 => self.el_mc_text(mem, row, gfx_start),
                2 => self.el_std_bitmap(mem, row, gfx_start),
                3 => self.el_mc_bitmap(mem, row, gfx_start),
                4 => self.el_ecm_text(mem, row, gfx_start),
                _ => self.el_invalid(row, gfx_start),
            }
        } else {
            match self.display_idx {
                0 | 1 | 4 => self.el_std_idle(mem, row, gfx_start),
                3 => self.el_mc_idle(mem, row, gfx_start),
                _ => self.el_invalid(row, gfx_start),
            }
        }

        if self.sprite_on != 0 {
            self.spr_coll_buf.fill(0);
            self.el_sprites(mem, row);
        }

        // Side borders, plus the narrow strips in 38-column mode.
        row[..COL40_XSTART].fill(self.ec);
        row[COL40_XSTOP..DISPLAY_X].fill(self.ec);
        if !self.border_40_col {
            row[COL40_XSTART..COL38_XSTART].fill(self.ec);
            row[COL38_XSTOP..COL40_XSTOP].fill(self.ec);
        }
    }

    // Inner renderers. Each draws 40 characters' worth of pixels starting
    // at `start` and stores one foreground mask byte per character.

    fn el_std_text(&mut self, mem: &VicMem, row: &mut [u8], start: usize) {
        for i in 0..40 {
            let color = self.color_line[i] & 0x0f;
            let data = mem.get(
                self.char_base + (u16::from(self.matrix_line[i]) << 3) + u16::from(self.rc),
            );
            self.fore_mask_buf[FORE_MASK_OFF + i] = data;
            let seg = &mut row[start + i * 8..start + i * 8 + 8];
            for (bit, px) in seg.iter_mut().enumerate() {
                *px = if data & (0x80 >> bit) != 0 {
                    color
                } else {
                    self.b0c
                };
            }
        }
    }

    fn el_mc_text(&mut self, mem: &VicMem, row: &mut [u8], start: usize) {
        for i in 0..40 {
            let cbyte = self.color_line[i];
            let data = mem.get(
                self.char_base + (u16::from(self.matrix_line[i]) << 3) + u16::from(self.rc),
            );
            let seg = &mut row[start + i * 8..start + i * 8 + 8];

            if cbyte & 8 != 0 {
                // Pairs %10 and %11 count as foreground.
                self.fore_mask_buf[FORE_MASK_OFF + i] = (data & 0xaa) | (data & 0xaa) >> 1;
                let color = cbyte & 7;
                for pair in 0..4 {
                    let bits = (data >> (6 - pair * 2)) & 3;
                    let c = match bits {
                        0 => self.b0c,
                        1 => self.b1c,
                        2 => self.b2c,
                        _ => color,
                    };
                    seg[pair * 2] = c;
                    seg[pair * 2 + 1] = c;
                }
            } else {
                // Bit 3 clear: this character renders as standard text.
                self.fore_mask_buf[FORE_MASK_OFF + i] = data;
                let color = cbyte & 0x0f;
                for (bit, px) in seg.iter_mut().enumerate() {
                    *px = if data & (0x80 >> bit) != 0 {
                        color
                    } else {
                        self.b0c
                    };
                }
            }
        }
    }

    fn el_std_bitmap(&mut self, mem: &VicMem, row: &mut [u8], start: usize) {
        for i in 0..40 {
            let mbyte = self.matrix_line[i];
            let data = mem.get(
                self.bitmap_base
                    + (((self.vc + i as u16) & 0x3ff) << 3)
                    + u16::from(self.rc),
            );
            self.fore_mask_buf[FORE_MASK_OFF + i] = data;
            let fg = mbyte >> 4;
            let bg = mbyte & 0x0f;
            let seg = &mut row[start + i * 8..start + i * 8 + 8];
            for (bit, px) in seg.iter_mut().enumerate() {
                *px = if data & (0x80 >> bit) != 0 { fg } else { bg };
            }
        }
    }

    fn el_mc_bitmap(&mut self, mem: &VicMem, row: &mut [u8], start: usize) {
        for i in 0..40 {
            let mbyte = self.matrix_line[i];
            let cbyte = self.color_line[i] & 0x0f;
            let data = mem.get(
                self.bitmap_base
                    + (((self.vc + i as u16) & 0x3ff) << 3)
                    + u16::from(self.rc),
            );
            self.fore_mask_buf[FORE_MASK_OFF + i] = (data & 0xaa) | (data & 0xaa) >> 1;
            let seg = &mut row[start + i * 8..start + i * 8 + 8];
            for pair in 0..4 {
                let bits = (data >> (6 - pair * 2)) & 3;
                let c = match bits {
                    0 => self.b0c,
                    1 => mbyte >> 4,
                    2 => mbyte & 0x0f,
                    _ => cbyte,
                };
                seg[pair * 2] = c;
                seg[pair * 2 + 1] = c;
            }
        }
    }

    fn el_ecm_text(&mut self, mem: &VicMem, row: &mut [u8], start: usize) {
        for i in 0..40 {
            let code = self.matrix_line[i];
            let color = self.color_line[i] & 0x0f;
            self.fore_mask_buf[FORE_MASK_OFF + i] = code;
            let bg = match (code >> 6) & 3 {
                0 => self.b0c,
                1 => self.b1c,
                2 => self.b2c,
                _ => self.b3c,
            };
            let data = mem.get(
                self.char_base + (u16::from(code & 0x3f) << 3) + u16::from(self.rc),
            );
            let seg = &mut row[start + i * 8..start + i * 8 + 8];
            for (bit, px) in seg.iter_mut().enumerate() {
                *px = if data & (0x80 >> bit) != 0 { color } else { bg };
            }
        }
    }

    fn el_std_idle(&mut self, mem: &VicMem, row: &mut [u8], start: usize) {
        // Idle graphics fetch a fixed byte; ECM pulls the address down.
        let addr = if self.ctrl1 & 0x40 != 0 { 0x39ff } else { 0x3fff };
        let data = mem.get(addr | self.cia_vabase);
        for i in 0..40 {
            self.fore_mask_buf[FORE_MASK_OFF + i] = data;
            let seg = &mut row[start + i * 8..start + i * 8 + 8];
            for (bit, px) in seg.iter_mut().enumerate() {
                *px = if data & (0x80 >> bit) != 0 { 0 } else { self.b0c };
            }
        }
    }

    fn el_mc_idle(&mut self, mem: &VicMem, row: &mut [u8], start: usize) {
        let data = mem.get(0x3fff | self.cia_vabase);
        for i in 0..40 {
            self.fore_mask_buf[FORE_MASK_OFF + i] = data;
            let seg = &mut row[start + i * 8..start + i * 8 + 8];
            for pair in 0..4 {
                let bits = (data >> (6 - pair * 2)) & 3;
                let c = if bits == 0 { self.b0c } else { 0 };
                seg[pair * 2] = c;
                seg[pair * 2 + 1] = c;
            }
        }
    }

    fn el_invalid(&mut self, row: &mut [u8], start: usize) {
        row[start..start + 320].fill(0);
        for i in 0..40 {
            self.fore_mask_buf[FORE_MASK_OFF + i] = 0;
        }
    }

    /// A window of the foreground mask as a left-aligned u64: bit 63 is
    /// the mask bit at `bit_pos`.
    fn fore_mask_window(&self, bit_pos: usize) -> u64 {
        let byte = bit_pos / 8;
        let mut window = 0u64;
        for i in 0..8 {
            let b = self.fore_mask_buf.get(byte + i).copied().unwrap_or(0);
            window |= u64::from(b) << (56 - i * 8);
        }
        window << (bit_pos & 7)
    }

    /// Overlay all active sprites on the current line.
    fn el_sprites(&mut self, mem: &VicMem, row: &mut [u8]) {
        let mut spr_coll = 0u8;
        let mut gfx_coll = 0u8;

        // Lower-numbered sprites are drawn first and win the priority tie.
        for n in 0..8 {
            let sbit = 1u8 << n;
            if self.sprite_on & sbit == 0 || self.mx[n] >= (DISPLAY_X - 32) as u16 {
                continue;
            }

            let mx = self.mx[n] as usize;
            let x_start = mx + 8;

            let data_addr = (u16::from(mem.get(self.matrix_base + 0x3f8 + n as u16)) << 6
                | u16::from(self.mc[n]))
                | self.cia_vabase;
            let d0 = mem.get(data_addr);
            let d1 = mem.get(data_addr.wrapping_add(1));
            let d2 = mem.get(data_addr.wrapping_add(2));

            let color = self.sc[n];
            let fore_mask = self.fore_mask_window(x_start - self.x_scroll as usize);

            // Build the pixel span, left-aligned in a u64.
            let (sdata, width) = if self.mxe & sbit != 0 {
                if mx >= DISPLAY_X - 56 {
                    continue;
                }
                let table = if self.mmc & sbit != 0 {
                    &MULTI_EXP_TABLE
                } else {
                    &EXP_TABLE
                };
                let span = (u64::from(table[d0 as usize]) << 48)
                    | (u64::from(table[d1 as usize]) << 32)
                    | (u64::from(table[d2 as usize]) << 16);
                (span, 48usize)
            } else {
                let span = (u64::from(d0) << 56) | (u64::from(d1) << 48) | (u64::from(d2) << 40);
                (span, 24usize)
            };

            if self.mmc & sbit != 0 {
                // Chunky pairs to bitplanes for priority and collisions.
                let plane0 = (sdata & 0x5555_5555_5555_5555) | (sdata & 0x5555_5555_5555_5555) << 1;
                let plane1 = (sdata & 0xaaaa_aaaa_aaaa_aaaa) | (sdata & 0xaaaa_aaaa_aaaa_aaaa) >> 1;

                if fore_mask & (plane0 | plane1) != 0 {
                    gfx_coll |= sbit;
                }
                let mask = if self.mdp & sbit == 0 { 0 } else { fore_mask };

                for i in 0..width {
                    let m = 1u64 << (63 - i);
                    let col = match (plane1 & m != 0, plane0 & m != 0) {
                        (true, true) => self.mm1,
                        (true, false) => color,
                        (false, true) => self.mm0,
                        (false, false) => continue,
                    };
                    let x = x_start + i;
                    if self.spr_coll_buf[x] != 0 {
                        // Obscured by a higher-priority sprite.
                        spr_coll |= self.spr_coll_buf[x] | sbit;
                    } else if mask & m == 0 {
                        row[x] = col;
                    }
                    self.spr_coll_buf[x] |= sbit;
                }
            } else {
                if fore_mask & sdata != 0 {
                    gfx_coll |= sbit;
                }
                let mask = if self.mdp & sbit == 0 { 0 } else { fore_mask };

                for i in 0..width {
                    let m = 1u64 << (63 - i);
                    if sdata & m == 0 {
                        continue;
                    }
                    let x = x_start + i;
                    if self.spr_coll_buf[x] != 0 {
                        spr_coll |= self.spr_coll_buf[x] | sbit;
                    } else if mask & m == 0 {
                        row[x] = color;
                    }
                    self.spr_coll_buf[x] |= sbit;
                }
            }
        }

        if self.sprite_collisions {
            if spr_coll != 0 {
                let old = self.clx_spr;
                self.clx_spr |= spr_coll;
                if old == 0 {
                    // Interrupt on the first collision since the latch
                    // was read.
                    self.irq_flag |= 0x04;
                    if self.irq_mask & 0x04 != 0 {
                        self.irq_flag |= 0x80;
                        self.irq_line = true;
                    }
                }
            }
            if gfx_coll != 0 {
                let old = self.clx_bgr;
                self.clx_bgr |= gfx_coll;
                if old == 0 {
                    self.irq_flag |= 0x02;
                    if self.irq_mask & 0x02 != 0 {
                        self.irq_flag |= 0x80;
                        self.irq_line = true;
                    }
                }
            }
        }
    }

    /// Advance the sprite data counters for the coming line. Returns the
    /// CPU cycles stolen by sprite DMA.
    fn update_sprite_dma(&mut self, raster: u16) -> i32 {
        let raster8 = raster as u8;
        let mut cycles_used = 0;
        let mut spron = self.sprite_on;

        for n in 0..8 {
            let sbit = 1u8 << n;
            if self.me & sbit != 0 && self.my[n] == raster8 {
                // Activate at the matching Y position.
                self.mc[n] = 0;
                spron |= sbit;
            } else if self.mc[n] != 63 {
                // Y expansion fetches new data every other line only.
                let fetch = self.mye & sbit == 0 || (self.my[n] ^ raster8) & 1 == 0;
                if fetch {
                    self.mc[n] += 3;
                    cycles_used += 2;
                    if self.mc[n] == 63 {
                        spron &= !sbit;
                    }
                }
            }
        }

        self.sprite_on = spron;
        cycles_used
    }

    /// Capture the register and pipeline state.
    #[must_use]
    pub fn state(&self) -> VicState {
        VicState {
            mx: self.mx,
            my: self.my,
            mx8: self.mx8,
            ctrl1: self.ctrl1,
            ctrl2: self.ctrl2,
            lpx: self.lpx,
            lpy: self.lpy,
            me: self.me,
            mxe: self.mxe,
            mye: self.mye,
            mdp: self.mdp,
            mmc: self.mmc,
            vbase: self.vbase,
            irq_flag: self.irq_flag,
            irq_mask: self.irq_mask,
            clx_spr: self.clx_spr,
            clx_bgr: self.clx_bgr,
            ec: self.ec,
            b0c: self.b0c,
            b1c: self.b1c,
            b2c: self.b2c,
            b3c: self.b3c,
            mm0: self.mm0,
            mm1: self.mm1,
            sc: self.sc,
            irq_raster: self.irq_raster,
            raster_y: self.raster_y,
            vc: self.vc,
            vc_base: self.vc_base,
            rc: self.rc,
            sprite_on: self.sprite_on,
            mc: self.mc,
            display_state: self.display_state,
            bad_lines_enabled: self.bad_lines_enabled,
            lp_triggered: self.lp_triggered,
            border_on: self.border_on,
            cia_vabase: self.cia_vabase,
            irq_line: self.irq_line,
        }
    }

    /// Restore from a captured state. Meant to be applied during the
    /// vertical blank; the per-line latches refill on the next bad line.
    pub fn restore(&mut self, s: &VicState) {
        self.mx = s.mx;
        self.my = s.my;
        self.mx8 = s.mx8;
        self.lpx = s.lpx;
        self.lpy = s.lpy;
        self.me = s.me;
        self.mxe = s.mxe;
        self.mye = s.mye;
        self.mdp = s.mdp;
        self.mmc = s.mmc;
        self.irq_flag = s.irq_flag;
        self.irq_mask = s.irq_mask;
        self.clx_spr = s.clx_spr;
        self.clx_bgr = s.clx_bgr;
        self.ec = s.ec;
        self.b0c = s.b0c;
        self.b1c = s.b1c;
        self.b2c = s.b2c;
        self.b3c = s.b3c;
        self.mm0 = s.mm0;
        self.mm1 = s.mm1;
        self.sc = s.sc;
        self.irq_raster = s.irq_raster;
        self.raster_y = s.raster_y;
        self.vc = s.vc;
        self.vc_base = s.vc_base;
        self.rc = s.rc;
        self.sprite_on = s.sprite_on;
        self.mc = s.mc;
        self.display_state = s.display_state;
        self.bad_lines_enabled = s.bad_lines_enabled;
        self.lp_triggered = s.lp_triggered;
        self.border_on = s.border_on;
        self.cia_vabase = s.cia_vabase;
        self.irq_line = s.irq_line;

        // Re-derive the register views.
        self.ctrl1 = s.ctrl1;
        self.ctrl2 = s.ctrl2;
        self.y_scroll = s.ctrl1 & 7;
        self.x_scroll = s.ctrl2 & 7;
        self.border_40_col = s.ctrl2 & 8 != 0;
        self.display_idx = ((s.ctrl1 & 0x60) | (s.ctrl2 & 0x10)) >> 4;
        if s.ctrl1 & 8 != 0 {
            self.dy_start = ROW25_YSTART;
            self.dy_stop = ROW25_YSTOP;
        } else {
            self.dy_start = ROW24_YSTART;
            self.dy_stop = ROW24_YSTOP;
        }
        self.vbase = s.vbase;
        self.matrix_base = (u16::from(s.vbase & 0xf0) << 6) | self.cia_vabase;
        self.char_base = (u16::from(s.vbase & 0x0e) << 10) | self.cia_vabase;
        self.bitmap_base = (u16::from(s.vbase & 0x08) << 10) | self.cia_vabase;
    }
}
