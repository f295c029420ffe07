//! C64 colour palette.

/// The 16 C64 colours as ARGB32, in register order.
pub const PALETTE: [u32; 16] = [
    0xff00_0000, // black
    0xffff_ffff, // white
    0xff88_3932, // red
    0xff67_b6bd, // cyan
    0xff8b_3f96, // purple
    0xff55_a049, // green
    0xff40_318d, // blue
    0xffbf_ce72, // yellow
    0xff8b_5429, // orange
    0xff57_4200, // brown
    0xffb8_6962, // light red
    0xff50_5050, // dark grey
    0xff78_7878, // grey
    0xff94_e089, // light green
    0xff78_69c4, // light blue
    0xff9f_9f9f, // light grey
];
