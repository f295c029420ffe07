//! Addressing mode helpers.
//!
//! Each helper fetches the operand bytes and returns the effective
//! address. Indexed reads report page crossings so the caller can add the
//! penalty cycle; indexed writes and read-modify-write instructions pay
//! the penalty unconditionally, which is folded into their fixed cycle
//! counts.

use crate::Mos6502;
use raster64_core::Bus;

impl Mos6502 {
    /// Fetch the byte at PC and advance PC.
    pub(crate) fn fetch(&mut self, bus: &mut impl Bus) -> u8 {
        let value = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    /// Fetch a little-endian word at PC.
    pub(crate) fn fetch_word(&mut self, bus: &mut impl Bus) -> u16 {
        let lo = self.fetch(bus);
        let hi = self.fetch(bus);
        u16::from_le_bytes([lo, hi])
    }

    /// Read a little-endian word.
    pub(crate) fn read_word(&mut self, bus: &mut impl Bus, addr: u16) -> u16 {
        let lo = bus.read(addr);
        let hi = bus.read(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    /// Read a pointer from the zero page; the high byte wraps within it.
    fn read_zp_word(&mut self, bus: &mut impl Bus, ptr: u8) -> u16 {
        let lo = bus.read(u16::from(ptr));
        let hi = bus.read(u16::from(ptr.wrapping_add(1)));
        u16::from_le_bytes([lo, hi])
    }

    /// Read a word with the indirect-JMP page-wrap quirk: the high byte
    /// comes from the start of the same page when the low byte is $FF.
    pub(crate) fn read_word_page_wrap(&mut self, bus: &mut impl Bus, addr: u16) -> u16 {
        let lo = bus.read(addr);
        let hi_addr = (addr & 0xff00) | (addr.wrapping_add(1) & 0x00ff);
        let hi = bus.read(hi_addr);
        u16::from_le_bytes([lo, hi])
    }

    pub(crate) fn push(&mut self, bus: &mut impl Bus, value: u8) {
        bus.write(0x0100 | u16::from(self.sp), value);
        self.sp = self.sp.wrapping_sub(1);
    }

    pub(crate) fn pull(&mut self, bus: &mut impl Bus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | u16::from(self.sp))
    }

    pub(crate) fn push_word(&mut self, bus: &mut impl Bus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    pub(crate) fn pull_word(&mut self, bus: &mut impl Bus) -> u16 {
        let lo = self.pull(bus);
        let hi = self.pull(bus);
        u16::from_le_bytes([lo, hi])
    }

    // Effective-address calculation, one method per mode.

    pub(crate) fn zp(&mut self, bus: &mut impl Bus) -> u16 {
        u16::from(self.fetch(bus))
    }

    pub(crate) fn zp_x(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch(bus);
        u16::from(base.wrapping_add(self.x))
    }

    pub(crate) fn zp_y(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch(bus);
        u16::from(base.wrapping_add(self.y))
    }

    pub(crate) fn abs(&mut self, bus: &mut impl Bus) -> u16 {
        self.fetch_word(bus)
    }

    /// Absolute,X for reads: returns the address and the crossing penalty.
    pub(crate) fn abs_x(&mut self, bus: &mut impl Bus) -> (u16, i32) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(u16::from(self.x));
        (addr, i32::from((base ^ addr) & 0xff00 != 0))
    }

    /// Absolute,Y for reads.
    pub(crate) fn abs_y(&mut self, bus: &mut impl Bus) -> (u16, i32) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(u16::from(self.y));
        (addr, i32::from((base ^ addr) & 0xff00 != 0))
    }

    /// Absolute,X for writes and RMW: the penalty is unconditional.
    pub(crate) fn abs_x_store(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch_word(bus);
        base.wrapping_add(u16::from(self.x))
    }

    /// Absolute,Y for writes and RMW.
    pub(crate) fn abs_y_store(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch_word(bus);
        base.wrapping_add(u16::from(self.y))
    }

    /// ($nn,X): zero-page pointer indexed before the lookup.
    pub(crate) fn ind_x(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch(bus);
        let ptr = base.wrapping_add(self.x);
        self.read_zp_word(bus, ptr)
    }

    /// ($nn),Y for reads: returns the address and the crossing penalty.
    pub(crate) fn ind_y(&mut self, bus: &mut impl Bus) -> (u16, i32) {
        let ptr = self.fetch(bus);
        let base = self.read_zp_word(bus, ptr);
        let addr = base.wrapping_add(u16::from(self.y));
        (addr, i32::from((base ^ addr) & 0xff00 != 0))
    }

    /// ($nn),Y for writes and RMW.
    pub(crate) fn ind_y_store(&mut self, bus: &mut impl Bus) -> u16 {
        let ptr = self.fetch(bus);
        let base = self.read_zp_word(bus, ptr);
        base.wrapping_add(u16::from(self.y))
    }

    /// Conditional branch. Returns the extra cycles: 1 when taken, 2 when
    /// the target is on a different page.
    pub(crate) fn branch(&mut self, bus: &mut impl Bus, cond: bool) -> i32 {
        let offset = self.fetch(bus) as i8;
        if !cond {
            return 0;
        }
        let target = self.pc.wrapping_add(offset as u16);
        let crossed = (self.pc ^ target) & 0xff00 != 0;
        self.pc = target;
        if crossed {
            2
        } else {
            1
        }
    }
}
