//! MOS 6522 Versatile Interface Adapter (VIA).
//!
//! The 6522 provides two 8-bit I/O ports, two 16-bit timers, a serial
//! shift register, and an interrupt controller. The 1541 floppy drive
//! uses two VIAs: one for the IEC serial bus interface and one for the
//! disk controller.
//!
//! Timers are counted in batches (`count_timers`) because the host
//! machine advances one raster line at a time, not one cycle at a time.
//!
//! # Registers ($0-$F)
//!
//! | Reg | Name | Description                         |
//! |-----|------|-------------------------------------|
//! | $0  | ORB  | Port B data (handshake on access)   |
//! | $1  | ORA  | Port A data (handshake on access)   |
//! | $2  | DDRB | Port B data direction (1 = output)  |
//! | $3  | DDRA | Port A data direction (1 = output)  |
//! | $4  | T1CL | Timer 1 counter low (read clears T1 IRQ) |
//! | $5  | T1CH | Timer 1 counter high (write starts T1) |
//! | $6  | T1LL | Timer 1 latch low                   |
//! | $7  | T1LH | Timer 1 latch high                  |
//! | $8  | T2CL | Timer 2 counter low (read clears T2 IRQ) |
//! | $9  | T2CH | Timer 2 counter high (write starts T2) |
//! | $A  | SR   | Shift register                      |
//! | $B  | ACR  | Auxiliary control register          |
//! | $C  | PCR  | Peripheral control register         |
//! | $D  | IFR  | Interrupt flag register             |
//! | $E  | IER  | Interrupt enable register           |
//! | $F  | ORA  | Port A data (no handshake)          |

// IFR/IER bit masks
const IFR_CA2: u8 = 0x01;
const IFR_CA1: u8 = 0x02;
const IFR_SR: u8 = 0x04;
const IFR_CB2: u8 = 0x08;
const IFR_CB1: u8 = 0x10;
const IFR_T2: u8 = 0x20;
const IFR_T1: u8 = 0x40;

/// MOS 6522 Versatile Interface Adapter.
pub struct Via6522 {
    /// Port A output register.
    port_a: u8,
    /// Port B output register.
    port_b: u8,
    /// Port A data direction register (1 = output).
    ddr_a: u8,
    /// Port B data direction register (1 = output).
    ddr_b: u8,
    /// External input lines for port A.
    in_a: u8,
    /// External input lines for port B.
    in_b: u8,

    /// Timer 1 counter (counts down).
    t1_counter: u16,
    /// Timer 1 latch, reloaded into the counter on underflow in free-run.
    t1_latch: u16,
    /// Timer 1 is counting. One-shot mode clears this on underflow.
    t1_running: bool,

    /// Timer 2 counter.
    t2_counter: u16,
    /// Timer 2 latch low byte (only the low byte is latched).
    t2_latch_lo: u8,
    /// Timer 2 is counting; always one-shot.
    t2_running: bool,

    /// Shift register.
    sr: u8,
    /// Auxiliary control register. Bit 6 = T1 free-run, bit 7 = PB7 toggle,
    /// bit 5 = T2 counts PB6 pulses instead of cycles.
    acr: u8,
    /// Peripheral control register. Bit 0 = CA1 edge, bit 4 = CB1 edge
    /// (1 = positive), bits 5-7 = CB2 control.
    pcr: u8,
    /// Interrupt flag register (bits 0-6).
    ifr: u8,
    /// Interrupt enable register (bits 0-6).
    ier: u8,

    /// Previous CA1 input level for edge detection.
    ca1_prev: bool,
    /// Previous CB1 input level for edge detection.
    cb1_prev: bool,
    /// PB7 toggle output driven by Timer 1 in free-run + PB7 mode.
    pb7_toggle: bool,
}

impl Via6522 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            port_a: 0,
            port_b: 0,
            ddr_a: 0,
            ddr_b: 0,
            in_a: 0xff,
            in_b: 0xff,
            t1_counter: 0xffff,
            t1_latch: 0xffff,
            t1_running: false,
            t2_counter: 0xffff,
            t2_latch_lo: 0xff,
            t2_running: false,
            sr: 0,
            acr: 0,
            pcr: 0,
            ifr: 0,
            ier: 0,
            ca1_prev: true,
            cb1_prev: true,
            pb7_toggle: false,
        }
    }

    /// Reset all registers to their power-up state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Count both timers down by `cycles` clock cycles.
    ///
    /// The host calls this once per raster line with the line's cycle
    /// budget. Underflows within the batch set the interrupt flags; the
    /// sub-cycle position of the underflow is not modelled.
    pub fn count_timers(&mut self, cycles: u32) {
        self.count_timer1(cycles);
        self.count_timer2(cycles);
    }

    /// Whether the VIA asserts its IRQ output.
    #[must_use]
    pub fn irq_active(&self) -> bool {
        (self.ifr & self.ier & 0x7f) != 0
    }

    /// Read a VIA register.
    pub fn read(&mut self, reg: u8) -> u8 {
        match reg & 0x0f {
            0x00 => {
                self.ifr &= !(IFR_CB1 | IFR_CB2);
                self.input_b()
            }
            0x01 => {
                self.ifr &= !(IFR_CA1 | IFR_CA2);
                self.input_a()
            }
            0x02 => self.ddr_b,
            0x03 => self.ddr_a,
            0x04 => {
                self.ifr &= !IFR_T1;
                self.t1_counter as u8
            }
            0x05 => (self.t1_counter >> 8) as u8,
            0x06 => self.t1_latch as u8,
            0x07 => (self.t1_latch >> 8) as u8,
            0x08 => {
                self.ifr &= !IFR_T2;
                self.t2_counter as u8
            }
            0x09 => (self.t2_counter >> 8) as u8,
            0x0a => self.sr,
            0x0b => self.acr,
            0x0c => self.pcr,
            0x0d => {
                let any = if (self.ifr & self.ier & 0x7f) != 0 {
                    0x80
                } else {
                    0
                };
                (self.ifr & 0x7f) | any
            }
            0x0e => self.ier | 0x80,
            0x0f => self.input_a(),
            _ => 0xff,
        }
    }

    /// Write a VIA register.
    pub fn write(&mut self, reg: u8, value: u8) {
        match reg & 0x0f {
            0x00 => {
                self.ifr &= !(IFR_CB1 | IFR_CB2);
                self.port_b = value;
            }
            0x01 => {
                self.ifr &= !(IFR_CA1 | IFR_CA2);
                self.port_a = value;
            }
            0x02 => self.ddr_b = value,
            0x03 => self.ddr_a = value,
            0x04 | 0x06 => {
                self.t1_latch = (self.t1_latch & 0xff00) | u16::from(value);
            }
            0x05 => {
                // Load counter from latch, start, clear T1 flag.
                self.t1_latch = (self.t1_latch & 0x00ff) | (u16::from(value) << 8);
                self.t1_counter = self.t1_latch;
                self.t1_running = true;
                self.ifr &= !IFR_T1;
                self.pb7_toggle = false;
            }
            0x07 => {
                self.t1_latch = (self.t1_latch & 0x00ff) | (u16::from(value) << 8);
                self.ifr &= !IFR_T1;
            }
            0x08 => self.t2_latch_lo = value,
            0x09 => {
                self.t2_counter = u16::from(self.t2_latch_lo) | (u16::from(value) << 8);
                self.t2_running = true;
                self.ifr &= !IFR_T2;
            }
            0x0a => {
                self.sr = value;
                self.ifr &= !IFR_SR;
            }
            0x0b => self.acr = value,
            0x0c => self.pcr = value,
            0x0d => self.ifr &= !value,
            0x0e => {
                if value & 0x80 != 0 {
                    self.ier |= value & 0x7f;
                } else {
                    self.ier &= !(value & 0x7f);
                }
            }
            0x0f => self.port_a = value,
            _ => {}
        }
    }

    /// Drive the CA1 input line. Triggers the CA1 flag on the edge
    /// selected by PCR bit 0 (0 = negative edge).
    pub fn set_ca1(&mut self, level: bool) {
        let positive = self.pcr & 0x01 != 0;
        let edge = if positive {
            !self.ca1_prev && level
        } else {
            self.ca1_prev && !level
        };
        if edge {
            self.ifr |= IFR_CA1;
        }
        self.ca1_prev = level;
    }

    /// Drive the CB1 input line. Edge select is PCR bit 4.
    pub fn set_cb1(&mut self, level: bool) {
        let positive = self.pcr & 0x10 != 0;
        let edge = if positive {
            !self.cb1_prev && level
        } else {
            self.cb1_prev && !level
        };
        if edge {
            self.ifr |= IFR_CB1;
        }
        self.cb1_prev = level;
    }

    /// Latch the external port A input lines.
    pub fn set_pa_in(&mut self, value: u8) {
        self.in_a = value;
    }

    /// Latch the external port B input lines.
    pub fn set_pb_in(&mut self, value: u8) {
        self.in_b = value;
    }

    /// Port A output value: only bits configured as outputs drive high.
    #[must_use]
    pub fn pa_out(&self) -> u8 {
        self.port_a & self.ddr_a
    }

    /// Port B output value. In PB7-toggle mode bit 7 follows Timer 1.
    #[must_use]
    pub fn pb_out(&self) -> u8 {
        let mut out = self.port_b & self.ddr_b;
        if self.acr & 0x80 != 0 {
            out = (out & 0x7f) | if self.pb7_toggle { 0x80 } else { 0 };
        }
        out
    }

    /// CA2 is held high by manual output mode (PCR bits 1-3 = 111).
    #[must_use]
    pub fn ca2_manual_high(&self) -> bool {
        (self.pcr & 0x0e) == 0x0e
    }

    /// CB2 is held low by manual output mode (PCR bits 5-7 = 110).
    #[must_use]
    pub fn cb2_manual_low(&self) -> bool {
        (self.pcr & 0xe0) == 0xc0
    }

    /// Capture the register state for snapshots.
    #[must_use]
    pub fn state(&self) -> ViaState {
        ViaState {
            port_a: self.port_a,
            port_b: self.port_b,
            ddr_a: self.ddr_a,
            ddr_b: self.ddr_b,
            t1_counter: self.t1_counter,
            t1_latch: self.t1_latch,
            t1_running: self.t1_running,
            t2_counter: self.t2_counter,
            t2_latch_lo: self.t2_latch_lo,
            t2_running: self.t2_running,
            sr: self.sr,
            acr: self.acr,
            pcr: self.pcr,
            ifr: self.ifr,
            ier: self.ier,
        }
    }

    /// Restore from a captured state. Input lines and edge history keep
    /// their current values; the host re-drives them after a restore.
    pub fn restore(&mut self, s: &ViaState) {
        self.port_a = s.port_a;
        self.port_b = s.port_b;
        self.ddr_a = s.ddr_a;
        self.ddr_b = s.ddr_b;
        self.t1_counter = s.t1_counter;
        self.t1_latch = s.t1_latch;
        self.t1_running = s.t1_running;
        self.t2_counter = s.t2_counter;
        self.t2_latch_lo = s.t2_latch_lo;
        self.t2_running = s.t2_running;
        self.sr = s.sr;
        self.acr = s.acr;
        self.pcr = s.pcr;
        self.ifr = s.ifr;
        self.ier = s.ier;
    }

    fn input_a(&self) -> u8 {
        (self.port_a & self.ddr_a) | (self.in_a & !self.ddr_a)
    }

    fn input_b(&self) -> u8 {
        let mut val = (self.port_b & self.ddr_b) | (self.in_b & !self.ddr_b);
        if self.acr & 0x80 != 0 {
            val = (val & 0x7f) | if self.pb7_toggle { 0x80 } else { 0 };
        }
        val
    }

    fn count_timer1(&mut self, cycles: u32) {
        let free_run = self.acr & 0x40 != 0;
        if !self.t1_running && !free_run {
            return;
        }

        let mut remaining = cycles;
        while remaining > 0 {
            let counter = u32::from(self.t1_counter);
            if counter >= remaining {
                self.t1_counter -= remaining as u16;
                return;
            }
            remaining -= counter + 1;
            self.ifr |= IFR_T1;
            if free_run {
                self.t1_counter = self.t1_latch;
                if self.acr & 0x80 != 0 {
                    self.pb7_toggle = !self.pb7_toggle;
                }
                if self.t1_latch == 0 {
                    // Degenerate latch; avoid spinning.
                    return;
                }
            } else {
                self.t1_running = false;
                self.t1_counter = self.t1_latch;
                return;
            }
        }
    }

    fn count_timer2(&mut self, cycles: u32) {
        if !self.t2_running || self.acr & 0x20 != 0 {
            // Stopped, or counting PB6 pulses which the host drives.
            return;
        }
        let counter = u32::from(self.t2_counter);
        if counter >= cycles {
            self.t2_counter -= cycles as u16;
        } else {
            self.ifr |= IFR_T2;
            self.t2_running = false;
            self.t2_counter = (counter.wrapping_sub(cycles)) as u16;
        }
    }
}

impl Default for Via6522 {
    fn default() -> Self {
        Self::new()
    }
}

/// Captured VIA register state for snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViaState {
    pub port_a: u8,
    pub port_b: u8,
    pub ddr_a: u8,
    pub ddr_b: u8,
    pub t1_counter: u16,
    pub t1_latch: u16,
    pub t1_running: bool,
    pub t2_counter: u16,
    pub t2_latch_lo: u8,
    pub t2_running: bool,
    pub sr: u8,
    pub acr: u8,
    pub pcr: u8,
    pub ifr: u8,
    pub ier: u8,
}
