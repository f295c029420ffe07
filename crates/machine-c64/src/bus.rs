//! Main CPU bus: 64 KiB address space with ROM/RAM/IO banking.
//!
//! The processor port at $00/$01 selects the banking configuration:
//! LORAM (bit 0) maps BASIC ROM at $A000, HIRAM (bit 1) maps KERNAL ROM
//! at $E000, CHAREN (bit 2) picks the IO window or the character ROM at
//! $D000. Writes under ROM always land in RAM.
//!
//! The bus owns every chip, including the whole 1541 drive. CIA2 writes
//! therefore reach the drive's VIA1 CA1 input synchronously, which is
//! what the ATN handshake needs.

use mos_6502::CpuBus;
use raster64_core::{Bus, FrameBuffer};

use crate::cia::Cia;
use crate::config::MachineConfig;
use crate::drive::{Drive1541, IEC_CLK, IEC_DATA};
use crate::keyboard::KeyboardMatrix;
use crate::vic::{LineResult, Vic, VicMem};

/// The C64 bus. Owns RAM, ROMs, colour RAM, the VIC, both CIAs, the
/// keyboard matrix and the drive.
pub struct C64Bus {
    pub ram: Box<[u8; 0x10000]>,
    basic_rom: Box<[u8; 0x2000]>,
    kernal_rom: Box<[u8; 0x2000]>,
    pub(crate) char_rom: Box<[u8; 0x1000]>,
    /// Processor port data direction ($00).
    pub(crate) port_ddr: u8,
    /// Processor port data ($01).
    pub(crate) port_data: u8,
    pub color_ram: Box<[u8; 0x400]>,
    /// SID register window; the chip itself is an external collaborator.
    pub(crate) sid_registers: [u8; 0x20],

    pub vic: Vic,
    pub cia1: Cia,
    pub cia2: Cia,
    pub keyboard: KeyboardMatrix,
    /// Active-low line masks for the two control ports. Port 1 reads on
    /// CIA1 port B, port 2 on CIA1 port A.
    pub(crate) joystick1: u8,
    pub(crate) joystick2: u8,

    pub drive: Drive1541,

    reset_line: bool,
    nmi_prev: bool,
}

impl C64Bus {
    pub(crate) fn new(
        basic_rom: Box<[u8; 0x2000]>,
        kernal_rom: Box<[u8; 0x2000]>,
        char_rom: Box<[u8; 0x1000]>,
        drive: Drive1541,
        config: &MachineConfig,
    ) -> Self {
        let timing = config.timing;
        let mut vic = Vic::new(
            timing.total_rasters(),
            timing.normal_cycles(),
            timing.bad_line_cycles(),
        );
        vic.set_sprite_collisions(config.sprite_collisions);

        let mut bus = Self {
            ram: Box::new([0; 0x10000]),
            basic_rom,
            kernal_rom,
            char_rom,
            port_ddr: 0x2f,
            port_data: 0x37,
            color_ram: Box::new([0; 0x400]),
            sid_registers: [0; 0x20],
            vic,
            cia1: Cia::new(),
            cia2: Cia::new(),
            keyboard: KeyboardMatrix::new(),
            joystick1: 0xff,
            joystick2: 0xff,
            drive,
            reset_line: false,
            nmi_prev: false,
        };
        bus.sync_cia2_outputs();
        bus
    }

    /// CIA2's contribution to the IEC bus: ATN/CLK/DATA outputs on port A
    /// bits 3-5, inverted on the wire.
    #[must_use]
    pub fn cia2_iec_lines(&self) -> u8 {
        !self.cia2.pa_out() & 0x38
    }

    /// Push the CIA2 port A outputs to their consumers: the drive's IEC
    /// view and the VIC bank select.
    pub(crate) fn sync_cia2_outputs(&mut self) {
        let lines = self.cia2_iec_lines();
        self.drive.set_cia2_lines(lines);
        let bank = u16::from(!self.cia2.pa_out() & 0x03);
        self.vic.changed_va(bank);
    }

    /// Render one raster line; the VIC reads RAM, the character ROM
    /// shadow and colour RAM directly.
    pub(crate) fn emulate_vic_line(&mut self, fb: &mut FrameBuffer) -> LineResult {
        let mem = VicMem {
            ram: &self.ram,
            char_rom: &self.char_rom,
        };
        self.vic.emulate_line(&mem, &self.color_ram, fb)
    }

    /// Request a reset at the CPU's next instruction boundary.
    pub fn request_reset(&mut self) {
        self.reset_line = true;
    }

    // Banking predicates, derived from the processor port.

    fn bank_config(&self) -> u8 {
        (self.port_data | !self.port_ddr) & 0x07
    }

    fn basic_visible(&self) -> bool {
        self.bank_config() & 0x03 == 0x03
    }

    fn kernal_visible(&self) -> bool {
        self.bank_config() & 0x02 != 0
    }

    fn io_visible(&self) -> bool {
        let cfg = self.bank_config();
        cfg & 0x04 != 0 && cfg & 0x03 != 0
    }

    fn char_visible(&self) -> bool {
        let cfg = self.bank_config();
        cfg & 0x04 == 0 && cfg & 0x03 != 0
    }

    fn read_io(&mut self, addr: u16) -> u8 {
        match addr {
            // VIC registers, mirrored every 64 bytes.
            0xd000..=0xd3ff => self.vic.read_register((addr & 0x3f) as u8),
            // SID register window, mirrored every 32 bytes.
            0xd400..=0xd7ff => self.sid_registers[(addr & 0x1f) as usize],
            // Colour RAM is 4 bits wide; the upper nibble floats high.
            0xd800..=0xdbff => self.color_ram[(addr & 0x3ff) as usize] | 0xf0,
            // CIA1, mirrored every 16 bytes.
            0xdc00..=0xdcff => {
                let reg = (addr & 0x0f) as u8;
                match reg {
                    0x00 => {
                        self.cia1.set_pa_in(self.joystick2);
                        self.cia1.read(0x00)
                    }
                    0x01 => {
                        // Keyboard rows are selected on port A; joystick 2
                        // shares those lines and joystick 1 the columns.
                        let rows = self.cia1.pa_out() & self.joystick2;
                        let columns = self.keyboard.scan(rows) & self.joystick1;
                        self.cia1.set_pb_in(columns);
                        self.cia1.read(0x01)
                    }
                    r => self.cia1.read(r),
                }
            }
            // CIA2, mirrored every 16 bytes.
            0xdd00..=0xddff => {
                let reg = (addr & 0x0f) as u8;
                if reg == 0x00 {
                    // Port A bits 6-7 read the bus CLK/DATA levels back.
                    let bus_lines = self.drive.iec_lines();
                    let pa_in = 0x3f | ((bus_lines & (IEC_CLK | IEC_DATA)) << 2);
                    self.cia2.set_pa_in(pa_in);
                }
                self.cia2.read(reg)
            }
            // Expansion IO is open.
            _ => 0xff,
        }
    }

    fn write_io(&mut self, addr: u16, value: u8) {
        match addr {
            0xd000..=0xd3ff => self.vic.write_register((addr & 0x3f) as u8, value),
            0xd400..=0xd7ff => self.sid_registers[(addr & 0x1f) as usize] = value,
            0xd800..=0xdbff => self.color_ram[(addr & 0x3ff) as usize] = value & 0x0f,
            0xdc00..=0xdcff => self.cia1.write((addr & 0x0f) as u8, value),
            0xdd00..=0xddff => {
                let reg = (addr & 0x0f) as u8;
                self.cia2.write(reg, value);
                if matches!(reg, 0x00 | 0x02) {
                    self.sync_cia2_outputs();
                }
            }
            _ => {}
        }
    }
}

impl Bus for C64Bus {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000 => self.port_ddr,
            // Unconnected input bits float high; bit 4 is the cassette
            // sense (no button pressed).
            0x0001 => (self.port_data & self.port_ddr) | (!self.port_ddr & 0xc0) | 0x10,
            0x0002..=0x9fff => self.ram[addr as usize],
            0xa000..=0xbfff => {
                if self.basic_visible() {
                    self.basic_rom[(addr & 0x1fff) as usize]
                } else {
                    self.ram[addr as usize]
                }
            }
            0xc000..=0xcfff => self.ram[addr as usize],
            0xd000..=0xdfff => {
                if self.io_visible() {
                    self.read_io(addr)
                } else if self.char_visible() {
                    self.char_rom[(addr & 0x0fff) as usize]
                } else {
                    self.ram[addr as usize]
                }
            }
            0xe000..=0xffff => {
                if self.kernal_visible() {
                    self.kernal_rom[(addr & 0x1fff) as usize]
                } else {
                    self.ram[addr as usize]
                }
            }
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000 => self.port_ddr = value,
            0x0001 => self.port_data = value,
            0xd000..=0xdfff if self.io_visible() => self.write_io(addr, value),
            // Writes under ROM land in the RAM below.
            _ => self.ram[addr as usize] = value,
        }
    }
}

impl CpuBus for C64Bus {
    fn irq_pending(&self) -> bool {
        self.vic.irq_line() || self.cia1.irq_active()
    }

    fn nmi_pending(&mut self) -> bool {
        let level = self.cia2.irq_active();
        let edge = level && !self.nmi_prev;
        self.nmi_prev = level;
        edge
    }

    fn reset_pending(&self) -> bool {
        self.reset_line
    }

    fn take_reset(&mut self) {
        self.reset_line = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d64::D64;

    fn test_bus() -> C64Bus {
        let mut kernal = Box::new([0xeau8; 0x2000]);
        kernal[0x1ffc] = 0x00;
        kernal[0x1ffd] = 0xe0;
        let basic = Box::new([0x11u8; 0x2000]);
        let chargen = Box::new([0x22u8; 0x1000]);
        let mut rom = vec![0xea; 0x4000];
        rom[0x3ffc] = 0x00;
        rom[0x3ffd] = 0xc0;
        let drive = Drive1541::new(&rom).expect("valid ROM");
        C64Bus::new(basic, kernal, chargen, drive, &MachineConfig::default())
    }

    #[test]
    fn default_banking_shows_all_roms_and_io() {
        let mut bus = test_bus();
        assert_eq!(bus.read(0xa000), 0x11); // BASIC
        assert_eq!(bus.read(0xe000), 0xea); // KERNAL
        bus.write(0xd020, 0x0e);
        assert_eq!(bus.read(0xd020) & 0x0f, 0x0e); // VIC register
    }

    #[test]
    fn ram_under_rom_via_processor_port() {
        let mut bus = test_bus();
        bus.write(0xa123, 0x42); // lands under the ROM
        assert_eq!(bus.read(0xa123), 0x11);
        bus.write(0x0001, 0x34); // LORAM off
        assert_eq!(bus.read(0xa123), 0x42);

        bus.write(0x0001, 0x30); // all RAM
        assert_eq!(bus.read(0xe000), 0x00);
        bus.write(0x0001, 0x33); // char ROM instead of IO
        assert_eq!(bus.read(0xd000), 0x22);
        bus.write(0x0001, 0x37);
    }

    #[test]
    fn color_ram_high_nibble_floats() {
        let mut bus = test_bus();
        bus.write(0xd800, 0xa5);
        assert_eq!(bus.read(0xd800), 0xf5);
    }

    #[test]
    fn expansion_io_reads_open() {
        let mut bus = test_bus();
        assert_eq!(bus.read(0xde00), 0xff);
        assert_eq!(bus.read(0xdf80), 0xff);
    }

    #[test]
    fn keyboard_scan_through_cia1() {
        let mut bus = test_bus();
        bus.keyboard.set_key(1, 1, true); // W

        bus.write(0xdc02, 0xff); // DDR A: outputs
        bus.write(0xdc03, 0x00); // DDR B: inputs
        bus.write(0xdc00, !0x02); // select row 1
        assert_eq!(bus.read(0xdc01) & 0x02, 0x00);
        bus.write(0xdc00, !0x01); // select row 0 only
        assert_eq!(bus.read(0xdc01), 0xff);
    }

    #[test]
    fn joystick_lines_overlay_cia1_ports() {
        let mut bus = test_bus();
        bus.write(0xdc02, 0x00);
        bus.write(0xdc03, 0x00);
        bus.joystick1 = !0x10; // fire on port 1 -> CIA1 PB
        bus.joystick2 = !0x01; // up on port 2 -> CIA1 PA
        assert_eq!(bus.read(0xdc01) & 0x10, 0x00);
        assert_eq!(bus.read(0xdc00) & 0x01, 0x00);
    }

    #[test]
    fn cia2_port_a_reads_bus_lines_back() {
        let mut bus = test_bus();
        // Configure the IEC outputs like the KERNAL does and release all.
        bus.write(0xdd02, 0x3f);
        bus.write(0xdd00, 0x03);
        // The drive still signals presence by holding DATA low.
        let pa = bus.read(0xdd00);
        assert_eq!(pa & 0x40, 0x40); // CLK high
        assert_eq!(pa & 0x80, 0x00); // DATA held low by the drive

        // Pulling CLK ourselves reads back low.
        bus.write(0xdd00, 0x03 | 0x10);
        assert_eq!(bus.read(0xdd00) & 0x40, 0x00);
    }

    #[test]
    fn vic_bank_follows_cia2() {
        let mut bus = test_bus();
        bus.write(0xdd02, 0x03);
        bus.write(0xdd00, 0x00); // inverted: bank 3 ($C000)
        assert_eq!(bus.vic.state().cia_vabase, 0xc000);
        bus.write(0xdd00, 0x02); // inverted: bank 1 ($4000)
        assert_eq!(bus.vic.state().cia_vabase, 0x4000);
    }

    #[test]
    fn atn_write_wakes_the_drive() {
        let mut bus = test_bus();
        bus.drive.idle = true;
        bus.write(0xdd02, 0x3f);
        bus.write(0xdd00, 0x08); // assert ATN
        assert!(!bus.drive.idle);
    }

    #[test]
    fn nmi_is_edge_consumed() {
        let mut bus = test_bus();
        bus.write(0xdd0d, 0x81); // enable CIA2 timer A interrupt
        bus.write(0xdd04, 0x02);
        bus.write(0xdd05, 0x00);
        bus.write(0xdd0e, 0x01); // start
        bus.cia2.count_timers(10);
        assert!(bus.nmi_pending());
        assert!(!bus.nmi_pending()); // consumed while the level holds
    }

    #[test]
    fn drive_sees_mounted_disk() {
        let mut bus = test_bus();
        bus.drive.insert_disk(D64::blank(), false);
        assert!(bus.drive.bus.disk.has_disk());
    }
}
