//! 1541 floppy drive: bus, IEC wiring, mechanics decode and DOS patches.
//!
//! The drive has its own 6502 at ~1 MHz, 2 KiB RAM, 16 KiB ROM and two
//! VIAs. VIA1 faces the IEC serial bus, VIA2 the disk controller.
//!
//! Memory map:
//!   $0000-$07FF  RAM, mirrored over the low half where no VIA decodes
//!   $1800-$1BFF  VIA1 (IEC)
//!   $1C00-$1FFF  VIA2 (disk)
//!   $8000-$FFFF  ROM (16 KiB, also mirrored at $8000)
//!   elsewhere    open bus; reads return the address high byte
//!
//! IEC line masks use ATN = $08, CLK = $10, DATA = $20 with a set bit
//! meaning the line is released (high). The bus level is the AND of all
//! participants' masks, and the ATN acknowledge circuit forces DATA low
//! independently of the drive's own DATA output.
//!
//! The drive ROM is patched with the `$F2` extension opcode at three
//! places; the sub-opcode selects going idle in the DOS loop, writing a
//! sector, or formatting a track, and execution resumes at a fixed ROM
//! address afterwards.

use mos_6502::{CpuBus, CpuState, Mos6502};
use mos_via_6522::Via6522;
use raster64_core::Bus;

use crate::d64::D64;
use crate::gcr::GcrDisk;

/// IEC line bits (released-high).
pub const IEC_ATN: u8 = 0x08;
pub const IEC_CLK: u8 = 0x10;
pub const IEC_DATA: u8 = 0x20;

/// Drive LED state, including the error blink the DOS signals through
/// its zero-page flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LedState {
    #[default]
    Off,
    On,
    ErrorOff,
    ErrorOn,
}

/// The drive's address space and peripherals.
pub struct DriveBus {
    pub ram: Box<[u8; 0x0800]>,
    rom: Box<[u8; 0x4000]>,
    pub via1: Via6522,
    pub via2: Via6522,
    pub disk: GcrDisk,

    /// The drive's own IEC contribution (released-high mask).
    iec_lines: u8,
    /// ATN acknowledge value derived from VIA1 PB4, as an ATN-bit mask.
    atn_ack: u8,
    /// CIA2's IEC contribution, refreshed by the machine on every change.
    cia2_lines: u8,

    led: LedState,
    reset_line: bool,
    /// Address of a jam, reported once to the host.
    jam_notice: Option<u16>,
    /// Idle transition requested by the extension opcode.
    idle_request: Option<bool>,
    /// Cycle counter mirror for disk timing inside bus accesses.
    cycle: u32,
}

impl DriveBus {
    fn new(rom: Box<[u8; 0x4000]>) -> Self {
        Self {
            ram: Box::new([0; 0x0800]),
            rom,
            via1: Via6522::new(),
            via2: Via6522::new(),
            disk: GcrDisk::new(),
            iec_lines: IEC_ATN | IEC_CLK | IEC_DATA,
            atn_ack: IEC_ATN,
            cia2_lines: IEC_ATN | IEC_CLK | IEC_DATA,
            led: LedState::Off,
            reset_line: false,
            jam_notice: None,
            idle_request: None,
            cycle: 0,
        }
    }

    /// Physical state of the IEC lines as seen on the wire: the AND of
    /// both participants, with the ATN acknowledge forcing DATA.
    #[must_use]
    pub fn calc_iec_lines(&self) -> u8 {
        let iec = self.iec_lines & self.cia2_lines;
        iec & (((iec ^ self.atn_ack) << 2) | !IEC_DATA)
    }

    /// Latch the drive's IEC outputs from the inverted VIA1 port B value:
    /// DATA on PB1, CLK on PB3, ATN acknowledge on PB4. The drive never
    /// drives ATN.
    fn set_iec_lines(&mut self, inv_out: u8) {
        self.iec_lines = ((inv_out & 0x02) << 4) | ((inv_out & 0x08) << 1) | IEC_ATN;
        self.atn_ack = (!inv_out & 0x10) >> 1;
    }

    /// Decode a VIA2 port B change into drive mechanics.
    fn update_mechanics(&mut self, old_pb: u8, new_pb: u8) {
        let changed = old_pb ^ new_pb;

        // Bits 0-1: stepper motor phase. A step in phase sequence moves
        // the head one half track.
        if changed & 0x03 != 0 {
            if old_pb & 3 == (new_pb.wrapping_add(1)) & 3 {
                self.disk.move_head_out();
            } else if old_pb & 3 == (new_pb.wrapping_sub(1)) & 3 {
                self.disk.move_head_in();
            }
        }

        // Bit 2: spindle motor.
        if changed & 0x04 != 0 {
            self.disk.set_motor(new_pb & 0x04 != 0);
        }

        // Bit 3: drive LED. The DOS error flag and pending-attention
        // bytes in zero page select the blink variant.
        let error = self.ram[0x26c] != 0 && self.ram[0x7c] == 0;
        self.led = match (new_pb & 0x08 != 0, error) {
            (true, true) => LedState::ErrorOn,
            (false, true) => LedState::ErrorOff,
            (true, false) => LedState::On,
            (false, false) => LedState::Off,
        };

        // Bits 5-6: GCR bit rate.
        if changed & 0x60 != 0 {
            self.disk.set_bit_rate((new_pb >> 5) & 0x03);
        }
    }

    /// Write a sector through the DOS job parameters: header track and
    /// sector in zero page, payload in the $0400 job buffer.
    fn service_write_sector(&mut self) {
        let track = self.ram[0x18];
        let sector = self.ram[0x19];
        let mut data = [0u8; 256];
        data.copy_from_slice(&self.ram[0x400..0x500]);
        self.disk.write_sector(track, sector, &data);
    }
}

impl Bus for DriveBus {
    fn read(&mut self, addr: u16) -> u8 {
        if addr >= 0x8000 {
            self.rom[(addr & 0x3fff) as usize]
        } else if addr & 0x1800 == 0x0000 {
            self.ram[(addr & 0x07ff) as usize]
        } else if addr & 0x1c00 == 0x1800 {
            match addr & 0x0f {
                0x00 => {
                    // The drive reads the bus lines inverted: DATA on
                    // PB0, CLK on PB2, ATN on PB7; output lines high.
                    let iec = !self.calc_iec_lines();
                    let in_b = ((iec & IEC_DATA) >> 5)
                        | ((iec & IEC_CLK) >> 2)
                        | ((iec & IEC_ATN) << 4)
                        | 0x1a;
                    self.via1.set_pb_in(in_b);
                }
                0x01 | 0x0f => self.via1.set_pa_in(0xff),
                _ => {}
            }
            self.via1.read((addr & 0x0f) as u8)
        } else if addr & 0x1c00 == 0x1c00 {
            match addr & 0x0f {
                0x00 => {
                    // Write protect on PB4, sync (active low) on PB7.
                    let mut in_b = if self.disk.wp_sensor_closed() { 0 } else { 0x10 };
                    if !self.disk.sync_found(self.cycle) {
                        in_b |= 0x80;
                    }
                    self.via2.set_pb_in(in_b);
                }
                0x01 | 0x0f => {
                    let byte = self.disk.read_byte(self.cycle);
                    self.via2.set_pa_in(byte);
                }
                _ => {}
            }
            self.via2.read((addr & 0x0f) as u8)
        } else {
            // Open address.
            (addr >> 8) as u8
        }
    }

    fn write(&mut self, addr: u16, byte: u8) {
        if addr >= 0x8000 {
            // ROM; writes ignored.
        } else if addr & 0x1800 == 0x0000 {
            self.ram[(addr & 0x07ff) as usize] = byte;
        } else if addr & 0x1c00 == 0x1800 {
            self.via1.write((addr & 0x0f) as u8, byte);
            if matches!(addr & 0x0f, 0x00 | 0x02) {
                let inv_out = !self.via1.pb_out();
                self.set_iec_lines(inv_out);
            }
        } else if addr & 0x1c00 == 0x1c00 {
            let old_pb = self.via2.pb_out();
            self.via2.write((addr & 0x0f) as u8, byte);
            if matches!(addr & 0x0f, 0x00 | 0x02) {
                let new_pb = self.via2.pb_out();
                self.update_mechanics(old_pb, new_pb);
            }
        }
    }
}

impl CpuBus for DriveBus {
    fn irq_pending(&self) -> bool {
        self.via1.irq_active() || self.via2.irq_active()
    }

    fn reset_pending(&self) -> bool {
        self.reset_line
    }

    fn take_reset(&mut self) {
        self.reset_line = false;
        self.via1.reset();
        self.via2.reset();
        self.iec_lines = IEC_ATN | IEC_CLK | IEC_DATA;
        self.atn_ack = IEC_ATN;
        self.jam_notice = None;
        self.idle_request = Some(false);
    }

    fn check_so(&mut self, cycle_counter: u32) -> bool {
        self.cycle = cycle_counter;
        // SO is wired to byte-ready, gated by VIA2 CA2 (manual high).
        self.via2.ca2_manual_high() && self.disk.byte_ready(cycle_counter)
    }

    fn extension_op(&mut self, addr: u16, sub: u8) -> Option<u16> {
        if addr < 0xc000 {
            return None;
        }
        match sub {
            0x00 => {
                // Sleep in the DOS idle loop unless an error is shown or
                // attention is pending.
                self.idle_request = Some(self.ram[0x26c] == 0 && self.ram[0x7c] == 0);
                Some(0xebff)
            }
            0x01 => {
                self.service_write_sector();
                Some(0xf5dc)
            }
            0x02 => {
                self.disk.format_track();
                Some(0xfd8b)
            }
            _ => None,
        }
    }

    fn on_jam(&mut self, addr: u16) {
        self.jam_notice = Some(addr);
    }
}

/// The 1541 drive: CPU, bus, and the idle flag the DOS loop patch uses.
pub struct Drive1541 {
    pub cpu: Mos6502,
    pub bus: DriveBus,
    /// The drive sits in its DOS idle loop waiting for the bus.
    pub idle: bool,
    /// Previous ATN level for transition wake-up.
    prev_atn: bool,
}

impl Drive1541 {
    /// Create a drive around a 16 KiB DOS ROM image.
    pub fn new(rom: &[u8]) -> Result<Self, String> {
        if rom.len() != 0x4000 {
            return Err(format!(
                "1541 ROM must be 16384 bytes, got {}",
                rom.len()
            ));
        }
        let mut rom_box = Box::new([0u8; 0x4000]);
        rom_box.copy_from_slice(rom);
        let mut bus = DriveBus::new(rom_box);
        let mut cpu = Mos6502::new();
        cpu.reset(&mut bus);
        Ok(Self {
            cpu,
            bus,
            idle: false,
            prev_atn: true,
        })
    }

    /// Request a reset at the next instruction boundary and wake the
    /// drive up so it gets there.
    pub fn async_reset(&mut self) {
        self.bus.reset_line = true;
        self.idle = false;
    }

    /// Hard reset: VIAs, IEC lines, CPU vector fetch.
    pub fn reset(&mut self) {
        self.bus.take_reset();
        self.idle = false;
        self.cpu.reset(&mut self.bus);
    }

    /// Refresh the CIA2 contribution to the IEC bus and wake the drive
    /// on any line transition. Drives VIA1 CA1 from the ATN level.
    pub fn set_cia2_lines(&mut self, lines: u8) {
        let changed = self.bus.cia2_lines != lines;
        self.bus.cia2_lines = lines;
        if changed {
            self.idle = false;
        }

        let atn_high = lines & IEC_ATN != 0;
        if atn_high != self.prev_atn {
            // Negative edge raises the VIA1 CA1 interrupt.
            self.bus.via1.set_ca1(atn_high);
            self.prev_atn = atn_high;
        }
    }

    /// Physical IEC line state contributed by the drive side, combined
    /// with the stored CIA2 view.
    #[must_use]
    pub fn iec_lines(&self) -> u8 {
        self.bus.calc_iec_lines()
    }

    /// Run the drive CPU for one line's share of cycles.
    pub fn emulate_line(&mut self, cycles: i32) -> i32 {
        if self.bus.irq_pending() {
            self.idle = false;
        }

        let used = if self.idle {
            // The mechanism keeps turning while the CPU sleeps.
            self.cpu.cycle_counter = self.cpu.cycle_counter.wrapping_add(cycles.max(0) as u32);
            cycles
        } else {
            self.cpu.emulate_line(&mut self.bus, cycles)
        };

        if let Some(idle) = self.bus.idle_request.take() {
            self.idle = idle;
        }
        used
    }

    /// Count the VIA timers for this line and wake the CPU if one fired.
    pub fn count_via_timers(&mut self, cycles: u32) {
        self.bus.via1.count_timers(cycles);
        self.bus.via2.count_timers(cycles);
        if self.bus.irq_pending() {
            self.idle = false;
        }
    }

    /// One-shot jam notification for the host.
    pub fn take_jam(&mut self) -> Option<u16> {
        self.bus.jam_notice.take()
    }

    /// Drive LED state for the host.
    #[must_use]
    pub fn led(&self) -> LedState {
        self.bus.led
    }

    /// Insert a disk image.
    pub fn insert_disk(&mut self, image: D64, write_protected: bool) {
        self.bus.disk.mount(image, write_protected);
        self.idle = false;
    }

    /// Remove the disk, returning the (possibly modified) image.
    pub fn eject_disk(&mut self) -> Option<D64> {
        self.bus.disk.eject()
    }

    /// Capture CPU state plus idle flag for snapshots.
    #[must_use]
    pub fn cpu_state(&self) -> (CpuState, bool) {
        (self.cpu.state(), self.idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rom() -> Vec<u8> {
        let mut rom = vec![0xea; 0x4000]; // NOP sled
        rom[0x3ffc] = 0x00; // reset vector -> $C000
        rom[0x3ffd] = 0xc0;
        rom
    }

    fn make_drive() -> Drive1541 {
        Drive1541::new(&test_rom()).expect("valid ROM")
    }

    #[test]
    fn rom_length_is_checked() {
        assert!(Drive1541::new(&[0; 100]).is_err());
    }

    #[test]
    fn reset_vector_is_fetched_from_rom() {
        let drive = make_drive();
        assert_eq!(drive.cpu.pc, 0xc000);
    }

    #[test]
    fn address_decoding() {
        let mut drive = make_drive();
        // RAM, mirrored every $2000 in the low half.
        drive.bus.write(0x0123, 0xab);
        assert_eq!(drive.bus.read(0x0123), 0xab);
        assert_eq!(drive.bus.read(0x2123), 0xab);
        // VIA1 / VIA2 DDR registers.
        drive.bus.write(0x1803, 0xff);
        assert_eq!(drive.bus.read(0x1803), 0xff);
        drive.bus.write(0x1c02, 0xaa);
        assert_eq!(drive.bus.read(0x1c12), 0xaa); // VIA mirror
        // ROM and its mirror.
        assert_eq!(drive.bus.read(0xc000), 0xea);
        assert_eq!(drive.bus.read(0x8000), 0xea);
        drive.bus.write(0xc000, 0x00);
        assert_eq!(drive.bus.read(0xc000), 0xea);
        // Open addresses return the high byte.
        assert_eq!(drive.bus.read(0x0923), 0x09);
        assert_eq!(drive.bus.read(0x1245), 0x12);
    }

    #[test]
    fn iec_lines_follow_via1_port_b() {
        let mut drive = make_drive();
        // Fresh out of reset the ATN acknowledge state holds DATA low:
        // that is how a powered-on drive signals its presence.
        assert_eq!(drive.iec_lines(), IEC_ATN | IEC_CLK);

        // DATA out on PB1, CLK out on PB3; 1 = pull low on the wire.
        drive.bus.write(0x1802, 0x1a); // DDR B: PB1/PB3/PB4 outputs
        drive.bus.write(0x1800, 0x02); // pull DATA
        assert_eq!(drive.iec_lines() & IEC_DATA, 0);
        assert_eq!(drive.iec_lines() & IEC_CLK, IEC_CLK);

        drive.bus.write(0x1800, 0x08); // pull CLK instead
        assert_eq!(drive.iec_lines() & IEC_CLK, 0);
        assert_eq!(drive.iec_lines() & IEC_DATA, IEC_DATA);
    }

    #[test]
    fn bus_is_wired_and_of_both_sides() {
        let mut drive = make_drive();
        drive.set_cia2_lines(IEC_ATN | IEC_CLK); // C64 pulls DATA
        assert_eq!(drive.iec_lines() & IEC_DATA, 0);

        // The drive pulling too keeps it low; releasing one side is not
        // enough.
        drive.bus.write(0x1802, 0x1a);
        drive.bus.write(0x1800, 0x02);
        assert_eq!(drive.iec_lines() & IEC_DATA, 0);
        drive.set_cia2_lines(IEC_ATN | IEC_CLK | IEC_DATA);
        assert_eq!(drive.iec_lines() & IEC_DATA, 0);
        drive.bus.write(0x1800, 0x00);
        assert_eq!(drive.iec_lines() & IEC_DATA, IEC_DATA);
    }

    #[test]
    fn atn_acknowledge_forces_data_low() {
        let mut drive = make_drive();
        drive.bus.write(0x1802, 0x1a);
        drive.bus.write(0x1800, 0x00); // DATA output released, PB4 low

        // ATN asserted while the acknowledge bit does not match: DATA is
        // forced low although the drive's own DATA output is released.
        drive.set_cia2_lines(IEC_CLK | IEC_DATA);
        assert_eq!(drive.iec_lines() & IEC_DATA, 0);

        // Raising PB4 acknowledges ATN and releases the forced DATA.
        drive.bus.write(0x1800, 0x10);
        assert_eq!(drive.iec_lines() & IEC_DATA, IEC_DATA);
    }

    #[test]
    fn via1_port_b_reads_inverted_bus_lines() {
        let mut drive = make_drive();
        drive.bus.write(0x1802, 0x1a); // PB0/PB2/PB7 stay inputs
        drive.bus.write(0x1800, 0x10); // acknowledge ATN, outputs released
        drive.set_cia2_lines(IEC_CLK | IEC_DATA); // ATN asserted

        let pb = drive.bus.read(0x1800);
        assert_eq!(pb & 0x01, 0x00); // DATA high -> PB0 reads 0
        assert_eq!(pb & 0x04, 0x00); // CLK high -> PB2 reads 0
        assert_eq!(pb & 0x80, 0x80); // ATN low -> PB7 reads 1

        drive.set_cia2_lines(IEC_ATN | IEC_CLK); // DATA pulled, ATN released
        let pb = drive.bus.read(0x1800);
        assert_eq!(pb & 0x01, 0x01);
        assert_eq!(pb & 0x80, 0x00);
    }

    #[test]
    fn atn_edge_raises_via1_ca1_and_wakes_the_drive() {
        let mut drive = make_drive();
        drive.bus.via1.write(0x0e, 0x80 | 0x02); // enable CA1 interrupt
        drive.idle = true;

        // ATN falls: negative edge.
        drive.set_cia2_lines(IEC_CLK | IEC_DATA);
        assert!(drive.bus.via1.irq_active());
        assert!(!drive.idle);

        // The pending VIA interrupt reaches the CPU on the next line.
        let rom_irq = {
            let mut rom = test_rom();
            rom[0x3ffe] = 0x00; // IRQ vector -> $C100
            rom[0x3fff] = 0xc1;
            rom
        };
        let mut drive = Drive1541::new(&rom_irq).expect("valid ROM");
        drive.bus.via1.write(0x0e, 0x80 | 0x02);
        drive.cpu.set_status(0x00); // clear I so the IRQ is taken
        drive.set_cia2_lines(IEC_CLK | IEC_DATA);
        drive.emulate_line(8);
        assert_eq!(drive.cpu.pc & 0xff00, 0xc100);
    }

    #[test]
    fn stepper_phases_move_the_head() {
        let mut drive = make_drive();
        drive.insert_disk(D64::blank(), false);
        let start = drive.bus.disk.track();

        drive.bus.write(0x1c02, 0x6f); // DDR B: stepper/motor/LED/rate out
        // Two half-track steps inward: phase 0 -> 1 -> 2.
        drive.bus.write(0x1c00, 0x01);
        drive.bus.write(0x1c00, 0x02);
        assert_eq!(drive.bus.disk.track(), start + 1);
        // And back out.
        drive.bus.write(0x1c00, 0x01);
        drive.bus.write(0x1c00, 0x00);
        assert_eq!(drive.bus.disk.track(), start);
    }

    #[test]
    fn motor_led_and_bit_rate_decode() {
        let mut drive = make_drive();
        drive.bus.write(0x1c02, 0x6f);
        drive.bus.write(0x1c00, 0x0c); // motor + LED
        assert!(drive.bus.disk.motor_on());
        assert_eq!(drive.led(), LedState::On);

        drive.bus.ram[0x26c] = 1; // DOS error flag
        drive.bus.write(0x1c00, 0x6c); // bit rate 3, motor, LED
        assert_eq!(drive.led(), LedState::ErrorOn);
    }

    #[test]
    fn extension_op_goes_idle_only_without_pending_work() {
        // Patch an $F2 $00 at the reset target.
        let mut rom = test_rom();
        rom[0x0000] = 0xf2; // $C000
        rom[0x0001] = 0x00;
        let mut drive = Drive1541::new(&rom).expect("valid ROM");
        drive.emulate_line(2);
        assert!(drive.idle);
        assert_eq!(drive.cpu.pc, 0xebff);

        // With the attention byte set, the drive stays awake.
        let mut busy = Drive1541::new(&rom).expect("valid ROM");
        busy.bus.ram[0x7c] = 1;
        busy.emulate_line(2);
        assert!(!busy.idle);
    }

    #[test]
    fn extension_write_sector_uses_job_parameters() {
        let mut rom = test_rom();
        rom[0x0000] = 0xf2;
        rom[0x0001] = 0x01;
        let mut drive = Drive1541::new(&rom).expect("valid ROM");
        drive.insert_disk(D64::blank(), false);
        drive.bus.ram[0x18] = 18; // track
        drive.bus.ram[0x19] = 1; // sector
        drive.bus.ram[0x400] = 0x5a;
        drive.emulate_line(2);
        assert_eq!(drive.cpu.pc, 0xf5dc);
        let image = drive.eject_disk().unwrap();
        assert_eq!(image.read_sector(18, 1).unwrap()[0], 0x5a);
    }

    #[test]
    fn extension_op_outside_rom_jams() {
        let mut drive = make_drive();
        drive.bus.ram[0x300] = 0xf2;
        drive.bus.ram[0x301] = 0x00;
        drive.cpu.pc = 0x0300;
        drive.emulate_line(8);
        assert!(drive.cpu.is_jammed());
        assert_eq!(drive.take_jam(), Some(0x0300));
        assert_eq!(drive.take_jam(), None);
    }

    #[test]
    fn jammed_drive_freezes_until_reset() {
        let mut drive = make_drive();
        drive.bus.ram[0x200] = 0x02;
        drive.cpu.pc = 0x0200;
        drive.emulate_line(64);
        assert!(drive.cpu.is_jammed());
        assert_eq!(drive.cpu.pc, 0x0200);
        drive.emulate_line(64);
        assert_eq!(drive.cpu.pc, 0x0200);

        drive.async_reset();
        drive.emulate_line(64);
        assert!(!drive.cpu.is_jammed());
        assert_ne!(drive.cpu.pc, 0x0200);
    }

    #[test]
    fn idle_drive_burns_cycles_without_executing() {
        let mut drive = make_drive();
        drive.idle = true;
        let pc = drive.cpu.pc;
        let counter = drive.cpu.cycle_counter;
        let used = drive.emulate_line(64);
        assert_eq!(used, 64);
        assert_eq!(drive.cpu.pc, pc);
        assert_eq!(drive.cpu.cycle_counter, counter + 64);
    }
}
