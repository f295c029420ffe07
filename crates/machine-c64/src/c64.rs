//! Top-level machine: the line-stepped scheduler and the host surface.
//!
//! One call to [`C64::step_line`] advances the whole machine by a raster
//! line, in a fixed order: the VIC renders the line and computes the CPU
//! budget, the main CPU runs, the CIA timers count the consumed cycles,
//! the drive CPU runs its nominal share, and the VIA timers and disk
//! head follow. Interrupts raised during rendering reach the CPU at its
//! next sampling point; register writes made by the CPU land on the
//! following line.

use std::collections::VecDeque;

use mos_6502::Mos6502;
use raster64_core::FrameBuffer;

use crate::bus::C64Bus;
use crate::config::{MachineConfig, TimingMode};
use crate::d64::D64;
use crate::drive::Drive1541;
use crate::input::{C64Key, InputQueue, JoystickState};
use crate::snapshot::Snapshot;
use crate::vic::{DISPLAY_X, DISPLAY_Y};

/// The ROM images the machine needs.
pub struct RomSet {
    /// 8 KiB BASIC ROM ($A000).
    pub basic: Vec<u8>,
    /// 8 KiB KERNAL ROM ($E000).
    pub kernal: Vec<u8>,
    /// 4 KiB character generator ROM.
    pub chargen: Vec<u8>,
    /// 16 KiB 1541 DOS ROM.
    pub drive: Vec<u8>,
}

/// Result of one scheduler step.
#[derive(Clone, Copy, Debug)]
pub struct LineTick {
    /// The frame wrapped: present the buffer.
    pub vblank: bool,
    /// Cycles the main CPU consumed this line.
    pub cpu_cycles: u32,
}

/// Which emulated address space an external access targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    Main,
    Drive,
}

/// The Commodore 64 with its 1541 drive.
pub struct C64 {
    config: MachineConfig,
    pub(crate) cpu: Mos6502,
    pub(crate) bus: C64Bus,
    pub(crate) frame: FrameBuffer,
    frame_count: u64,
    /// Frames until the next TOD tenth-of-a-second tick.
    tod_countdown: u32,
    input_queue: InputQueue,
    joysticks_swapped: bool,
    notifications: VecDeque<String>,
}

impl C64 {
    /// Build a machine from its ROM images.
    pub fn new(roms: &RomSet, config: MachineConfig) -> Result<Self, String> {
        fn rom_box<const N: usize>(data: &[u8], name: &str) -> Result<Box<[u8; N]>, String> {
            if data.len() != N {
                return Err(format!("{name} ROM must be {N} bytes, got {}", data.len()));
            }
            let mut b = Box::new([0u8; N]);
            b.copy_from_slice(data);
            Ok(b)
        }

        let basic = rom_box::<0x2000>(&roms.basic, "BASIC")?;
        let kernal = rom_box::<0x2000>(&roms.kernal, "KERNAL")?;
        let chargen = rom_box::<0x1000>(&roms.chargen, "character")?;
        let drive = Drive1541::new(&roms.drive)?;

        let mut bus = C64Bus::new(basic, kernal, chargen, drive, &config);
        let mut cpu = Mos6502::new();
        cpu.reset(&mut bus);

        Ok(Self {
            config,
            cpu,
            bus,
            frame: FrameBuffer::new(DISPLAY_X, DISPLAY_Y),
            frame_count: 0,
            tod_countdown: 0,
            input_queue: InputQueue::new(),
            joysticks_swapped: false,
            notifications: VecDeque::new(),
        })
    }

    /// Advance the machine by one raster line.
    pub fn step_line(&mut self) -> LineTick {
        // 1. Video: render the line, compute the CPU budget, raise the
        //    raster interrupt.
        let line = self.bus.emulate_vic_line(&mut self.frame);

        // 2. Main CPU.
        let used = self.cpu.emulate_line(&mut self.bus, line.cycles);
        let cpu_cycles = used.max(0) as u32;

        // 3. CIA timers follow the consumed cycles.
        self.bus.cia1.count_timers(cpu_cycles);
        self.bus.cia2.count_timers(cpu_cycles);

        // 4. Drive: a fixed per-line share, clock-ratio compensated, then
        //    its VIA timers.
        let drive_cycles = self.config.drive_cycles_per_line;
        let lines = self.bus.cia2_iec_lines();
        self.bus.drive.set_cia2_lines(lines);
        self.bus.drive.emulate_line(drive_cycles);
        self.bus.drive.count_via_timers(drive_cycles as u32);

        if let Some(addr) = self.bus.drive.take_jam() {
            self.notifications.push_back(format!(
                "1541 processor jammed at ${addr:04X}; reset the drive to continue"
            ));
        }

        if line.vblank {
            self.frame_count += 1;
            self.tick_tod();
            let queue = &mut self.input_queue;
            let keyboard = &mut self.bus.keyboard;
            queue.drain_due(self.frame_count, |key, pressed| {
                let (row, col) = key.matrix();
                keyboard.set_key(row, col, pressed);
            });
        }

        LineTick {
            vblank: line.vblank,
            cpu_cycles,
        }
    }

    fn tick_tod(&mut self) {
        let frames_per_tenth = match self.config.timing {
            TimingMode::Pal => 5,
            TimingMode::Ntsc => 6,
        };
        self.tod_countdown += 1;
        if self.tod_countdown >= frames_per_tenth {
            self.tod_countdown = 0;
            self.bus.cia1.tick_tod();
            self.bus.cia2.tick_tod();
        }
    }

    /// Run until the next frame is complete. Returns the CPU cycles
    /// consumed.
    pub fn run_frame(&mut self) -> u32 {
        let mut cycles = 0;
        loop {
            let tick = self.step_line();
            cycles += tick.cpu_cycles;
            if tick.vblank {
                return cycles;
            }
        }
    }

    /// Reset the machine. `clear_memory` also wipes RAM and colour RAM.
    pub fn reset(&mut self, clear_memory: bool) {
        if clear_memory {
            self.bus.ram.fill(0);
            self.bus.color_ram.fill(0);
        }
        self.bus.port_ddr = 0x2f;
        self.bus.port_data = 0x37;
        self.bus.cia1.reset();
        self.bus.cia2.reset();
        self.bus.sync_cia2_outputs();
        self.bus.drive.reset();
        self.cpu.reset(&mut self.bus);
    }

    /// Request a reset of the drive only, taken at its next instruction
    /// boundary.
    pub fn reset_drive(&mut self) {
        self.bus.drive.async_reset();
    }

    // --- Host surface ---

    /// The chunky frame buffer.
    #[must_use]
    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }

    /// Ask for a new frame geometry; applied at the next frame start.
    pub fn request_frame_resize(&mut self, width: usize, height: usize, xmod: usize) {
        self.frame.request_resize(width, height, xmod);
    }

    /// Completed frame count.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// One-shot host notifications (drive jam and the like).
    pub fn take_notification(&mut self) -> Option<String> {
        self.notifications.pop_front()
    }

    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[must_use]
    pub fn cpu(&self) -> &Mos6502 {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Mos6502 {
        &mut self.cpu
    }

    #[must_use]
    pub fn bus(&self) -> &C64Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut C64Bus {
        &mut self.bus
    }

    // --- Input mailbox ---

    /// Press a key immediately.
    pub fn press_key(&mut self, key: C64Key) {
        let (row, col) = key.matrix();
        self.bus.keyboard.set_key(row, col, true);
    }

    /// Release a key.
    pub fn release_key(&mut self, key: C64Key) {
        let (row, col) = key.matrix();
        self.bus.keyboard.set_key(row, col, false);
    }

    /// Timed key sequences, drained at frame starts.
    pub fn input_queue(&mut self) -> &mut InputQueue {
        &mut self.input_queue
    }

    /// Set the state of a control port (1 or 2). The swap toggle decides
    /// which physical port the state lands on.
    pub fn set_joystick(&mut self, port: u8, state: JoystickState) {
        let mask = state.to_mask();
        let mut target = port;
        if self.joysticks_swapped {
            target = if port == 1 { 2 } else { 1 };
        }
        if target == 1 {
            self.bus.joystick1 = mask;
        } else {
            self.bus.joystick2 = mask;
        }
    }

    /// Swap which host controller maps to which control port.
    pub fn swap_joysticks(&mut self) {
        self.joysticks_swapped = !self.joysticks_swapped;
        std::mem::swap(&mut self.bus.joystick1, &mut self.bus.joystick2);
    }

    // --- Media ---

    /// Insert a D64 into the drive.
    pub fn insert_disk(&mut self, image: D64, write_protected: bool) {
        self.bus.drive.insert_disk(image, write_protected);
    }

    /// Remove the disk, returning the (possibly modified) image.
    pub fn eject_disk(&mut self) -> Option<D64> {
        self.bus.drive.eject_disk()
    }

    /// Load a PRG into main RAM. Returns the load address. Loads at the
    /// BASIC start also fix up the BASIC program pointers.
    pub fn load_prg(&mut self, data: &[u8]) -> Result<u16, String> {
        if data.len() < 2 {
            return Err("PRG file too short".to_string());
        }
        let load_addr = u16::from_le_bytes([data[0], data[1]]);
        for (i, &byte) in data[2..].iter().enumerate() {
            let addr = load_addr.wrapping_add(i as u16);
            self.bus.ram[addr as usize] = byte;
        }
        if load_addr == 0x0801 {
            let end = load_addr.wrapping_add((data.len() - 2) as u16);
            let [lo, hi] = end.to_le_bytes();
            // VARTAB, ARYTAB and STREND all point past the program.
            for ptr in [0x2d, 0x2f, 0x31] {
                self.bus.ram[ptr] = lo;
                self.bus.ram[ptr + 1] = hi;
            }
        }
        Ok(load_addr)
    }

    // --- External monitor pass-through ---

    /// Read a byte from an emulated address space, with the bus side
    /// effects a real access has.
    pub fn peek(&mut self, space: AddressSpace, addr: u16) -> u8 {
        use raster64_core::Bus;
        match space {
            AddressSpace::Main => self.bus.read(addr),
            AddressSpace::Drive => self.bus.drive.bus.read(addr),
        }
    }

    /// Write a byte into an emulated address space.
    pub fn poke(&mut self, space: AddressSpace, addr: u16, value: u8) {
        use raster64_core::Bus;
        match space {
            AddressSpace::Main => self.bus.write(addr, value),
            AddressSpace::Drive => self.bus.drive.bus.write(addr, value),
        }
    }

    // --- Snapshots ---

    /// Capture the machine state.
    #[must_use]
    pub fn save_state(&self) -> Snapshot {
        let (drive_cpu, drive_idle) = self.bus.drive.cpu_state();
        Snapshot {
            cpu: self.cpu.state(),
            drive_cpu,
            drive_idle,
            vic: self.bus.vic.state(),
            cia1: self.bus.cia1.state(),
            cia2: self.bus.cia2.state(),
            via1: self.bus.drive.bus.via1.state(),
            via2: self.bus.drive.bus.via2.state(),
            disk: self.bus.drive.bus.disk.state(),
            port_ddr: self.bus.port_ddr,
            port_data: self.bus.port_data,
            ram: self.bus.ram.clone(),
            color_ram: self.bus.color_ram.clone(),
            sid_registers: self.bus.sid_registers,
            drive_ram: self.bus.drive.bus.ram.clone(),
            keyboard_rows: self.bus.keyboard.rows(),
            frame_count: self.frame_count,
            tod_countdown: self.tod_countdown,
        }
    }

    /// Restore a previously captured state.
    pub fn restore_state(&mut self, s: &Snapshot) {
        self.cpu.restore(&s.cpu);
        self.bus.drive.cpu.restore(&s.drive_cpu);
        self.bus.vic.restore(&s.vic);
        self.bus.cia1.restore(&s.cia1);
        self.bus.cia2.restore(&s.cia2);
        self.bus.drive.bus.via1.restore(&s.via1);
        self.bus.drive.bus.via2.restore(&s.via2);
        self.bus.drive.bus.disk.restore(&s.disk);
        self.bus.port_ddr = s.port_ddr;
        self.bus.port_data = s.port_data;
        self.bus.ram.copy_from_slice(s.ram.as_ref());
        self.bus.color_ram.copy_from_slice(s.color_ram.as_ref());
        self.bus.sid_registers = s.sid_registers;
        self.bus.drive.bus.ram.copy_from_slice(s.drive_ram.as_ref());
        self.bus.keyboard.set_rows(s.keyboard_rows);
        self.frame_count = s.frame_count;
        self.tod_countdown = s.tod_countdown;
        // Re-drive the shared lines from the restored registers; the
        // idle flag lands last so the line sync cannot wake the drive.
        self.bus.sync_cia2_outputs();
        self.bus.drive.idle = s.drive_idle;
    }

    /// Save the machine state as bytes.
    #[must_use]
    pub fn save_state_bytes(&self) -> Vec<u8> {
        self.save_state().to_bytes()
    }

    /// Restore from snapshot bytes. On failure the current state is left
    /// untouched.
    pub fn restore_state_bytes(&mut self, data: &[u8]) -> Result<(), String> {
        let snapshot = Snapshot::from_bytes(data)?;
        self.restore_state(&snapshot);
        Ok(())
    }
}
