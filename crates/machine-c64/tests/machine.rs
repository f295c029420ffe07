//! Whole-machine tests: scheduler ordering, raster interrupts through
//! the CPU, the ATN handshake, drive jamming, and snapshots.

use machine_c64::c64::AddressSpace;
use machine_c64::{C64, D64, MachineConfig, RomSet};

/// A KERNAL image whose reset code arms a raster interrupt at line 100
/// and whose IRQ handler counts acknowledgements in $02.
fn raster_irq_kernal() -> Vec<u8> {
    let mut kernal = vec![0xea; 0x2000];
    let code: &[u8] = &[
        0x78, // SEI
        0xa9, 0x7f, // LDA #$7F
        0x8d, 0x0d, 0xdc, // STA $DC0D   disable CIA1 interrupts
        0xa9, 0x01, // LDA #$01
        0x8d, 0x1a, 0xd0, // STA $D01A   enable the raster interrupt
        0xa9, 0x64, // LDA #$64
        0x8d, 0x12, 0xd0, // STA $D012   compare line 100
        0xa9, 0x1b, // LDA #$1B
        0x8d, 0x11, 0xd0, // STA $D011   compare bit 8 clear, DEN on
        0x58, // CLI
        0x4c, 0x15, 0xe0, // JMP $E015   idle
    ];
    kernal[..code.len()].copy_from_slice(code);

    let handler: &[u8] = &[
        0xe6, 0x02, // INC $02     count one acknowledgement
        0xa9, 0x0f, // LDA #$0F
        0x8d, 0x19, 0xd0, // STA $D019   acknowledge
        0x40, // RTI
    ];
    kernal[0x0100..0x0100 + handler.len()].copy_from_slice(handler); // $E100

    kernal[0x1ffc] = 0x00; // reset -> $E000
    kernal[0x1ffd] = 0xe0;
    kernal[0x1ffe] = 0x00; // IRQ -> $E100
    kernal[0x1fff] = 0xe1;
    kernal
}

fn nop_kernal() -> Vec<u8> {
    let mut kernal = vec![0xea; 0x2000];
    kernal[0x1ffc] = 0x00;
    kernal[0x1ffd] = 0xe0;
    kernal[0x1ffe] = 0x00;
    kernal[0x1fff] = 0xe0;
    kernal
}

fn drive_rom() -> Vec<u8> {
    let mut rom = vec![0xea; 0x4000];
    rom[0x3ffc] = 0x00; // reset -> $C000
    rom[0x3ffd] = 0xc0;
    rom[0x3ffe] = 0x00; // IRQ -> $C000
    rom[0x3fff] = 0xc0;
    rom
}

fn make_c64(kernal: Vec<u8>) -> C64 {
    let roms = RomSet {
        basic: vec![0; 0x2000],
        kernal,
        chargen: vec![0; 0x1000],
        drive: drive_rom(),
    };
    C64::new(&roms, MachineConfig::default()).expect("valid ROMs")
}

#[test]
fn rom_sizes_are_validated() {
    let roms = RomSet {
        basic: vec![0; 16],
        kernal: nop_kernal(),
        chargen: vec![0; 0x1000],
        drive: drive_rom(),
    };
    assert!(C64::new(&roms, MachineConfig::default()).is_err());
}

#[test]
fn raster_irq_acknowledged_once_per_frame() {
    let mut c64 = make_c64(raster_irq_kernal());
    // Two full frames of lines; the compare line passes twice.
    for _ in 0..624 {
        c64.step_line();
    }
    let acks = c64.peek(AddressSpace::Main, 0x0002);
    assert_eq!(acks, 2, "expected one acknowledgement per frame");
}

#[test]
fn line_budget_reaches_the_cpu() {
    let mut c64 = make_c64(nop_kernal());
    for _ in 0..100 {
        let tick = c64.step_line();
        // A NOP sled consumes at least the whole budget; the final
        // instruction may overshoot by one cycle.
        assert!(tick.cpu_cycles >= 63 && tick.cpu_cycles <= 72);
    }
}

#[test]
fn frames_have_the_pal_line_count() {
    let mut c64 = make_c64(nop_kernal());
    let mut lines = 0u32;
    loop {
        lines += 1;
        if c64.step_line().vblank {
            break;
        }
    }
    // First frame from power-on: the raster starts just before the wrap.
    assert_eq!(lines, 1);
    let mut lines = 0u32;
    loop {
        lines += 1;
        if c64.step_line().vblank {
            break;
        }
    }
    assert_eq!(lines, 312);
}

#[test]
fn drive_runs_its_fixed_share_per_line() {
    let mut c64 = make_c64(nop_kernal());
    let before = c64.bus().drive.cpu.cycle_counter;
    for _ in 0..100 {
        c64.step_line();
    }
    let used = c64.bus().drive.cpu.cycle_counter - before;
    // 64 cycles per line, give or take instruction overshoot.
    assert!((6400..6600).contains(&used), "drive used {used} cycles");
}

#[test]
fn atn_handshake_reaches_the_drive() {
    let mut c64 = make_c64(nop_kernal());

    // Configure CIA2 like the KERNAL: IEC outputs, everything released.
    c64.poke(AddressSpace::Main, 0xdd02, 0x3f);
    c64.poke(AddressSpace::Main, 0xdd00, 0x03);
    // Clear the power-on edge history, then enable the drive's CA1
    // (ATN) interrupt, as the DOS does.
    c64.bus_mut().drive.bus.via1.write(0x0d, 0x7f);
    c64.bus_mut().drive.bus.via1.write(0x0e, 0x80 | 0x02);
    c64.bus_mut().drive.idle = true;

    // With ATN released, the drive's acknowledge circuit holds DATA low:
    // that is how the C64 senses a device on the bus.
    let pa = c64.peek(AddressSpace::Main, 0xdd00);
    assert_eq!(pa & 0x80, 0x00, "device presence holds DATA low");

    // Assert ATN: the negative edge must hit VIA1 CA1, raise the drive
    // IRQ, and wake the drive from idle.
    c64.poke(AddressSpace::Main, 0xdd00, 0x03 | 0x08);
    assert!(!c64.bus().drive.idle, "ATN edge should leave idle");
    assert!(c64.bus().drive.bus.via1.irq_active());
    let ifr = c64.bus_mut().drive.bus.via1.read(0x0d);
    assert_ne!(ifr & 0x02, 0, "CA1 flag set");

    // The acknowledge state now matches ATN, so the forced DATA is
    // released and the line reads high.
    let pa = c64.peek(AddressSpace::Main, 0xdd00);
    assert_eq!(pa & 0x80, 0x80, "DATA released by the acknowledge");

    // The bus is a wired AND: pulling DATA from the C64 side reads low.
    c64.poke(AddressSpace::Main, 0xdd00, 0x03 | 0x08 | 0x20);
    let pa = c64.peek(AddressSpace::Main, 0xdd00);
    assert_eq!(pa & 0x80, 0x00);

    // Releasing it reads high again.
    c64.poke(AddressSpace::Main, 0xdd00, 0x03 | 0x08);
    let pa = c64.peek(AddressSpace::Main, 0xdd00);
    assert_eq!(pa & 0x80, 0x80);
}

#[test]
fn drive_jam_notifies_once_and_freezes() {
    let mut c64 = make_c64(nop_kernal());
    // Plant an undefined opcode in drive RAM and jump there.
    c64.poke(AddressSpace::Drive, 0x0300, 0x02);
    c64.bus_mut().drive.cpu.pc = 0x0300;

    for _ in 0..4 {
        c64.step_line();
    }
    let note = c64.take_notification().expect("jam notification");
    assert!(note.contains("$0300"), "unexpected notification: {note}");
    assert!(c64.take_notification().is_none(), "only one notification");

    // The PC stays put and the machine keeps running.
    for _ in 0..320 {
        c64.step_line();
    }
    assert_eq!(c64.bus().drive.cpu.pc, 0x0300);
    assert!(c64.bus().drive.cpu.is_jammed());
    assert!(c64.take_notification().is_none());

    // A drive reset revives it.
    c64.reset_drive();
    c64.step_line();
    assert!(!c64.bus().drive.cpu.is_jammed());
}

#[test]
fn snapshot_restore_is_identity() {
    let mut c64 = make_c64(raster_irq_kernal());
    c64.insert_disk(D64::blank(), false);
    for _ in 0..3 {
        c64.run_frame();
    }
    let saved = c64.save_state_bytes();

    // Restoring onto a diverged machine reproduces the same state.
    let mut other = make_c64(raster_irq_kernal());
    other.insert_disk(D64::blank(), false);
    other.run_frame();
    other
        .restore_state_bytes(&saved)
        .expect("snapshot applies");
    assert_eq!(other.save_state_bytes(), saved);

    // And the machines evolve identically afterwards.
    c64.run_frame();
    other.run_frame();
    assert_eq!(other.save_state_bytes(), c64.save_state_bytes());
}

#[test]
fn corrupt_snapshot_leaves_state_intact() {
    let mut c64 = make_c64(nop_kernal());
    c64.poke(AddressSpace::Main, 0x1000, 0x55);
    let mut bytes = c64.save_state_bytes();
    bytes.truncate(bytes.len() / 2);
    assert!(c64.restore_state_bytes(&bytes).is_err());
    assert_eq!(c64.peek(AddressSpace::Main, 0x1000), 0x55);
}

#[test]
fn prg_load_fixes_basic_pointers() {
    let mut c64 = make_c64(nop_kernal());
    let prg = [0x01, 0x08, 0x0a, 0x00, 0x99, 0x22, 0x48, 0x49, 0x22, 0x00];
    let addr = c64.load_prg(&prg).expect("valid PRG");
    assert_eq!(addr, 0x0801);
    assert_eq!(c64.peek(AddressSpace::Main, 0x0801), 0x0a);
    let end = 0x0801 + (prg.len() as u16 - 2);
    assert_eq!(c64.peek(AddressSpace::Main, 0x2d), end.to_le_bytes()[0]);
    assert_eq!(c64.peek(AddressSpace::Main, 0x2e), end.to_le_bytes()[1]);
    assert!(c64.load_prg(&[0x00]).is_err());
}

#[test]
fn joystick_port_swap() {
    use machine_c64::JoystickState;
    let mut c64 = make_c64(nop_kernal());
    c64.poke(AddressSpace::Main, 0xdc02, 0x00);
    c64.poke(AddressSpace::Main, 0xdc03, 0x00);

    let fire = JoystickState {
        fire: true,
        ..JoystickState::default()
    };
    c64.set_joystick(2, fire);
    assert_eq!(c64.peek(AddressSpace::Main, 0xdc00) & 0x10, 0x00);

    c64.swap_joysticks();
    // The same host controller now lands on port 1 (CIA1 port B).
    c64.set_joystick(2, fire);
    assert_eq!(c64.peek(AddressSpace::Main, 0xdc01) & 0x10, 0x00);
}
