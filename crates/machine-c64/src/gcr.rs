//! GCR track model and drive mechanics.
//!
//! The 1541 records data as GCR: every 4 bits map to a 5-bit code with
//! at most two consecutive zero bits. A sector on disk is
//!
//!   sync (5 x $FF), 10 GCR header bytes, 9 x $55 gap,
//!   sync (5 x $FF), 325 GCR data bytes, 9 x $55 gap.
//!
//! [`GcrDisk`] owns everything the drive CPU observes of the mechanism:
//! spindle motor, half-track head position, the zone-dependent byte
//! clock, sync detection, the byte-ready line, and the write-protect
//! sensor. The DOS-patch services write whole sectors back through the
//! codec rather than modelling flux-level writes.

use crate::d64::D64;

/// 4-bit to 5-bit GCR code table.
const GCR_ENCODE: [u8; 16] = [
    0x0a, 0x0b, 0x12, 0x13, 0x0e, 0x0f, 0x16, 0x17,
    0x09, 0x19, 0x1a, 0x1b, 0x0d, 0x1d, 0x1e, 0x15,
];

/// 5-bit to 4-bit decode table; invalid codes map to $FF.
const GCR_DECODE: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0x08, 0x00, 0x01, 0xff, 0x0c, 0x04, 0x05,
    0xff, 0xff, 0x02, 0x03, 0xff, 0x0f, 0x06, 0x07,
    0xff, 0x09, 0x0a, 0x0b, 0xff, 0x0d, 0x0e, 0xff,
];

/// Encoded length of one sector including syncs and gaps.
const SECTOR_GCR_LEN: usize = 5 + 10 + 9 + 5 + 325 + 9;

/// Speed zone of a track (0 = outermost and fastest).
#[must_use]
pub fn speed_zone(track: u8) -> u8 {
    match track {
        1..=17 => 3,
        18..=24 => 2,
        25..=30 => 1,
        _ => 0,
    }
}

/// Drive CPU cycles per GCR byte for a bit-rate setting (VIA2 PB5-6).
/// Rate 3 is the fastest (outer tracks).
#[must_use]
pub fn cycles_per_byte(bit_rate: u8) -> u32 {
    26 + 2 * u32::from(3 - (bit_rate & 3))
}

/// Encode 4 raw bytes into 5 GCR bytes.
fn encode_group(input: &[u8; 4]) -> [u8; 5] {
    let g: [u8; 8] = [
        GCR_ENCODE[(input[0] >> 4) as usize],
        GCR_ENCODE[(input[0] & 0x0f) as usize],
        GCR_ENCODE[(input[1] >> 4) as usize],
        GCR_ENCODE[(input[1] & 0x0f) as usize],
        GCR_ENCODE[(input[2] >> 4) as usize],
        GCR_ENCODE[(input[2] & 0x0f) as usize],
        GCR_ENCODE[(input[3] >> 4) as usize],
        GCR_ENCODE[(input[3] & 0x0f) as usize],
    ];
    [
        (g[0] << 3) | (g[1] >> 2),
        (g[1] << 6) | (g[2] << 1) | (g[3] >> 4),
        (g[3] << 4) | (g[4] >> 1),
        (g[4] << 7) | (g[5] << 2) | (g[6] >> 3),
        (g[6] << 5) | g[7],
    ]
}

/// Decode 5 GCR bytes into 4 raw bytes; `None` on an invalid code.
pub fn decode_group(input: &[u8; 5]) -> Option<[u8; 4]> {
    let nibbles = [
        (input[0] >> 3) & 0x1f,
        ((input[0] << 2) | (input[1] >> 6)) & 0x1f,
        (input[1] >> 1) & 0x1f,
        ((input[1] << 4) | (input[2] >> 4)) & 0x1f,
        ((input[2] << 1) | (input[3] >> 7)) & 0x1f,
        (input[3] >> 2) & 0x1f,
        ((input[3] << 3) | (input[4] >> 5)) & 0x1f,
        input[4] & 0x1f,
    ];
    let mut raw = [0u8; 8];
    for (i, &n) in nibbles.iter().enumerate() {
        let d = GCR_DECODE[n as usize];
        if d == 0xff {
            return None;
        }
        raw[i] = d;
    }
    Some([
        (raw[0] << 4) | raw[1],
        (raw[2] << 4) | raw[3],
        (raw[4] << 4) | raw[5],
        (raw[6] << 4) | raw[7],
    ])
}

/// Encode a sector header: $08, checksum, sector, track, id2, id1, $0F, $0F.
fn encode_header(track: u8, sector: u8, disk_id: [u8; 2]) -> [u8; 10] {
    let checksum = sector ^ track ^ disk_id[0] ^ disk_id[1];
    let raw = [
        0x08, checksum, sector, track, disk_id[1], disk_id[0], 0x0f, 0x0f,
    ];
    let g0 = encode_group(&[raw[0], raw[1], raw[2], raw[3]]);
    let g1 = encode_group(&[raw[4], raw[5], raw[6], raw[7]]);
    let mut out = [0u8; 10];
    out[..5].copy_from_slice(&g0);
    out[5..].copy_from_slice(&g1);
    out
}

/// Encode a sector data block: $07, 256 bytes, checksum, $00, $00 as 325
/// GCR bytes.
fn encode_data_block(sector: &[u8]) -> Vec<u8> {
    debug_assert!(sector.len() == 256);
    let mut checksum = 0u8;
    for &b in sector {
        checksum ^= b;
    }

    let mut raw = Vec::with_capacity(260);
    raw.push(0x07);
    raw.extend_from_slice(sector);
    raw.push(checksum);
    raw.push(0x00);
    raw.push(0x00);

    let mut gcr = Vec::with_capacity(325);
    for chunk in raw.chunks_exact(4) {
        gcr.extend_from_slice(&encode_group(&[chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    gcr
}

/// Decode a 325-byte GCR data block back to its 256 data bytes; `None`
/// on a code error or checksum mismatch.
pub fn decode_data_block(gcr: &[u8]) -> Option<Vec<u8>> {
    if gcr.len() < 325 {
        return None;
    }
    let mut raw = Vec::with_capacity(260);
    for chunk in gcr[..325].chunks_exact(5) {
        let group = decode_group(&[chunk[0], chunk[1], chunk[2], chunk[3], chunk[4]])?;
        raw.extend_from_slice(&group);
    }
    if raw[0] != 0x07 {
        return None;
    }
    let data = &raw[1..257];
    let mut checksum = 0u8;
    for &b in data {
        checksum ^= b;
    }
    if checksum != raw[257] {
        return None;
    }
    Some(data.to_vec())
}

fn encode_sector(track: u8, sector: u8, data: &[u8], disk_id: [u8; 2]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECTOR_GCR_LEN);
    out.extend_from_slice(&[0xff; 5]);
    out.extend_from_slice(&encode_header(track, sector, disk_id));
    out.extend_from_slice(&[0x55; 9]);
    out.extend_from_slice(&[0xff; 5]);
    out.extend_from_slice(&encode_data_block(data));
    out.extend_from_slice(&[0x55; 9]);
    out
}

/// Encode a whole track as the byte stream the head reads in a loop.
#[must_use]
pub fn encode_track(d64: &D64, track: u8) -> Vec<u8> {
    let num_sectors = D64::sectors_per_track(track);
    let disk_id = d64.disk_id();
    let mut out = Vec::with_capacity(num_sectors as usize * SECTOR_GCR_LEN);
    for sector in 0..num_sectors {
        let data = d64.read_sector(track, sector).expect("sector in range");
        out.extend_from_slice(&encode_sector(track, sector, data, disk_id));
    }
    out
}

/// The drive mechanism as seen from the drive CPU.
pub struct GcrDisk {
    image: Option<D64>,
    write_protected: bool,
    motor_on: bool,
    /// Head position in half tracks; track = half_track / 2 + 1.
    half_track: u8,
    /// Bit-rate setting from VIA2 PB5-6.
    bit_rate: u8,
    /// GCR byte stream under the head for the current track.
    track_data: Vec<u8>,
    position: usize,
    /// Cycle stamp of the byte currently under the head.
    mark_cycle: u32,
    /// A new byte passed under the head since the last query.
    byte_ready: bool,
}

impl GcrDisk {
    #[must_use]
    pub fn new() -> Self {
        Self {
            image: None,
            write_protected: false,
            motor_on: false,
            half_track: 34, // track 18, where the DOS parks the head
            bit_rate: 3,
            track_data: Vec::new(),
            position: 0,
            mark_cycle: 0,
            byte_ready: false,
        }
    }

    /// Insert a disk image.
    pub fn mount(&mut self, image: D64, write_protected: bool) {
        self.image = Some(image);
        self.write_protected = write_protected;
        self.encode_current_track();
    }

    /// Remove the disk.
    pub fn eject(&mut self) -> Option<D64> {
        self.track_data.clear();
        self.position = 0;
        self.byte_ready = false;
        self.image.take()
    }

    #[must_use]
    pub fn has_disk(&self) -> bool {
        self.image.is_some()
    }

    /// Borrow the mounted image, e.g. for saving.
    #[must_use]
    pub fn image(&self) -> Option<&D64> {
        self.image.as_ref()
    }

    /// Current full track under the head.
    #[must_use]
    pub fn track(&self) -> u8 {
        self.half_track / 2 + 1
    }

    #[must_use]
    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    pub fn set_motor(&mut self, on: bool) {
        self.motor_on = on;
    }

    pub fn set_bit_rate(&mut self, rate: u8) {
        self.bit_rate = rate & 3;
    }

    /// Step the head one half track towards the spindle.
    pub fn move_head_in(&mut self) {
        if self.half_track < 83 {
            self.half_track += 1;
            self.encode_current_track();
        }
    }

    /// Step the head one half track towards the edge.
    pub fn move_head_out(&mut self) {
        if self.half_track > 0 {
            self.half_track -= 1;
            self.encode_current_track();
        }
    }

    /// The write-protect sensor: closed when a protected disk is in.
    #[must_use]
    pub fn wp_sensor_closed(&self) -> bool {
        self.image.is_some() && self.write_protected
    }

    /// A new byte has arrived under the head. Consumes the ready state.
    pub fn byte_ready(&mut self, cycle: u32) -> bool {
        self.catch_up(cycle);
        let ready = self.byte_ready;
        self.byte_ready = false;
        ready
    }

    /// The GCR byte currently under the head.
    pub fn read_byte(&mut self, cycle: u32) -> u8 {
        self.catch_up(cycle);
        if self.track_data.is_empty() {
            0
        } else {
            self.track_data[self.position]
        }
    }

    /// Whether the head sits in a sync mark.
    pub fn sync_found(&mut self, cycle: u32) -> bool {
        self.catch_up(cycle);
        !self.track_data.is_empty() && self.motor_on && self.track_data[self.position] == 0xff
    }

    /// Write one sector through the codec and refresh the track stream.
    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> bool {
        if self.write_protected {
            return false;
        }
        let Some(image) = self.image.as_mut() else {
            return false;
        };
        if !image.write_sector(track, sector, data) {
            return false;
        }
        if track == self.track() {
            self.encode_current_track();
        }
        true
    }

    /// Format the track under the head: all sectors zeroed.
    pub fn format_track(&mut self) -> bool {
        if self.write_protected {
            return false;
        }
        let track = self.track();
        let Some(image) = self.image.as_mut() else {
            return false;
        };
        let zeroes = [0u8; 256];
        for sector in 0..D64::sectors_per_track(track) {
            if !image.write_sector(track, sector, &zeroes) {
                return false;
            }
        }
        self.encode_current_track();
        true
    }

    /// Advance the head to the byte under it at `cycle`.
    fn catch_up(&mut self, cycle: u32) {
        if !self.motor_on || self.track_data.is_empty() {
            self.mark_cycle = cycle;
            return;
        }
        let cpb = cycles_per_byte(self.bit_rate);
        let elapsed = cycle.wrapping_sub(self.mark_cycle);
        let steps = elapsed / cpb;
        if steps > 0 {
            self.position = (self.position + steps as usize) % self.track_data.len();
            self.mark_cycle = self.mark_cycle.wrapping_add(steps * cpb);
            self.byte_ready = true;
        }
    }

    /// Rebuild the GCR stream for the track under the head. Between two
    /// full tracks there is no readable data, so the stream is empty and
    /// the DOS finds no sync marks there.
    fn encode_current_track(&mut self) {
        let on_half_track = self.half_track & 1 != 0;
        let track = self.track();
        match (&self.image, on_half_track) {
            (Some(image), false) if track <= image.num_tracks() => {
                self.track_data = encode_track(image, track);
            }
            _ => self.track_data.clear(),
        }
        if self.position >= self.track_data.len() {
            self.position = 0;
        }
    }

    /// Mechanics state for snapshots.
    #[must_use]
    pub fn state(&self) -> DiskState {
        DiskState {
            motor_on: self.motor_on,
            half_track: self.half_track,
            bit_rate: self.bit_rate,
            position: self.position as u32,
        }
    }

    /// Restore mechanics state. The track stream is re-encoded from the
    /// mounted image.
    pub fn restore(&mut self, s: &DiskState) {
        self.motor_on = s.motor_on;
        self.half_track = s.half_track;
        self.bit_rate = s.bit_rate;
        self.encode_current_track();
        self.position = if self.track_data.is_empty() {
            0
        } else {
            s.position as usize % self.track_data.len()
        };
        self.byte_ready = false;
    }
}

impl Default for GcrDisk {
    fn default() -> Self {
        Self::new()
    }
}

/// Captured drive mechanics for snapshots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskState {
    pub motor_on: bool,
    pub half_track: u8,
    pub bit_rate: u8,
    pub position: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcr_group_round_trip() {
        let inputs = [[0x00u8; 4], [0xff; 4], [0x12, 0x34, 0x56, 0x78]];
        for input in inputs {
            let encoded = encode_group(&input);
            assert_eq!(decode_group(&encoded), Some(input));
        }
    }

    #[test]
    fn gcr_codes_avoid_long_zero_runs() {
        // The whole point of GCR: no encoded group contains three
        // consecutive zero bits.
        for a in 0..=255u8 {
            let encoded = encode_group(&[a, a ^ 0x5a, !a, 0x0f]);
            let mut bits = 0u64;
            for (i, &b) in encoded.iter().enumerate() {
                bits |= u64::from(b) << ((4 - i) * 8);
            }
            let mut run = 0;
            for i in 0..40 {
                if bits & (1 << (39 - i)) == 0 {
                    run += 1;
                    assert!(run < 3, "zero run in group for input {a:#x}");
                } else {
                    run = 0;
                }
            }
        }
    }

    #[test]
    fn data_block_round_trip_checks_checksum() {
        let mut sector = [0u8; 256];
        sector[0] = 0xab;
        sector[100] = 0x12;
        let mut gcr = encode_data_block(&sector);
        assert_eq!(gcr.len(), 325);
        assert_eq!(decode_data_block(&gcr).as_deref(), Some(&sector[..]));

        // Corrupt a byte: checksum mismatch.
        gcr[40] ^= 0x11;
        assert!(decode_data_block(&gcr).is_none());
    }

    #[test]
    fn track_stream_length_follows_sector_count() {
        let d64 = D64::blank();
        assert_eq!(encode_track(&d64, 1).len(), 21 * SECTOR_GCR_LEN);
        assert_eq!(encode_track(&d64, 18).len(), 19 * SECTOR_GCR_LEN);
        assert_eq!(encode_track(&d64, 35).len(), 17 * SECTOR_GCR_LEN);
    }

    #[test]
    fn byte_clock_follows_bit_rate() {
        assert_eq!(cycles_per_byte(3), 26);
        assert_eq!(cycles_per_byte(2), 28);
        assert_eq!(cycles_per_byte(1), 30);
        assert_eq!(cycles_per_byte(0), 32);
        assert_eq!(speed_zone(1), 3);
        assert_eq!(speed_zone(18), 2);
        assert_eq!(speed_zone(31), 0);
    }

    #[test]
    fn byte_ready_needs_motor_and_disk() {
        let mut disk = GcrDisk::new();
        assert!(!disk.byte_ready(1000));

        disk.mount(D64::blank(), false);
        assert!(!disk.byte_ready(2000)); // motor still off

        disk.set_motor(true);
        let _ = disk.byte_ready(2000); // sets the mark
        assert!(disk.byte_ready(2000 + 26));
        assert!(!disk.byte_ready(2000 + 26)); // consumed
    }

    #[test]
    fn sync_is_found_at_track_start() {
        let mut disk = GcrDisk::new();
        disk.mount(D64::blank(), false);
        disk.set_motor(true);
        // The track stream begins with the first header sync.
        assert!(disk.sync_found(0));
    }

    #[test]
    fn half_track_positions_have_no_data() {
        let mut disk = GcrDisk::new();
        disk.mount(D64::blank(), false);
        disk.set_motor(true);
        assert!(disk.sync_found(0));
        disk.move_head_in(); // odd half track
        assert!(!disk.sync_found(0));
        disk.move_head_in(); // next full track
        assert!(disk.sync_found(0));
    }

    #[test]
    fn head_steps_are_bounded() {
        let mut disk = GcrDisk::new();
        for _ in 0..200 {
            disk.move_head_out();
        }
        assert_eq!(disk.track(), 1);
        for _ in 0..200 {
            disk.move_head_in();
        }
        assert_eq!(disk.track(), 42);
    }

    #[test]
    fn write_sector_respects_write_protect() {
        let mut disk = GcrDisk::new();
        disk.mount(D64::blank(), true);
        assert!(disk.wp_sensor_closed());
        assert!(!disk.write_sector(18, 0, &[0u8; 256]));

        let mut disk = GcrDisk::new();
        disk.mount(D64::blank(), false);
        let mut data = [0u8; 256];
        data[0] = 0x99;
        assert!(disk.write_sector(18, 0, &data));
        assert_eq!(disk.image().unwrap().read_sector(18, 0).unwrap()[0], 0x99);
    }

    #[test]
    fn format_track_zeroes_current_track() {
        let mut disk = GcrDisk::new();
        let mut image = D64::blank();
        let mut data = [0u8; 256];
        data[7] = 0x77;
        image.write_sector(18, 3, &data);
        disk.mount(image, false);
        assert!(disk.format_track()); // head parks on track 18
        assert_eq!(disk.image().unwrap().read_sector(18, 3).unwrap()[7], 0);
    }
}
