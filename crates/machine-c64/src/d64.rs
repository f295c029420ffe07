//! D64 disk images.
//!
//! A D64 holds the sector dump of a 1541 disk: 35 tracks with a
//! zone-dependent sector count, 683 sectors of 256 bytes. Two common
//! variants are accepted as well: 40-track images and images with a
//! trailing per-sector error-info block.

/// Bytes per sector.
const SECTOR_SIZE: usize = 256;

/// Sectors in a standard 35-track image.
const SECTORS_35: usize = 683;
/// Sectors in a 40-track image.
const SECTORS_40: usize = 768;

/// Standard 35-track size.
const D64_SIZE_35: usize = SECTORS_35 * SECTOR_SIZE;
/// 35 tracks with error info appendix.
const D64_SIZE_35_ERRORS: usize = D64_SIZE_35 + SECTORS_35;
/// 40-track size.
const D64_SIZE_40: usize = SECTORS_40 * SECTOR_SIZE;
/// 40 tracks with error info appendix.
const D64_SIZE_40_ERRORS: usize = D64_SIZE_40 + SECTORS_40;

/// Sectors per track, 1-indexed; tracks 36-40 continue the innermost zone.
const SECTORS_PER_TRACK: [u8; 41] = [
    0, // track 0 does not exist
    21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, // 1-17
    19, 19, 19, 19, 19, 19, 19, // 18-24
    18, 18, 18, 18, 18, 18, // 25-30
    17, 17, 17, 17, 17, // 31-35
    17, 17, 17, 17, 17, // 36-40
];

/// Byte offset of the first sector of each track.
const TRACK_OFFSETS: [usize; 41] = {
    let mut offsets = [0usize; 41];
    let mut track = 1;
    let mut offset = 0;
    while track < 41 {
        offsets[track] = offset;
        offset += SECTORS_PER_TRACK[track] as usize * SECTOR_SIZE;
        track += 1;
    }
    offsets
};

/// A parsed D64 disk image.
pub struct D64 {
    data: Vec<u8>,
    /// Per-sector error info, when the image carries it.
    error_info: Vec<u8>,
    num_tracks: u8,
}

impl D64 {
    /// Parse a D64 image. Accepts the 35- and 40-track sizes with or
    /// without the error-info appendix.
    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        let (num_tracks, sectors) = match data.len() {
            D64_SIZE_35 | D64_SIZE_35_ERRORS => (35, SECTORS_35),
            D64_SIZE_40 | D64_SIZE_40_ERRORS => (40, SECTORS_40),
            n => {
                return Err(format!(
                    "invalid D64 size: {n} bytes (expected {D64_SIZE_35}, \
                     {D64_SIZE_35_ERRORS}, {D64_SIZE_40} or {D64_SIZE_40_ERRORS})"
                ))
            }
        };
        let image_size = sectors * SECTOR_SIZE;
        Ok(Self {
            data: data[..image_size].to_vec(),
            error_info: data[image_size..].to_vec(),
            num_tracks,
        })
    }

    /// A blank, formatted-empty 35-track image.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            data: vec![0; D64_SIZE_35],
            error_info: Vec::new(),
            num_tracks: 35,
        }
    }

    /// Number of tracks in this image (35 or 40).
    #[must_use]
    pub fn num_tracks(&self) -> u8 {
        self.num_tracks
    }

    /// Sectors on a given track; 0 for invalid track numbers.
    #[must_use]
    pub fn sectors_per_track(track: u8) -> u8 {
        if (1..=40).contains(&track) {
            SECTORS_PER_TRACK[track as usize]
        } else {
            0
        }
    }

    fn sector_offset(&self, track: u8, sector: u8) -> Option<usize> {
        if track == 0 || track > self.num_tracks {
            return None;
        }
        if sector >= SECTORS_PER_TRACK[track as usize] {
            return None;
        }
        Some(TRACK_OFFSETS[track as usize] + sector as usize * SECTOR_SIZE)
    }

    /// Read a 256-byte sector.
    #[must_use]
    pub fn read_sector(&self, track: u8, sector: u8) -> Option<&[u8]> {
        let offset = self.sector_offset(track, sector)?;
        Some(&self.data[offset..offset + SECTOR_SIZE])
    }

    /// Write a 256-byte sector. Returns false for invalid addresses or
    /// payload sizes.
    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> bool {
        if data.len() != SECTOR_SIZE {
            return false;
        }
        let Some(offset) = self.sector_offset(track, sector) else {
            return false;
        };
        self.data[offset..offset + SECTOR_SIZE].copy_from_slice(data);
        true
    }

    /// The error-info byte for a sector, when the image carries the
    /// appendix. 1 means "no error".
    #[must_use]
    pub fn sector_error(&self, track: u8, sector: u8) -> Option<u8> {
        let offset = self.sector_offset(track, sector)? / SECTOR_SIZE;
        self.error_info.get(offset).copied()
    }

    /// Disk ID from the BAM (track 18 sector 0, bytes $A2-$A3).
    #[must_use]
    pub fn disk_id(&self) -> [u8; 2] {
        let bam = self
            .read_sector(18, 0)
            .expect("track 18 sector 0 exists on every image");
        [bam[0xa2], bam[0xa3]]
    }

    /// Serialize back to bytes, keeping any error-info appendix.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.error_info);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_sizes() {
        assert!(D64::from_bytes(&[0; 100]).is_err());
        assert!(D64::from_bytes(&vec![0; D64_SIZE_35 + 1]).is_err());
    }

    #[test]
    fn accepts_all_four_variants() {
        assert_eq!(
            D64::from_bytes(&vec![0; D64_SIZE_35]).unwrap().num_tracks(),
            35
        );
        assert_eq!(
            D64::from_bytes(&vec![0; D64_SIZE_35_ERRORS])
                .unwrap()
                .num_tracks(),
            35
        );
        assert_eq!(
            D64::from_bytes(&vec![0; D64_SIZE_40]).unwrap().num_tracks(),
            40
        );
        assert_eq!(
            D64::from_bytes(&vec![0; D64_SIZE_40_ERRORS])
                .unwrap()
                .num_tracks(),
            40
        );
    }

    #[test]
    fn geometry_totals() {
        // The last sector of track 35 ends exactly at the 35-track size.
        let d64 = D64::blank();
        let last = d64.sector_offset(35, 16).unwrap();
        assert_eq!(last + SECTOR_SIZE, D64_SIZE_35);
        assert_eq!(D64::sectors_per_track(1), 21);
        assert_eq!(D64::sectors_per_track(18), 19);
        assert_eq!(D64::sectors_per_track(25), 18);
        assert_eq!(D64::sectors_per_track(35), 17);
        assert_eq!(D64::sectors_per_track(36), 17);
        assert_eq!(D64::sectors_per_track(0), 0);
        assert_eq!(D64::sectors_per_track(41), 0);
    }

    #[test]
    fn track_36_requires_40_track_image() {
        let d35 = D64::blank();
        assert!(d35.read_sector(36, 0).is_none());
        let d40 = D64::from_bytes(&vec![0; D64_SIZE_40]).unwrap();
        assert!(d40.read_sector(36, 0).is_some());
    }

    #[test]
    fn sector_round_trip() {
        let mut d64 = D64::blank();
        let mut data = [0u8; 256];
        data[0] = 0xab;
        data[255] = 0xcd;
        assert!(d64.write_sector(18, 0, &data));
        let read = d64.read_sector(18, 0).unwrap();
        assert_eq!(read[0], 0xab);
        assert_eq!(read[255], 0xcd);
        assert!(!d64.write_sector(18, 0, &data[..100]));
        assert!(!d64.write_sector(1, 21, &data));
    }

    #[test]
    fn error_info_is_per_sector() {
        let mut raw = vec![0; D64_SIZE_35_ERRORS];
        raw[D64_SIZE_35] = 5; // track 1 sector 0: data checksum error
        let d64 = D64::from_bytes(&raw).unwrap();
        assert_eq!(d64.sector_error(1, 0), Some(5));
        assert_eq!(d64.sector_error(1, 1), Some(0));
        assert_eq!(D64::blank().sector_error(1, 0), None);
    }

    #[test]
    fn disk_id_from_bam() {
        let mut raw = vec![0; D64_SIZE_35];
        let bam = TRACK_OFFSETS[18];
        raw[bam + 0xa2] = 0x41;
        raw[bam + 0xa3] = 0x42;
        let d64 = D64::from_bytes(&raw).unwrap();
        assert_eq!(d64.disk_id(), [0x41, 0x42]);
    }
}
