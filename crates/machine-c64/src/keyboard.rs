//! C64 keyboard matrix.
//!
//! An 8x8 matrix scanned through CIA1: port A drives the row select
//! (active low) and port B reads the column result (active low, 0 = a
//! key in a selected row is pressed).

/// 8x8 keyboard matrix.
///
/// Internally stores 1 = pressed per bit; `scan()` converts to the
/// active-low view CIA1 port B sees.
pub struct KeyboardMatrix {
    /// `rows[r]` has bit `c` set if the key at (row r, column c) is down.
    rows: [u8; 8],
}

impl KeyboardMatrix {
    #[must_use]
    pub fn new() -> Self {
        Self { rows: [0; 8] }
    }

    /// Press or release the key at a matrix position.
    pub fn set_key(&mut self, row: u8, col: u8, pressed: bool) {
        if row < 8 && col < 8 {
            if pressed {
                self.rows[row as usize] |= 1 << col;
            } else {
                self.rows[row as usize] &= !(1 << col);
            }
        }
    }

    /// Scan the matrix for a row mask written to CIA1 port A (a 0 bit
    /// selects the row). Returns active-low column data.
    #[must_use]
    pub fn scan(&self, row_mask: u8) -> u8 {
        let mut pressed = 0u8;
        for (row, &row_data) in self.rows.iter().enumerate() {
            if row_mask & (1 << row) == 0 {
                pressed |= row_data;
            }
        }
        !pressed
    }

    /// Release every key.
    pub fn release_all(&mut self) {
        self.rows = [0; 8];
    }

    /// Raw matrix rows, for snapshots.
    #[must_use]
    pub fn rows(&self) -> [u8; 8] {
        self.rows
    }

    /// Restore raw matrix rows.
    pub fn set_rows(&mut self, rows: [u8; 8]) {
        self.rows = rows;
    }
}

impl Default for KeyboardMatrix {
    fn default() -> Self {
        Self::new()
    }
}
