//! Input mailbox: logical keys, joysticks, and timed key sequences.
//!
//! Matrix layout (row = CIA1 PA, col = CIA1 PB):
//!
//! | Row | Col0 | Col1 | Col2 | Col3 | Col4 | Col5 | Col6 | Col7    |
//! |-----|------|------|------|------|------|------|------|---------|
//! | 0   | DEL  | 3    | 5    | 7    | 9    | +    | £    | 1       |
//! | 1   | RET  | W    | R    | Y    | I    | P    | *    | ←       |
//! | 2   | →    | A    | D    | G    | J    | L    | ;    | CTRL    |
//! | 3   | F7   | 4    | 6    | 8    | 0    | -    | HOME | 2       |
//! | 4   | F1   | Z    | C    | B    | M    | .    | RSHFT| SPC     |
//! | 5   | F3   | S    | F    | H    | K    | :    | =    | C=      |
//! | 6   | F5   | E    | T    | U    | O    | @    | ↑    | Q       |
//! | 7   | ↓    | LSHFT| X    | V    | N    | ,    | /    | STOP    |

use std::collections::VecDeque;

/// Logical key on the C64 keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum C64Key {
    Delete,
    N3,
    N5,
    N7,
    N9,
    Plus,
    Pound,
    N1,
    Return,
    W,
    R,
    Y,
    I,
    P,
    Asterisk,
    LeftArrow,
    CursorRight,
    A,
    D,
    G,
    J,
    L,
    Semicolon,
    Ctrl,
    F7,
    N4,
    N6,
    N8,
    N0,
    Minus,
    Home,
    N2,
    F1,
    Z,
    C,
    B,
    M,
    Period,
    RShift,
    Space,
    F3,
    S,
    F,
    H,
    K,
    Colon,
    Equals,
    Commodore,
    F5,
    E,
    T,
    U,
    O,
    At,
    UpArrow,
    Q,
    CursorDown,
    LShift,
    X,
    V,
    N,
    Comma,
    Slash,
    RunStop,
}

impl C64Key {
    /// The (row, col) position of this key in the matrix.
    #[must_use]
    pub const fn matrix(self) -> (u8, u8) {
        match self {
            Self::Delete => (0, 0),
            Self::N3 => (0, 1),
            Self::N5 => (0, 2),
            Self::N7 => (0, 3),
            Self::N9 => (0, 4),
            Self::Plus => (0, 5),
            Self::Pound => (0, 6),
            Self::N1 => (0, 7),
            Self::Return => (1, 0),
            Self::W => (1, 1),
            Self::R => (1, 2),
            Self::Y => (1, 3),
            Self::I => (1, 4),
            Self::P => (1, 5),
            Self::Asterisk => (1, 6),
            Self::LeftArrow => (1, 7),
            Self::CursorRight => (2, 0),
            Self::A => (2, 1),
            Self::D => (2, 2),
            Self::G => (2, 3),
            Self::J => (2, 4),
            Self::L => (2, 5),
            Self::Semicolon => (2, 6),
            Self::Ctrl => (2, 7),
            Self::F7 => (3, 0),
            Self::N4 => (3, 1),
            Self::N6 => (3, 2),
            Self::N8 => (3, 3),
            Self::N0 => (3, 4),
            Self::Minus => (3, 5),
            Self::Home => (3, 6),
            Self::N2 => (3, 7),
            Self::F1 => (4, 0),
            Self::Z => (4, 1),
            Self::C => (4, 2),
            Self::B => (4, 3),
            Self::M => (4, 4),
            Self::Period => (4, 5),
            Self::RShift => (4, 6),
            Self::Space => (4, 7),
            Self::F3 => (5, 0),
            Self::S => (5, 1),
            Self::F => (5, 2),
            Self::H => (5, 3),
            Self::K => (5, 4),
            Self::Colon => (5, 5),
            Self::Equals => (5, 6),
            Self::Commodore => (5, 7),
            Self::F5 => (6, 0),
            Self::E => (6, 1),
            Self::T => (6, 2),
            Self::U => (6, 3),
            Self::O => (6, 4),
            Self::At => (6, 5),
            Self::UpArrow => (6, 6),
            Self::Q => (6, 7),
            Self::CursorDown => (7, 0),
            Self::LShift => (7, 1),
            Self::X => (7, 2),
            Self::V => (7, 3),
            Self::N => (7, 4),
            Self::Comma => (7, 5),
            Self::Slash => (7, 6),
            Self::RunStop => (7, 7),
        }
    }
}

/// State of one joystick: four directions and fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoystickState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub fire: bool,
}

impl JoystickState {
    /// The active-low line mask as seen on the CIA port.
    #[must_use]
    pub fn to_mask(self) -> u8 {
        let mut mask = 0xff;
        if self.up {
            mask &= !0x01;
        }
        if self.down {
            mask &= !0x02;
        }
        if self.left {
            mask &= !0x04;
        }
        if self.right {
            mask &= !0x08;
        }
        if self.fire {
            mask &= !0x10;
        }
        mask
    }
}

/// A timed keyboard event.
#[derive(Debug, Clone, Copy)]
pub struct InputEvent {
    /// Frame number at which the event fires.
    pub frame: u64,
    pub key: C64Key,
    /// true = press, false = release.
    pub pressed: bool,
}

/// Timed input queue for scripted key sequences.
///
/// Events are kept ordered by frame number and drained at the start of
/// each frame.
pub struct InputQueue {
    events: VecDeque<InputEvent>,
}

impl InputQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    /// Enqueue an event, keeping frame order.
    pub fn push(&mut self, event: InputEvent) {
        let pos = self
            .events
            .iter()
            .position(|e| e.frame > event.frame)
            .unwrap_or(self.events.len());
        self.events.insert(pos, event);
    }

    /// Queue a press-and-release pair for a key.
    pub fn tap(&mut self, frame: u64, key: C64Key, hold_frames: u64) {
        self.push(InputEvent {
            frame,
            key,
            pressed: true,
        });
        self.push(InputEvent {
            frame: frame + hold_frames,
            key,
            pressed: false,
        });
    }

    /// Drain all events due at `frame`, applying them through `apply`.
    pub fn drain_due(&mut self, frame: u64, mut apply: impl FnMut(C64Key, bool)) {
        while let Some(event) = self.events.front() {
            if event.frame > frame {
                break;
            }
            let event = self.events.pop_front().expect("front checked");
            apply(event.key, event.pressed);
        }
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joystick_mask_is_active_low() {
        let idle = JoystickState::default();
        assert_eq!(idle.to_mask(), 0xff);

        let state = JoystickState {
            up: true,
            fire: true,
            ..JoystickState::default()
        };
        assert_eq!(state.to_mask(), 0xff & !0x11);
    }

    #[test]
    fn every_key_maps_inside_the_matrix() {
        let keys = [C64Key::Delete, C64Key::Return, C64Key::Space, C64Key::RunStop];
        for key in keys {
            let (row, col) = key.matrix();
            assert!(row < 8 && col < 8);
        }
    }

    #[test]
    fn queue_drains_in_frame_order() {
        let mut queue = InputQueue::new();
        queue.tap(5, C64Key::A, 2);
        queue.push(InputEvent {
            frame: 1,
            key: C64Key::B,
            pressed: true,
        });

        let mut seen = Vec::new();
        queue.drain_due(5, |key, pressed| seen.push((key, pressed)));
        assert_eq!(seen, vec![(C64Key::B, true), (C64Key::A, true)]);
        assert_eq!(queue.len(), 1);

        seen.clear();
        queue.drain_due(7, |key, pressed| seen.push((key, pressed)));
        assert_eq!(seen, vec![(C64Key::A, false)]);
        assert!(queue.is_empty());
    }
}
