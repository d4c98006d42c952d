//! Host input events and the transient state derived from them.
//!
//! `InputState` is only changed through its named transitions; the controller decides what
//! each transition means for the camera.

use foldhash::{HashSet, HashSetExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    Shift,
    Space,
    A,
    D,
    E,
    I,
    J,
    K,
    L,
    P,
    Q,
    S,
    V,
    W,
    Digit(u8),
    Minus,
    Plus,
    Other,
}

impl Key {
    /// Maps a DOM `KeyboardEvent.code` value.
    pub fn from_code(code: &str) -> Self {
        match code {
            "ArrowUp" => Key::ArrowUp,
            "ArrowDown" => Key::ArrowDown,
            "ArrowLeft" => Key::ArrowLeft,
            "ArrowRight" => Key::ArrowRight,
            "Shift" | "ShiftLeft" | "ShiftRight" => Key::Shift,
            "Space" => Key::Space,
            "KeyA" => Key::A,
            "KeyD" => Key::D,
            "KeyE" => Key::E,
            "KeyI" => Key::I,
            "KeyJ" => Key::J,
            "KeyK" => Key::K,
            "KeyL" => Key::L,
            "KeyP" => Key::P,
            "KeyQ" => Key::Q,
            "KeyS" => Key::S,
            "KeyV" => Key::V,
            "KeyW" => Key::W,
            "Minus" | "NumpadSubtract" => Key::Minus,
            "Equal" | "NumpadAdd" => Key::Plus,
            _ => code
                .strip_prefix("Digit")
                .or_else(|| code.strip_prefix("Numpad"))
                .and_then(|d| d.parse::<u8>().ok())
                .filter(|d| *d <= 9)
                .map_or(Key::Other, Key::Digit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// `WheelEvent.deltaMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WheelDeltaMode {
    #[default]
    Pixel,
    Line,
    Page,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    KeyDown(Key),
    KeyUp(Key),
    /// The window lost focus; nothing is held any more.
    Blur,
    /// `ctrl` is true for either Control or Meta.
    MouseDown {
        x: f32,
        y: f32,
        button: MouseButton,
        ctrl: bool,
    },
    MouseMove {
        x: f32,
        y: f32,
    },
    MouseUp,
    Wheel {
        dx: f32,
        dy: f32,
        mode: WheelDeltaMode,
        shift: bool,
        ctrl: bool,
    },
    TouchStart(Vec<(f32, f32)>),
    TouchMove(Vec<(f32, f32)>),
    TouchEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GamepadButton {
    pub pressed: bool,
    pub value: f32,
}

/// Snapshot of one pad in the standard mapping, polled once per frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GamepadState {
    pub axes: [f32; 4],
    pub buttons: [GamepadButton; 16],
}

impl GamepadState {
    pub const JUMP: usize = 0;
    pub const RESUME: usize = 3;
    pub const NEXT_PRESET: usize = 4;
    pub const PREV_PRESET: usize = 5;
    pub const ROLL_LEFT: usize = 6;
    pub const ROLL_RIGHT: usize = 7;
    pub const DPAD_UP: usize = 12;
    pub const DPAD_DOWN: usize = 13;
    pub const DPAD_LEFT: usize = 14;
    pub const DPAD_RIGHT: usize = 15;

    #[inline]
    pub fn pressed(&self, button: usize) -> bool {
        self.buttons.get(button).is_some_and(|b| b.pressed)
    }

    #[inline]
    pub fn value(&self, button: usize) -> f32 {
        self.buttons.get(button).map_or(0.0, |b| b.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DragMode {
    #[default]
    Idle,
    Orbit,
    Pan,
}

/// A two-finger gesture between two touch samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinchDelta {
    /// Change of the angle between the fingers, radians.
    pub dtheta: f32,
    /// Previous finger distance over the current one.
    pub dscale: f32,
    /// Midpoint motion in pixels.
    pub dx: f32,
    pub dy: f32,
}

#[derive(Debug, Default)]
pub struct InputState {
    held: HashSet<Key>,
    drag: DragMode,
    start: (f32, f32),
    alt: (f32, f32),
    /// Last seen bumper state, one entry per pad slot.
    bumpers: Vec<(bool, bool)>,
}

impl InputState {
    pub fn new() -> Self {
        Self {
            held: HashSet::new(),
            ..Default::default()
        }
    }

    /// Returns true if the key was not already held.
    pub fn press(&mut self, key: Key) -> bool {
        self.held.insert(key)
    }

    pub fn release(&mut self, key: Key) {
        self.held.remove(&key);
    }

    pub fn release_all(&mut self) {
        self.held.clear();
    }

    #[inline]
    pub fn is_held(&self, key: Key) -> bool {
        self.held.contains(&key)
    }

    pub fn any_held(&self, keys: &[Key]) -> bool {
        keys.iter().any(|k| self.held.contains(k))
    }

    #[inline]
    pub fn drag_mode(&self) -> DragMode {
        self.drag
    }

    pub fn begin_drag(&mut self, mode: DragMode, x: f32, y: f32) {
        self.drag = mode;
        self.start = (x, y);
    }

    /// Pixel motion since the previous sample of the current drag; `None` when idle.
    pub fn drag_to(&mut self, x: f32, y: f32) -> Option<(DragMode, f32, f32)> {
        if self.drag == DragMode::Idle {
            return None;
        }
        let delta = (x - self.start.0, y - self.start.1);
        self.start = (x, y);
        Some((self.drag, delta.0, delta.1))
    }

    pub fn end_drag(&mut self) {
        self.drag = DragMode::Idle;
        self.start = (0.0, 0.0);
    }

    /// Records the first two touch points. Returns false for gestures this viewer ignores.
    pub fn begin_touch(&mut self, touches: &[(f32, f32)]) -> bool {
        match touches {
            [first] => {
                self.begin_drag(DragMode::Orbit, first.0, first.1);
                true
            }
            [first, second] => {
                self.begin_drag(DragMode::Orbit, first.0, first.1);
                self.alt = *second;
                true
            }
            _ => false,
        }
    }

    pub fn pinch_to(&mut self, first: (f32, f32), second: (f32, f32)) -> PinchDelta {
        let (s, a) = (self.start, self.alt);
        let before = (s.1 - a.1).atan2(s.0 - a.0);
        let after = (first.1 - second.1).atan2(first.0 - second.0);
        let span = (first.0 - second.0).hypot(first.1 - second.1);
        let dscale = if span > 0.0 {
            (s.0 - a.0).hypot(s.1 - a.1) / span
        } else {
            1.0
        };

        self.start = first;
        self.alt = second;
        PinchDelta {
            dtheta: before - after,
            dscale,
            dx: (first.0 + second.0 - (s.0 + a.0)) / 2.0,
            dy: (first.1 + second.1 - (s.1 + a.1)) / 2.0,
        }
    }

    /// Rising edges of the two preset bumpers since the previous poll of pad `slot`.
    pub fn bumper_edges(&mut self, slot: usize, pad: &GamepadState) -> (bool, bool) {
        if self.bumpers.len() <= slot {
            self.bumpers.resize(slot + 1, (false, false));
        }
        let next = pad.pressed(GamepadState::NEXT_PRESET);
        let prev = pad.pressed(GamepadState::PREV_PRESET);
        let last = &mut self.bumpers[slot];
        let edges = (next && !last.0, prev && !last.1);
        *last = (next, prev);
        edges
    }
}
