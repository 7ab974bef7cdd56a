//! Non-character key whitelist and key-code validation.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/key.cpp`/`.hpp`:
//! negative key codes name non-character keys from a fixed table; positive
//! codes in `1..=0x10FFFF` (excluding the UTF-16 surrogate range) are
//! ordinary Unicode character presses. Values are stable across the
//! process lifetime and are not configurable.

/// Named non-character keys, with the negative integer codes the wire
/// protocol uses for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NamedKey {
    Backspace = -8,
    Tab = -9,
    Enter = -13,
    Shift = -16,
    Ctrl = -17,
    Alt = -18,
    CapsLock = -20,
    Esc = -27,
    PageUp = -33,
    PageDown = -34,
    End = -35,
    Home = -36,
    Left = -37,
    Up = -38,
    Right = -39,
    Down = -40,
    Insert = -45,
    Delete = -46,
    Meta = -91,
    F1 = -112,
    F2 = -113,
    F3 = -114,
    F4 = -115,
    F5 = -116,
    F6 = -117,
    F7 = -118,
    F8 = -119,
    F9 = -120,
    F10 = -121,
    F11 = -122,
    F12 = -123,
    NumLock = -144,
}

impl NamedKey {
    pub fn from_code(code: i32) -> Option<NamedKey> {
        use NamedKey::*;
        Some(match code {
            -8 => Backspace,
            -9 => Tab,
            -13 => Enter,
            -16 => Shift,
            -17 => Ctrl,
            -18 => Alt,
            -20 => CapsLock,
            -27 => Esc,
            -33 => PageUp,
            -34 => PageDown,
            -35 => End,
            -36 => Home,
            -37 => Left,
            -38 => Up,
            -39 => Right,
            -40 => Down,
            -45 => Insert,
            -46 => Delete,
            -91 => Meta,
            -112 => F1,
            -113 => F2,
            -114 => F3,
            -115 => F4,
            -116 => F5,
            -117 => F6,
            -118 => F7,
            -119 => F8,
            -120 => F9,
            -121 => F10,
            -122 => F11,
            -123 => F12,
            -144 => NumLock,
            _ => return None,
        })
    }
}

/// A decoded key event: either a named non-character key or a Unicode
/// character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Named(NamedKey),
    Char(char),
}

/// Validates a raw key code (already XORed with the snake-oil key) and
/// decodes it. Returns `None` for anything outside the whitelist / valid
/// Unicode range, per the "invalid tokens abort event parsing"
/// rule.
pub fn decode_key(code: i32) -> Option<Key> {
    if code < 0 {
        return NamedKey::from_code(code).map(Key::Named);
    }
    if code == 0 {
        return None;
    }
    let code = code as u32;
    if code > 0x10FFFF {
        return None;
    }
    if (0xD800..=0xDFFF).contains(&code) {
        return None; // surrogate halves are not valid standalone codepoints
    }
    char::from_u32(code).map(Key::Char)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_named_keys() {
        assert_eq!(decode_key(-8), Some(Key::Named(NamedKey::Backspace)));
        assert_eq!(decode_key(-144), Some(Key::Named(NamedKey::NumLock)));
    }

    #[test]
    fn decodes_unicode_chars() {
        assert_eq!(decode_key(65), Some(Key::Char('A')));
        assert_eq!(decode_key(0x1F600), Some(Key::Char('\u{1F600}')));
    }

    #[test]
    fn rejects_unknown_negative_codes() {
        assert_eq!(decode_key(-1), None);
        assert_eq!(decode_key(-999), None);
    }

    #[test]
    fn rejects_zero_and_surrogates_and_out_of_range() {
        assert_eq!(decode_key(0), None);
        assert_eq!(decode_key(0xD800), None);
        assert_eq!(decode_key(0xDFFF), None);
        assert_eq!(decode_key(0x110000), None);
    }
}
