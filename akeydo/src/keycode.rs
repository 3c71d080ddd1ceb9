//! Lookup from the Linux kernel's `KEY_*` input-event-code names to the
//! numeric codes evdev uses on the wire, for hotkeys configured as strings
//! in YAML settings or libvirt domain metadata.

/// Resolves a `KEY_*` name (e.g. `"KEY_LEFTCTRL"`) to its evdev key code.
///
/// Only the subset of keys plausible in a hotkey chord is covered:
/// modifiers, the alphanumeric row, function keys, and the keypad. An
/// unrecognized name returns `None`; the caller is responsible for logging
/// and failing the entire hotkey rather than silently dropping one key.
#[must_use]
pub fn lookup(name: &str) -> Option<u16> {
    use evdev::Key;

    let key = match name {
        "KEY_LEFTCTRL" => Key::KEY_LEFTCTRL,
        "KEY_RIGHTCTRL" => Key::KEY_RIGHTCTRL,
        "KEY_LEFTALT" => Key::KEY_LEFTALT,
        "KEY_RIGHTALT" => Key::KEY_RIGHTALT,
        "KEY_LEFTSHIFT" => Key::KEY_LEFTSHIFT,
        "KEY_RIGHTSHIFT" => Key::KEY_RIGHTSHIFT,
        "KEY_LEFTMETA" => Key::KEY_LEFTMETA,
        "KEY_RIGHTMETA" => Key::KEY_RIGHTMETA,
        "KEY_ESC" => Key::KEY_ESC,
        "KEY_TAB" => Key::KEY_TAB,
        "KEY_SPACE" => Key::KEY_SPACE,
        "KEY_ENTER" => Key::KEY_ENTER,
        "KEY_BACKSPACE" => Key::KEY_BACKSPACE,
        "KEY_CAPSLOCK" => Key::KEY_CAPSLOCK,
        "KEY_SCROLLLOCK" => Key::KEY_SCROLLLOCK,
        "KEY_NUMLOCK" => Key::KEY_NUMLOCK,
        "KEY_MINUS" => Key::KEY_MINUS,
        "KEY_EQUAL" => Key::KEY_EQUAL,
        "KEY_A" => Key::KEY_A,
        "KEY_B" => Key::KEY_B,
        "KEY_C" => Key::KEY_C,
        "KEY_D" => Key::KEY_D,
        "KEY_E" => Key::KEY_E,
        "KEY_F" => Key::KEY_F,
        "KEY_G" => Key::KEY_G,
        "KEY_H" => Key::KEY_H,
        "KEY_I" => Key::KEY_I,
        "KEY_J" => Key::KEY_J,
        "KEY_K" => Key::KEY_K,
        "KEY_L" => Key::KEY_L,
        "KEY_M" => Key::KEY_M,
        "KEY_N" => Key::KEY_N,
        "KEY_O" => Key::KEY_O,
        "KEY_P" => Key::KEY_P,
        "KEY_Q" => Key::KEY_Q,
        "KEY_R" => Key::KEY_R,
        "KEY_S" => Key::KEY_S,
        "KEY_T" => Key::KEY_T,
        "KEY_U" => Key::KEY_U,
        "KEY_V" => Key::KEY_V,
        "KEY_W" => Key::KEY_W,
        "KEY_X" => Key::KEY_X,
        "KEY_Y" => Key::KEY_Y,
        "KEY_Z" => Key::KEY_Z,
        "KEY_0" => Key::KEY_0,
        "KEY_1" => Key::KEY_1,
        "KEY_2" => Key::KEY_2,
        "KEY_3" => Key::KEY_3,
        "KEY_4" => Key::KEY_4,
        "KEY_5" => Key::KEY_5,
        "KEY_6" => Key::KEY_6,
        "KEY_7" => Key::KEY_7,
        "KEY_8" => Key::KEY_8,
        "KEY_9" => Key::KEY_9,
        "KEY_F1" => Key::KEY_F1,
        "KEY_F2" => Key::KEY_F2,
        "KEY_F3" => Key::KEY_F3,
        "KEY_F4" => Key::KEY_F4,
        "KEY_F5" => Key::KEY_F5,
        "KEY_F6" => Key::KEY_F6,
        "KEY_F7" => Key::KEY_F7,
        "KEY_F8" => Key::KEY_F8,
        "KEY_F9" => Key::KEY_F9,
        "KEY_F10" => Key::KEY_F10,
        "KEY_F11" => Key::KEY_F11,
        "KEY_F12" => Key::KEY_F12,
        "KEY_KP0" => Key::KEY_KP0,
        "KEY_KP1" => Key::KEY_KP1,
        "KEY_KP2" => Key::KEY_KP2,
        "KEY_KP3" => Key::KEY_KP3,
        "KEY_KP4" => Key::KEY_KP4,
        "KEY_KP5" => Key::KEY_KP5,
        "KEY_KP6" => Key::KEY_KP6,
        "KEY_KP7" => Key::KEY_KP7,
        "KEY_KP8" => Key::KEY_KP8,
        "KEY_KP9" => Key::KEY_KP9,
        _ => return None,
    };
    Some(key.code())
}

/// Parses an iterable of `KEY_*` names into a [`crate::model::Chord`].
///
/// If any name fails to resolve, the whole chord is discarded (logged as a
/// warning) rather than silently dropping one key from it — a chord missing
/// a key would fire too eagerly.
pub fn parse_chord<'a>(keys: impl IntoIterator<Item = &'a str>) -> Option<crate::model::Chord> {
    let mut codes = Vec::new();
    for name in keys {
        match lookup(name) {
            Some(code) => codes.push(code),
            None => {
                tracing::warn!(
                    "unable to resolve key {name:?}; hotkey will be unavailable"
                );
                return None;
            }
        }
    }
    if codes.is_empty() {
        None
    } else {
        Some(crate::model::Chord::new(codes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_keys() {
        assert!(lookup("KEY_LEFTCTRL").is_some());
        assert!(lookup("KEY_RIGHTCTRL").is_some());
    }

    #[test]
    fn unknown_key_fails_whole_chord() {
        assert!(parse_chord(["KEY_LEFTCTRL", "KEY_NOT_A_REAL_KEY"]).is_none());
    }

    #[test]
    fn empty_input_yields_no_chord() {
        assert!(parse_chord(Vec::<&str>::new()).is_none());
    }

    #[test]
    fn valid_chord_parses() {
        let chord = parse_chord(["KEY_LEFTCTRL", "KEY_RIGHTCTRL"]).unwrap();
        assert_eq!(chord.keys().count(), 2);
    }
}
