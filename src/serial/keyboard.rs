use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{Result, SerialError, SerialTransport};
use crate::serial::protocol::{
    keyboard_report, MOD_LEFT_ALT, MOD_LEFT_CTRL, MOD_LEFT_GUI, MOD_LEFT_SHIFT, MOD_RIGHT_ALT,
    MOD_RIGHT_CTRL, MOD_RIGHT_GUI, MOD_RIGHT_SHIFT,
};

// HID usage ids for keys addressable by name
const KEY_ENTER: u8 = 0x28;
const KEY_ESC: u8 = 0x29;
const KEY_BACKSPACE: u8 = 0x2A;
const KEY_TAB: u8 = 0x2B;
const KEY_SPACE: u8 = 0x2C;
const KEY_CAPS_LOCK: u8 = 0x39;
const KEY_INSERT: u8 = 0x49;
const KEY_HOME: u8 = 0x4A;
const KEY_PAGE_UP: u8 = 0x4B;
const KEY_DELETE: u8 = 0x4C;
const KEY_END: u8 = 0x4D;
const KEY_PAGE_DOWN: u8 = 0x4E;
const KEY_RIGHT: u8 = 0x4F;
const KEY_LEFT: u8 = 0x50;
const KEY_DOWN: u8 = 0x51;
const KEY_UP: u8 = 0x52;

/// ASCII character to (usage id, modifier bitmask). US layout.
static ASCII_KEYCODES: Lazy<HashMap<char, (u8, u8)>> = Lazy::new(|| {
    let mut map = HashMap::new();

    for (i, c) in ('a'..='z').enumerate() {
        map.insert(c, (0x04 + i as u8, 0));
        map.insert(c.to_ascii_uppercase(), (0x04 + i as u8, MOD_LEFT_SHIFT));
    }
    for (i, c) in ('1'..='9').enumerate() {
        map.insert(c, (0x1E + i as u8, 0));
    }
    map.insert('0', (0x27, 0));

    for (i, c) in "!@#$%^&*()".chars().enumerate() {
        map.insert(c, (0x1E + i as u8, MOD_LEFT_SHIFT));
    }

    map.insert('\n', (KEY_ENTER, 0));
    map.insert('\t', (KEY_TAB, 0));
    map.insert(' ', (KEY_SPACE, 0));

    let punctuation = [
        ('-', 0x2D, 0),
        ('_', 0x2D, MOD_LEFT_SHIFT),
        ('=', 0x2E, 0),
        ('+', 0x2E, MOD_LEFT_SHIFT),
        ('[', 0x2F, 0),
        ('{', 0x2F, MOD_LEFT_SHIFT),
        (']', 0x30, 0),
        ('}', 0x30, MOD_LEFT_SHIFT),
        ('\\', 0x31, 0),
        ('|', 0x31, MOD_LEFT_SHIFT),
        (';', 0x33, 0),
        (':', 0x33, MOD_LEFT_SHIFT),
        ('\'', 0x34, 0),
        ('"', 0x34, MOD_LEFT_SHIFT),
        ('`', 0x35, 0),
        ('~', 0x35, MOD_LEFT_SHIFT),
        (',', 0x36, 0),
        ('<', 0x36, MOD_LEFT_SHIFT),
        ('.', 0x37, 0),
        ('>', 0x37, MOD_LEFT_SHIFT),
        ('/', 0x38, 0),
        ('?', 0x38, MOD_LEFT_SHIFT),
    ];
    for (c, code, modifier) in punctuation {
        map.insert(c, (code, modifier));
    }

    map
});

/// Resolve an ASCII character to its usage id and modifier bitmask.
pub fn ascii_keycode(c: char) -> Option<(u8, u8)> {
    ASCII_KEYCODES.get(&c).copied()
}

/// Resolve a key name used in combinations ("ctrl", "f5", "enter", "a").
fn named_key(name: &str) -> Option<NamedKey> {
    let lower = name.to_ascii_lowercase();
    let modifier = match lower.as_str() {
        "ctrl" | "lctrl" => Some(MOD_LEFT_CTRL),
        "shift" | "lshift" => Some(MOD_LEFT_SHIFT),
        "alt" | "lalt" => Some(MOD_LEFT_ALT),
        "win" | "gui" | "meta" | "cmd" => Some(MOD_LEFT_GUI),
        "rctrl" => Some(MOD_RIGHT_CTRL),
        "rshift" => Some(MOD_RIGHT_SHIFT),
        "ralt" => Some(MOD_RIGHT_ALT),
        "rwin" | "rgui" => Some(MOD_RIGHT_GUI),
        _ => None,
    };
    if let Some(bit) = modifier {
        return Some(NamedKey::Modifier(bit));
    }

    let code = match lower.as_str() {
        "enter" | "return" => Some(KEY_ENTER),
        "esc" | "escape" => Some(KEY_ESC),
        "backspace" => Some(KEY_BACKSPACE),
        "tab" => Some(KEY_TAB),
        "space" => Some(KEY_SPACE),
        "capslock" => Some(KEY_CAPS_LOCK),
        "insert" => Some(KEY_INSERT),
        "home" => Some(KEY_HOME),
        "pageup" => Some(KEY_PAGE_UP),
        "delete" | "del" => Some(KEY_DELETE),
        "end" => Some(KEY_END),
        "pagedown" => Some(KEY_PAGE_DOWN),
        "right" => Some(KEY_RIGHT),
        "left" => Some(KEY_LEFT),
        "down" => Some(KEY_DOWN),
        "up" => Some(KEY_UP),
        _ => None,
    };
    if let Some(code) = code {
        return Some(NamedKey::Key(code));
    }

    if let Some(rest) = lower.strip_prefix('f') {
        if let Ok(n) = rest.parse::<u8>() {
            if (1..=12).contains(&n) {
                return Some(NamedKey::Key(0x3A + n - 1));
            }
        }
    }

    let mut chars = lower.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => ascii_keycode(c).map(|(code, _)| NamedKey::Key(code)),
        _ => None,
    }
}

enum NamedKey {
    Modifier(u8),
    Key(u8),
}

/// Keyboard indicator LEDs of the target host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedState {
    pub num_lock: bool,
    pub caps_lock: bool,
    pub scroll_lock: bool,
}

/// High-level keyboard input over a shared transport.
pub struct Keyboard {
    transport: Arc<Mutex<SerialTransport>>,
    /// Pause between characters when typing text.
    char_delay: Duration,
    led_state: LedState,
}

impl Keyboard {
    pub fn new(transport: Arc<Mutex<SerialTransport>>) -> Self {
        Self {
            transport,
            char_delay: Duration::from_millis(20),
            led_state: LedState::default(),
        }
    }

    pub fn set_char_delay(&mut self, delay: Duration) {
        self.char_delay = delay;
    }

    pub fn led_state(&self) -> LedState {
        self.led_state
    }

    /// Send a raw report holding the given modifiers and key codes.
    pub async fn press(&self, modifiers: u8, keys: &[u8]) -> Result<()> {
        let report = keyboard_report(modifiers, keys);
        self.transport
            .lock()
            .await
            .send_keyboard_report(report)
            .await
    }

    /// Send the all-zero report that releases every held key.
    pub async fn release_all(&self) -> Result<()> {
        self.transport
            .lock()
            .await
            .send_keyboard_report([0u8; 8])
            .await
    }

    /// Press and release a single key.
    pub async fn send_key_press(&self, modifiers: u8, key: u8) -> Result<()> {
        self.press(modifiers, &[key]).await?;
        self.release_all().await
    }

    /// Type an ASCII string, one press/release pair per character.
    /// Characters outside the layout table are skipped with a warning.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        for c in text.chars() {
            match ascii_keycode(c) {
                Some((code, modifier)) => {
                    self.send_key_press(modifier, code).await?;
                    sleep(self.char_delay).await;
                }
                None => {
                    log::warn!("No keycode for character {:?}, skipping", c);
                }
            }
        }
        Ok(())
    }

    /// Press a named combination like `["ctrl", "alt", "delete"]`: all
    /// modifiers and up to six keys held in one report, then released.
    pub async fn send_key_combination(&self, keys: &[&str]) -> Result<()> {
        let mut modifiers = 0u8;
        let mut codes: Vec<u8> = Vec::new();

        for name in keys {
            match named_key(name) {
                Some(NamedKey::Modifier(bit)) => modifiers |= bit,
                Some(NamedKey::Key(code)) => codes.push(code),
                None => {
                    return Err(SerialError::ProtocolError(format!(
                        "unknown key name: {}",
                        name
                    )));
                }
            }
        }
        if codes.len() > 6 {
            return Err(SerialError::ProtocolError(
                "combination holds more than six keys".to_string(),
            ));
        }

        self.press(modifiers, &codes).await?;
        self.release_all().await
    }

    /// Refresh the cached LED state from the chip's indicator byte.
    pub async fn update_led_state(&mut self) -> Result<LedState> {
        let info = self.transport.lock().await.get_info()?;
        self.led_state = LedState {
            num_lock: info.num_lock(),
            caps_lock: info.caps_lock(),
            scroll_lock: info.scroll_lock(),
        };
        Ok(self.led_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_lowercase_letters() {
        assert_eq!(ascii_keycode('a'), Some((0x04, 0)));
        assert_eq!(ascii_keycode('z'), Some((0x1D, 0)));
    }

    #[test]
    fn test_ascii_uppercase_needs_shift() {
        assert_eq!(ascii_keycode('A'), Some((0x04, MOD_LEFT_SHIFT)));
        assert_eq!(ascii_keycode('Z'), Some((0x1D, MOD_LEFT_SHIFT)));
    }

    #[test]
    fn test_ascii_digits_and_symbols() {
        assert_eq!(ascii_keycode('1'), Some((0x1E, 0)));
        assert_eq!(ascii_keycode('0'), Some((0x27, 0)));
        assert_eq!(ascii_keycode('!'), Some((0x1E, MOD_LEFT_SHIFT)));
        assert_eq!(ascii_keycode(')'), Some((0x27, MOD_LEFT_SHIFT)));
        assert_eq!(ascii_keycode('?'), Some((0x38, MOD_LEFT_SHIFT)));
    }

    #[test]
    fn test_ascii_whitespace() {
        assert_eq!(ascii_keycode('\n'), Some((KEY_ENTER, 0)));
        assert_eq!(ascii_keycode('\t'), Some((KEY_TAB, 0)));
        assert_eq!(ascii_keycode(' '), Some((KEY_SPACE, 0)));
    }

    #[test]
    fn test_ascii_unknown_character() {
        assert_eq!(ascii_keycode('é'), None);
    }

    #[test]
    fn test_named_modifiers() {
        assert!(matches!(
            named_key("ctrl"),
            Some(NamedKey::Modifier(MOD_LEFT_CTRL))
        ));
        assert!(matches!(
            named_key("Shift"),
            Some(NamedKey::Modifier(MOD_LEFT_SHIFT))
        ));
        assert!(matches!(
            named_key("rctrl"),
            Some(NamedKey::Modifier(MOD_RIGHT_CTRL))
        ));
    }

    #[test]
    fn test_named_function_keys() {
        assert!(matches!(named_key("f1"), Some(NamedKey::Key(0x3A))));
        assert!(matches!(named_key("F12"), Some(NamedKey::Key(0x45))));
        assert!(named_key("f13").is_none());
        assert!(named_key("f0").is_none());
    }

    #[test]
    fn test_named_specials_and_letters() {
        assert!(matches!(named_key("enter"), Some(NamedKey::Key(KEY_ENTER))));
        assert!(matches!(named_key("delete"), Some(NamedKey::Key(KEY_DELETE))));
        assert!(matches!(named_key("c"), Some(NamedKey::Key(0x06))));
        assert!(named_key("bogus").is_none());
    }
}
