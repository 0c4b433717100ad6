use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{Result, SerialTransport};
use crate::serial::protocol::{encode_mouse_absolute, encode_mouse_relative};

/// Mouse buttons as wire bitmask values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn mask(&self) -> u8 {
        match self {
            MouseButton::Left => 0x01,
            MouseButton::Right => 0x02,
            MouseButton::Middle => 0x04,
        }
    }
}

/// High-level mouse input over a shared transport.
pub struct Mouse {
    transport: Arc<Mutex<SerialTransport>>,
    /// Hold time between button press and release.
    click_delay: Duration,
    /// Pause between the two presses of a double click.
    double_click_interval: Duration,
    /// Buttons currently held, so moves keep them pressed.
    held_buttons: u8,
}

impl Mouse {
    pub fn new(transport: Arc<Mutex<SerialTransport>>) -> Self {
        Self {
            transport,
            click_delay: Duration::from_millis(50),
            double_click_interval: Duration::from_millis(100),
            held_buttons: 0,
        }
    }

    pub fn set_click_delay(&mut self, delay: Duration) {
        self.click_delay = delay;
    }

    /// Relative move by (dx, dy); deltas beyond +-127 are clamped.
    pub async fn move_relative(&self, dx: i32, dy: i32) -> Result<()> {
        let payload = encode_mouse_relative(self.held_buttons, dx, dy, 0);
        self.transport
            .lock()
            .await
            .send_mouse_relative(payload)
            .await
    }

    /// Absolute move to (x, y) on the 0..=32767 logical grid.
    pub async fn move_absolute(&self, x: i32, y: i32) -> Result<()> {
        let payload = encode_mouse_absolute(self.held_buttons, x, y, 0);
        self.transport
            .lock()
            .await
            .send_mouse_absolute(payload)
            .await
    }

    /// Press and hold a button; subsequent moves drag.
    pub async fn press(&mut self, button: MouseButton) -> Result<()> {
        self.held_buttons |= button.mask();
        let payload = encode_mouse_relative(self.held_buttons, 0, 0, 0);
        self.transport
            .lock()
            .await
            .send_mouse_relative(payload)
            .await
    }

    /// Release one held button.
    pub async fn release(&mut self, button: MouseButton) -> Result<()> {
        self.held_buttons &= !button.mask();
        let payload = encode_mouse_relative(self.held_buttons, 0, 0, 0);
        self.transport
            .lock()
            .await
            .send_mouse_relative(payload)
            .await
    }

    /// Release every held button.
    pub async fn release_all(&mut self) -> Result<()> {
        self.held_buttons = 0;
        let payload = encode_mouse_relative(0, 0, 0, 0);
        self.transport
            .lock()
            .await
            .send_mouse_relative(payload)
            .await
    }

    /// Click a button in place: press, hold briefly, release.
    pub async fn click(&mut self, button: MouseButton) -> Result<()> {
        self.press(button).await?;
        sleep(self.click_delay).await;
        self.release(button).await
    }

    pub async fn double_click(&mut self, button: MouseButton) -> Result<()> {
        self.click(button).await?;
        sleep(self.double_click_interval).await;
        self.click(button).await
    }

    /// Scroll the wheel; positive is away from the user. Amounts beyond
    /// +-127 are clamped.
    pub async fn scroll(&self, amount: i32) -> Result<()> {
        let payload = encode_mouse_relative(self.held_buttons, 0, 0, amount);
        self.transport
            .lock()
            .await
            .send_mouse_relative(payload)
            .await
    }

    pub fn held_buttons(&self) -> u8 {
        self.held_buttons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_masks() {
        assert_eq!(MouseButton::Left.mask(), 0x01);
        assert_eq!(MouseButton::Right.mask(), 0x02);
        assert_eq!(MouseButton::Middle.mask(), 0x04);
    }

    #[tokio::test]
    async fn test_held_button_bookkeeping() {
        let transport = Arc::new(Mutex::new(SerialTransport::new("/dev/null")));
        let mut mouse = Mouse::new(transport);
        assert_eq!(mouse.held_buttons(), 0);

        // The mask updates before the send, which fails while disconnected.
        let _ = mouse.press(MouseButton::Left).await;
        let _ = mouse.press(MouseButton::Right).await;
        assert_eq!(mouse.held_buttons(), 0x03);
        let _ = mouse.release(MouseButton::Left).await;
        assert_eq!(mouse.held_buttons(), 0x02);
        let _ = mouse.release_all().await;
        assert_eq!(mouse.held_buttons(), 0);
    }
}
