use usbkvm_bridge::serial::keyboard::ascii_keycode;
use usbkvm_bridge::serial::protocol::{keyboard_report, MOD_LEFT_SHIFT};

#[test]
fn typing_a_shifted_character_builds_the_expected_report() {
    let (code, modifier) = ascii_keycode('A').expect("letter should map");
    let report = keyboard_report(modifier, &[code]);
    assert_eq!(report, [MOD_LEFT_SHIFT, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn every_printable_ascii_character_maps() {
    for byte in 0x20u8..0x7F {
        let c = byte as char;
        assert!(
            ascii_keycode(c).is_some(),
            "no keycode for {:?} (0x{:02X})",
            c,
            byte
        );
    }
}
