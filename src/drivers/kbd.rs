//! 8042 PS/2 keyboard
//!
//! Set-1 scancode decoding, just enough for the command shell: letters,
//! digits, punctuation, shift, enter and backspace.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::inb;

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const STATUS_OUTPUT_FULL: u8 = 1 << 0;

const SC_LSHIFT: u8 = 0x2A;
const SC_RSHIFT: u8 = 0x36;
const SC_RELEASE: u8 = 0x80;

static SHIFT: AtomicBool = AtomicBool::new(false);

const PLAIN: [u8; 64] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ', 0, 0, 0, 0, 0, 0,
];

const SHIFTED: [u8; 64] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 0x08, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ', 0, 0, 0, 0, 0, 0,
];

fn decode(scancode: u8) -> Option<char> {
    if scancode & SC_RELEASE != 0 {
        let pressed = scancode & !SC_RELEASE;
        if pressed == SC_LSHIFT || pressed == SC_RSHIFT {
            SHIFT.store(false, Ordering::Relaxed);
        }
        return None;
    }

    if scancode == SC_LSHIFT || scancode == SC_RSHIFT {
        SHIFT.store(true, Ordering::Relaxed);
        return None;
    }

    let table = if SHIFT.load(Ordering::Relaxed) {
        &SHIFTED
    } else {
        &PLAIN
    };
    match table.get(scancode as usize) {
        Some(&byte) if byte != 0 => Some(byte as char),
        _ => None,
    }
}

/// Keyboard interrupt body: decode pending scancodes into the shell
pub fn handle_interrupt() {
    unsafe {
        while inb(STATUS_PORT) & STATUS_OUTPUT_FULL != 0 {
            let scancode = inb(DATA_PORT);
            if let Some(c) = decode(scancode) {
                crate::shell::push_input(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_letters_and_shift() {
        assert_eq!(decode(0x10), Some('q'));
        assert_eq!(decode(SC_LSHIFT), None);
        assert_eq!(decode(0x10), Some('Q'));
        assert_eq!(decode(SC_LSHIFT | SC_RELEASE), None);
        assert_eq!(decode(0x10), Some('q'));
    }

    #[test]
    fn test_decode_enter() {
        assert_eq!(decode(0x1C), Some('\n'));
    }
}
