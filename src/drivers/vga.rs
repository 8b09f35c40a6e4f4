//! VGA text terminal
//!
//! 80x25 character buffer at the standard physical window. This is the
//! user-facing console; the trace log goes to the serial port.

use crate::kern::lock::SpinLock;

const BUFFER_ADDR: usize = 0xB8000;
const COLS: usize = 80;
const ROWS: usize = 25;

const COLOR_LIGHT_GREY_ON_BLACK: u8 = 0x07;

pub struct VgaTerminal {
    row: usize,
    col: usize,
    color: u8,
}

impl VgaTerminal {
    const fn new() -> Self {
        Self {
            row: 0,
            col: 0,
            color: COLOR_LIGHT_GREY_ON_BLACK,
        }
    }

    fn cell(row: usize, col: usize) -> *mut u16 {
        (BUFFER_ADDR + 2 * (row * COLS + col)) as *mut u16
    }

    fn put_at(&self, row: usize, col: usize, byte: u8) {
        let value = (self.color as u16) << 8 | byte as u16;
        unsafe {
            Self::cell(row, col).write_volatile(value);
        }
    }

    pub fn clear(&mut self) {
        for row in 0..ROWS {
            for col in 0..COLS {
                self.put_at(row, col, b' ');
            }
        }
        self.row = 0;
        self.col = 0;
    }

    fn scroll(&mut self) {
        for row in 1..ROWS {
            for col in 0..COLS {
                let value = unsafe { Self::cell(row, col).read_volatile() };
                unsafe {
                    Self::cell(row - 1, col).write_volatile(value);
                }
            }
        }
        for col in 0..COLS {
            self.put_at(ROWS - 1, col, b' ');
        }
        self.row = ROWS - 1;
        self.col = 0;
    }

    fn newline(&mut self) {
        self.col = 0;
        self.row += 1;
        if self.row == ROWS {
            self.scroll();
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            0x08 => {
                // backspace
                if self.col > 0 {
                    self.col -= 1;
                    self.put_at(self.row, self.col, b' ');
                }
            }
            byte => {
                if self.col == COLS {
                    self.newline();
                }
                self.put_at(self.row, self.col, byte);
                self.col += 1;
            }
        }
    }
}

impl core::fmt::Write for VgaTerminal {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

static TERMINAL: SpinLock<VgaTerminal> = SpinLock::new(VgaTerminal::new());

pub fn clear() {
    TERMINAL.lock().clear();
}

pub fn write_fmt(args: core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = TERMINAL.lock().write_fmt(args);
}
