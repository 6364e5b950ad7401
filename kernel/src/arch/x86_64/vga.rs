//! VGA text-mode console.
//!
//! An 80x25 character buffer at physical 0xB8000, two bytes per cell
//! (character, attribute). The writer tracks a full (row, column) cursor:
//! characters wrap at column 80 and the screen scrolls up one line when the
//! cursor passes row 25. All access is serialized behind one mutex.

use core::{fmt, ptr::write_volatile};

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;

/// VGA text-mode color palette. Not all variants are used but the full
/// 16-color palette is defined per the VGA specification.
#[allow(dead_code)] // Full VGA color palette per specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode(((background as u8) << 4) | (foreground as u8))
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

/// Default attribute: light grey on black.
pub const DEFAULT_COLOR: ColorCode = ColorCode::new(Color::LightGray, Color::Black);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

pub const BUFFER_HEIGHT: usize = 25;
pub const BUFFER_WIDTH: usize = 80;

/// Physical address of the text buffer.
pub const VGA_BUFFER_ADDR: usize = 0xB8000;

#[repr(transparent)]
pub struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

impl Buffer {
    /// A blank buffer for exercising the writer off-target.
    #[cfg(not(target_os = "none"))]
    pub fn blank() -> alloc::boxed::Box<Buffer> {
        alloc::boxed::Box::new(Buffer {
            chars: [[ScreenChar {
                ascii_character: b' ',
                color_code: DEFAULT_COLOR,
            }; BUFFER_WIDTH]; BUFFER_HEIGHT],
        })
    }
}

pub struct Writer {
    row: usize,
    column: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

impl Writer {
    /// Create a writer over an existing buffer, cursor at the top left.
    pub fn new(buffer: &'static mut Buffer) -> Self {
        Self {
            row: 0,
            column: 0,
            color_code: DEFAULT_COLOR,
            buffer,
        }
    }

    /// Write one byte at the cursor, wrapping at column 80 and scrolling
    /// at row 25.
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }

                let row = self.row;
                let col = self.column;
                let color_code = self.color_code;
                // SAFETY: The VGA buffer is memory-mapped I/O; write_volatile
                // keeps the store from being optimized away. row < 25 is
                // maintained by new_line and col < 80 by the wrap above.
                unsafe {
                    write_volatile(
                        &mut self.buffer.chars[row][col],
                        ScreenChar {
                            ascii_character: byte,
                            color_code,
                        },
                    );
                }
                self.column += 1;
            }
        }
    }

    /// Write a string, substituting 0xFE for non-printable bytes.
    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Set the color used for subsequent characters.
    pub fn set_color(&mut self, foreground: Color, background: Color) {
        self.color_code = ColorCode::new(foreground, background);
    }

    /// Clear the whole screen with spaces in the current color and home
    /// the cursor.
    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.row = 0;
        self.column = 0;
    }

    /// Scroll the contents up one line, blanking the bottom row.
    pub fn scroll_up(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                // SAFETY: Volatile copy within the VGA buffer; row is in
                // 1..25 and col in 0..80, so row-1 and col stay in bounds.
                let character = unsafe { core::ptr::read_volatile(&self.buffer.chars[row][col]) };
                unsafe {
                    write_volatile(&mut self.buffer.chars[row - 1][col], character);
                }
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
    }

    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
        } else {
            self.scroll_up();
        }
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            // SAFETY: Volatile store inside the buffer; row and col are
            // bounded by the dimensions.
            unsafe {
                write_volatile(&mut self.buffer.chars[row][col], blank);
            }
        }
    }

    /// Cursor position as (row, column).
    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.column)
    }

    /// Character and attribute at a cell. Test/diagnostic accessor.
    pub fn char_at(&self, row: usize, col: usize) -> (u8, u8) {
        // SAFETY: Volatile read inside the buffer; callers pass in-bounds
        // coordinates (debug-asserted here).
        debug_assert!(row < BUFFER_HEIGHT && col < BUFFER_WIDTH);
        let c = unsafe { core::ptr::read_volatile(&self.buffer.chars[row][col]) };
        (c.ascii_character, c.color_code.as_u8())
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

#[cfg(target_os = "none")]
lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        row: 0,
        column: 0,
        color_code: DEFAULT_COLOR,
        // SAFETY: 0xB8000 is the well-known physical address of the VGA
        // text buffer, reachable through the kernel's boot mapping. The
        // cast to &'static mut Buffer is valid because the buffer has
        // static lifetime and is protected by the enclosing Mutex.
        buffer: unsafe { &mut *(VGA_BUFFER_ADDR as *mut Buffer) },
    });
}

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use crate::arch::x86_64::hal;

    hal::without_interrupts(|| {
        let mut writer = WRITER.lock();
        let _ = writer.write_fmt(args);
        crate::arch::x86_64::serial::_print(args);
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    fn test_writer() -> Writer {
        Writer::new(Box::leak(Buffer::blank()))
    }

    #[test]
    fn characters_advance_the_cursor() {
        let mut w = test_writer();
        w.write_string("hi");
        assert_eq!(w.cursor(), (0, 2));
        assert_eq!(w.char_at(0, 0).0, b'h');
        assert_eq!(w.char_at(0, 1).0, b'i');
    }

    #[test]
    fn wraps_at_column_80() {
        let mut w = test_writer();
        for _ in 0..81 {
            w.write_byte(b'x');
        }
        assert_eq!(w.cursor(), (1, 1));
        assert_eq!(w.char_at(1, 0).0, b'x');
    }

    #[test]
    fn scrolls_at_row_25() {
        let mut w = test_writer();
        w.write_string("top\n");
        for _ in 0..BUFFER_HEIGHT - 1 {
            w.write_byte(b'\n');
        }
        // The cursor stays on the last row and the first line scrolled off.
        assert_eq!(w.cursor().0, BUFFER_HEIGHT - 1);
        assert_eq!(w.char_at(0, 0).0, b' ');
    }

    #[test]
    fn clear_fills_with_spaces_and_homes_cursor() {
        let mut w = test_writer();
        w.write_string("junk");
        w.clear();
        assert_eq!(w.cursor(), (0, 0));
        assert_eq!(w.char_at(0, 0).0, b' ');
        assert_eq!(w.char_at(0, 3).0, b' ');
    }

    #[test]
    fn default_attribute_is_light_grey_on_black() {
        let mut w = test_writer();
        w.write_byte(b'a');
        assert_eq!(w.char_at(0, 0).1, 0x07);
    }

    #[test]
    fn set_color_applies_to_new_characters() {
        let mut w = test_writer();
        w.write_byte(b'a');
        w.set_color(Color::Yellow, Color::Blue);
        w.write_byte(b'b');
        assert_eq!(w.char_at(0, 0).1, 0x07);
        assert_eq!(w.char_at(0, 1).1, (1 << 4) | 14);
    }
}
