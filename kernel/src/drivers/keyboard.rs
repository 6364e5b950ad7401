//! PS/2 keyboard driver.
//!
//! IRQ1 reads the scancode from port 0x60 and feeds it here. Scancodes are
//! decoded with the `pc_keyboard` crate (scancode set 1, US 104-key
//! layout, shift/ctrl/alt tracked across press and release) and the
//! resulting ASCII bytes land in a lock-free single-producer
//! single-consumer ring buffer. Non-printing keys produce nothing.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, Keyboard, ScancodeSet1};
use spin::Mutex;

use crate::error::KernelResult;

use super::{ControlOp, Driver};

/// PS/2 controller data port.
pub const DATA_PORT: u16 = 0x60;
/// PS/2 controller status/command port.
pub const STATUS_PORT: u16 = 0x64;

/// Bitmask: Shift is held.
pub const MOD_SHIFT: u8 = 0x01;
/// Bitmask: Ctrl is held.
pub const MOD_CTRL: u8 = 0x02;
/// Bitmask: Alt is held.
pub const MOD_ALT: u8 = 0x04;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static MODIFIER_STATE: AtomicU8 = AtomicU8::new(0);

/// Current modifier bitmask.
pub fn get_modifiers() -> u8 {
    MODIFIER_STATE.load(Ordering::Relaxed)
}

fn update_modifier(bit: u8, down: bool) {
    if down {
        MODIFIER_STATE.fetch_or(bit, Ordering::Relaxed);
    } else {
        MODIFIER_STATE.fetch_and(!bit, Ordering::Relaxed);
    }
}

/// Ring buffer size for decoded key bytes (power of 2).
const KEY_BUFFER_SIZE: usize = 256;

/// Lock-free SPSC ring buffer: the IRQ handler produces, the console
/// reader consumes.
struct KeyBuffer {
    buf: UnsafeCell<[u8; KEY_BUFFER_SIZE]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl KeyBuffer {
    const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; KEY_BUFFER_SIZE]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Push a byte (single producer: the IRQ handler). Full buffer drops
    /// the key.
    fn push(&self, byte: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & (KEY_BUFFER_SIZE - 1);
        let tail = self.tail.load(Ordering::Acquire);
        if next == tail {
            return;
        }
        // SAFETY: Only the single producer writes slot `head`, and the
        // consumer will not read it until the Release store below
        // publishes it.
        unsafe {
            (*self.buf.get())[head] = byte;
        }
        self.head.store(next, Ordering::Release);
    }

    /// Pop a byte (single consumer: the console read path).
    fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        // SAFETY: The Acquire load of `head` ordered this slot's write
        // before this read, and only the single consumer advances `tail`.
        let byte = unsafe { (*self.buf.get())[tail] };
        self.tail
            .store((tail + 1) & (KEY_BUFFER_SIZE - 1), Ordering::Release);
        Some(byte)
    }

    fn clear(&self) {
        while self.pop().is_some() {}
    }
}

// SAFETY: head/tail are atomics with Release/Acquire pairing; the buffer
// cells are only touched by the single producer and single consumer in
// the windows those atomics carve out.
unsafe impl Sync for KeyBuffer {}

static KEY_BUFFER: KeyBuffer = KeyBuffer::new();

static KEYBOARD: Mutex<Option<Keyboard<layouts::Us104Key, ScancodeSet1>>> = Mutex::new(None);

/// Initialize the decoder state machine.
pub fn init() {
    let kb = Keyboard::new(
        ScancodeSet1::new(),
        layouts::Us104Key,
        HandleControl::Ignore,
    );
    *KEYBOARD.lock() = Some(kb);
    KEY_BUFFER.clear();
    INITIALIZED.store(true, Ordering::Release);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Feed one scancode from the IRQ handler. Must not print or take any
/// lock shared with preemptible code.
pub fn handle_scancode(scancode: u8) {
    let mut guard = KEYBOARD.lock();
    let Some(keyboard) = guard.as_mut() else {
        return;
    };

    if let Ok(Some(key_event)) = keyboard.add_byte(scancode) {
        // Track modifiers from the raw event before process_keyevent
        // consumes it; releases matter as much as presses.
        let is_down = key_event.state == pc_keyboard::KeyState::Down;
        match key_event.code {
            KeyCode::LShift | KeyCode::RShift => update_modifier(MOD_SHIFT, is_down),
            KeyCode::LControl | KeyCode::RControl => update_modifier(MOD_CTRL, is_down),
            KeyCode::LAlt | KeyCode::RAltGr => update_modifier(MOD_ALT, is_down),
            _ => {}
        }

        if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(key_event) {
            if ch.is_ascii() {
                KEY_BUFFER.push(ch as u8);
            }
        }
        // RawKey (arrows, function keys) yields nothing at this layer.
    }
}

/// Read one decoded key byte, non-blocking.
pub fn read_key() -> Option<u8> {
    KEY_BUFFER.pop()
}

/// Keyboard driver wrapper for the device registry.
pub struct KeyboardDriver;

impl KeyboardDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KeyboardDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for KeyboardDriver {
    fn init(&mut self) -> KernelResult<()> {
        init();
        Ok(())
    }

    fn read(&mut self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            match read_key() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        // Keyboards are input-only; writes are swallowed.
        Ok(buf.len())
    }

    fn control(&mut self, op: ControlOp) -> KernelResult<()> {
        if op == ControlOp::Flush {
            KEY_BUFFER.clear();
        }
        Ok(())
    }

    fn shutdown(&mut self) -> KernelResult<()> {
        INITIALIZED.store(false, Ordering::Release);
        Ok(())
    }
}

/// Serializes tests that touch the global decoder and ring buffer.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Scancode-set-1 values used below: 0x1E = 'a' press, 0x9E = 'a'
    /// release, 0x2A/0xAA = left shift press/release.
    #[test]
    fn press_release_yields_one_ascii_byte() {
        let _guard = TEST_LOCK.lock();
        init();
        handle_scancode(0x1E);
        handle_scancode(0x9E);
        assert_eq!(read_key(), Some(b'a'));
        assert_eq!(read_key(), None);
    }

    #[test]
    fn shift_produces_uppercase_and_tracks_state() {
        let _guard = TEST_LOCK.lock();
        init();
        handle_scancode(0x2A); // shift down
        assert_eq!(get_modifiers() & MOD_SHIFT, MOD_SHIFT);
        handle_scancode(0x1E); // 'a' down
        handle_scancode(0x9E); // 'a' up
        handle_scancode(0xAA); // shift up
        assert_eq!(get_modifiers() & MOD_SHIFT, 0);
        assert_eq!(read_key(), Some(b'A'));
        assert_eq!(read_key(), None);
    }

    #[test]
    fn release_codes_alone_produce_nothing() {
        let _guard = TEST_LOCK.lock();
        init();
        handle_scancode(0x9E);
        assert_eq!(read_key(), None);
    }

    #[test]
    fn driver_read_drains_the_buffer() {
        let _guard = TEST_LOCK.lock();
        init();
        for &code in &[0x23u8, 0xA3, 0x17, 0x97] {
            handle_scancode(code); // 'h' press/release, 'i' press/release
        }
        let mut driver = KeyboardDriver::new();
        let mut buf = [0u8; 8];
        let n = driver.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
