//! PS/2 keyboard scancode queue.
//!
//! The IRQ handler pushes raw scancodes into a fixed-size lock-free queue;
//! kernel code drains it at its leisure and decodes with `pc-keyboard`.

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

use crate::serial_println;

const QUEUE_CAPACITY: usize = 128;

static SCANCODE_QUEUE: OnceCell<ArrayQueue<u8>> = OnceCell::uninit();

lazy_static! {
    static ref DECODER: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(
        Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore)
    );
}

/// Allocate the scancode queue. Must run before interrupts are enabled.
pub fn init() {
    let _ = SCANCODE_QUEUE.try_init_once(|| ArrayQueue::new(QUEUE_CAPACITY));
}

/// Called by the keyboard interrupt handler. Must not block or allocate.
pub(crate) fn add_scancode(scancode: u8) {
    let Ok(queue) = SCANCODE_QUEUE.try_get() else {
        serial_println!("WARNING: scancode queue uninitialized");
        return;
    };
    if queue.push(scancode).is_err() {
        serial_println!("WARNING: scancode queue full; dropping keyboard input");
    }
}

/// Pop the oldest undelivered scancode, if any.
pub fn pop_scancode() -> Option<u8> {
    SCANCODE_QUEUE.try_get().ok().and_then(ArrayQueue::pop)
}

/// Drain one scancode and decode it to a key, when a complete key event is
/// available.
pub fn read_key() -> Option<DecodedKey> {
    let scancode = pop_scancode()?;
    let mut decoder = DECODER.lock();
    let event = decoder.add_byte(scancode).ok().flatten()?;
    decoder.process_keyevent(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_queue_round_trips_scancodes() {
        init();
        while pop_scancode().is_some() {}

        add_scancode(0x1E);
        add_scancode(0x9E);
        assert_eq!(pop_scancode(), Some(0x1E), "FIFO order expected.");
        assert_eq!(pop_scancode(), Some(0x9E), "FIFO order expected.");
        assert_eq!(pop_scancode(), None, "Queue must drain empty.");
    }
}
