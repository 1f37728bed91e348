//! Wire constants for the BF serial bootloader

use crate::cipher::KeyIndex;

/// Unlock sequence, answered with a single byte
pub const UNLOCK_MAGIC: &[u8; 16] = b"PROGRAMBFNORMALU";
pub const UNLOCK_RESP_LEN: usize = 1;

pub const STATUS_RESP_LEN: usize = 16;
pub const IDENT_RESP_LEN: usize = 15;

/// Prefix of the key selection command
pub const KEY_SELECT_PREFIX: &[u8; 4] = b"SEND";

/// Key selection data sent during the handshake, see [`select_key`]
pub const KEY_SELECT_PAYLOAD: [u8; 20] = [
    0x21, 0x05, 0x0D, 0x01, 0x01, 0x01, 0x04, 0x11, 0x08, 0x05,
    0x0D, 0x0D, 0x01, 0x11, 0x0F, 0x09, 0x12, 0x09, 0x10, 0x04,
];

/// Terminator following the key selection payload, the device's reference
/// client sends it making the command 25 bytes long
pub const KEY_SELECT_TERMINATOR: u8 = 0x00;
pub const KEY_SELECT_RESP_LEN: usize = 1;

/// Length of the echoed header preceding block read data
pub const BLOCK_HEADER_LEN: usize = 4;

/// Acknowledgement of a block write
pub const ACK: u8 = 0x06;

/// Default block size for this device
pub const DEFAULT_BLOCK_SIZE: u8 = 0x40;

/// Writing the block at this address erases the whole flash sector on the device
pub const ERASE_SECTOR_START: u16 = 0xF000;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Dumps 16 bytes of device status
    Status = 0x46,

    /// Returns the device revision and identification string
    Identify = 0x4D,

    /// Reads one block, echoing the opcode and address before the data
    ReadBlock = 0x52,

    /// Writes one block, answered with [`ACK`]
    WriteBlock = 0x57,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

/// Check whether writing `len` bytes from `addr` in `block_size` steps
/// writes the block at [`ERASE_SECTOR_START`], addresses wrapping at 0xFFFF
pub fn covers_erase_sector(addr: u16, len: usize, block_size: u8) -> bool {
    (0..len)
        .step_by(block_size.max(1) as usize)
        .any(|offset| addr.wrapping_add(offset as u16) == ERASE_SECTOR_START)
}

/// Build the full key selection command
pub fn key_select_command() -> Vec<u8> {
    let mut cmd = Vec::with_capacity(KEY_SELECT_PREFIX.len() + KEY_SELECT_PAYLOAD.len() + 1);
    cmd.extend_from_slice(KEY_SELECT_PREFIX);
    cmd.extend_from_slice(&KEY_SELECT_PAYLOAD);
    cmd.push(KEY_SELECT_TERMINATOR);
    cmd
}

/// Build a block command header
pub fn block_header(command: Command, addr: u16, block_size: u8) -> [u8; BLOCK_HEADER_LEN] {
    let [hi, lo] = addr.to_be_bytes();
    [command.opcode(), hi, lo, block_size]
}

/// Resolve the key a device selects from a key selection payload.
///
/// The first byte picks the offset of the key byte: `0x20..=0x24` select
/// even offsets `2..=10`, `0x10..=0x14` select odd offsets `1..=9`.
/// Anything else, or a selected key past the end of the table, is invalid.
///
/// Not used when talking to a device, the handshake always sends
/// [`KEY_SELECT_PAYLOAD`].
pub fn select_key(payload: &[u8]) -> Option<KeyIndex> {
    let d = *payload.first()?;

    let idx = if d >= 0x20 {
        let a = d - 0x20;
        if a > 4 {
            return None;
        }
        2 * a as usize + 2
    } else {
        let a = d.wrapping_sub(0x10);
        if a > 4 {
            return None;
        }
        2 * a as usize + 1
    };

    KeyIndex::new(*payload.get(idx)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_payload_selects_key() {
        assert_eq!(select_key(&KEY_SELECT_PAYLOAD), KeyIndex::new(1));
    }

    #[test]
    fn select_key_offsets() {
        let mut payload = [0u8; 12];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = i as u8;
        }

        for a in 0..=4u8 {
            payload[0] = 0x20 + a;
            assert_eq!(select_key(&payload), KeyIndex::new(2 * a + 2));

            payload[0] = 0x10 + a;
            assert_eq!(select_key(&payload), KeyIndex::new(2 * a + 1));
        }
    }

    #[test]
    fn select_key_rejects_invalid() {
        let mut payload = KEY_SELECT_PAYLOAD;

        // Discriminators out of range
        for d in &[0x25, 0xFF, 0x15, 0x1F, 0x0F, 0x00] {
            payload[0] = *d;
            assert_eq!(select_key(&payload), None, "0x{:02x}", d);
        }

        // Key value past the table
        payload[0] = 0x20;
        payload[2] = 0x14;
        assert_eq!(select_key(&payload), None);
        payload[2] = 0x13;
        assert_eq!(select_key(&payload), KeyIndex::new(0x13));

        // Truncated payloads
        assert_eq!(select_key(&[]), None);
        assert_eq!(select_key(&[0x24, 0, 0]), None);
    }

    #[test]
    fn erase_sector_coverage() {
        assert!(covers_erase_sector(0xF000, 64, 0x40));
        assert!(covers_erase_sector(0xE000, 0x1040, 0x40));
        assert!(!covers_erase_sector(0xE000, 0x1000, 0x40));
        assert!(!covers_erase_sector(0xF040, 0x0FC0, 0x40));

        // Wrapping past 0xFFFF back over the sector start
        assert!(covers_erase_sector(0xFF00, 0xF140, 0x40));
        assert!(!covers_erase_sector(0xFF00, 0xF100, 0x40));

        // Unaligned regions only erase when a block lands on the start
        assert!(!covers_erase_sector(0xEFF0, 0x80, 0x40));
    }

    #[test]
    fn command_layout() {
        let cmd = key_select_command();
        assert_eq!(&cmd[..4], b"SEND");
        assert_eq!(&cmd[4..24], &KEY_SELECT_PAYLOAD[..]);
        assert_eq!(cmd.len(), 25);

        assert_eq!(block_header(Command::ReadBlock, 0xF240, 0x40), [b'R', 0xF2, 0x40, 0x40]);
        assert_eq!(block_header(Command::WriteBlock, 0x0010, 0x40), [b'W', 0x00, 0x10, 0x40]);
        assert_eq!(Command::Status.opcode(), b'F');
        assert_eq!(Command::Identify.opcode(), b'M');
    }
}
