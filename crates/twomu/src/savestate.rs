//! Sequential savestate stream.
//!
//! One symmetric `do_savestate` walk serializes or deserializes the whole
//! machine: each component writes its variables in a fixed order inside a
//! named section, and the same code path reads them back. The header carries
//! a magic, a format version, and the console type; a loader rejects a stream
//! up front on any of those, and underflow or section mismatch during the
//! walk sets a sticky error flag checked at the end, so a corrupt stream is
//! reported instead of half-applied.

use tracing::warn;

/// Stream magic
pub const MAGIC: [u8; 4] = *b"TWMU";
/// Bumped on any layout change
pub const VERSION: u16 = 1;

/// Header size: magic + version + console type byte + pad
const HEADER_LEN: usize = 8;

pub struct Savestate {
    buffer: Vec<u8>,
    pos: usize,
    saving: bool,
    error: bool,
}

impl Savestate {
    /// Start a save stream with a fresh header
    pub fn new_save(console_type: u8) -> Self {
        let mut buffer = Vec::with_capacity(1024);
        buffer.extend_from_slice(&MAGIC);
        buffer.extend_from_slice(&VERSION.to_le_bytes());
        buffer.push(console_type);
        buffer.push(0);
        Self {
            buffer,
            pos: HEADER_LEN,
            saving: true,
            error: false,
        }
    }

    /// Open a stream for loading, validating the header.
    ///
    /// Returns the console type recorded in the stream; the caller decides
    /// whether it is acceptable before applying anything.
    pub fn open_load(data: Vec<u8>) -> Result<(Self, u8), String> {
        if data.len() < HEADER_LEN {
            return Err("savestate stream truncated".to_string());
        }
        if data[0..4] != MAGIC {
            return Err("not a savestate stream (bad magic)".to_string());
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(format!(
                "unsupported savestate version {} (expected {})",
                version, VERSION
            ));
        }
        let console_type = data[6];
        let file = Self {
            buffer: data,
            pos: HEADER_LEN,
            saving: false,
            error: false,
        };
        Ok((file, console_type))
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    /// Sticky error state; set on underflow or section mismatch while loading
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// The serialized bytes of a finished save stream
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Section marker. On save it is written; on load it must match the next
    /// four bytes of the stream.
    pub fn section(&mut self, magic: &[u8; 4]) {
        if self.saving {
            self.buffer.extend_from_slice(magic);
        } else {
            let mut found = [0u8; 4];
            self.read(&mut found);
            if !self.error && &found != magic {
                warn!(
                    "savestate section mismatch: expected {:?}, found {:?}",
                    magic, found
                );
                self.error = true;
            }
        }
    }

    /// Whether the whole stream was consumed; trailing garbage counts as
    /// corruption
    pub fn at_end(&self) -> bool {
        self.pos == self.buffer.len()
    }

    fn read(&mut self, out: &mut [u8]) {
        if self.error {
            return;
        }
        let end = self.pos + out.len();
        if end > self.buffer.len() {
            warn!("savestate stream underflow at offset {}", self.pos);
            self.error = true;
            return;
        }
        out.copy_from_slice(&self.buffer[self.pos..end]);
        self.pos = end;
    }

    pub fn var_u8(&mut self, v: &mut u8) {
        if self.saving {
            self.buffer.push(*v);
        } else {
            let mut buf = [0u8; 1];
            self.read(&mut buf);
            if !self.error {
                *v = buf[0];
            }
        }
    }

    pub fn var_bool(&mut self, v: &mut bool) {
        let mut byte = *v as u8;
        self.var_u8(&mut byte);
        *v = byte != 0;
    }

    pub fn var_u16(&mut self, v: &mut u16) {
        if self.saving {
            self.buffer.extend_from_slice(&v.to_le_bytes());
        } else {
            let mut buf = [0u8; 2];
            self.read(&mut buf);
            if !self.error {
                *v = u16::from_le_bytes(buf);
            }
        }
    }

    pub fn var_u32(&mut self, v: &mut u32) {
        if self.saving {
            self.buffer.extend_from_slice(&v.to_le_bytes());
        } else {
            let mut buf = [0u8; 4];
            self.read(&mut buf);
            if !self.error {
                *v = u32::from_le_bytes(buf);
            }
        }
    }

    pub fn var_u64(&mut self, v: &mut u64) {
        if self.saving {
            self.buffer.extend_from_slice(&v.to_le_bytes());
        } else {
            let mut buf = [0u8; 8];
            self.read(&mut buf);
            if !self.error {
                *v = u64::from_le_bytes(buf);
            }
        }
    }

    /// Raw buffer contents, e.g. a RAM bank.
    ///
    /// A length prefix guards against buffers whose size depends on state
    /// (main RAM differs per console type).
    pub fn bytes(&mut self, buf: &mut [u8]) {
        let mut len = buf.len() as u64;
        self.var_u64(&mut len);
        if self.saving {
            self.buffer.extend_from_slice(buf);
        } else {
            if !self.error && len != buf.len() as u64 {
                warn!(
                    "savestate buffer length mismatch: expected {}, found {}",
                    buf.len(),
                    len
                );
                self.error = true;
                return;
            }
            self.read(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        let mut save = Savestate::new_save(0);
        save.section(b"TEST");
        let (mut a, mut b, mut c, mut d) = (0xABu8, 0x1234u16, 0xDEAD_BEEFu32, 0x1122_3344_5566u64);
        save.var_u8(&mut a);
        save.var_u16(&mut b);
        save.var_u32(&mut c);
        save.var_u64(&mut d);

        let (mut load, console_type) = Savestate::open_load(save.into_bytes()).unwrap();
        assert_eq!(console_type, 0);
        load.section(b"TEST");
        let (mut a2, mut b2, mut c2, mut d2) = (0u8, 0u16, 0u32, 0u64);
        load.var_u8(&mut a2);
        load.var_u16(&mut b2);
        load.var_u32(&mut c2);
        load.var_u64(&mut d2);
        assert!(!load.has_error());
        assert!(load.at_end());
        assert_eq!((a2, b2, c2, d2), (a, b, c, d));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        assert!(Savestate::open_load(b"NOPE\x01\x00\x00\x00".to_vec()).is_err());

        let mut save = Savestate::new_save(0);
        let mut byte = 0u8;
        save.var_u8(&mut byte);
        let mut bytes = save.into_bytes();
        bytes[4] = 0xFF; // version
        assert!(Savestate::open_load(bytes).is_err());
    }

    #[test]
    fn underflow_sets_the_error_flag() {
        let save = Savestate::new_save(1);
        let (mut load, _) = Savestate::open_load(save.into_bytes()).unwrap();
        let mut v = 0u32;
        load.var_u32(&mut v);
        assert!(load.has_error());
        assert_eq!(v, 0);
    }

    #[test]
    fn section_mismatch_sets_the_error_flag() {
        let mut save = Savestate::new_save(0);
        save.section(b"AAAA");
        let (mut load, _) = Savestate::open_load(save.into_bytes()).unwrap();
        load.section(b"BBBB");
        assert!(load.has_error());
    }
}
