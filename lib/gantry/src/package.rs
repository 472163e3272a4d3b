//! Package layout: a fixed 18-byte packed little-endian header followed by a
//! contiguous body. Buffers are allocated with enough slack for the encrypted
//! form of the body so the secure channel can encrypt in place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use plinth::crypto::aes_cipher_length;

use crate::error::{Error, Result};
use crate::schema::{self, Message};
use crate::{CommandId, PackageId};

/// Exact size of the packed header on the wire.
pub const HEADER_LEN: usize = 18;

/// The leading `version` + `command` fields; enough to validate the protocol
/// version while the rest of the header is still in flight.
pub const HEADER_BASE_LEN: usize = 6;

pub const BUFFER_LEN: usize = 65536;
pub const MAX_CONTENT_LEN: usize = BUFFER_LEN - HEADER_LEN;

/// Network package header shared by every package.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PackageHeader {
    /// Protocol version; packages with a different version are rejected.
    pub version: u16,
    /// Indicates how to use the content.
    pub command: CommandId,
    /// Sender-assigned correlation id; echoed back as `trigger_id` in replies.
    pub self_id: i32,
    /// `self_id` of the request this package replies to.
    pub trigger_id: i32,
    /// Plaintext length of the content.
    pub content_length: i32,
}

impl PackageHeader {
    /// Parses a full header from the front of `buf`.
    pub fn read_from(mut buf: &[u8]) -> PackageHeader {
        PackageHeader {
            version: buf.read_u16::<LittleEndian>().expect("header buffer too short"),
            command: buf.read_i32::<LittleEndian>().expect("header buffer too short"),
            self_id: buf.read_i32::<LittleEndian>().expect("header buffer too short"),
            trigger_id: buf.read_i32::<LittleEndian>().expect("header buffer too short"),
            content_length: buf.read_i32::<LittleEndian>().expect("header buffer too short"),
        }
    }

    /// Parses only the leading `(version, command)` pair.
    pub fn read_base(mut buf: &[u8]) -> (u16, CommandId) {
        let version = buf.read_u16::<LittleEndian>().expect("header buffer too short");
        let command = buf.read_i32::<LittleEndian>().expect("header buffer too short");
        (version, command)
    }

    /// Writes the packed header to the front of `buf`.
    pub fn write_to(&self, mut buf: &mut [u8]) {
        buf.write_u16::<LittleEndian>(self.version).expect("header buffer too short");
        buf.write_i32::<LittleEndian>(self.command).expect("header buffer too short");
        buf.write_i32::<LittleEndian>(self.self_id).expect("header buffer too short");
        buf.write_i32::<LittleEndian>(self.trigger_id).expect("header buffer too short");
        buf.write_i32::<LittleEndian>(self.content_length).expect("header buffer too short");
    }
}

/// The `(command, self_id)` pair of a request, needed to address its reply.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TriggerSource {
    pub command: CommandId,
    pub self_id: i32,
}

#[derive(Debug)]
struct PackageInner {
    id: PackageId,
    cipher: AtomicBool,
    buf: Mutex<Box<[u8]>>,
}

/// Handle to a package buffer owned by the store. Cheap to clone; the store
/// keeps the buffer alive until the handle is removed.
#[derive(Clone, Debug)]
pub struct Package {
    inner: Arc<PackageInner>,
}

impl Package {
    pub(crate) fn new(id: PackageId, buf: Box<[u8]>) -> Package {
        Package {
            inner: Arc::new(PackageInner {
                id,
                cipher: AtomicBool::new(false),
                buf: Mutex::new(buf),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> PackageId {
        self.inner.id
    }

    /// Marks the body as holding cipher text, which changes the wire length.
    #[inline]
    pub fn set_is_cipher(&self, is_cipher: bool) {
        self.inner.cipher.store(is_cipher, Ordering::Release);
    }

    #[inline]
    pub fn is_cipher(&self) -> bool {
        self.inner.cipher.load(Ordering::Acquire)
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.inner.buf.lock().expect("package buffer lock poisoned")
    }

    pub fn header(&self) -> PackageHeader {
        PackageHeader::read_from(&self.lock())
    }

    pub fn set_header(&self, header: &PackageHeader) {
        header.write_to(&mut self.lock());
    }

    /// Read-modify-write of the header.
    pub fn update_header<F: FnOnce(&mut PackageHeader)>(&self, update: F) {
        let mut buf = self.lock();
        let mut header = PackageHeader::read_from(&buf);
        update(&mut header);
        header.write_to(&mut buf);
    }

    /// Copies `content` into the body and leaves `content_length` untouched;
    /// the caller sizes the buffer at registration.
    pub fn write_content(&self, content: &[u8]) {
        let mut buf = self.lock();
        buf[HEADER_LEN..HEADER_LEN + content.len()].copy_from_slice(content);
    }

    /// Runs `f` over the `content_length` bytes of body.
    pub fn content<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R {
        let buf = self.lock();
        let len = PackageHeader::read_from(&buf).content_length as usize;
        f(&buf[HEADER_LEN..HEADER_LEN + len])
    }

    /// Runs `f` over the whole underlying buffer.
    pub fn with_buf<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R {
        f(&self.lock())
    }

    /// Runs `f` over the whole underlying buffer, mutably.
    pub fn with_buf_mut<R, F: FnOnce(&mut [u8]) -> R>(&self, f: F) -> R {
        f(&mut self.lock())
    }

    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.lock().len()
    }

    /// Header plus body length as it goes on the wire, which depends on
    /// whether the body has been encrypted.
    pub fn wire_length(&self) -> usize {
        let content_length = self.header().content_length as usize;
        match self.is_cipher() {
            true => HEADER_LEN + aes_cipher_length(content_length),
            false => HEADER_LEN + content_length,
        }
    }

    /// The pair a receiver echoes back when replying to this package.
    pub fn get_trigger_source(&self) -> TriggerSource {
        let header = self.header();
        TriggerSource {
            command: header.command,
            self_id: header.self_id,
        }
    }

    /// Deserializes the body as a typed message.
    pub fn decode<M: Message>(&self) -> Result<M> {
        self.content(|body| schema::decode(body)).map_err(|_| Error::Parse)
    }
}
