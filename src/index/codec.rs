//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mboxidx.
//
// Mboxidx is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mboxidx is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mboxidx. If not, see <http://www.gnu.org/licenses/>.

//! Fixed-layout binary encoding of index headers and records.
//!
//! Both blocks are sequences of big-endian fields terminated by a CRC-32
//! (IEEE) computed over every byte that precedes it. The field order is the
//! on-disk format; it is spelled out exactly once, in the `encode_*`/`decode_*`
//! pairs below, and nothing outside this module knows any offset.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use super::model::*;

pub const HEADER_SIZE: usize = 128;
pub const RECORD_SIZE: usize = 96;

/// Why a header or record block failed to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corruption {
    /// The block is not of the fixed size.
    BadLength(usize),
    /// The stored CRC does not match the block's contents.
    BadCrc { stored: u32, computed: u32 },
    /// The system flags word has bits with no defined meaning.
    UnknownFlags(u32),
    /// The header describes a layout this crate does not understand.
    UnsupportedLayout,
    /// The header's purge horizon is above its highest modseq.
    ModseqInverted,
    /// The file is shorter than the header's record count implies.
    Truncated,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Corruption::BadLength(len) => write!(f, "bad block length {}", len),
            Corruption::BadCrc { stored, computed } => write!(
                f,
                "CRC mismatch (stored {:08x}, computed {:08x})",
                stored, computed
            ),
            Corruption::UnknownFlags(bits) => {
                write!(f, "unknown system flag bits {:08x}", bits)
            }
            Corruption::UnsupportedLayout => write!(f, "unsupported layout"),
            Corruption::ModseqInverted => {
                write!(f, "deletedmodseq above highestmodseq")
            }
            Corruption::Truncated => write!(f, "index file truncated"),
        }
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, pos: 0 }
    }

    fn u32(&mut self, v: u32) {
        BigEndian::write_u32(&mut self.buf[self.pos..], v);
        self.pos += 4;
    }

    fn u64(&mut self, v: u64) {
        BigEndian::write_u64(&mut self.buf[self.pos..], v);
        self.pos += 8;
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }

    /// Append the CRC of everything written so far.
    fn seal(mut self) {
        let crc = crc32(&self.buf[..self.pos]);
        self.u32(crc);
        debug_assert_eq!(self.buf.len(), self.pos);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn u32(&mut self) -> u32 {
        let v = BigEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = BigEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        v
    }

    fn bytes(&mut self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.buf[self.pos..self.pos + dst.len()]);
        self.pos += dst.len();
    }
}

/// Verify the trailing CRC of `block`, which must be `size` bytes long.
fn check_crc(block: &[u8], size: usize) -> Result<(), Corruption> {
    if block.len() != size {
        return Err(Corruption::BadLength(block.len()));
    }

    let stored = BigEndian::read_u32(&block[size - 4..]);
    let computed = crc32(&block[..size - 4]);
    if stored != computed {
        return Err(Corruption::BadCrc { stored, computed });
    }

    Ok(())
}

pub fn encode_header(h: &IndexHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    let mut w = Writer::new(&mut buf);
    w.u32(h.generation_no);
    w.u32(h.format);
    w.u32(h.minor_version);
    w.u32(h.start_offset);
    w.u32(h.record_size);
    w.u32(h.num_records);
    w.u32(h.last_appenddate);
    w.u32(h.last_uid.0);
    w.u64(h.quota_mailbox_used);
    w.u32(h.pop3_last_login);
    w.u32(h.uidvalidity);
    w.u32(h.deleted);
    w.u32(h.answered);
    w.u32(h.flagged);
    w.u32(h.options);
    w.u32(h.leaked_cache_records);
    w.u64(h.highestmodseq.0);
    w.u64(h.deletedmodseq.0);
    w.u32(h.exists);
    w.u32(h.first_expunged);
    w.u32(h.last_repack_time);
    w.u32(h.header_file_crc);
    w.u32(h.sync_crc);
    w.u32(h.recentuid.0);
    w.u32(h.recenttime);
    for &r in &h.reserved {
        w.u32(r);
    }
    w.seal();
    buf
}

pub fn decode_header(block: &[u8]) -> Result<IndexHeader, Corruption> {
    check_crc(block, HEADER_SIZE)?;
    decode_header_unchecked(block)
}

/// Decode the fields of a header block without validating its CRC.
///
/// This exists so that the fields of a damaged header can be salvaged.
pub fn decode_header_unchecked(
    block: &[u8],
) -> Result<IndexHeader, Corruption> {
    if block.len() != HEADER_SIZE {
        return Err(Corruption::BadLength(block.len()));
    }

    let mut r = Reader::new(block);
    Ok(IndexHeader {
        generation_no: r.u32(),
        format: r.u32(),
        minor_version: r.u32(),
        start_offset: r.u32(),
        record_size: r.u32(),
        num_records: r.u32(),
        last_appenddate: r.u32(),
        last_uid: Uid(r.u32()),
        quota_mailbox_used: r.u64(),
        pop3_last_login: r.u32(),
        uidvalidity: r.u32(),
        deleted: r.u32(),
        answered: r.u32(),
        flagged: r.u32(),
        options: r.u32(),
        leaked_cache_records: r.u32(),
        highestmodseq: Modseq(r.u64()),
        deletedmodseq: Modseq(r.u64()),
        exists: r.u32(),
        first_expunged: r.u32(),
        last_repack_time: r.u32(),
        header_file_crc: r.u32(),
        sync_crc: r.u32(),
        recentuid: Uid(r.u32()),
        recenttime: r.u32(),
        reserved: [r.u32(), r.u32(), r.u32()],
    })
}

pub fn encode_record(rec: &IndexRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    let mut w = Writer::new(&mut buf);
    w.u32(rec.uid.0);
    w.u32(rec.internaldate);
    w.u32(rec.sentdate);
    w.u32(rec.size);
    w.u32(rec.header_size);
    w.u32(rec.gmtime);
    w.u32(rec.cache_offset);
    w.u32(rec.last_updated);
    w.u32(rec.system_flags.bits());
    for &word in &rec.user_flags.0 {
        w.u32(word);
    }
    w.u32(rec.content_lines);
    w.u32(rec.cache_version);
    w.bytes(&rec.guid.0);
    w.u64(rec.modseq.0);
    w.u32(rec.cache_crc);
    w.seal();
    buf
}

pub fn decode_record(block: &[u8]) -> Result<IndexRecord, Corruption> {
    check_crc(block, RECORD_SIZE)?;

    let mut r = Reader::new(block);
    let uid = Uid(r.u32());
    let internaldate = r.u32();
    let sentdate = r.u32();
    let size = r.u32();
    let header_size = r.u32();
    let gmtime = r.u32();
    let cache_offset = r.u32();
    let last_updated = r.u32();
    let flag_bits = r.u32();
    let system_flags = SystemFlags::from_bits(flag_bits).ok_or(
        Corruption::UnknownFlags(flag_bits & !SystemFlags::all().bits()),
    )?;
    let user_flags = UserFlags([r.u32(), r.u32(), r.u32(), r.u32()]);
    let content_lines = r.u32();
    let cache_version = r.u32();
    let mut guid = Guid::NULL;
    r.bytes(&mut guid.0);
    let modseq = Modseq(r.u64());
    let cache_crc = r.u32();

    Ok(IndexRecord {
        uid,
        internaldate,
        sentdate,
        size,
        header_size,
        gmtime,
        cache_offset,
        last_updated,
        system_flags,
        user_flags,
        content_lines,
        cache_version,
        guid,
        modseq,
        cache_crc,
    })
}

/// The contribution of one record to the header's `sync_crc`.
///
/// This covers exactly the state a replica needs to agree on: uid, modseq
/// and flags.
pub fn record_sync_crc(rec: &IndexRecord) -> u32 {
    let mut buf = [0u8; 32];
    let mut w = Writer::new(&mut buf);
    w.u32(rec.uid.0);
    w.u64(rec.modseq.0);
    w.u32(rec.system_flags.bits());
    for &word in &rec.user_flags.0 {
        w.u32(word);
    }
    crc32(&buf)
}
