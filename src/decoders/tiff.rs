use std::collections::HashMap;

use crate::decoders::basics::*;
use crate::decoders::{OrfError, Result};

const TIFF_MAGIC: u16 = 42;
// ORF files reuse the TIFF structure but change the magic
const ORF_MAGIC_RO: u16 = 0x4f52;
const ORF_MAGIC_RS: u16 = 0x5352;

const MAX_IFD_DEPTH: u32 = 5;
const MAX_CHAINED_IFDS: usize = 100;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(dead_code)]
pub enum Tag {
  ImageWidth = 0x0100,
  ImageLength = 0x0101,
  Compression = 0x0103,
  Make = 0x010F,
  Model = 0x0110,
  StripOffsets = 0x0111,
  StripByteCounts = 0x0117,
  SubIFDs = 0x014A,
  OlympusRedMul = 0x1017,
  OlympusBlueMul = 0x1018,
  OlympusImgProc = 0x2040,
  ExifIFDPointer = 0x8769,
  IsoSpeedRatings = 0x8827,
  Makernote = 0x927C,
}

const TIFF_BYTE: u16 = 1;
const TIFF_ASCII: u16 = 2;
const TIFF_SHORT: u16 = 3;
const TIFF_LONG: u16 = 4;
const TIFF_RATIONAL: u16 = 5;
const TIFF_UNDEFINED: u16 = 7;
const TIFF_SSHORT: u16 = 8;
const TIFF_SLONG: u16 = 9;
const TIFF_SRATIONAL: u16 = 10;
const TIFF_FLOAT: u16 = 11;
const TIFF_DOUBLE: u16 = 12;

fn type_size(typ: u16) -> usize {
  match typ {
    TIFF_BYTE | TIFF_ASCII | TIFF_UNDEFINED | 6 => 1,
    TIFF_SHORT | TIFF_SSHORT => 2,
    TIFF_LONG | TIFF_SLONG | TIFF_FLOAT => 4,
    TIFF_RATIONAL | TIFF_SRATIONAL | TIFF_DOUBLE => 8,
    _ => 1,
  }
}

/// One directory entry, pointing at its value bytes.
#[derive(Debug, Clone)]
pub struct TiffEntry<'a> {
  tag: u16,
  typ: u16,
  count: usize,
  data: &'a [u8],
  endian: Endian,
}

impl<'a> TiffEntry<'a> {
  pub fn count(&self) -> usize {
    self.count
  }

  pub fn get_u32(&self, idx: usize) -> u32 {
    match self.typ {
      TIFF_BYTE | TIFF_UNDEFINED => self.data[idx] as u32,
      TIFF_SHORT | TIFF_SSHORT => self.endian.ru16(self.data, idx * 2) as u32,
      _ => self.endian.ru32(self.data, idx * 4),
    }
  }

  pub fn get_u16(&self, idx: usize) -> u16 {
    self.get_u32(idx) as u16
  }

  pub fn get_usize(&self, idx: usize) -> usize {
    self.get_u32(idx) as usize
  }

  pub fn get_f32(&self, idx: usize) -> f32 {
    match self.typ {
      TIFF_RATIONAL => {
        let num = self.endian.ru32(self.data, idx * 8);
        let den = self.endian.ru32(self.data, idx * 8 + 4);
        if den == 0 {
          0.0
        } else {
          num as f32 / den as f32
        }
      }
      TIFF_SRATIONAL => {
        let num = self.endian.ru32(self.data, idx * 8) as i32;
        let den = self.endian.ru32(self.data, idx * 8 + 4) as i32;
        if den == 0 {
          0.0
        } else {
          num as f32 / den as f32
        }
      }
      TIFF_FLOAT => f32::from_bits(self.endian.ru32(self.data, idx * 4)),
      _ => self.get_u32(idx) as f32,
    }
  }

  pub fn get_str(&self) -> &'a str {
    let bytes = match self.data.iter().position(|&b| b == 0) {
      Some(idx) => &self.data[..idx],
      None => self.data,
    };
    std::str::from_utf8(bytes).unwrap_or("")
  }
}

/// An image file directory and everything parsed below it.
#[derive(Debug, Clone)]
pub struct TiffIFD<'a> {
  buf: &'a [u8],
  entries: HashMap<u16, TiffEntry<'a>>,
  subifds: Vec<TiffIFD<'a>>,
  nextifd: usize,
  endian: Endian,
}

impl<'a> TiffIFD<'a> {
  /// Parse a full container: header, magic, the chain of top-level IFDs
  /// and (recursively) their sub-IFDs, Exif and makernote directories.
  pub fn new_root(buf: &'a [u8], offset: usize) -> Result<TiffIFD<'a>> {
    if buf.len() < offset + 8 {
      return Err(OrfError::Tiff("not enough data for the header".to_string()));
    }
    let endian = match &buf[offset..offset + 2] {
      b"II" => Endian::Little,
      b"MM" => Endian::Big,
      _ => return Err(OrfError::Tiff("unknown byte order marker".to_string())),
    };
    let magic = endian.ru16(buf, offset + 2);
    if magic != TIFF_MAGIC && magic != ORF_MAGIC_RO && magic != ORF_MAGIC_RS {
      return Err(OrfError::Tiff(format!("unknown magic 0x{:04x}", magic)));
    }

    let mut subifds = Vec::new();
    let mut nextifd = endian.ru32(buf, offset + 4) as usize;
    for _ in 0..MAX_CHAINED_IFDS {
      let ifd = TiffIFD::new(buf, nextifd, 0, endian)?;
      nextifd = ifd.nextifd;
      subifds.push(ifd);
      if nextifd == 0 {
        break;
      }
    }

    Ok(TiffIFD {
      buf,
      entries: HashMap::new(),
      subifds,
      nextifd: 0,
      endian,
    })
  }

  pub fn new(buf: &'a [u8], offset: usize, depth: u32, e: Endian) -> Result<TiffIFD<'a>> {
    if depth > MAX_IFD_DEPTH {
      return Err(OrfError::Tiff("directories nested too deep".to_string()));
    }
    if buf.len() < offset + 2 {
      return Err(OrfError::Tiff("directory past end of buffer".to_string()));
    }
    let num = e.ru16(buf, offset) as usize;
    if buf.len() < offset + 2 + num * 12 + 4 {
      return Err(OrfError::Tiff("directory entries past end of buffer".to_string()));
    }

    let mut entries = HashMap::with_capacity(num);
    let mut subifds = Vec::new();

    for i in 0..num {
      let entry_offset = offset + 2 + i * 12;
      let tag = e.ru16(buf, entry_offset);
      let typ = e.ru16(buf, entry_offset + 2);
      let count = e.ru32(buf, entry_offset + 4) as usize;
      let bytesize = count.saturating_mul(type_size(typ));
      let doffset = if bytesize <= 4 {
        entry_offset + 8
      } else {
        e.ru32(buf, entry_offset + 8) as usize
      };
      if doffset.saturating_add(bytesize) > buf.len() {
        // entry points outside the file, drop it
        continue;
      }
      let entry = TiffEntry {
        tag,
        typ,
        count,
        data: &buf[doffset..doffset + bytesize],
        endian: e,
      };

      if entry.tag == Tag::SubIFDs as u16 {
        for j in 0..count {
          if let Ok(ifd) = TiffIFD::new(buf, entry.get_usize(j), depth + 1, e) {
            subifds.push(ifd);
          }
        }
      } else if entry.tag == Tag::ExifIFDPointer as u16 {
        if let Ok(ifd) = TiffIFD::new(buf, entry.get_usize(0), depth + 1, e) {
          subifds.push(ifd);
        }
      } else if entry.tag == Tag::Makernote as u16 {
        if let Ok(ifd) = TiffIFD::new_makernote(buf, doffset, depth + 1, e) {
          subifds.push(ifd);
        }
      } else {
        entries.insert(tag, entry);
      }
    }

    Ok(TiffIFD {
      buf,
      entries,
      subifds,
      nextifd: e.ru32(buf, offset + 2 + num * 12) as usize,
      endian: e,
    })
  }

  /// Olympus makernotes are regular directories behind a vendor header.
  /// The newer "OLYMPUS\0II" style keeps its offsets relative to the
  /// makernote itself, the older "OLYMP\0" style uses file offsets.
  pub fn new_makernote(buf: &'a [u8], offset: usize, depth: u32, e: Endian) -> Result<TiffIFD<'a>> {
    let data = &buf[offset..];
    if data.len() >= 12 && &data[0..10] == b"OLYMPUS\0II" {
      TiffIFD::new(data, 12, depth, Endian::Little)
    } else if data.len() >= 12 && &data[0..10] == b"OLYMPUS\0MM" {
      TiffIFD::new(data, 12, depth, Endian::Big)
    } else if data.len() >= 8 && &data[0..6] == b"OLYMP\0" {
      TiffIFD::new(buf, offset + 8, depth, e)
    } else {
      Err(OrfError::Tiff("unknown makernote format".to_string()))
    }
  }

  /// The buffer this directory's offsets are relative to.
  pub fn buffer(&self) -> &'a [u8] {
    self.buf
  }

  pub fn endian(&self) -> Endian {
    self.endian
  }

  /// Entry lookup by bare tag number, for vendor sub-IFDs whose tags
  /// collide with the TIFF namespace. Not recursive.
  pub fn find_entry_raw(&self, tag: u16) -> Option<&TiffEntry<'a>> {
    self.entries.get(&tag)
  }

  pub fn find_entry(&self, tag: Tag) -> Option<&TiffEntry<'a>> {
    if let Some(entry) = self.entries.get(&(tag as u16)) {
      return Some(entry);
    }
    for ifd in &self.subifds {
      if let Some(entry) = ifd.find_entry(tag) {
        return Some(entry);
      }
    }
    None
  }

  pub fn has_entry(&self, tag: Tag) -> bool {
    self.find_entry(tag).is_some()
  }

  pub fn find_ifds_with_tag(&self, tag: Tag) -> Vec<&TiffIFD<'a>> {
    let mut ifds = Vec::new();
    if self.entries.contains_key(&(tag as u16)) {
      ifds.push(self);
    }
    for ifd in &self.subifds {
      ifds.extend(ifd.find_ifds_with_tag(tag));
    }
    ifds
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Little-endian container with the ORF magic and one IFD:
  //   ImageWidth = 4 (SHORT), Make = "OLYMPUS\0" (out of line)
  fn minimal_orf() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"II");
    buf.extend_from_slice(&0x4f52u16.to_le_bytes());
    buf.extend_from_slice(&8u32.to_le_bytes());
    // IFD: 2 entries
    buf.extend_from_slice(&2u16.to_le_bytes());
    // ImageWidth, SHORT, count 1, value 4
    buf.extend_from_slice(&0x0100u16.to_le_bytes());
    buf.extend_from_slice(&3u16.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&4u32.to_le_bytes());
    // Make, ASCII, count 8, offset 38
    buf.extend_from_slice(&0x010Fu16.to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&8u32.to_le_bytes());
    buf.extend_from_slice(&38u32.to_le_bytes());
    // next IFD
    buf.extend_from_slice(&0u32.to_le_bytes());
    assert_eq!(buf.len(), 38);
    buf.extend_from_slice(b"OLYMPUS\0");
    buf
  }

  #[test]
  fn parses_orf_magic() {
    let buf = minimal_orf();
    let tiff = TiffIFD::new_root(&buf, 0).unwrap();
    assert!(tiff.endian().little());
    assert_eq!(tiff.find_entry(Tag::ImageWidth).unwrap().get_u32(0), 4);
    assert_eq!(tiff.find_entry(Tag::Make).unwrap().get_str(), "OLYMPUS");
  }

  #[test]
  fn rejects_unknown_magic() {
    let mut buf = minimal_orf();
    buf[2] = 0x77;
    buf[3] = 0x77;
    assert!(TiffIFD::new_root(&buf, 0).is_err());
  }

  #[test]
  fn find_ifds_with_tag_walks_the_chain() {
    let buf = minimal_orf();
    let tiff = TiffIFD::new_root(&buf, 0).unwrap();
    assert_eq!(tiff.find_ifds_with_tag(Tag::ImageWidth).len(), 1);
    assert_eq!(tiff.find_ifds_with_tag(Tag::StripOffsets).len(), 0);
  }

  #[test]
  fn new_style_makernote_is_relative() {
    // A makernote blob with one SHORT entry, offsets relative to itself
    let mut mn = Vec::new();
    mn.extend_from_slice(b"OLYMPUS\0II\x03\x00");
    mn.extend_from_slice(&1u16.to_le_bytes());
    mn.extend_from_slice(&0x1017u16.to_le_bytes());
    mn.extend_from_slice(&3u16.to_le_bytes());
    mn.extend_from_slice(&1u32.to_le_bytes());
    mn.extend_from_slice(&500u32.to_le_bytes());
    mn.extend_from_slice(&0u32.to_le_bytes());

    let ifd = TiffIFD::new_makernote(&mn, 0, 0, Endian::Little).unwrap();
    assert_eq!(ifd.find_entry(Tag::OlympusRedMul).unwrap().get_u32(0), 500);
  }
}
