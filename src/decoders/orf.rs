/// Olympus ORF decoder.
///
/// Handles the single-strip compressed format and the five uncompressed
/// packings Olympus has shipped over the years. The compressed format is a
/// per-row adaptive predictor over two interleaved sample streams (even and
/// odd columns) sharing one MSB-first bit stream; every sample depends on
/// already decoded neighbours, so decoding is strictly serial.
use crate::decoders::basics::*;
use crate::decoders::tiff::*;
use crate::decoders::*;

use std::f32::NAN;

use lazy_static::lazy_static;
use log::{debug, warn};

lazy_static! {
  // Position of the leading set bit of a 12 bit value, 12 when none
  static ref BIT_TABLE: [u8; 4096] = {
    let mut table = [12u8; 4096];
    for (i, entry) in table.iter_mut().enumerate() {
      for high in 0..12 {
        if (i >> (11 - high)) & 1 != 0 {
          *entry = high as u8;
          break;
        }
      }
    }
    table
  };
}

#[derive(Debug, Clone)]
pub struct OrfDecoder<'a> {
  buffer: &'a [u8],
  loader: &'a OrfLoader,
  tiff: TiffIFD<'a>,
}

impl<'a> OrfDecoder<'a> {
  pub fn new(buf: &'a [u8], tiff: TiffIFD<'a>, loader: &'a OrfLoader) -> OrfDecoder<'a> {
    OrfDecoder {
      buffer: buf,
      tiff,
      loader,
    }
  }
}

impl<'a> Decoder for OrfDecoder<'a> {
  fn image(&self, dummy: bool) -> Result<RawImage> {
    let camera = self.loader.check_supported(&self.tiff)?;

    let raw_ifds = self.tiff.find_ifds_with_tag(Tag::StripOffsets);
    if raw_ifds.len() != 1 {
      return Err(OrfError::NoImage);
    }
    let raw = raw_ifds[0];

    let compression = fetch_tag!(raw, Tag::Compression).get_u32(0);
    if compression != 1 {
      return Err(OrfError::UnsupportedCompression(compression));
    }

    let offsets = fetch_tag!(raw, Tag::StripOffsets);
    let counts = fetch_tag!(raw, Tag::StripByteCounts);
    if offsets.count() != counts.count() {
      return Err(OrfError::MalformedStrips {
        offsets: offsets.count(),
        counts: counts.count(),
      });
    }

    // Strips are taken as one contiguous run starting at the first offset.
    // A file that pads between strips or stores them out of order will
    // come out scrambled; nothing here can detect that.
    let off = offsets.get_usize(0);
    let size: usize = (0..counts.count()).map(|i| counts.get_usize(i)).sum();
    if off.checked_add(size).map_or(true, |end| end > self.buffer.len()) {
      return Err(OrfError::Truncated);
    }

    let width = fetch_tag!(raw, Tag::ImageWidth).get_usize(0);
    let height = fetch_tag!(raw, Tag::ImageLength).get_usize(0);
    if width == 0 || height == 0 {
      return Err(OrfError::Tiff(format!("invalid image size {}x{}", width, height)));
    }

    let (data, decode_error) = if offsets.count() == 1 && !camera.find_hint("force_uncompressed")
    {
      debug!("ORF: compressed path, {}x{}, {} bytes", width, height, size);
      let mut out = alloc_image_plain!(width, height, dummy);
      let err = if dummy {
        None
      } else {
        OrfDecoder::decode_compressed(&self.buffer[off..off + size], &mut out, width, height)
          .err()
      };
      (out, err)
    } else {
      debug!("ORF: uncompressed path, {}x{}, {} bytes", width, height, size);
      (
        self.decode_uncompressed(&camera, off, size, width, height, dummy)?,
        None,
      )
    };

    let mut error = decode_error.map(|e| e.to_string());

    let imgproc = match self.imgproc_ifd() {
      Ok(ifd) => ifd,
      Err(e) => {
        error.get_or_insert_with(|| e.to_string());
        None
      }
    };
    let wb_coeffs = self.get_wb(imgproc.as_ref());
    let mut image = RawImage::new(&camera, width, height, wb_coeffs, data);
    if let Some(levels) = self.get_blacklevels(&camera, imgproc.as_ref()) {
      // The dynamic range is assumed constant, so the white level follows
      // the measured black level
      let shift = camera.blackpoint as i32 - levels[0] as i32;
      for white in image.whitelevels.iter_mut() {
        *white = (*white as i32 - shift) as u16;
      }
      image.blacklevels = levels;
    }

    if let Some(msg) = &error {
      warn!("ORF: returning partial result: {}", msg);
    }
    image.error = error;
    Ok(image)
  }
}

impl<'a> OrfDecoder<'a> {
  /// One of five packings, chosen from camera hints and the strip size.
  fn decode_uncompressed(
    &self,
    camera: &Camera,
    off: usize,
    size: usize,
    width: usize,
    height: usize,
    dummy: bool,
  ) -> Result<Vec<u16>> {
    let src = &self.buffer[off..];

    if camera.find_hint("packed_with_control") {
      if size < height * (width * 12 / 8 + (width + 2) / 10) {
        return Err(OrfError::Truncated);
      }
      Ok(decode_12le_wcontrol(src, width, height, dummy))
    } else if camera.find_hint("jpeg32_bitorder") {
      if size < height * width * 12 / 8 {
        return Err(OrfError::Truncated);
      }
      Ok(decode_12be_msb32(src, width, height, dummy))
    } else if size >= width * height * 2 {
      // One sample per 16 bit word
      if self.tiff.endian().little() {
        Ok(decode_12le_unpacked(src, width, height, dummy))
      } else {
        Ok(decode_12be_unpacked_left_aligned(src, width, height, dummy))
      }
    } else if size >= width * height * 3 / 2 {
      if src.len() < interlaced_needed_bytes(width, height) {
        return Err(OrfError::Truncated);
      }
      Ok(decode_12be_interlaced(src, width, height, dummy))
    } else {
      Err(OrfError::UnsupportedLayout)
    }
  }

  /// The compressed bit stream: a 7 byte header, then one codeword per
  /// sample, even and odd columns keeping separate predictor state.
  ///
  /// Per sample: a 15 bit window holds sign (bit 14), the two lowest
  /// residual bits (13-12) and a unary prefix (11-0, escape when empty).
  /// The decoded magnitude feeds a running estimator (`acarry[1]`) and a
  /// small-magnitude counter (`acarry[2]`) that narrows the minimum code
  /// width. Output wraps to 16 bits on store; the wrap is load-bearing
  /// near saturation.
  fn decode_compressed(src: &[u8], out: &mut [u16], width: usize, height: usize) -> Result<()> {
    let mut left = [0i32; 2];
    let mut nw = [0i32; 2];

    let mut pump = BitPumpMSB::new(&src[src.len().min(7)..]);

    for row in 0..height {
      let mut acarry = [[0i32; 3]; 2];
      let y_border = row < 2;
      let mut border = true;

      for col in 0..width {
        let c = col & 1;
        if c == 0 {
          pump.check_pos()?;
        }
        pump.fill();

        let i = if acarry[c][2] < 3 { 2u32 } else { 0u32 };
        let mut nbits = 2 + i;
        // Widened before shifting: a hostile stream can grow the carry
        // until nbits + i reaches 16, which would overflow a u16 shift
        while (acarry[c][0] as u16 as u32) >> (nbits + i) != 0 {
          nbits += 1;
        }

        let b = pump.peek_bits_no_fill(15) as i32;
        let sign = -(b >> 14);
        let low = (b >> 12) & 3;
        let mut high = BIT_TABLE[(b & 4095) as usize] as i32;

        if high == 12 {
          pump.skip_bits_no_fill(15);
          high = (pump.get_bits(16 - nbits) >> 1) as i32;
        } else {
          pump.skip_bits_no_fill(high as u32 + 1 + 3);
        }

        acarry[c][0] = (high << nbits) | pump.get_bits(nbits) as i32;
        let diff = (acarry[c][0] ^ sign) + acarry[c][1];
        acarry[c][1] = (diff * 3 + acarry[c][1]) >> 5;
        acarry[c][2] = if acarry[c][0] > 16 { 0 } else { acarry[c][2] + 1 };

        let pos = row * width + col;
        let pred = if border {
          if y_border && col < 2 {
            0
          } else if y_border {
            left[c]
          } else {
            let up = out[pos - width] as i32;
            nw[c] = up;
            up
          }
        } else {
          let up = out[pos - width] as i32;
          let left_minus_nw = left[c] - nw[c];
          let up_minus_nw = up - nw[c];
          nw[c] = up;
          // Gradients disagreeing in sign means an edge between the
          // neighbours; large ones get the plane predictor, small ones
          // the average. Otherwise follow the weaker gradient.
          if left_minus_nw * up_minus_nw < 0 {
            if left_minus_nw.abs() > 32 || up_minus_nw.abs() > 32 {
              left[c] + up_minus_nw
            } else {
              (left[c] + up) >> 1
            }
          } else if left_minus_nw.abs() > up_minus_nw.abs() {
            left[c]
          } else {
            up
          }
        };

        out[pos] = (pred + ((diff << 2) | low)) as u16;
        left[c] = out[pos] as i32;
        // Interior rows only treat their leftmost column pair as border;
        // it re-seeds nw from the row above
        if c == 1 {
          border = y_border;
        }
      }
    }
    Ok(())
  }

  /// The ImageProcessing sub-IFD lives behind an offset relative to the
  /// makernote it was found in. A broken one is a soft error.
  fn imgproc_ifd(&self) -> Result<Option<TiffIFD<'a>>> {
    let parents = self.tiff.find_ifds_with_tag(Tag::OlympusImgProc);
    let parent = match parents.first() {
      Some(p) => *p,
      None => return Ok(None),
    };
    let entry = match parent.find_entry(Tag::OlympusImgProc) {
      Some(e) => e,
      None => return Ok(None),
    };
    match TiffIFD::new(parent.buffer(), entry.get_usize(0), 0, parent.endian()) {
      Ok(ifd) => Ok(Some(ifd)),
      Err(e) => Err(OrfError::Metadata(e.to_string())),
    }
  }

  fn get_wb(&self, imgproc: Option<&TiffIFD>) -> [f32; 4] {
    // Old bodies store plain red/blue multipliers in the makernote
    if let (Some(red), Some(blue)) = (
      self.tiff.find_entry(Tag::OlympusRedMul),
      self.tiff.find_entry(Tag::OlympusBlueMul),
    ) {
      return [red.get_u32(0) as f32, 256.0, blue.get_u32(0) as f32, NAN];
    }
    if let Some(wb) = imgproc.and_then(|ifd| ifd.find_entry_raw(0x0100)) {
      if wb.count() == 2 || wb.count() == 4 {
        return [wb.get_f32(0), 256.0, wb.get_f32(1), NAN];
      }
    }
    [NAN, NAN, NAN, NAN]
  }

  fn get_blacklevels(&self, camera: &Camera, imgproc: Option<&TiffIFD>) -> Option<[u16; 4]> {
    let blacks = imgproc.and_then(|ifd| ifd.find_entry_raw(0x0600))?;
    if blacks.count() != 4 {
      return None;
    }
    // Values come in RGGB order, remapped over the 2x2 CFA positions
    let mut levels = [0u16; 4];
    let mut green = 0;
    for (i, level) in levels.iter_mut().enumerate() {
      *level = match camera.cfa.color_at(i >> 1, i & 1) {
        0 => blacks.get_u16(0),
        2 => blacks.get_u16(3),
        _ => {
          green += 1;
          blacks.get_u16(green)
        }
      };
    }
    Some(levels)
  }
}
