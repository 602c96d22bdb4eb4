use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use log::debug;
use thiserror::Error;

macro_rules! fetch_tag {
  ($tiff:expr, $tag:expr) => {
    $tiff
      .find_entry($tag)
      .ok_or_else(|| crate::decoders::OrfError::MissingTag(format!("{:?}", $tag)))?
  };
}

macro_rules! alloc_image_plain {
  ($width:expr, $height:expr, $dummy:expr) => {{
    if $width * $height > 500000000 || $width > 50000 || $height > 50000 {
      panic!("orfloader: surely there's no such thing as a >500MP or >50000 pixel wide/tall image!");
    }
    if $dummy {
      vec![0]
    } else {
      vec![0u16; $width * $height]
    }
  }};
}

macro_rules! alloc_image {
  ($width:expr, $height:expr, $dummy:expr) => {{
    let out = alloc_image_plain!($width, $height, $dummy);
    if $dummy {
      return out;
    }
    out
  }};
}

pub mod basics;
pub mod cfa;
pub mod orf;
pub mod tiff;

use crate::decoders::cfa::CFA;
use crate::decoders::tiff::{Tag, TiffIFD};

/// Everything that can go wrong while reading an ORF file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrfError {
  #[error("no image data found")]
  NoImage,
  #[error("unsupported compression {0}")]
  UnsupportedCompression(u32),
  #[error("{offsets} strip offsets but {counts} byte counts")]
  MalformedStrips { offsets: usize, counts: usize },
  #[error("truncated file")]
  Truncated,
  #[error("don't know how to handle the encoding in this file")]
  UnsupportedLayout,
  #[error("bit stream overrun")]
  BitStreamOverrun,
  #[error("makernote: {0}")]
  Metadata(String),
  #[error("tiff: {0}")]
  Tiff(String),
  #[error("couldn't find tag {0}")]
  MissingTag(String),
  #[error("couldn't find camera \"{make}\" \"{model}\"")]
  UnknownCamera { make: String, model: String },
  #[error("io: {0}")]
  Io(String),
}

impl From<std::io::Error> for OrfError {
  fn from(err: std::io::Error) -> OrfError {
    OrfError::Io(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, OrfError>;

/// A decodable camera model and its quirks.
#[derive(Debug, Clone)]
pub struct Camera {
  pub make: String,
  pub model: String,
  pub clean_make: String,
  pub clean_model: String,
  pub cfa: CFA,
  pub whitepoint: u16,
  pub blackpoint: u16,
  hints: Vec<String>,
}

impl Camera {
  pub fn find_hint(&self, hint: &str) -> bool {
    self.hints.iter().any(|h| h == hint)
  }

  fn from_toml(ct: &toml::Value) -> Camera {
    let get_str =
      |key: &str| ct.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
    let hints = ct
      .get("hints")
      .and_then(|v| v.as_array())
      .map(|arr| {
        arr
          .iter()
          .filter_map(|v| v.as_str())
          .map(|s| s.to_string())
          .collect()
      })
      .unwrap_or_default();
    Camera {
      make: get_str("make"),
      model: get_str("model"),
      clean_make: get_str("clean_make"),
      clean_model: get_str("clean_model"),
      cfa: CFA::new(ct.get("cfa").and_then(|v| v.as_str()).unwrap_or("RGGB")),
      whitepoint: ct
        .get("whitepoint")
        .and_then(|v| v.as_integer())
        .unwrap_or(4095) as u16,
      blackpoint: ct
        .get("blackpoint")
        .and_then(|v| v.as_integer())
        .unwrap_or(0) as u16,
      hints,
    }
  }
}

/// The decoded raw image, transferred to the caller on return.
#[derive(Debug, Clone)]
pub struct RawImage {
  pub make: String,
  pub model: String,
  pub clean_make: String,
  pub clean_model: String,
  pub width: usize,
  pub height: usize,
  pub cfa: CFA,
  pub wb_coeffs: [f32; 4],
  pub whitelevels: [u16; 4],
  pub blacklevels: [u16; 4],
  /// Sensor codes, row major, rows packed tightly at `width` samples.
  pub data: Vec<u16>,
  /// Set when part of the decode failed but a (partial) grid was produced.
  pub error: Option<String>,
}

impl RawImage {
  pub fn new(
    camera: &Camera,
    width: usize,
    height: usize,
    wb_coeffs: [f32; 4],
    data: Vec<u16>,
  ) -> RawImage {
    RawImage {
      make: camera.make.clone(),
      model: camera.model.clone(),
      clean_make: camera.clean_make.clone(),
      clean_model: camera.clean_model.clone(),
      width,
      height,
      cfa: camera.cfa.clone(),
      wb_coeffs,
      whitelevels: [camera.whitepoint; 4],
      blacklevels: [camera.blackpoint; 4],
      data,
      error: None,
    }
  }
}

pub trait Decoder {
  fn image(&self, dummy: bool) -> Result<RawImage>;
}

const CAMERAS_TOML: &str = include_str!(concat!(
  env!("CARGO_MANIFEST_DIR"),
  "/data/cameras.toml"
));

/// Holds the camera database and hands out decoders for buffers.
#[derive(Debug)]
pub struct OrfLoader {
  cameras: HashMap<(String, String), Camera>,
}

impl OrfLoader {
  pub fn new() -> OrfLoader {
    let toml: toml::Value = CAMERAS_TOML
      .parse()
      .expect("broken embedded camera database");
    let mut cameras = HashMap::new();
    if let Some(cams) = toml.get("cameras").and_then(|v| v.as_array()) {
      for ct in cams {
        let cam = Camera::from_toml(ct);
        cameras.insert((cam.make.clone(), cam.model.clone()), cam);
      }
    }
    OrfLoader { cameras }
  }

  pub fn get_decoder<'b>(&'b self, buf: &'b [u8]) -> Result<Box<dyn Decoder + 'b>> {
    let tiff = TiffIFD::new_root(buf, 0)?;
    if tiff.has_entry(Tag::Make) {
      let make = fetch_tag!(tiff, Tag::Make).get_str();
      if make.starts_with("OLYMPUS") {
        debug!("file identified as ORF, make \"{}\"", make);
        return Ok(Box::new(orf::OrfDecoder::new(buf, tiff, self)));
      }
    }
    Err(OrfError::Tiff("couldn't find a decoder for this file".to_string()))
  }

  pub fn check_supported(&self, tiff: &TiffIFD) -> Result<Camera> {
    let make = fetch_tag!(tiff, Tag::Make).get_str().trim_end().to_string();
    let model = fetch_tag!(tiff, Tag::Model).get_str().trim_end().to_string();
    match self.cameras.get(&(make.clone(), model.clone())) {
      Some(cam) => Ok(cam.clone()),
      None => Err(OrfError::UnknownCamera { make, model }),
    }
  }

  pub fn decode(&self, reader: &mut dyn Read, dummy: bool) -> Result<RawImage> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    let decoder = self.get_decoder(&buffer)?;
    decoder.image(dummy)
  }

  pub fn decode_file(&self, path: &Path) -> Result<RawImage> {
    let file = std::fs::File::open(path)?;
    let mut buffered = std::io::BufReader::new(file);
    self.decode(&mut buffered, false)
  }
}

impl Default for OrfLoader {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_database_loads() {
    let loader = OrfLoader::new();
    assert!(!loader.cameras.is_empty());
    let cam = loader
      .cameras
      .get(&(
        "OLYMPUS IMAGING CORP.".to_string(),
        "E-410".to_string(),
      ))
      .unwrap();
    assert_eq!(cam.clean_model, "E-410");
    assert_eq!(cam.whitepoint, 4095);
    assert_eq!(cam.blackpoint, 0);
    assert!(!cam.find_hint("force_uncompressed"));
  }

  #[test]
  fn hints_are_per_camera() {
    let loader = OrfLoader::new();
    let e10 = loader
      .cameras
      .get(&("OLYMPUS OPTICAL CO.,LTD".to_string(), "E-10".to_string()))
      .unwrap();
    assert!(e10.find_hint("force_uncompressed"));
    assert!(!e10.find_hint("jpeg32_bitorder"));
    let e300 = loader
      .cameras
      .get(&("OLYMPUS IMAGING CORP.".to_string(), "E-300".to_string()))
      .unwrap();
    assert!(e300.find_hint("packed_with_control"));
  }
}
