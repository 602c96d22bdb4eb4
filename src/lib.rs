//! Library to extract the raw data and some metadata from Olympus ORF files.
//!
//! Only the ORF container and the Olympus raw encodings are handled; anything
//! higher level (demosaicing, color conversion, output formats) is out of
//! scope. The aim is to turn a file into a grid of 16 bit sensor codes plus
//! the metadata needed to interpret it.
//!
//! # Example
//!
//! ```rust,no_run
//! let image = orfloader::decode_file("example.orf").unwrap();
//! println!("decoded a {}x{} raw image", image.width, image.height);
//! ```

use lazy_static::lazy_static;

use std::io::Read;
use std::path::Path;

mod decoders;

pub use decoders::cfa::CFA;
pub use decoders::Decoder;
pub use decoders::OrfError;
pub use decoders::OrfLoader;
pub use decoders::RawImage;
pub use decoders::Result;

lazy_static! {
  static ref LOADER: OrfLoader = OrfLoader::new();
}

/// Decode the file at `path` into its raw image representation.
pub fn decode_file<P: AsRef<Path>>(path: P) -> Result<RawImage> {
  LOADER.decode_file(path.as_ref())
}

/// Decode a reader holding a full ORF file.
pub fn decode(reader: &mut dyn Read) -> Result<RawImage> {
  LOADER.decode(reader, false)
}
