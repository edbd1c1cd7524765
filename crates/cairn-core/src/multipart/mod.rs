//! `multipart/form-data` codec.
//!
//! The encoder streams a body made of text fields and file parts; the decoder
//! parses one incrementally, keeping text fields in memory and streaming file
//! parts to temporary files.

mod decoder;
mod encoder;
mod headers;
mod state;

pub use decoder::{
    decode_stream, Field, FilePart, MultipartBody, MultipartDecoder, DEFAULT_MAX_FIELD_BYTES,
    MAX_HEADER_BYTES,
};
pub use encoder::MultipartEncoder;
pub use headers::{extract_boundary, parse_part_headers, PartHeaders};
pub use state::{Boundary, ParserState};
