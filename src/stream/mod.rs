//! Streamed response reconstruction.
//!
//! - `reader` - incremental UTF-8 decoding of the raw byte stream
//! - `framer` - `data: ` record framing across arbitrary fragment boundaries
//! - `reassembler` - folding payloads into render-ready message content
pub mod framer;
pub mod reader;
pub mod reassembler;

pub use framer::EventFramer;
pub use reader::{Utf8Decoder, decode_fragments};
pub use reassembler::{AppendPolicy, ContentUpdate, Reassembler};
