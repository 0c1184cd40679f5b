//! Content-Encoding decoding for revalidated bodies.
//!
//! The revalidation client asks for compressed transfer itself, so bodies
//! arrive exactly as the origin encoded them.

use std::io::{self, Read};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Encodings the revalidator can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    /// Parses one `Content-Encoding` token.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(ContentEncoding::Gzip),
            "deflate" => Some(ContentEncoding::Deflate),
            "br" => Some(ContentEncoding::Brotli),
            _ => None,
        }
    }

    /// Decodes a whole body.
    pub fn decode(self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            ContentEncoding::Gzip => {
                GzDecoder::new(data).read_to_end(&mut out)?;
            }
            ContentEncoding::Deflate => {
                // Servers disagree on whether "deflate" carries the zlib
                // wrapper.
                if ZlibDecoder::new(data).read_to_end(&mut out).is_err() {
                    out.clear();
                    DeflateDecoder::new(data).read_to_end(&mut out)?;
                }
            }
            ContentEncoding::Brotli => {
                brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}

/// Undoes every encoding listed in a `Content-Encoding` value.
///
/// Returns `Ok(None)` when the value names an encoding that cannot be
/// decoded, leaving the body untouched.
pub fn decode_content(header: &str, data: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let mut encodings = Vec::new();
    for token in header.split(',') {
        let token = token.trim();
        if token.is_empty() || token.eq_ignore_ascii_case("identity") {
            continue;
        }
        match ContentEncoding::parse(token) {
            Some(encoding) => encodings.push(encoding),
            None => return Ok(None),
        }
    }

    let mut body = data.to_vec();
    // Encodings are listed in the order they were applied.
    for encoding in encodings.iter().rev() {
        body = encoding.decode(&body)?;
    }
    Ok(Some(body))
}
