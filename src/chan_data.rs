//! Per-channel backend blobs as stored in the `module channel data` section:
//! zlib-compressed, then base64 text.

use crate::Result;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Initial inflate buffer size, as a multiple of the compressed length.
const INFLATE_FACTOR: usize = 32;

pub fn len_key(chan: usize) -> String {
    format!("data_chan{chan}_len")
}

pub fn data_key(chan: usize) -> String {
    format!("data_chan{chan}")
}

pub fn encode(blob: &[u8]) -> Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(blob)
        .map_err(|e| err!(Encode, "compressing channel data: {e}"))?;
    let compressed = encoder
        .finish()
        .map_err(|e| err!(Encode, "compressing channel data: {e}"))?;
    Ok(BASE64_STANDARD.encode(compressed))
}

/// Reverse [`encode`]. `encoded_len` is the stored text length; anything
/// past it on the line is ignored.
pub fn decode(text: &str, encoded_len: usize) -> Result<Vec<u8>> {
    let text = text.trim();
    let Some(text) = text.get(..encoded_len) else {
        bail!(
            Decode,
            "channel data is {} characters, expected {encoded_len}",
            text.len()
        );
    };
    let compressed = BASE64_STANDARD
        .decode(text)
        .map_err(|e| err!(Decode, "channel data is not base64: {e}"))?;
    let mut blob = Vec::with_capacity(compressed.len() * INFLATE_FACTOR);
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut blob)
        .map_err(|e| err!(Decode, "inflating channel data: {e}"))?;
    Ok(blob)
}

/// The two `name = value` lines written for one channel.
pub fn lines(chan: usize, blob: &[u8]) -> Result<[(String, String); 2]> {
    let text = encode(blob)?;
    Ok([
        (len_key(chan), text.len().to_string()),
        (data_key(chan), text),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn blob_survives_encoding() {
        let blob: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let [(len_name, len), (name, text)] = lines(3, &blob).unwrap();
        assert_eq!(len_name, "data_chan3_len");
        assert_eq!(name, "data_chan3");
        assert_eq!(decode(&text, len.parse().unwrap()).unwrap(), blob);
    }

    #[test]
    fn empty_blob() {
        let text = encode(&[]).unwrap();
        assert!(decode(&text, text.len()).unwrap().is_empty());
    }

    #[test]
    fn short_text_is_a_decode_error() {
        let text = encode(b"falcon").unwrap();
        let err = decode(&text[..4], text.len()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert_eq!(decode("!!!!", 4).unwrap_err().kind(), ErrorKind::Decode);
        let not_zlib = BASE64_STANDARD.encode(b"plain");
        assert_eq!(
            decode(&not_zlib, not_zlib.len()).unwrap_err().kind(),
            ErrorKind::Decode
        );
    }
}
