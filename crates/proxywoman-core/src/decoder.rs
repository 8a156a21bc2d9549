use std::fmt::Write as _;
use std::io::Read;

use crate::flow::FlowResponse;

const HEX_BYTES_PER_LINE: usize = 16;
const HEX_MAX_LINES: usize = 1000;
const HEX_VIEW_THRESHOLD: usize = 1024 * 1024;
const PRINTABLE_SAMPLE: usize = 1024;

const DOCUMENT_TYPES: &[&str] = &[
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "text/css",
    "application/json",
    "application/ld+json",
    "text/plain",
    "text/html",
    "application/xml",
    "text/xml",
    "application/xhtml+xml",
    "text/csv",
    "application/csv",
    "text/markdown",
    "application/yaml",
    "text/yaml",
    "application/x-yaml",
];

/// Fills in the derived views on a response: decompressed body, text/binary
/// classification, and the capped hex dump for binary or oversized bodies.
pub fn decode_response(response: &mut FlowResponse) {
    if response.body.is_empty() {
        return;
    }

    let encoding = header_value(&response.headers, "content-encoding")
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let content_type = header_value(&response.headers, "content-type")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    response.encoding = encoding.clone();
    if response.content_type.is_empty() {
        response.content_type = content_type.clone();
    }

    let decoded = match decompress(&response.body, &encoding) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::debug!(%encoding, %error, "body decode failed, keeping raw bytes");
            response.body.clone()
        }
    };

    response.is_text = is_text_content(&decoded, &content_type);
    response.is_binary = !response.is_text;
    response.is_document = is_document_content(&content_type);
    if response.is_binary || decoded.len() > HEX_VIEW_THRESHOLD {
        response.hex_view = Some(hex_view(&decoded));
    }
    response.decoded_body = decoded;
}

fn header_value<'a>(
    headers: &'a std::collections::HashMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn decompress(body: &[u8], encoding: &str) -> Result<Vec<u8>, String> {
    match encoding {
        "gzip" => decompress_gzip(body),
        "deflate" => decompress_deflate(body),
        "br" => decompress_brotli(body),
        _ => {
            // No declared encoding: recognize a gzip body by its magic bytes.
            if body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b {
                return decompress_gzip(body);
            }
            Ok(body.to_vec())
        }
    }
}

fn decompress_gzip(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|error| format!("gzip decode failed: {error}"))?;
    Ok(out)
}

fn decompress_deflate(input: &[u8]) -> Result<Vec<u8>, String> {
    // Servers disagree on whether "deflate" means zlib-wrapped or raw.
    let mut out = Vec::new();
    let mut zlib = flate2::read::ZlibDecoder::new(input);
    if zlib.read_to_end(&mut out).is_ok() {
        return Ok(out);
    }

    out.clear();
    let mut raw = flate2::read::DeflateDecoder::new(input);
    raw.read_to_end(&mut out)
        .map_err(|error| format!("deflate decode failed: {error}"))?;
    Ok(out)
}

fn decompress_brotli(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = brotli::Decompressor::new(input, 4096);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|error| format!("brotli decode failed: {error}"))?;
    Ok(out)
}

fn is_text_content(data: &[u8], content_type: &str) -> bool {
    const TEXT_FAMILIES: &[&str] = &[
        "text/",
        "application/json",
        "application/xml",
        "application/javascript",
        "application/x-javascript",
        "application/xhtml+xml",
        "application/rss+xml",
        "application/atom+xml",
    ];
    if TEXT_FAMILIES
        .iter()
        .any(|family| content_type.contains(family))
    {
        return true;
    }

    if data.is_empty() {
        return true;
    }
    if std::str::from_utf8(data).is_err() {
        return false;
    }

    let sample = &data[..data.len().min(PRINTABLE_SAMPLE)];
    let printable = sample
        .iter()
        .filter(|byte| matches!(byte, 0x20..=0x7e | b'\t' | b'\n' | b'\r'))
        .count();
    printable as f64 / sample.len() as f64 > 0.8
}

fn is_document_content(content_type: &str) -> bool {
    DOCUMENT_TYPES
        .iter()
        .any(|document| content_type.contains(document))
        || content_type.contains("text/")
}

/// Classic dump layout: offset, sixteen hex bytes split in two groups of
/// eight, then the printable-ASCII pane.
fn hex_view(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    let total_lines = data.len().div_ceil(HEX_BYTES_PER_LINE);
    let lines = total_lines.min(HEX_MAX_LINES);
    let mut out = String::with_capacity(lines * 80);

    for line in 0..lines {
        let offset = line * HEX_BYTES_PER_LINE;
        let _ = write!(out, "{offset:08x}  ");
        for column in 0..HEX_BYTES_PER_LINE {
            match data.get(offset + column) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
            if column == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for column in 0..HEX_BYTES_PER_LINE {
            let Some(byte) = data.get(offset + column) else {
                break;
            };
            if (0x20..=0x7e).contains(byte) {
                out.push(*byte as char);
            } else {
                out.push('.');
            }
        }
        out.push_str("|\n");
    }

    if data.len() > HEX_MAX_LINES * HEX_BYTES_PER_LINE {
        let _ = write!(
            out,
            "\n... (first {HEX_MAX_LINES} lines of {} bytes)\n",
            data.len()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::flow::FlowResponse;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("gzip write");
        encoder.finish().expect("gzip finish")
    }

    fn response_with(headers: &[(&str, &str)], body: Vec<u8>) -> FlowResponse {
        FlowResponse {
            status_code: 200,
            status: "200 OK".to_string(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect::<HashMap<_, _>>(),
            body,
            ..FlowResponse::default()
        }
    }

    #[test]
    fn gunzips_declared_gzip_bodies() {
        let mut response = response_with(
            &[
                ("Content-Encoding", "gzip"),
                ("Content-Type", "text/plain"),
            ],
            gzip(b"hello gzip"),
        );
        decode_response(&mut response);
        assert_eq!(response.decoded_body, b"hello gzip");
        assert_eq!(response.encoding, "gzip");
        assert!(response.is_text);
        assert!(response.is_document);
    }

    #[test]
    fn sniffs_gzip_without_declared_encoding() {
        let mut response = response_with(&[("Content-Type", "text/plain")], gzip(b"sniffed"));
        decode_response(&mut response);
        assert_eq!(response.decoded_body, b"sniffed");
    }

    #[test]
    fn undecodable_body_falls_back_to_raw() {
        let mut response = response_with(
            &[("Content-Encoding", "gzip")],
            b"\x1f\x8bnot really gzip".to_vec(),
        );
        decode_response(&mut response);
        assert_eq!(response.decoded_body, b"\x1f\x8bnot really gzip");
    }

    #[test]
    fn classifies_json_as_text_document() {
        let mut response = response_with(
            &[("Content-Type", "application/json; charset=utf-8")],
            b"{\"ok\":true}".to_vec(),
        );
        decode_response(&mut response);
        assert!(response.is_text);
        assert!(response.is_document);
        assert!(!response.is_binary);
        assert!(response.hex_view.is_none());
    }

    #[test]
    fn classifies_unlabeled_binary_and_builds_hex_view() {
        let body: Vec<u8> = (0u8..=255).cycle().take(64).collect();
        let mut response = response_with(&[], body);
        decode_response(&mut response);
        assert!(response.is_binary);
        assert!(!response.is_document);

        let hex = response.hex_view.expect("hex view for binary body");
        let first_line = hex.lines().next().expect("one line");
        assert!(first_line.starts_with("00000000  00 01 02 03 04 05 06 07  08 09"));
        assert!(first_line.ends_with('|'));
        assert_eq!(hex.lines().count(), 4);
    }

    #[test]
    fn hex_view_caps_line_count() {
        let data = vec![0u8; (HEX_MAX_LINES + 10) * HEX_BYTES_PER_LINE];
        let view = hex_view(&data);
        let data_lines = view
            .lines()
            .filter(|line| line.starts_with(|c: char| c.is_ascii_hexdigit()))
            .count();
        assert_eq!(data_lines, HEX_MAX_LINES);
        assert!(view.contains("... (first 1000 lines"));
    }

    #[test]
    fn mostly_unprintable_utf8_is_binary() {
        let body = vec![0x01u8; 256];
        let mut response = response_with(&[], body);
        decode_response(&mut response);
        assert!(response.is_binary);
    }
}
