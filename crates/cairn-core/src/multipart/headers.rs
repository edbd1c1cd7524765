//! Part header parsing

use crate::error::{Error, Result};

/// Headers of one multipart part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeaders {
    pub name: String,
    /// Present for file parts
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl PartHeaders {
    pub const fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

/// Parse a raw header block (lines separated by CRLF, no trailing empty line)
pub fn parse_part_headers(raw: &[u8]) -> Result<PartHeaders> {
    let raw = std::str::from_utf8(raw)
        .map_err(|_| Error::Multipart("Part headers are not valid UTF-8".into()))?;

    let mut disposition = None;
    let mut content_type = None;
    for line in raw.split("\r\n").filter(|line| !line.trim().is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Multipart(format!("Malformed part header: {line}")))?;
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("content-disposition") {
            disposition = Some(value);
        } else if name.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }

    let disposition = disposition
        .ok_or_else(|| Error::Multipart("Part without Content-Disposition".into()))?;
    let mut params = disposition.split(';').map(str::trim);
    if !params
        .next()
        .is_some_and(|kind| kind.eq_ignore_ascii_case("form-data"))
    {
        return Err(Error::Multipart(format!(
            "Unsupported Content-Disposition: {disposition}"
        )));
    }

    let mut name = None;
    let mut filename = None;
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = unquote(value.trim());
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(value),
            "filename" => filename = Some(value),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| Error::Multipart("Part without a name".into()))?;
    Ok(PartHeaders {
        name,
        filename,
        content_type,
    })
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map_or_else(|| value.to_string(), |inner| inner.replace("\\\"", "\""))
}

/// Quote a header parameter value
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

/// Extract the boundary from a `multipart/form-data` Content-Type value
pub fn extract_boundary(content_type: &str) -> Option<String> {
    let content_type = content_type
        .trim()
        .strip_prefix("Content-Type:")
        .unwrap_or(content_type);
    let mut params = content_type.split(';').map(str::trim);
    if !params
        .next()
        .is_some_and(|mime| mime.eq_ignore_ascii_case("multipart/form-data"))
    {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| unquote(value.trim()))
        .filter(|boundary| !boundary.is_empty())
}
