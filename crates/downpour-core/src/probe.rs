//! URL probing: discover name, size, content type, redirect target, and
//! whether the server honors byte ranges.

use crate::error::Result;
use downpour_types::LinkInfo;
use reqwest::header;
use reqwest::Client;
use tracing::{debug, info};

/// Probe a URL with HEAD, falling back to a ranged GET for servers that
/// leave `Accept-Ranges` out.
///
/// The server is resumable when `Accept-Ranges != none`. When the header is
/// absent and the content is larger than one segment, a test GET for bytes
/// `100-500` is issued: status 206 with `Content-Length: 401` means the
/// server is implicitly resumable.
pub async fn probe(client: &Client, url: &str, segment_size: u64) -> Result<LinkInfo> {
    debug!("probing {url}");
    let response = client.head(url).send().await?;

    let eff_url = response.url().to_string();
    let headers = response.headers().clone();

    let size: u64 = header_str(&headers, header::CONTENT_LENGTH)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let content_type = header_str(&headers, header::CONTENT_TYPE)
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    let last_modified = header_str(&headers, header::LAST_MODIFIED).map(str::to_string);

    let accept_ranges = header_str(&headers, header::ACCEPT_RANGES);
    let mut resumable = matches!(accept_ranges, Some(v) if v != "none");

    if accept_ranges.is_none() && size > segment_size {
        resumable = test_range_support(client, &eff_url).await;
    }

    let name = file_name_from(&headers, &eff_url);

    info!(
        "probe {url}: size={size} resumable={resumable} type={:?}",
        content_type
    );
    Ok(LinkInfo {
        url: url.to_string(),
        eff_url,
        name,
        size,
        content_type,
        resumable,
        last_modified,
    })
}

/// Issue a GET for the 401-byte test range `100-500` and check for an exact
/// partial response.
async fn test_range_support(client: &Client, url: &str) -> bool {
    let response = match client
        .get(url)
        .header(header::RANGE, "bytes=100-500")
        .send()
        .await
    {
        Ok(r) => r,
        Err(_) => return false,
    };

    response.status() == reqwest::StatusCode::PARTIAL_CONTENT
        && response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            == Some(401)
}

fn header_str<'a>(headers: &'a header::HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract a file name from `Content-Disposition` (preferring `filename*`
/// per RFC 6266), else from the URL path, percent-decoded.
fn file_name_from(headers: &header::HeaderMap, url: &str) -> String {
    if let Some(cd) = header_str(headers, header::CONTENT_DISPOSITION) {
        let parts: Vec<&str> = cd.split(';').map(str::trim).collect();
        let starred = parts
            .iter()
            .find(|p| p.to_ascii_lowercase().starts_with("filename*"));
        let plain = parts
            .iter()
            .find(|p| p.to_ascii_lowercase().starts_with("filename"));
        if let Some(part) = starred.or(plain) {
            if let Some(value) = part.splitn(2, '=').nth(1) {
                // filename*=UTF-8''name.ext | filename="name.ext"
                let value = value.trim_matches('"');
                let value = value.rsplit("''").next().unwrap_or(value);
                let decoded = percent_decode(value);
                if !decoded.is_empty() {
                    return decoded;
                }
            }
        }
    }

    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_default();
    let base = path.trim_matches('/').rsplit('/').next().unwrap_or("");
    let decoded = percent_decode(base);
    if decoded.is_empty() {
        "download".to_string()
    } else {
        decoded
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> header::HeaderMap {
        let mut map = header::HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                header::HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn name_from_content_disposition() {
        let h = headers(&[(
            "content-disposition",
            "attachment; filename=\"proxmox-ve_6.3-1.iso\"; size=852299776",
        )]);
        assert_eq!(
            file_name_from(&h, "http://example.com/dl"),
            "proxmox-ve_6.3-1.iso"
        );
    }

    #[test]
    fn starred_filename_wins() {
        let h = headers(&[(
            "content-disposition",
            "attachment; filename=\"plain.bin\"; filename*=UTF-8''better.bin",
        )]);
        assert_eq!(file_name_from(&h, "http://example.com/dl"), "better.bin");
    }

    #[test]
    fn name_falls_back_to_url_path() {
        let h = header::HeaderMap::new();
        assert_eq!(
            file_name_from(&h, "http://example.com/files/silver%20bullet.mkv?x=1"),
            "silver bullet.mkv"
        );
        assert_eq!(file_name_from(&h, "http://example.com/"), "download");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
