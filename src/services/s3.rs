//! Generic S3 dialect: SigV4 request signing, retry-once on 5xx, and the
//! marker-paginated ListBucketResult format.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;

use crate::config::Config;
use crate::http::hook::{ListPage, RequestHook};
use crate::http::request::HttpRequest;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";

pub struct S3Hook {
    access_key_id: String,
    secret_access_key: String,
    region: String,
}

impl S3Hook {
    pub fn new(config: &Config) -> Self {
        Self {
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            region: config.region.clone(),
        }
    }

    fn anonymous(&self) -> bool {
        self.access_key_id.is_empty()
    }
}

impl RequestHook for S3Hook {
    fn pre_run(&self, req: &mut HttpRequest, _attempt: u32) -> Result<()> {
        if self.anonymous() {
            return Ok(());
        }
        sign_v4(
            req,
            &self.access_key_id,
            &self.secret_access_key,
            &self.region,
            Utc::now(),
        )
    }

    fn should_retry(&self, req: &HttpRequest, attempt: u32) -> bool {
        // One extra attempt on a server-side error; anything persistent is
        // the caller's problem.
        let retry = req.response_code() >= 500 && attempt == 0;
        if retry {
            warn!(
                url = %req.url(),
                code = req.response_code(),
                "server error; retrying once"
            );
        }
        retry
    }

    fn list_query(&self, prefix: &str, marker: Option<&str>, delimited: bool) -> String {
        let mut query = format!("prefix={}", uri_encode(prefix, true));
        if delimited {
            query.push_str("&delimiter=%2F");
        }
        if let Some(marker) = marker {
            query.push_str("&marker=");
            query.push_str(&uri_encode(marker, true));
        }
        query
    }

    fn parse_list(&self, body: &[u8]) -> Result<ListPage> {
        parse_list_bucket_result(body)
    }
}

/// Sign the pending transaction with AWS Signature Version 4. Recomputed on
/// every attempt so retries carry a fresh date.
fn sign_v4(
    req: &mut HttpRequest,
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let method = req
        .method()
        .ok_or_else(|| Error::InvalidArgument("sign before init".into()))?;
    let url = Url::parse(req.target_url())
        .map_err(|e| Error::InvalidArgument(format!("unparseable URL {}: {e}", req.target_url())))?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(Error::InvalidArgument(format!(
                "URL without host: {}",
                req.target_url()
            ))
            .into())
        }
    };

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let payload_hash = hex::encode(Sha256::digest(req.input_buffer()));

    req.set_header("host", &host);
    req.set_header("x-amz-date", &amz_date);
    req.set_header("x-amz-content-sha256", &payload_hash);

    // Canonical headers: every request header except the authorization from
    // a previous attempt, lowercased and sorted.
    let mut header_pairs: Vec<(String, String)> = req
        .request_headers()
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    header_pairs.sort();
    let canonical_headers: String = header_pairs
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = header_pairs
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let mut query_pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
        .collect();
    query_pairs.sort();
    let canonical_query = query_pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.as_str(),
        url.path(),
        canonical_query,
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("AWS4{secret_access_key}").as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, SERVICE.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

    req.set_header(
        "authorization",
        &format!(
            "AWS4-HMAC-SHA256 Credential={access_key_id}/{scope}, \
             SignedHeaders={signed_headers}, Signature={signature}"
        ),
    );
    Ok(())
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 percent-encoding as SigV4 requires it.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Extract keys, common prefixes, and the continuation marker from a
/// ListBucketResult document. A tag scanner is enough for this fixed,
/// non-nested subset; anything that does not look like a listing is
/// `Corrupt`.
pub fn parse_list_bucket_result(body: &[u8]) -> Result<ListPage> {
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::Corrupt("listing is not valid UTF-8".into()))?;
    if !text.contains("<ListBucketResult") {
        return Err(Error::Corrupt("missing ListBucketResult element".into()).into());
    }

    let mut page = ListPage::default();
    for content in extract_tag_bodies(text, "Contents")? {
        let keys = extract_tag_bodies(&content, "Key")?;
        let key = keys
            .into_iter()
            .next()
            .ok_or_else(|| Error::Corrupt("Contents without Key".into()))?;
        page.keys.push(unescape_xml(&key));
    }
    for common in extract_tag_bodies(text, "CommonPrefixes")? {
        for prefix in extract_tag_bodies(&common, "Prefix")? {
            page.prefixes.push(unescape_xml(&prefix));
        }
    }

    let truncated = extract_tag_bodies(text, "IsTruncated")?
        .first()
        .is_some_and(|v| v == "true");
    if truncated {
        page.next_marker = extract_tag_bodies(text, "NextMarker")?
            .into_iter()
            .next()
            .map(|m| unescape_xml(&m))
            .or_else(|| {
                // Marker-style listings without NextMarker continue from the
                // lexically last name returned.
                page.keys
                    .iter()
                    .chain(page.prefixes.iter())
                    .max()
                    .cloned()
            });
        if page.next_marker.is_none() {
            return Err(Error::Corrupt("truncated listing without a marker".into()).into());
        }
    }

    Ok(page)
}

/// Return the text between each `<tag>`/`</tag>` pair. Self-closing and
/// attribute-carrying forms do not occur in the subset we read.
fn extract_tag_bodies(text: &str, tag: &str) -> Result<Vec<String>> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut bodies = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            return Err(Error::Corrupt(format!("unterminated <{tag}>")).into());
        };
        bodies.push(after[..end].to_string());
        rest = &after[end + close.len()..];
    }
    Ok(bodies)
}

fn unescape_xml(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
