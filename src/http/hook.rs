//! The plug-in seam for object store dialects. A hook shapes URLs, signs
//! requests per attempt, decides retries after HTTP-level completion, and
//! owns the listing wire format.

use crate::http::request::HttpRequest;
use crate::Result;

/// One page of a bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Object keys, bucket-relative.
    pub keys: Vec<String>,
    /// Common prefixes (delimited listings only), with trailing delimiter.
    pub prefixes: Vec<String>,
    /// Marker to pass for the next page; `None` when the listing is complete.
    pub next_marker: Option<String>,
}

pub trait RequestHook: Send + Sync {
    /// Rewrite the base URL, e.g. to move the bucket into the hostname.
    fn adjust_url(&self, url: &str) -> String {
        url.to_string()
    }

    /// Called before every attempt; signatures are recomputed here so each
    /// retry carries a fresh date.
    fn pre_run(&self, _req: &mut HttpRequest, _attempt: u32) -> Result<()> {
        Ok(())
    }

    /// Called after an HTTP-level completion; return true to run another
    /// attempt (e.g. refresh credentials on 401, back off on 5xx).
    fn should_retry(&self, _req: &HttpRequest, _attempt: u32) -> bool {
        false
    }

    /// Build the query string for a listing request. `delimited` selects a
    /// single-level listing (readdir) over a full-subtree one (rename).
    fn list_query(&self, prefix: &str, marker: Option<&str>, delimited: bool) -> String;

    /// Parse one listing response body.
    fn parse_list(&self, body: &[u8]) -> Result<ListPage>;
}

/// Hook that passes everything through unchanged and understands no listing
/// format. Placeholder for executors that never list.
#[derive(Debug, Default)]
pub struct NullHook;

impl RequestHook for NullHook {
    fn list_query(&self, _prefix: &str, _marker: Option<&str>, _delimited: bool) -> String {
        String::new()
    }

    fn parse_list(&self, _body: &[u8]) -> Result<ListPage> {
        Ok(ListPage::default())
    }
}
