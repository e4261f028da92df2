//! HTTP layer: the request executor, the store-dialect hook seam, and
//! process-wide transfer statistics.

pub mod hook;
pub mod request;
pub mod stats;

pub use hook::{ListPage, RequestHook};
pub use request::{HeaderBag, HttpRequest, Method, Transport};
