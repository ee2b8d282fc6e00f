//! Transport to the REST backend.

mod client;
mod types;

pub use client::{ApiClient, ApiRequest, HttpRefresher, SessionRefresher};
pub use types::{Attachment, Body, Created, MultipartBody, Page};
