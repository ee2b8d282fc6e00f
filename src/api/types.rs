//! Wire types shared by the transport and its callers.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A paged collection response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
  pub count: u64,
  #[serde(default)]
  pub total_pages: Option<u64>,
  #[serde(default)]
  pub current_page: Option<u64>,
  pub next: Option<String>,
  pub previous: Option<String>,
  pub results: Vec<T>,
}

/// Outcome of a create call. A 409 means the resource is already there,
/// which callers treat as an informational branch rather than a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Created {
  New(Value),
  AlreadyExists(String),
}

impl Created {
  /// Server-assigned identifier of a newly created resource.
  pub fn id(&self) -> Option<String> {
    match self {
      Created::New(body) => match body.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
      },
      Created::AlreadyExists(_) => None,
    }
  }
}

/// Binary upload carried inside a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
  pub name: String,
  pub mime: String,
  #[serde(serialize_with = "encode_bytes", deserialize_with = "decode_bytes")]
  pub bytes: Vec<u8>,
}

fn encode_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&STANDARD.encode(bytes))
}

fn decode_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
  let encoded = String::deserialize(deserializer)?;
  STANDARD
    .decode(encoded.as_bytes())
    .map_err(serde::de::Error::custom)
}

/// A `multipart/form-data` body. Kept as plain data so it can be rebuilt when a
/// request is retried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartBody {
  pub fields: Vec<(String, String)>,
  pub files: Vec<(String, Attachment)>,
}

/// Request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
  #[default]
  Empty,
  Json(Value),
  Multipart(MultipartBody),
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_attachment_is_base64_in_json() {
    let a = Attachment {
      name: "drill.png".into(),
      mime: "image/png".into(),
      bytes: vec![0, 1, 2, 255],
    };
    let v = serde_json::to_value(&a).unwrap();
    assert_eq!(v["bytes"], "AAEC/w==");
    let back: Attachment = serde_json::from_value(v).unwrap();
    assert_eq!(back, a);
  }

  #[test]
  fn test_page_shape() {
    let page: Page<Value> = serde_json::from_value(json!({
      "count": 3,
      "total_pages": 2,
      "current_page": 1,
      "next": "https://rent.example/api/equipments/?page=2",
      "previous": null,
      "page_links": [],
      "results": [{"id": 1}, {"id": 2}]
    }))
    .unwrap();
    assert_eq!(page.results.len(), 2);
    assert_eq!(page.total_pages, Some(2));
  }

  #[test]
  fn test_created_id() {
    assert_eq!(Created::New(json!({"id": "abc"})).id().as_deref(), Some("abc"));
    assert_eq!(Created::New(json!({"id": 7})).id().as_deref(), Some("7"));
    assert_eq!(Created::AlreadyExists("dup".into()).id(), None);
  }
}
