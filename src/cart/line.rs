//! Cart lines and money.

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

/// A money value in minor units (cents).
///
/// The backend sends decimals as strings (`"12.50"`), occasionally as numbers.
/// Both are accepted; it is always written back as a two-decimal string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
  pub const ZERO: Amount = Amount(0);

  pub fn from_minor(minor: i64) -> Self {
    Self(minor)
  }

  pub fn minor(self) -> i64 {
    self.0
  }

  /// Parse a decimal string. Digits past the second decimal are rounded.
  pub fn parse(text: &str) -> Result<Self, String> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
      Some(rest) => (true, rest),
      None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
      return Err(format!("invalid amount: {:?}", text));
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
      return Err(format!("invalid amount: {:?}", text));
    }

    let whole: i64 = if whole.is_empty() {
      0
    } else {
      whole.parse().map_err(|e| format!("invalid amount {:?}: {}", text, e))?
    };
    let mut frac_digits = frac.bytes().map(|b| i64::from(b - b'0'));
    let tenths = frac_digits.next().unwrap_or(0);
    let hundredths = frac_digits.next().unwrap_or(0);
    let round_up = frac_digits.next().map_or(false, |d| d >= 5);

    let minor = whole
      .checked_mul(100)
      .and_then(|m| m.checked_add(tenths * 10 + hundredths + i64::from(round_up)))
      .ok_or_else(|| format!("amount out of range: {:?}", text))?;
    Ok(Self(if negative { -minor } else { minor }))
  }

  /// `self * quantity`
  pub fn times(self, quantity: u32) -> Self {
    Self(self.0.saturating_mul(i64::from(quantity)))
  }
}

impl fmt::Display for Amount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let sign = if self.0 < 0 { "-" } else { "" };
    let abs = self.0.unsigned_abs();
    write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
  }
}

impl Add for Amount {
  type Output = Amount;

  fn add(self, rhs: Amount) -> Amount {
    Amount(self.0.saturating_add(rhs.0))
  }
}

impl Sum for Amount {
  fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
    iter.fold(Amount::ZERO, Add::add)
  }
}

impl Serialize for Amount {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Amount {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    match Value::deserialize(deserializer)? {
      Value::String(s) => Amount::parse(&s).map_err(de::Error::custom),
      Value::Number(n) => Amount::parse(&n.to_string()).map_err(de::Error::custom),
      Value::Null => Ok(Amount::ZERO),
      other => Err(de::Error::custom(format!("invalid amount: {}", other))),
    }
  }
}

/// Identifiers arrive as numbers or strings; both become strings.
pub(crate) fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(de::Error::custom(format!("invalid identifier: {}", other))),
  }
}

fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::Null => Ok(None),
    Value::String(s) => Ok(Some(s)),
    Value::Number(n) => Ok(Some(n.to_string())),
    other => Err(de::Error::custom(format!("invalid identifier: {}", other))),
  }
}

/// One item in a cart.
///
/// `id` is the server line id and is `None` for anonymous lines. `total` is
/// derived; call [`CartLine::recompute`] after touching quantity or rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
  #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(alias = "item", deserialize_with = "de_id")]
  pub item_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub quantity: u32,
  #[serde(default, alias = "hourly_rate")]
  pub unit_rate: Amount,
  #[serde(default)]
  pub total: Amount,
  /// Stock known when the line was recorded
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub available_quantity: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_date: Option<NaiveDate>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_date: Option<NaiveDate>,
}

impl CartLine {
  pub fn new(item_id: impl Into<String>, quantity: u32, unit_rate: Amount) -> Self {
    let mut line = Self {
      id: None,
      item_id: item_id.into(),
      name: None,
      quantity,
      unit_rate,
      total: Amount::ZERO,
      available_quantity: None,
      start_date: None,
      end_date: None,
    };
    line.recompute();
    line
  }

  pub fn with_available(mut self, available: u32) -> Self {
    self.available_quantity = Some(available);
    self
  }

  pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
    self.start_date = start;
    self.end_date = end;
    self
  }

  pub fn recompute(&mut self) {
    self.total = self.unit_rate.times(self.quantity);
  }

  /// Body of a create-cart-line call.
  pub fn create_body(&self, quantity: u32) -> Value {
    let mut body = serde_json::json!({
      "item": self.item_id,
      "quantity": quantity,
    });
    if let Some(start) = self.start_date {
      body["start_date"] = Value::String(start.to_string());
    }
    if let Some(end) = self.end_date {
      body["end_date"] = Value::String(end.to_string());
    }
    body
  }
}

#[derive(Debug, Deserialize)]
struct ItemDetails {
  #[serde(default)]
  name: Option<String>,
  #[serde(default)]
  hourly_rate: Amount,
  #[serde(default)]
  available_quantity: Option<u32>,
}

/// A line as the cart endpoint returns it.
#[derive(Debug, Deserialize)]
pub(crate) struct ServerCartLine {
  #[serde(deserialize_with = "de_id")]
  id: String,
  #[serde(deserialize_with = "de_id")]
  item: String,
  #[serde(default)]
  item_details: Option<ItemDetails>,
  quantity: u32,
  #[serde(default)]
  start_date: Option<NaiveDate>,
  #[serde(default)]
  end_date: Option<NaiveDate>,
}

impl From<ServerCartLine> for CartLine {
  fn from(line: ServerCartLine) -> Self {
    let details = line.item_details.unwrap_or(ItemDetails {
      name: None,
      hourly_rate: Amount::ZERO,
      available_quantity: None,
    });
    // The server total is ignored; totals are always recomputed locally
    let mut out = CartLine {
      id: Some(line.id),
      item_id: line.item,
      name: details.name,
      quantity: line.quantity,
      unit_rate: details.hourly_rate,
      total: Amount::ZERO,
      available_quantity: details.available_quantity,
      start_date: line.start_date,
      end_date: line.end_date,
    };
    out.recompute();
    out
  }
}
