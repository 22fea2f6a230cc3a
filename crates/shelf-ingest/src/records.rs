//! CSV row types.
//!
//! The export marks missing values either with an empty field or with the
//! literal `nan`; both load as NULL.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

/// One row of `distribution_centers.csv`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DistributionCenterRecord {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "nullable")]
    pub longitude: Option<f64>,
}

/// One row of `products.csv`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductRecord {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub cost: Option<f64>,
    #[serde(default, deserialize_with = "nullable")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub brand: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub retail_price: Option<f64>,
    #[serde(default, deserialize_with = "nullable")]
    pub department: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub sku: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub distribution_center_id: Option<i64>,
}

/// Treat empty fields and `nan` as missing, parse everything else.
///
/// Text is kept byte-for-byte so later exact matching on it still holds.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("nan") => Ok(None),
        Some(s) => s.parse().map(Some).or_else(|e| {
            // Numeric columns sometimes carry padding.
            s.trim()
                .parse()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid value {s:?}: {e}")))
        }),
    }
}
