use std::fmt;

/// SubscriberId is an opaque endpoint identity, such as a chat or channel id.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// AssetKey identifies an asset by its coordinates in integer micro-degrees.
///
/// Reports reference assets by location before any persisted row may exist,
/// so coordinates rather than database identity are the key of both the
/// subscription index and aggregation entries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct AssetKey {
    pub lat_e6: i32,
    pub lng_e6: i32,
}

impl AssetKey {
    pub const fn new(lat_e6: i32, lng_e6: i32) -> Self {
        Self { lat_e6, lng_e6 }
    }

    /// Round floating-point degrees to the nearest micro-degree.
    pub fn from_degrees(lat: f64, lng: f64) -> Self {
        Self {
            lat_e6: degrees_to_e6(lat),
            lng_e6: degrees_to_e6(lng),
        }
    }

    pub fn latitude(&self) -> f64 {
        self.lat_e6 as f64 / 1e6
    }

    pub fn longitude(&self) -> f64 {
        self.lng_e6 as f64 / 1e6
    }
}

pub fn degrees_to_e6(degrees: f64) -> i32 {
    (degrees * 1e6).round() as i32
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude(), self.longitude())
    }
}

impl std::str::FromStr for AssetKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((lat, lng)) = s.split_once(',') else {
            anyhow::bail!("asset key {s:?} must be formatted as 'lat,lng'");
        };
        let lat: f64 = lat.trim().parse()?;
        let lng: f64 = lng.trim().parse()?;

        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            anyhow::bail!("asset key {s:?} is out of range");
        }
        Ok(Self::from_degrees(lat, lng))
    }
}

/// EntryKey addresses one aggregation entry: a single subscriber's view of a single asset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub asset: AssetKey,
    pub subscriber: SubscriberId,
}

impl EntryKey {
    pub fn new(asset: AssetKey, subscriber: SubscriberId) -> Self {
        Self { asset, subscriber }
    }

    /// Key of the coordination lease which serializes deliveries for this entry.
    pub fn lease_key(&self) -> String {
        format!("{self}.lock")
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asset({}),{}", self.asset, self.subscriber)
    }
}
