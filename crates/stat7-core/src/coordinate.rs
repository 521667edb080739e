use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::address::compute_address;
use crate::boundary::{derive_coordinate, DerivationRule};
use crate::Stat7Error;

pub const COORDINATE_SCHEMA_VERSION: &str = "stat7.coordinate.v1";
pub const POLARITY_LEN: usize = 7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Realm {
    Data,
    Narrative,
    System,
    Faculty,
    Event,
    Pattern,
    Void,
}

impl Realm {
    pub const ALL: [Self; 7] = [
        Self::Data,
        Self::Narrative,
        Self::System,
        Self::Faculty,
        Self::Event,
        Self::Pattern,
        Self::Void,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Narrative => "narrative",
            Self::System => "system",
            Self::Faculty => "faculty",
            Self::Event => "event",
            Self::Pattern => "pattern",
            Self::Void => "void",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|realm| realm.as_str() == value)
    }
}

/// Lifecycle stage. Variants are declared in lifecycle order so the derived
/// `Ord` matches `rank`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    Genesis,
    Emergence,
    Peak,
    Decay,
    Archived,
}

impl Horizon {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Genesis => 0,
            Self::Emergence => 1,
            Self::Peak => 2,
            Self::Decay => 3,
            Self::Archived => 4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Genesis => "genesis",
            Self::Emergence => "emergence",
            Self::Peak => "peak",
            Self::Decay => "decay",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "genesis" => Some(Self::Genesis),
            "emergence" => Some(Self::Emergence),
            "peak" => Some(Self::Peak),
            "decay" => Some(Self::Decay),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Public,
    Sensitive,
    Pii,
}

impl Classification {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "PUBLIC",
            Self::Sensitive => "SENSITIVE",
            Self::Pii => "PII",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PUBLIC" => Some(Self::Public),
            "SENSITIVE" => Some(Self::Sensitive),
            "PII" => Some(Self::Pii),
            _ => None,
        }
    }
}

/// 64-character lowercase hex SHA-256 digest naming a record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub const LEN: usize = 64;

    /// # Errors
    /// Returns `Stat7Error::Validation` unless `raw` is exactly 64 lowercase hex characters.
    pub fn parse(raw: &str) -> Result<Self, Stat7Error> {
        let well_formed = raw.len() == Self::LEN
            && raw.bytes().all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if !well_formed {
            return Err(Stat7Error::Validation(format!(
                "address must be {} lowercase hex characters, got {raw:?}",
                Self::LEN
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub(crate) fn from_digest_hex(hex: String) -> Self {
        Self(hex)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = Stat7Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Address {
    type Error = Stat7Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Opaque record content. Travels as standard base64 in JSON.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct Payload(Vec<u8>);

impl Payload {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// # Errors
    /// Returns `Stat7Error::Validation` when `encoded` is not standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, Stat7Error> {
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(|err| Stat7Error::Validation(format!("payload is not valid base64: {err}")))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Coordinate {
    pub realm: Realm,
    pub lineage: u32,
    #[serde(default)]
    pub adjacency: BTreeSet<Address>,
    pub horizon: Horizon,
    pub luminosity: f64,
    pub polarity: [f64; POLARITY_LEN],
    pub dimensionality: u8,
}

impl Coordinate {
    /// Root coordinate at lineage 0 with an all-zero polarity.
    #[must_use]
    pub fn genesis(realm: Realm, luminosity: f64, dimensionality: u8) -> Self {
        Self {
            realm,
            lineage: 0,
            adjacency: BTreeSet::new(),
            horizon: Horizon::Genesis,
            luminosity,
            polarity: [0.0; POLARITY_LEN],
            dimensionality,
        }
    }

    #[must_use]
    pub fn with_polarity(mut self, polarity: [f64; POLARITY_LEN]) -> Self {
        self.polarity = polarity;
        self
    }

    #[must_use]
    pub fn with_adjacency(mut self, adjacency: impl IntoIterator<Item = Address>) -> Self {
        self.adjacency = adjacency.into_iter().collect();
        self
    }

    /// Polarity components that participate in scoring.
    #[must_use]
    pub fn active_polarity(&self) -> &[f64] {
        let active = usize::from(self.dimensionality).min(POLARITY_LEN);
        &self.polarity[..active]
    }

    /// Checks the value ranges every stored coordinate must satisfy. Non-zero
    /// trailing polarity is tolerated here; the boundary validator repairs it.
    ///
    /// # Errors
    /// Returns `Stat7Error::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<(), Stat7Error> {
        if !self.luminosity.is_finite() || !(0.0..=1.0).contains(&self.luminosity) {
            return Err(Stat7Error::Validation(format!(
                "luminosity must be a finite value in [0, 1], got {}",
                self.luminosity
            )));
        }

        for (index, component) in self.polarity.iter().enumerate() {
            if !component.is_finite() || !(-1.0..=1.0).contains(component) {
                return Err(Stat7Error::Validation(format!(
                    "polarity[{index}] must be a finite value in [-1, 1], got {component}"
                )));
            }
        }

        if self.dimensionality == 0 || usize::from(self.dimensionality) > POLARITY_LEN {
            return Err(Stat7Error::Validation(format!(
                "dimensionality must be in 1..={POLARITY_LEN}, got {}",
                self.dimensionality
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Record {
    pub address: Address,
    pub coordinate: Coordinate,
    pub classification: Classification,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Record {
    /// Builds a record and derives its address from coordinate and payload.
    ///
    /// # Errors
    /// Returns `Stat7Error::Validation` when the coordinate is out of range.
    pub fn new(
        coordinate: Coordinate,
        payload: Payload,
        classification: Classification,
    ) -> Result<Self, Stat7Error> {
        coordinate.validate()?;
        let address = compute_address(&coordinate, payload.as_bytes());
        Ok(Self {
            address,
            coordinate,
            classification,
            payload,
            parent: None,
            owner: None,
            signature: None,
        })
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Links this record to `parent`.
    ///
    /// # Errors
    /// Returns `Stat7Error::Validation` unless lineage is exactly one past the parent's
    /// and both records share a realm.
    pub fn with_parent(mut self, parent: &Record) -> Result<Self, Stat7Error> {
        let expected = parent.coordinate.lineage.checked_add(1);
        if expected != Some(self.coordinate.lineage) {
            return Err(Stat7Error::Validation(format!(
                "lineage {} does not follow parent lineage {}",
                self.coordinate.lineage, parent.coordinate.lineage
            )));
        }
        if parent.coordinate.realm != self.coordinate.realm {
            return Err(Stat7Error::Validation(format!(
                "realm {} does not match parent realm {}",
                self.coordinate.realm.as_str(),
                parent.coordinate.realm.as_str()
            )));
        }
        self.parent = Some(parent.address.clone());
        Ok(self)
    }

    /// Derives a child record under `rule`. The child inherits owner and
    /// classification; `payload` defaults to the parent's.
    ///
    /// # Errors
    /// Returns `Stat7Error::Validation` when the rule cannot be applied to this record.
    pub fn derive(&self, rule: DerivationRule, payload: Option<Payload>) -> Result<Self, Stat7Error> {
        let coordinate = derive_coordinate(&self.coordinate, rule)?;
        let payload = payload.unwrap_or_else(|| self.payload.clone());
        let mut child = Self::new(coordinate, payload, self.classification)?;
        child.parent = Some(self.address.clone());
        child.owner.clone_from(&self.owner);
        Ok(child)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none() && self.coordinate.lineage == 0
    }

    /// Recomputes the address from the stored coordinate and payload.
    ///
    /// # Errors
    /// Returns `Stat7Error::Integrity` when the stored address does not match.
    pub fn verify_address(&self) -> Result<(), Stat7Error> {
        let recomputed = compute_address(&self.coordinate, self.payload.as_bytes());
        if recomputed != self.address {
            return Err(Stat7Error::Integrity(format!(
                "stored address {} does not match recomputed {recomputed}",
                self.address
            )));
        }
        Ok(())
    }

    /// True when both records carry the same content under the same address.
    #[must_use]
    pub fn same_content(&self, other: &Record) -> bool {
        self.address == other.address
            && self.coordinate == other.coordinate
            && self.payload == other.payload
            && self.classification == other.classification
    }
}
