//! Typed additional properties and the discriminator → decoder registry.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityLtsDataProperties {
    pub altitude_difference: Option<f64>,
    pub altitude_highest_point: Option<f64>,
    pub altitude_lowest_point: Option<f64>,
    pub distance_duration: Option<f64>,
    pub distance_length: Option<f64>,
    pub way_number: Option<i32>,
    pub is_open: Option<bool>,
    pub is_prepared: Option<bool>,
    pub has_rentals: Option<bool>,
    pub lift_available: Option<bool>,
    pub mountain_bike_permitted: Option<bool>,
    pub lift_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PoiLtsDataProperties {
    pub is_open: Option<bool>,
    pub has_free_entrance: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GastronomyLtsDataProperties {
    pub max_seating_capacity: Option<i32>,
    pub category_codes: Vec<String>,
    pub facilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PoiAgeDataProperties {
    pub age_from: Option<i32>,
    pub age_to: Option<i32>,
}

/// Tagged union of every additional property shape the engine understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "PropertyType")]
pub enum AdditionalProperty {
    ActivityLtsDataProperties(ActivityLtsDataProperties),
    PoiLtsDataProperties(PoiLtsDataProperties),
    GastronomyLtsDataProperties(GastronomyLtsDataProperties),
    PoiAgeDataProperties(PoiAgeDataProperties),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no codec registered for additional property type `{0}`")]
    UnknownDiscriminator(String),
    #[error("additional property `{discriminator}` failed to decode: {source}")]
    Decode {
        discriminator: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decoder for one additional property discriminator.
pub trait AdditionalPropertyCodec: Send + Sync {
    fn discriminator(&self) -> &'static str;
    fn decode(&self, value: &JsonValue) -> Result<AdditionalProperty, CodecError>;
}

/// Codec backed by a serde type and the enum variant constructor wrapping it.
pub struct SerdeCodec<T> {
    discriminator: &'static str,
    wrap: fn(T) -> AdditionalProperty,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    pub fn new(discriminator: &'static str, wrap: fn(T) -> AdditionalProperty) -> Self {
        Self {
            discriminator,
            wrap,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> AdditionalPropertyCodec for SerdeCodec<T> {
    fn discriminator(&self) -> &'static str {
        self.discriminator
    }

    fn decode(&self, value: &JsonValue) -> Result<AdditionalProperty, CodecError> {
        let decoded = T::deserialize(value).map_err(|source| CodecError::Decode {
            discriminator: self.discriminator.to_string(),
            source,
        })?;
        Ok((self.wrap)(decoded))
    }
}

#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Box<dyn AdditionalPropertyCodec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(SerdeCodec::new(
            "ActivityLtsDataProperties",
            AdditionalProperty::ActivityLtsDataProperties,
        ));
        registry.register(SerdeCodec::new(
            "PoiLtsDataProperties",
            AdditionalProperty::PoiLtsDataProperties,
        ));
        registry.register(SerdeCodec::new(
            "GastronomyLtsDataProperties",
            AdditionalProperty::GastronomyLtsDataProperties,
        ));
        registry.register(SerdeCodec::new(
            "PoiAgeDataProperties",
            AdditionalProperty::PoiAgeDataProperties,
        ));
        registry
    }

    pub fn register(&mut self, codec: impl AdditionalPropertyCodec + 'static) {
        self.codecs.insert(codec.discriminator(), Box::new(codec));
    }

    pub fn decode(&self, discriminator: &str, value: &JsonValue) -> Result<AdditionalProperty, CodecError> {
        self.codecs
            .get(discriminator)
            .ok_or_else(|| CodecError::UnknownDiscriminator(discriminator.to_string()))?
            .decode(value)
    }

    pub fn decode_all(
        &self,
        raw: &BTreeMap<String, JsonValue>,
    ) -> Result<BTreeMap<String, AdditionalProperty>, CodecError> {
        raw.iter()
            .map(|(key, value)| Ok((key.clone(), self.decode(key, value)?)))
            .collect()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys = self.codecs.keys().collect::<Vec<_>>();
        keys.sort();
        f.debug_struct("CodecRegistry").field("codecs", &keys).finish()
    }
}
