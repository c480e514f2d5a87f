use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PoolError;

/// Seed value asking for a random seed.
pub const RANDOM_SEED: i64 = -1;

/// Uniform generation parameters handed to every adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    /// Model the request wants loaded, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Free-form extension fields passed through to backends.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

fn default_steps() -> u32 {
    20
}

fn default_dimension() -> u32 {
    512
}

fn default_cfg_scale() -> f64 {
    7.0
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            seed: RANDOM_SEED,
            steps: default_steps(),
            width: default_dimension(),
            height: default_dimension(),
            cfg_scale: default_cfg_scale(),
            model: None,
            extra: Map::new(),
        }
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = negative.into();
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Copy of the request for one unit of a batch.
    pub fn for_unit(&self, base_seed: i64, index: u32) -> Self {
        let mut unit = self.clone();
        unit.seed = base_seed.wrapping_add(i64::from(index));
        unit
    }

    pub fn to_json(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self).context("serializing generation request")? {
            Value::Object(map) => Ok(map),
            other => Err(PoolError::InvalidData(format!(
                "generation request serialized to {other}"
            ))
            .into()),
        }
    }
}

/// One produced image.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl GeneratedImage {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Decode plain base64 PNG data, as returned by web-ui style servers.
    pub fn from_base64_png(encoded: &str) -> Result<Self> {
        let data = STANDARD
            .decode(encoded.trim())
            .map_err(|err| PoolError::RemoteProtocol(format!("bad base64 image: {err}")))?;
        Ok(Self::new("image/png", data))
    }

    /// Decode a `data:<mime>;base64,<payload>` URI.
    pub fn from_data_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| PoolError::RemoteProtocol("image is not a data URI".into()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| PoolError::RemoteProtocol("data URI has no payload".into()))?;
        let mime_type = header
            .strip_suffix(";base64")
            .ok_or_else(|| PoolError::RemoteProtocol("data URI is not base64".into()))?;
        let data = STANDARD
            .decode(payload)
            .map_err(|err| PoolError::RemoteProtocol(format!("bad base64 image: {err}")))?;
        Ok(Self::new(mime_type, data))
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }
}

impl std::fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub type ImageSet = Vec<GeneratedImage>;

/// Incremental output of a streaming generation.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    /// Progress report; `batch_index` identifies the unit within the batch.
    Progress { batch_index: u32, data: Value },
    Image(GeneratedImage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_fields_flatten_into_payload() {
        let req = GenerationRequest::new("a fox")
            .with_seed(7)
            .with_extra("sampler", Value::from("euler"));
        let json = req.to_json().unwrap();
        assert_eq!(json["prompt"], "a fox");
        assert_eq!(json["seed"], 7);
        assert_eq!(json["sampler"], "euler");
        assert!(!json.contains_key("model"));

        let parsed: GenerationRequest =
            serde_json::from_value(Value::Object(json)).unwrap();
        assert_eq!(parsed.extra["sampler"], "euler");
    }

    #[test]
    fn unit_seeds_offset_from_base() {
        let req = GenerationRequest::new("x");
        assert_eq!(req.for_unit(100, 0).seed, 100);
        assert_eq!(req.for_unit(100, 4).seed, 104);
        assert_eq!(req.for_unit(i64::MAX, 1).seed, i64::MIN);
    }

    #[test]
    fn data_uri_parsing() {
        let image = GeneratedImage::new("image/jpeg", vec![1, 2, 3]);
        let uri = image.to_data_uri();
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        assert_eq!(GeneratedImage::from_data_uri(&uri).unwrap(), image);

        let err = GeneratedImage::from_data_uri("https://example.com/a.png").unwrap_err();
        assert!(matches!(
            PoolError::find(&err),
            Some(PoolError::RemoteProtocol(_))
        ));
    }
}
