// Visual-DNA bank entries: per-entity embedding versions used to keep
// characters and scenes visually consistent across shots. Vectors are
// opaque bytes here; similarity search happens in worker agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    WeightedAverage,
    LatestPriority,
    ConfidenceThreshold,
    ManualSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnaVersion {
    pub version: u32,
    /// Blend weight in [0, 1]. Weights across an entry sum to 1.0 after
    /// `rebalance`.
    pub weight: f64,
    /// Artifact the embedding was extracted from.
    pub source_artifact: String,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    #[serde(with = "vector_base64")]
    pub vector: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnaEntry {
    #[serde(default)]
    pub versions: Vec<DnaVersion>,
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub aggregated_confidence: f64,
}

impl Default for DnaEntry {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
            merge_strategy: MergeStrategy::WeightedAverage,
            aggregated_confidence: 0.0,
        }
    }
}

impl DnaEntry {
    /// Append a version and renormalize.
    pub fn push_version(&mut self, version: DnaVersion) {
        self.versions.push(version);
        self.rebalance();
    }

    /// Normalize weights so they sum to 1.0 and refresh the aggregated
    /// confidence (weighted mean). Zero-weight entries fall back to a
    /// uniform split.
    pub fn rebalance(&mut self) {
        if self.versions.is_empty() {
            self.aggregated_confidence = 0.0;
            return;
        }
        let total: f64 = self.versions.iter().map(|v| v.weight.max(0.0)).sum();
        if total <= f64::EPSILON {
            let uniform = 1.0 / self.versions.len() as f64;
            for v in &mut self.versions {
                v.weight = uniform;
            }
        } else {
            for v in &mut self.versions {
                v.weight = v.weight.max(0.0) / total;
            }
        }
        self.aggregated_confidence = self
            .versions
            .iter()
            .map(|v| v.weight * v.confidence)
            .sum();
    }

    pub fn latest_version(&self) -> Option<&DnaVersion> {
        self.versions.iter().max_by_key(|v| v.version)
    }
}

// Embedding vectors are raw bytes; base64 keeps them JSON-safe.
mod vector_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
