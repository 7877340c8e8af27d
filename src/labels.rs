// Class index to emotion name mapping

use crate::error::{EmotionStreamError, Result};
use crate::models::ClassProbabilities;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Object entries in document order, repeated keys included.
struct RawEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for RawEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of class index to name")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<RawEntries, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, Value>()? {
                    entries.push(entry);
                }
                Ok(RawEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Ordered class names, index-aligned with the classifier output.
///
/// Indices are canonical `usize` values `0..len`; every loader checks that
/// they are contiguous so a stray or missing class can't shift the rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    /// Builds a label map from names in class-index order.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(EmotionStreamError::LabelMap(
                "label map has no classes".to_string(),
            ));
        }
        if let Some(idx) = names.iter().position(|n| n.trim().is_empty()) {
            return Err(EmotionStreamError::LabelMap(format!(
                "class {idx} has an empty name"
            )));
        }
        Ok(Self { names })
    }

    /// Parses either `["Angry", ...]` or `{"0": "Angry", ...}`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Array(items) => {
                let names = items
                    .into_iter()
                    .enumerate()
                    .map(|(idx, item)| match item {
                        Value::String(name) => Ok(name),
                        other => Err(EmotionStreamError::LabelMap(format!(
                            "class {idx} is not a string: {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Self::from_names(names)
            }
            Value::Object(_) => {
                // `Value` keeps only the last of repeated keys, so read the raw entries.
                let RawEntries(entries) = serde_json::from_str(json)?;
                let mut indexed = BTreeMap::new();
                for (key, value) in entries {
                    let idx: usize = key.trim().parse().map_err(|_| {
                        EmotionStreamError::LabelMap(format!(
                            "key {key:?} is not a non-negative class index"
                        ))
                    })?;
                    let Value::String(name) = value else {
                        return Err(EmotionStreamError::LabelMap(format!(
                            "class {idx} is not a string: {value}"
                        )));
                    };
                    if indexed.insert(idx, name).is_some() {
                        return Err(EmotionStreamError::LabelMap(format!(
                            "class index {idx} appears more than once"
                        )));
                    }
                }
                if let Some((expected, found)) = indexed
                    .keys()
                    .enumerate()
                    .find(|(expected, found)| expected != *found)
                {
                    return Err(EmotionStreamError::LabelMap(format!(
                        "class indices must be contiguous from 0: expected {expected}, found {found}"
                    )));
                }
                Self::from_names(indexed.into_values())
            }
            other => Err(EmotionStreamError::LabelMap(format!(
                "expected a JSON array or object, got {other}"
            ))),
        }
    }

    /// Loads the label map from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EmotionStreamError::LabelMap(format!("failed to read {}: {e}", path.display()))
        })?;
        let labels = Self::from_json_str(&json)?;
        info!("Loaded {} emotion classes from {}", labels.len(), path.display());
        Ok(labels)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Fails unless the classifier's output length equals the class count.
    pub fn check_class_count(&self, outputs: usize) -> Result<()> {
        if outputs != self.len() {
            return Err(EmotionStreamError::ClassCountMismatch {
                labels: self.len(),
                outputs,
            });
        }
        Ok(())
    }

    /// Pairs each class name with its probability, in class order.
    pub fn readout<'a>(&'a self, probabilities: &ClassProbabilities) -> Vec<(&'a str, f32)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(probabilities.as_slice().iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_keys_in_numeric_order() {
        let labels =
            LabelMap::from_json_str(r#"{"2": "Neutral", "0": "Happy", "1": "Sad", "10": "X", "3": "a", "4": "b", "5": "c", "6": "d", "7": "e", "8": "f", "9": "g"}"#)
                .unwrap();
        assert_eq!(labels.len(), 11);
        assert_eq!(labels.get(0), Some("Happy"));
        assert_eq!(labels.get(2), Some("Neutral"));
        assert_eq!(labels.get(10), Some("X"));
    }

    #[test]
    fn parses_array_form() {
        let labels = LabelMap::from_json_str(r#"["Angry", "Disgust", "Fear"]"#).unwrap();
        assert_eq!(labels.names(), &["Angry", "Disgust", "Fear"]);
    }

    #[test]
    fn rejects_gaps_and_bad_keys() {
        assert!(matches!(
            LabelMap::from_json_str(r#"{"0": "Happy", "2": "Sad"}"#),
            Err(EmotionStreamError::LabelMap(_))
        ));
        assert!(matches!(
            LabelMap::from_json_str(r#"{"0": "Happy", "one": "Sad"}"#),
            Err(EmotionStreamError::LabelMap(_))
        ));
        assert!(matches!(
            LabelMap::from_json_str(r#"{"-1": "Happy"}"#),
            Err(EmotionStreamError::LabelMap(_))
        ));
        assert!(matches!(
            LabelMap::from_json_str(r#"{"0": 3}"#),
            Err(EmotionStreamError::LabelMap(_))
        ));
        assert!(matches!(
            LabelMap::from_json_str("[]"),
            Err(EmotionStreamError::LabelMap(_))
        ));
        assert!(matches!(
            LabelMap::from_json_str("\"Happy\""),
            Err(EmotionStreamError::LabelMap(_))
        ));
    }

    #[test]
    fn rejects_repeated_keys() {
        let err = LabelMap::from_json_str(r#"{"0": "Happy", "0": "Sad", "1": "Neutral"}"#)
            .unwrap_err();
        assert!(
            matches!(&err, EmotionStreamError::LabelMap(msg) if msg.contains("index 0")),
            "{err}"
        );
        assert!(matches!(
            LabelMap::from_json_str(r#"{"0": "Happy", "00": "Sad"}"#),
            Err(EmotionStreamError::LabelMap(_))
        ));
    }

    #[test]
    fn rejects_class_count_mismatch() {
        let labels = LabelMap::from_names(["Happy", "Sad", "Neutral"]).unwrap();
        assert!(labels.check_class_count(3).is_ok());
        assert!(matches!(
            labels.check_class_count(7),
            Err(EmotionStreamError::ClassCountMismatch {
                labels: 3,
                outputs: 7
            })
        ));
    }

    #[test]
    fn readout_pairs_names_with_scores() {
        let labels = LabelMap::from_names(["Happy", "Sad"]).unwrap();
        let readout = labels.readout(&vec![0.25, 0.75].into());
        assert_eq!(readout, vec![("Happy", 0.25), ("Sad", 0.75)]);
    }
}
