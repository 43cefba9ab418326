use std::fmt;
use std::ops::Deref;
use std::sync::LazyLock;

use discovery::LabelSet;
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

static DEFAULT_REGEX: LazyLock<Regexp> =
    LazyLock::new(|| Regexp::new("(.*)").expect("default relabel regex must compile"));

fn default_regex() -> Regexp {
    DEFAULT_REGEX.clone()
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_replacement() -> String {
    "$1".to_string()
}

/// A regular expression which always matches the whole input, the
/// original pattern is kept for serialization.
#[derive(Clone, Debug)]
pub struct Regexp {
    pattern: String,
    regex: Regex,
}

impl Regexp {
    pub fn new(pattern: &str) -> Result<Regexp, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;

        Ok(Regexp {
            pattern: pattern.to_string(),
            regex,
        })
    }

    #[inline]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Deref for Regexp {
    type Target = Regex;

    fn deref(&self) -> &Self::Target {
        &self.regex
    }
}

impl PartialEq for Regexp {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Serialize for Regexp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for Regexp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Regexp::new(&pattern).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Match `regex` against the concatenated `source_labels`, then set
    /// `target_label` to `replacement` with match group references
    /// (`${1}`, `${2}`, ...) substituted.
    #[default]
    Replace,
    /// Drop targets for which `regex` does not match the concatenated `source_labels`.
    Keep,
    /// Drop targets for which `regex` matches the concatenated `source_labels`.
    Drop,
    /// Set `target_label` to the `modulus` of a hash of the concatenated `source_labels`.
    HashMod,
    /// Copy the values of labels whose name matches `regex` to label
    /// names given by `replacement`.
    LabelMap,
    /// Remove labels whose name matches `regex`.
    LabelDrop,
    /// Remove labels whose name does not match `regex`.
    LabelKeep,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Replace => "replace",
            Action::Keep => "keep",
            Action::Drop => "drop",
            Action::HashMod => "hashmod",
            Action::LabelMap => "labelmap",
            Action::LabelDrop => "labeldrop",
            Action::LabelKeep => "labelkeep",
        };

        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RelabelError {
    #[error("relabel configuration for {0} action requires 'target_label' value")]
    MissingTargetLabel(Action),

    #[error("relabel configuration for hashmod requires non-zero modulus")]
    ZeroModulus,
}

/// RelabelConfig is the configuration for relabeling of target label sets.
///
/// Deserialized rules are always valid, see `RelabelConfig::validate`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(try_from = "RawRelabelConfig")]
pub struct RelabelConfig {
    /// A list of labels from which values are taken and concatenated
    /// with the configured separator in order.
    pub source_labels: Vec<String>,

    /// Separator is the string between concatenated values from the source labels.
    pub separator: String,

    /// Regex against which the value is matched.
    pub regex: Regexp,

    /// Modulus to take of the hash of concatenated values from the source labels.
    pub modulus: u64,

    /// The label to which the resulting string is written in a replacement.
    pub target_label: String,

    /// The replacement is the regex replacement pattern to be used.
    pub replacement: String,

    /// Action is the action to be performed for the relabeling.
    pub action: Action,
}

#[derive(Deserialize)]
struct RawRelabelConfig {
    #[serde(default)]
    source_labels: Vec<String>,
    #[serde(default = "default_separator")]
    separator: String,
    #[serde(default = "default_regex")]
    regex: Regexp,
    #[serde(default)]
    modulus: u64,
    #[serde(default)]
    target_label: String,
    #[serde(default = "default_replacement")]
    replacement: String,
    #[serde(default)]
    action: Action,
}

impl TryFrom<RawRelabelConfig> for RelabelConfig {
    type Error = RelabelError;

    fn try_from(raw: RawRelabelConfig) -> Result<Self, Self::Error> {
        let config = RelabelConfig {
            source_labels: raw.source_labels,
            separator: raw.separator,
            regex: raw.regex,
            modulus: raw.modulus,
            target_label: raw.target_label,
            replacement: raw.replacement,
            action: raw.action,
        };

        config.validate()?;

        Ok(config)
    }
}

impl Default for RelabelConfig {
    fn default() -> Self {
        RelabelConfig {
            source_labels: vec![],
            separator: default_separator(),
            regex: default_regex(),
            modulus: 0,
            target_label: String::new(),
            replacement: default_replacement(),
            action: Action::default(),
        }
    }
}

impl RelabelConfig {
    pub fn validate(&self) -> Result<(), RelabelError> {
        if self.action == Action::HashMod && self.modulus == 0 {
            return Err(RelabelError::ZeroModulus);
        }

        if matches!(self.action, Action::Replace | Action::HashMod) && self.target_label.is_empty()
        {
            return Err(RelabelError::MissingTargetLabel(self.action));
        }

        Ok(())
    }

    /// Returns `None` if the label set should be dropped.
    fn apply(&self, mut labels: LabelSet) -> Option<LabelSet> {
        let value = self
            .source_labels
            .iter()
            .map(|name| labels.get(name).map(String::as_str).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(&self.separator);

        match self.action {
            Action::Replace => {
                if let Some(captures) = self.regex.captures(&value) {
                    let mut result = String::new();
                    captures.expand(&self.replacement, &mut result);

                    if result.is_empty() {
                        labels.remove(&self.target_label);
                    } else {
                        labels.insert(self.target_label.clone(), result);
                    }
                }
            }
            Action::Keep => {
                if !self.regex.is_match(&value) {
                    return None;
                }
            }
            Action::Drop => {
                if self.regex.is_match(&value) {
                    return None;
                }
            }
            Action::HashMod => {
                let digest = Md5::digest(value.as_bytes());
                let mut lower = [0u8; 8];
                lower.copy_from_slice(&digest[8..]);

                // a zero modulus only gets past validation when the rule
                // is built by hand, it is a no-op then
                if let Some(m) = u64::from_be_bytes(lower).checked_rem(self.modulus) {
                    labels.insert(self.target_label.clone(), m.to_string());
                }
            }
            Action::LabelMap => {
                // matching is done against the input, so freshly mapped
                // names are never mapped again
                let mut mapped = labels.clone();
                for (name, value) in &labels {
                    if self.regex.is_match(name) {
                        let new = self.regex.replace(name, self.replacement.as_str());
                        mapped.insert(new.into_owned(), value.clone());
                    }
                }

                labels = mapped;
            }
            Action::LabelDrop => labels.retain(|name, _value| !self.regex.is_match(name)),
            Action::LabelKeep => labels.retain(|name, _value| self.regex.is_match(name)),
        }

        Some(labels)
    }
}

/// Applies the relabeling rules in order, each rule sees the output of the
/// previous one. Returns `None` as soon as a rule drops the label set.
pub fn process(mut labels: LabelSet, configs: &[RelabelConfig]) -> Option<LabelSet> {
    for config in configs {
        labels = config.apply(labels)?;
    }

    Some(labels)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn assert_process(input: &[(&str, &str)], configs: Vec<RelabelConfig>, want: Option<LabelSet>) {
        let got = process(labels(input), &configs);
        assert_eq!(got, want);
    }

    #[test]
    fn regex_is_anchored() {
        let re = Regexp::new("a.*").unwrap();

        assert!(re.is_match("abc"));
        assert!(!re.is_match("cab"));
        assert_eq!(re.pattern(), "a.*");
    }

    #[test]
    fn replace() {
        assert_process(
            &[("a", "foo"), ("b", "bar")],
            vec![RelabelConfig {
                source_labels: vec!["a".into(), "b".into()],
                regex: Regexp::new("f(.*);(.*)r").unwrap(),
                target_label: "c".into(),
                replacement: "ch${1}-ch${2}".into(),
                ..Default::default()
            }],
            Some(labels(&[("a", "foo"), ("b", "bar"), ("c", "choo-chba")])),
        )
    }

    #[test]
    fn replace_not_matched() {
        assert_process(
            &[("a", "foo")],
            vec![RelabelConfig {
                source_labels: vec!["a".into()],
                regex: Regexp::new("bar").unwrap(),
                target_label: "b".into(),
                ..Default::default()
            }],
            Some(labels(&[("a", "foo")])),
        )
    }

    #[test]
    fn replace_empty_result_deletes() {
        assert_process(
            &[("a", "foo"), ("b", "bar")],
            vec![RelabelConfig {
                source_labels: vec!["missing".into()],
                regex: Regexp::new("(.*)").unwrap(),
                target_label: "b".into(),
                ..Default::default()
            }],
            Some(labels(&[("a", "foo")])),
        )
    }

    #[test]
    fn rules_run_in_order() {
        assert_process(
            &[("a", "foo")],
            vec![
                RelabelConfig {
                    source_labels: vec!["a".into()],
                    target_label: "b".into(),
                    ..Default::default()
                },
                RelabelConfig {
                    source_labels: vec!["b".into()],
                    regex: Regexp::new("foo").unwrap(),
                    action: Action::Drop,
                    ..Default::default()
                },
                RelabelConfig {
                    source_labels: vec!["a".into()],
                    target_label: "never".into(),
                    ..Default::default()
                },
            ],
            None,
        )
    }

    #[test]
    fn keep() {
        let config = RelabelConfig {
            source_labels: vec!["a".into()],
            regex: Regexp::new("f.*").unwrap(),
            action: Action::Keep,
            ..Default::default()
        };

        assert_process(
            &[("a", "foo")],
            vec![config.clone()],
            Some(labels(&[("a", "foo")])),
        );
        assert_process(&[("a", "boo")], vec![config], None);
    }

    #[test]
    fn drop() {
        let config = RelabelConfig {
            source_labels: vec!["a".into()],
            regex: Regexp::new("f.*").unwrap(),
            action: Action::Drop,
            ..Default::default()
        };

        assert_process(&[("a", "foo")], vec![config.clone()], None);
        assert_process(
            &[("a", "boo")],
            vec![config],
            Some(labels(&[("a", "boo")])),
        );
    }

    #[test]
    fn hashmod() {
        assert_process(
            &[("c", "baz")],
            vec![RelabelConfig {
                source_labels: vec!["c".into()],
                target_label: "d".into(),
                modulus: 1000,
                action: Action::HashMod,
                ..Default::default()
            }],
            Some(labels(&[("c", "baz"), ("d", "976")])),
        )
    }

    #[test]
    fn labelmap() {
        assert_process(
            &[("__meta_foo", "1"), ("__meta_bar", "2"), ("other", "3")],
            vec![RelabelConfig {
                regex: Regexp::new("__meta_(.+)").unwrap(),
                replacement: "${1}".into(),
                action: Action::LabelMap,
                ..Default::default()
            }],
            Some(labels(&[
                ("__meta_foo", "1"),
                ("__meta_bar", "2"),
                ("other", "3"),
                ("foo", "1"),
                ("bar", "2"),
            ])),
        )
    }

    #[test]
    fn labeldrop() {
        assert_process(
            &[("a", "foo"), ("b1", "bar"), ("b2", "baz")],
            vec![RelabelConfig {
                regex: Regexp::new("b.*").unwrap(),
                action: Action::LabelDrop,
                ..Default::default()
            }],
            Some(labels(&[("a", "foo")])),
        )
    }

    #[test]
    fn labelkeep() {
        assert_process(
            &[("a", "foo"), ("b1", "bar"), ("b2", "baz")],
            vec![RelabelConfig {
                regex: Regexp::new("b.*").unwrap(),
                action: Action::LabelKeep,
                ..Default::default()
            }],
            Some(labels(&[("b1", "bar"), ("b2", "baz")])),
        )
    }

    #[test]
    fn deserialize_defaults() {
        let config = serde_yaml::from_str::<RelabelConfig>(
            r#"
source_labels: [job]
target_label: foo
"#,
        )
        .unwrap();

        assert_eq!(
            config,
            RelabelConfig {
                source_labels: vec!["job".into()],
                target_label: "foo".into(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn deserialize_invalid_regex() {
        let err = serde_yaml::from_str::<RelabelConfig>("regex: \"(foo\"").unwrap_err();
        assert!(err.to_string().contains("regex parse error"), "{err}");
    }

    #[test]
    fn deserialize_invalid_rule() {
        for (text, want) in [
            (
                "{source_labels: [__address__], target_label: shard, action: hashmod}",
                "non-zero modulus",
            ),
            (
                "{source_labels: [__address__], modulus: 8, action: hashmod}",
                "requires 'target_label' value",
            ),
            ("{source_labels: [job]}", "requires 'target_label' value"),
        ] {
            let err = serde_yaml::from_str::<RelabelConfig>(text)
                .unwrap_err()
                .to_string();
            assert!(err.contains(want), "{text}: {err}");
        }
    }

    #[test]
    fn hashmod_zero_modulus_is_noop() {
        assert_process(
            &[("c", "baz")],
            vec![RelabelConfig {
                source_labels: vec!["c".into()],
                target_label: "d".into(),
                action: Action::HashMod,
                ..Default::default()
            }],
            Some(labels(&[("c", "baz")])),
        )
    }

    #[test]
    fn validate() {
        for (config, want) in [
            (
                RelabelConfig::default(),
                Err(RelabelError::MissingTargetLabel(Action::Replace)),
            ),
            (
                RelabelConfig {
                    action: Action::HashMod,
                    target_label: "foo".into(),
                    ..Default::default()
                },
                Err(RelabelError::ZeroModulus),
            ),
            (
                RelabelConfig {
                    action: Action::Drop,
                    ..Default::default()
                },
                Ok(()),
            ),
        ] {
            assert_eq!(config.validate(), want);
        }
    }
}
