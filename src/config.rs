//! Layer hyper-parameters.
//!
//! The surrounding model loader hands every layer a string-keyed map of
//! options. The convolution layer recognises:
//!
//! - `stride` (required): sets both the vertical and horizontal stride.
//! - `backend` (optional): `host`, `accelerator` or `auto`.
//! - `auto_min_macs` (optional): work threshold used by the `auto` policy.
//! - `pool` (optional): reuse scratch buffers across calls.
//!
//! ```rust
//! use briny_conv::config::{ConvConfig, HyperParams};
//! let params: HyperParams = "stride=2 backend=host".parse().unwrap();
//! let cfg = ConvConfig::from_params(&params).unwrap();
//! assert_eq!((cfg.stride_h, cfg.stride_w), (2, 2));
//! ```

use crate::backend::{CostModel, ExecPolicy};
use crate::error::{ConvError, Result};
use std::collections::HashMap;
use std::str::FromStr;

/// One hyper-parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

/// String-keyed option map handed to a layer at setup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HyperParams {
    params: HashMap<String, Param>,
}

impl HyperParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Param>) -> &mut Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Param> {
        self.params.get(key)
    }

    /// Reads `key` as a non-negative integer; text values are parsed.
    ///
    /// Returns `Ok(None)` when the key is absent.
    ///
    /// # Errors
    /// [`ConvError::Config`] if the value is not an integer that fits `usize`.
    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        let Some(param) = self.params.get(key) else {
            return Ok(None);
        };
        let value = match param {
            Param::Int(v) => *v,
            Param::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| ConvError::config(key, format!("`{s}` is not an integer ({e})")))?,
            other => return Err(ConvError::config(key, format!("expected an integer, got {other:?}"))),
        };
        usize::try_from(value)
            .map(Some)
            .map_err(|_| ConvError::config(key, format!("{value} is negative")))
    }

    /// Reads `key` as a boolean; `true`/`false`/`1`/`0` text is accepted.
    ///
    /// # Errors
    /// [`ConvError::Config`] on any other value.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(Param::Bool(b)) => Ok(Some(*b)),
            Some(Param::Int(0)) => Ok(Some(false)),
            Some(Param::Int(1)) => Ok(Some(true)),
            Some(Param::Text(s)) => match s.trim() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(ConvError::config(key, format!("`{s}` is not a boolean"))),
            },
            Some(other) => Err(ConvError::config(key, format!("expected a boolean, got {other:?}"))),
        }
    }
}

impl<K: Into<String>, V: Into<Param>> FromIterator<(K, V)> for HyperParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.set(k, v);
        }
        params
    }
}

/// Parses `key=value` pairs separated by whitespace or commas.
///
/// Values are kept as [`Param::Text`]; typed accessors convert on read.
impl FromStr for HyperParams {
    type Err = ConvError;

    fn from_str(s: &str) -> Result<Self> {
        let mut params = Self::new();
        for pair in s.split(|c: char| c == ',' || c.is_whitespace()) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConvError::config(pair, "expected `key=value`"))?;
            if key.is_empty() {
                return Err(ConvError::config(pair, "empty key"));
            }
            params.set(key, Param::Text(value.to_owned()));
        }
        Ok(params)
    }
}

/// Validated, immutable configuration of one convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvConfig {
    pub stride_h: usize,
    pub stride_w: usize,
    /// Per-layer policy; `None` defers to [`crate::backend::default_policy`].
    pub policy: Option<ExecPolicy>,
    pub cost: CostModel,
    pub pooling: bool,
}

impl ConvConfig {
    /// A configuration with equal strides and every optional setting at its default.
    ///
    /// # Errors
    /// [`ConvError::Config`] if `stride` is zero.
    pub fn with_stride(stride: usize) -> Result<Self> {
        if stride == 0 {
            return Err(ConvError::config("stride", "must be at least 1"));
        }
        Ok(Self {
            stride_h: stride,
            stride_w: stride,
            policy: None,
            cost: CostModel::default(),
            pooling: false,
        })
    }

    /// Builds the configuration from the loader's option map.
    ///
    /// Nothing is partially applied: any invalid option fails the whole setup.
    ///
    /// # Errors
    /// [`ConvError::Config`] if `stride` is missing, not an integer or zero,
    /// or if an optional key holds an invalid value.
    pub fn from_params(params: &HyperParams) -> Result<Self> {
        let stride = params
            .get_usize("stride")?
            .ok_or_else(|| ConvError::config("stride", "option is required"))?;
        let mut cfg = Self::with_stride(stride)?;

        cfg.policy = match params.get("backend") {
            None => None,
            Some(Param::Text(s)) => Some(s.parse()?),
            Some(other) => {
                return Err(ConvError::config("backend", format!("expected text, got {other:?}")));
            }
        };
        if let Some(min_macs) = params.get_usize("auto_min_macs")? {
            cfg.cost = CostModel { min_macs };
        }
        cfg.pooling = params.get_bool("pool")?.unwrap_or(false);

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_applies_to_both_axes() {
        let params: HyperParams = [("stride", 3i64)].into_iter().collect();
        let cfg = ConvConfig::from_params(&params).unwrap();
        assert_eq!((cfg.stride_h, cfg.stride_w), (3, 3));
        assert_eq!(cfg.policy, None);
        assert!(!cfg.pooling);
    }

    #[test]
    fn missing_stride_is_config_error() {
        let err = ConvConfig::from_params(&HyperParams::new()).unwrap_err();
        assert!(matches!(err, ConvError::Config { ref key, .. } if key == "stride"));
    }

    #[test]
    fn invalid_stride_values_are_rejected() {
        for bad in ["abc", "-1", "0", "1.5"] {
            let params: HyperParams = format!("stride={bad}").parse().unwrap();
            assert!(
                matches!(ConvConfig::from_params(&params), Err(ConvError::Config { .. })),
                "stride={bad} should be rejected"
            );
        }
        let mut params = HyperParams::new();
        params.set("stride", 2.0);
        assert!(ConvConfig::from_params(&params).is_err());
    }

    #[test]
    fn parses_optional_keys() {
        let params: HyperParams = "stride=1, backend=accelerator pool=true auto_min_macs=64"
            .parse()
            .unwrap();
        let cfg = ConvConfig::from_params(&params).unwrap();
        assert_eq!(cfg.policy, Some(ExecPolicy::Accelerator));
        assert!(cfg.pooling);
        assert_eq!(cfg.cost.min_macs, 64);
    }

    #[test]
    fn unknown_backend_name_fails_setup() {
        let params: HyperParams = "stride=1 backend=tpu".parse().unwrap();
        assert!(matches!(
            ConvConfig::from_params(&params),
            Err(ConvError::Config { ref key, .. }) if key == "backend"
        ));
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!("stride".parse::<HyperParams>().is_err());
        assert!("=2".parse::<HyperParams>().is_err());
    }
}
