use crate::error::EngineError;
use crate::optimizer_status::HyperoptState;
use crate::space::{Dimension, Domain};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value of one hyperoptable parameter. This (inside a `ParamsDict`) is the only
/// thing handed to optimizer workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

pub type ParamsDict = BTreeMap<String, ParameterValue>;

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            ParameterValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParameterValue::Bool(v) => serde_json::Value::from(*v),
            ParameterValue::Int(v) => serde_json::Value::from(*v),
            ParameterValue::Float(v) => serde_json::Value::from(*v),
            ParameterValue::Str(v) => serde_json::Value::from(v.as_str()),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Str(value.to_string())
    }
}

/// Stable textual key of a parameter point, used to recognise duplicates.
pub fn params_key(params: &ParamsDict) -> String {
    serde_json::to_string(params).unwrap_or_else(|_| format!("{:?}", params))
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Int,
    Real,
    Decimal,
    Categorical,
    Boolean,
}

impl ParameterKind {
    fn label(self) -> &'static str {
        match self {
            ParameterKind::Int => "IntParameter",
            ParameterKind::Real => "RealParameter",
            ParameterKind::Decimal => "DecimalParameter",
            ParameterKind::Categorical => "CategoricalParameter",
            ParameterKind::Boolean => "BooleanParameter",
        }
    }
}

/// Numeric bounds as passed to a constructor: a scalar `low` (with `high`
/// given separately) or a `[low, high]` sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Bounds {
    Low(f64),
    Sequence(Vec<f64>),
}

impl From<f64> for Bounds {
    fn from(value: f64) -> Self {
        Bounds::Low(value)
    }
}

impl From<i64> for Bounds {
    fn from(value: i64) -> Self {
        Bounds::Low(value as f64)
    }
}

impl From<i32> for Bounds {
    fn from(value: i32) -> Self {
        Bounds::Low(value as f64)
    }
}

impl From<[i32; 2]> for Bounds {
    fn from(value: [i32; 2]) -> Self {
        Bounds::Sequence(value.iter().map(|v| *v as f64).collect())
    }
}

impl From<[f64; 2]> for Bounds {
    fn from(value: [f64; 2]) -> Self {
        Bounds::Sequence(value.to_vec())
    }
}

impl From<[i64; 2]> for Bounds {
    fn from(value: [i64; 2]) -> Self {
        Bounds::Sequence(value.iter().map(|v| *v as f64).collect())
    }
}

impl From<Vec<f64>> for Bounds {
    fn from(value: Vec<f64>) -> Self {
        Bounds::Sequence(value)
    }
}

fn resolve_bounds(kind: ParameterKind, low: Bounds, high: Option<f64>) -> Result<(f64, f64)> {
    match (low, high) {
        (Bounds::Sequence(_), Some(_)) => Err(EngineError::configuration(format!(
            "{} space invalid.",
            kind.label()
        ))
        .into()),
        (Bounds::Sequence(values), None) if values.len() == 2 => Ok((values[0], values[1])),
        (Bounds::Low(low), Some(high)) => Ok((low, high)),
        _ => Err(EngineError::configuration(format!(
            "{} space must be [low, high]",
            kind.label()
        ))
        .into()),
    }
}

/// Keyword options shared by every parameter kind.
#[derive(Debug, Clone)]
pub struct ParameterOptions {
    pub space: Option<String>,
    pub optimize: bool,
    pub load: bool,
    /// Must stay `None`; names come from registration.
    pub name: Option<String>,
}

impl Default for ParameterOptions {
    fn default() -> Self {
        Self {
            space: None,
            optimize: true,
            load: true,
            name: None,
        }
    }
}

impl ParameterOptions {
    pub fn space(space: &str) -> Self {
        Self {
            space: Some(space.to_string()),
            ..Self::default()
        }
    }

    pub fn fixed(mut self) -> Self {
        self.optimize = false;
        self
    }

    pub fn no_load(mut self) -> Self {
        self.load = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HyperoptParameter {
    name: Option<String>,
    kind: ParameterKind,
    domain: Domain,
    value: ParameterValue,
    pub space: Option<String>,
    pub optimize: bool,
    pub load: bool,
    pub in_space: bool,
}

impl HyperoptParameter {
    fn build(
        kind: ParameterKind,
        domain: Domain,
        default: ParameterValue,
        options: ParameterOptions,
    ) -> Result<Self> {
        if options.name.is_some() {
            return Err(EngineError::configuration(
                "Name is determined by parameter field name and can not be specified manually.",
            )
            .into());
        }
        let mut parameter = Self {
            name: None,
            kind,
            domain,
            value: default.clone(),
            space: options.space,
            optimize: options.optimize,
            load: options.load,
            in_space: false,
        };
        parameter.set_value(default)?;
        Ok(parameter)
    }

    pub fn int(
        low: impl Into<Bounds>,
        high: Option<i64>,
        default: i64,
        options: ParameterOptions,
    ) -> Result<Self> {
        let (low, high) =
            resolve_bounds(ParameterKind::Int, low.into(), high.map(|v| v as f64))?;
        Self::build(
            ParameterKind::Int,
            Domain::Int {
                low: low.round() as i64,
                high: high.round() as i64,
            },
            ParameterValue::Int(default),
            options,
        )
    }

    pub fn real(
        low: impl Into<Bounds>,
        high: Option<f64>,
        default: f64,
        options: ParameterOptions,
    ) -> Result<Self> {
        let (low, high) = resolve_bounds(ParameterKind::Real, low.into(), high)?;
        Self::build(
            ParameterKind::Real,
            Domain::Real { low, high },
            ParameterValue::Float(default),
            options,
        )
    }

    /// Decimal parameter rounded to `decimals` places (3 when `None`).
    pub fn decimal(
        low: impl Into<Bounds>,
        high: Option<f64>,
        default: f64,
        decimals: Option<u32>,
        options: ParameterOptions,
    ) -> Result<Self> {
        let (low, high) = resolve_bounds(ParameterKind::Decimal, low.into(), high)?;
        let domain = Domain::decimal(low, high, Some(decimals.unwrap_or(3)), None)?;
        Self::build(
            ParameterKind::Decimal,
            domain,
            ParameterValue::Float(default),
            options,
        )
    }

    /// Decimal parameter quantized by an explicit `step`.
    pub fn decimal_step(
        low: impl Into<Bounds>,
        high: Option<f64>,
        default: f64,
        step: f64,
        options: ParameterOptions,
    ) -> Result<Self> {
        let (low, high) = resolve_bounds(ParameterKind::Decimal, low.into(), high)?;
        let domain = Domain::decimal(low, high, None, Some(step))?;
        Self::build(
            ParameterKind::Decimal,
            domain,
            ParameterValue::Float(default),
            options,
        )
    }

    pub fn categorical(
        categories: Vec<ParameterValue>,
        default: Option<ParameterValue>,
        options: ParameterOptions,
    ) -> Result<Self> {
        if categories.len() < 2 {
            return Err(EngineError::configuration(
                "CategoricalParameter space must be [a, b, ...] (at least two parameters)",
            )
            .into());
        }
        let default = default.unwrap_or_else(|| categories[0].clone());
        Self::build(
            ParameterKind::Categorical,
            Domain::Categorical(categories),
            default,
            options,
        )
    }

    pub fn boolean(default: bool, options: ParameterOptions) -> Result<Self> {
        Self::build(
            ParameterKind::Boolean,
            Domain::Categorical(vec![ParameterValue::Bool(true), ParameterValue::Bool(false)]),
            ParameterValue::Bool(default),
            options,
        )
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    /// Assigns a new value, coercing it onto the parameter's type. Decimal
    /// values are rounded to the parameter's precision.
    pub fn set_value(&mut self, value: ParameterValue) -> Result<()> {
        let coerced = match (&self.domain, &value) {
            (Domain::Int { .. }, v) => v.as_i64().map(ParameterValue::Int),
            (Domain::Real { .. }, v) => v.as_f64().map(ParameterValue::Float),
            (Domain::Decimal { decimals, .. }, v) => v
                .as_f64()
                .map(|raw| ParameterValue::Float(round_to(raw, *decimals))),
            (Domain::Categorical(options), v) => {
                options.iter().find(|option| *option == v).cloned()
            }
        };
        match coerced {
            Some(value) => {
                self.value = value;
                Ok(())
            }
            None => Err(EngineError::configuration(format!(
                "Value {} is not valid for {}{}",
                value,
                self.kind.label(),
                self.name
                    .as_deref()
                    .map(|name| format!(" {}", name))
                    .unwrap_or_default()
            ))
            .into()),
        }
    }

    /// Values the strategy should iterate over. The full domain is exposed only
    /// while the parameter is being optimized and indicators are precomputed;
    /// otherwise this is just the current value.
    pub fn range(&self, state: HyperoptState) -> Vec<ParameterValue> {
        if self.in_space && self.optimize && state != HyperoptState::Optimize {
            match &self.domain {
                Domain::Real { .. } => vec![self.value.clone()],
                domain => domain.values(),
            }
        } else {
            vec![self.value.clone()]
        }
    }

    /// Search dimension for this parameter, when it takes part in the run.
    pub fn dimension(&self) -> Option<Dimension> {
        if !(self.in_space && self.optimize) {
            return None;
        }
        Some(Dimension {
            name: self.name.clone()?,
            space: self.space.clone().unwrap_or_default(),
            domain: self.domain.clone(),
        })
    }
}

/// Named parameters of one strategy, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    parameters: Vec<HyperoptParameter>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `name` to the parameter. A parameter declared without a space
    /// takes it from its name prefix (`buy_*`, `sell_*`, `protection_*`).
    pub fn register(&mut self, name: &str, mut parameter: HyperoptParameter) -> Result<()> {
        if self.get(name).is_some() {
            return Err(EngineError::configuration(format!(
                "Parameter {} is declared twice",
                name
            ))
            .into());
        }
        if parameter.space.is_none() {
            parameter.space = ["buy", "sell", "protection"]
                .iter()
                .find(|prefix| name.starts_with(&format!("{}_", prefix)))
                .map(|prefix| prefix.to_string());
        }
        if parameter.space.is_none() {
            return Err(EngineError::configuration(format!(
                "Parameter {} has no space and its name does not start with buy_, sell_ or protection_",
                name
            ))
            .into());
        }
        parameter.name = Some(name.to_string());
        self.parameters.push(parameter);
        Ok(())
    }

    pub fn with(mut self, name: &str, parameter: HyperoptParameter) -> Result<Self> {
        self.register(name, parameter)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&HyperoptParameter> {
        self.parameters.iter().find(|p| p.name() == Some(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HyperoptParameter> {
        self.parameters.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn value(&self, name: &str) -> Option<&ParameterValue> {
        self.get(name).map(HyperoptParameter::value)
    }

    pub fn int_value(&self, name: &str, default: i64) -> i64 {
        self.value(name).and_then(ParameterValue::as_i64).unwrap_or(default)
    }

    pub fn float_value(&self, name: &str, default: f64) -> f64 {
        self.value(name).and_then(ParameterValue::as_f64).unwrap_or(default)
    }

    pub fn bool_value(&self, name: &str, default: bool) -> bool {
        self.value(name).and_then(ParameterValue::as_bool).unwrap_or(default)
    }

    /// Marks parameters whose space is in `spaces` as taking part in the run.
    pub fn set_in_space(&mut self, spaces: &[String]) {
        for parameter in &mut self.parameters {
            parameter.in_space = parameter.optimize
                && parameter
                    .space
                    .as_ref()
                    .map_or(false, |space| spaces.iter().any(|s| s == space));
        }
    }

    pub fn dimensions(&self, space: &str) -> Vec<Dimension> {
        self.parameters
            .iter()
            .filter(|p| p.space.as_deref() == Some(space))
            .filter_map(HyperoptParameter::dimension)
            .collect()
    }

    pub fn has_space(&self, space: &str) -> bool {
        self.parameters.iter().any(|p| p.space.as_deref() == Some(space))
    }

    /// Assigns values from `params`. Returns the names that were applied.
    pub fn apply(&mut self, params: &ParamsDict) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        for parameter in &mut self.parameters {
            let Some(name) = parameter.name.clone() else {
                continue;
            };
            if let Some(value) = params.get(&name) {
                parameter.set_value(value.clone())?;
                applied.push(name);
            }
        }
        Ok(applied)
    }

    /// Loads persisted values for one space, honouring each parameter's `load` flag.
    pub fn load_space(&mut self, space: &str, params: &ParamsDict) -> Result<()> {
        for parameter in &mut self.parameters {
            if parameter.space.as_deref() != Some(space) {
                continue;
            }
            let name = parameter.name.clone().unwrap_or_default();
            match params.get(&name) {
                Some(value) if parameter.load => {
                    parameter.set_value(value.clone())?;
                    info!("Strategy Parameter: {} = {}", name, parameter.value());
                }
                Some(_) => info!(
                    "Parameter \"{}\" exists, but is disabled. Default value \"{}\" used.",
                    name,
                    parameter.value()
                ),
                None => info!("Strategy Parameter(default): {} = {}", name, parameter.value()),
            }
        }
        Ok(())
    }

    /// Current values of parameters not under optimization, grouped by space.
    pub fn not_optimized(&self) -> BTreeMap<String, ParamsDict> {
        let mut grouped: BTreeMap<String, ParamsDict> = BTreeMap::new();
        for parameter in self.parameters.iter().filter(|p| !p.in_space) {
            if let (Some(space), Some(name)) = (&parameter.space, &parameter.name) {
                grouped
                    .entry(space.clone())
                    .or_default()
                    .insert(name.clone(), parameter.value.clone());
            }
        }
        grouped
    }
}
