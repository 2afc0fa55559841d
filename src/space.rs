use crate::error::EngineError;
use crate::parameters::{round_to, ParameterValue, ParamsDict};
use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SPACE_BUY: &str = "buy";
pub const SPACE_SELL: &str = "sell";
pub const SPACE_PROTECTION: &str = "protection";
pub const SPACE_ROI: &str = "roi";
pub const SPACE_STOPLOSS: &str = "stoploss";
pub const SPACE_TRAILING: &str = "trailing";
pub const SPACE_TRADES: &str = "trades";

pub const ALL_SPACES: [&str; 7] = [
    SPACE_BUY,
    SPACE_SELL,
    SPACE_PROTECTION,
    SPACE_ROI,
    SPACE_STOPLOSS,
    SPACE_TRAILING,
    SPACE_TRADES,
];
pub const DEFAULT_SPACES: [&str; 4] = [SPACE_BUY, SPACE_SELL, SPACE_ROI, SPACE_STOPLOSS];

/// Decimal places used for `params_details` output.
const DETAILS_DECIMALS: u32 = 13;

/// Value domain of a search dimension or parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    Int { low: i64, high: i64 },
    Real { low: f64, high: f64 },
    Decimal { low: f64, high: f64, decimals: u32, step: f64 },
    Categorical(Vec<ParameterValue>),
}

impl Domain {
    /// Decimal domain. `decimals` and `step` are mutually exclusive; a bare
    /// decimal dimension is rounded to 4 places.
    pub fn decimal(low: f64, high: f64, decimals: Option<u32>, step: Option<f64>) -> Result<Self> {
        let (decimals, step) = match (decimals, step) {
            (Some(_), Some(_)) => {
                return Err(EngineError::configuration(
                    "DecimalParameter accepts either decimals or step, not both.",
                )
                .into())
            }
            (None, Some(step)) => {
                if !(step.is_finite() && step > 0.0) {
                    return Err(EngineError::configuration(format!(
                        "DecimalParameter step must be > 0 (value: {})",
                        step
                    ))
                    .into());
                }
                (step_decimals(step), step)
            }
            (decimals, None) => {
                let decimals = decimals.unwrap_or(4);
                (decimals, 10f64.powi(-(decimals as i32)))
            }
        };
        if low > high {
            return Err(EngineError::configuration(format!(
                "DecimalParameter low ({}) must not exceed high ({})",
                low, high
            ))
            .into());
        }
        Ok(Domain::Decimal {
            low: round_to(low, decimals),
            high: round_to(high, decimals),
            decimals,
            step,
        })
    }

    /// Discrete values in declaration order. Real domains yield their bounds.
    pub fn values(&self) -> Vec<ParameterValue> {
        match self {
            Domain::Int { low, high } => (*low..=*high).map(ParameterValue::Int).collect(),
            Domain::Real { low, high } => {
                vec![ParameterValue::Float(*low), ParameterValue::Float(*high)]
            }
            Domain::Decimal {
                low,
                decimals,
                step,
                ..
            } => (0..=self.decimal_steps())
                .map(|k| ParameterValue::Float(round_to(low + k as f64 * step, *decimals)))
                .collect(),
            Domain::Categorical(options) => options.clone(),
        }
    }

    fn decimal_steps(&self) -> i64 {
        match self {
            Domain::Decimal {
                low, high, step, ..
            } => ((high - low) / step + 1e-9).floor().max(0.0) as i64,
            _ => 0,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Domain::Int { low, high } => ParameterValue::Int(if low >= high {
                *low
            } else {
                rng.gen_range(*low..=*high)
            }),
            Domain::Real { low, high } => ParameterValue::Float(if low >= high {
                *low
            } else {
                rng.gen_range(*low..=*high)
            }),
            Domain::Decimal {
                low, decimals, step, ..
            } => {
                let k = rng.gen_range(0..=self.decimal_steps());
                ParameterValue::Float(round_to(low + k as f64 * step, *decimals))
            }
            Domain::Categorical(options) => options
                .choose(rng)
                .cloned()
                .unwrap_or(ParameterValue::Bool(false)),
        }
    }

    /// Snaps a numeric value back into the domain.
    pub fn clip(&self, raw: f64) -> Option<ParameterValue> {
        match self {
            Domain::Int { low, high } => {
                Some(ParameterValue::Int((raw.round() as i64).clamp(*low, (*high).max(*low))))
            }
            Domain::Real { low, high } => Some(ParameterValue::Float(raw.clamp(*low, high.max(*low)))),
            Domain::Decimal {
                low,
                high,
                decimals,
                step,
            } => {
                let k = ((raw - low) / step).round();
                let snapped = round_to(low + k * step, *decimals);
                Some(ParameterValue::Float(snapped.clamp(*low, high.max(*low))))
            }
            Domain::Categorical(_) => None,
        }
    }

    /// Width of a numeric domain.
    pub fn span(&self) -> Option<f64> {
        match self {
            Domain::Int { low, high } => Some((high - low) as f64),
            Domain::Real { low, high } | Domain::Decimal { low, high, .. } => Some(high - low),
            Domain::Categorical(_) => None,
        }
    }
}

fn step_decimals(step: f64) -> u32 {
    (0..=12)
        .find(|&digits| (round_to(step, digits) - step).abs() < 1e-12)
        .unwrap_or(12)
}

/// One named axis of the search space.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub space: String,
    pub domain: Domain,
}

impl Dimension {
    pub fn int(name: &str, space: &str, low: i64, high: i64) -> Self {
        Self {
            name: name.to_string(),
            space: space.to_string(),
            domain: Domain::Int { low, high },
        }
    }

    pub fn decimal(name: &str, space: &str, low: f64, high: f64, decimals: u32) -> Self {
        let step = 10f64.powi(-(decimals as i32));
        Self {
            name: name.to_string(),
            space: space.to_string(),
            domain: Domain::Decimal {
                low: round_to(low, decimals),
                high: round_to(high, decimals),
                decimals,
                step,
            },
        }
    }

    pub fn categorical(name: &str, space: &str, options: Vec<ParameterValue>) -> Self {
        Self {
            name: name.to_string(),
            space: space.to_string(),
            domain: Domain::Categorical(options),
        }
    }
}

/// Expands `all` / `default` shorthands and rejects unknown space names.
pub fn resolve_spaces(spaces: &[String]) -> Result<Vec<String>> {
    let mut resolved: Vec<String> = Vec::new();
    let requested: Vec<&str> = if spaces.is_empty() {
        vec!["default"]
    } else {
        spaces.iter().map(|s| s.trim()).collect()
    };
    for space in requested {
        let expanded: Vec<&str> = match space {
            "all" => ALL_SPACES.to_vec(),
            "default" => DEFAULT_SPACES.to_vec(),
            other if ALL_SPACES.contains(&other) => vec![other],
            other => {
                return Err(EngineError::configuration(format!(
                    "Unknown hyperopt space '{}' (expected one of all, default, {})",
                    other,
                    ALL_SPACES.join(", ")
                ))
                .into())
            }
        };
        for name in expanded {
            if !resolved.iter().any(|s| s == name) {
                resolved.push(name.to_string());
            }
        }
    }
    resolved.sort_by_key(|name| ALL_SPACES.iter().position(|s| s == name));
    Ok(resolved)
}

pub fn has_space(spaces: &[String], space: &str) -> bool {
    spaces.iter().any(|s| s == space)
}

/// ROI dimensions adapted to the timeframe: time limits scale linearly,
/// profit limits logarithmically, matching the 5m layout exactly.
pub fn roi_space(timeframe_minutes: i64) -> Vec<Dimension> {
    let minutes = timeframe_minutes.max(1) as f64;
    let t_scale = minutes / 5.0;
    let p_scale = minutes.ln_1p() / 5f64.ln_1p();
    let t = |v: f64| (v * t_scale) as i64;
    let p = |v: f64| v * p_scale;
    vec![
        Dimension::int("roi_t1", SPACE_ROI, t(10.0), t(120.0)),
        Dimension::int("roi_t2", SPACE_ROI, t(10.0), t(60.0)),
        Dimension::int("roi_t3", SPACE_ROI, t(10.0), t(40.0)),
        Dimension::decimal("roi_p1", SPACE_ROI, p(0.01), p(0.04), 3),
        Dimension::decimal("roi_p2", SPACE_ROI, p(0.01), p(0.07), 3),
        Dimension::decimal("roi_p3", SPACE_ROI, p(0.01), p(0.20), 3),
    ]
}

pub fn stoploss_space() -> Vec<Dimension> {
    vec![Dimension::decimal("stoploss", SPACE_STOPLOSS, -0.35, -0.02, 3)]
}

pub fn trailing_space() -> Vec<Dimension> {
    vec![
        // Only `true` is searched; disabling trailing is what the other spaces do.
        Dimension::categorical(
            "trailing_stop",
            SPACE_TRAILING,
            vec![ParameterValue::Bool(true)],
        ),
        Dimension::decimal("trailing_stop_positive", SPACE_TRAILING, 0.01, 0.35, 3),
        Dimension::decimal(
            "trailing_stop_positive_offset_p1",
            SPACE_TRAILING,
            0.001,
            0.1,
            3,
        ),
        Dimension::categorical(
            "trailing_only_offset_is_reached",
            SPACE_TRAILING,
            vec![ParameterValue::Bool(true), ParameterValue::Bool(false)],
        ),
    ]
}

pub fn trades_space(pair_count: usize) -> Vec<Dimension> {
    vec![Dimension::int(
        "max_open_trades",
        SPACE_TRADES,
        -1,
        (2 * pair_count.max(1)) as i64,
    )]
}

fn float_param(params: &ParamsDict, name: &str) -> f64 {
    params.get(name).and_then(ParameterValue::as_f64).unwrap_or(0.0)
}

fn int_param(params: &ParamsDict, name: &str) -> i64 {
    params.get(name).and_then(ParameterValue::as_i64).unwrap_or(0)
}

/// `{0: p1+p2+p3, t3: p1+p2, t3+t2: p1, t3+t2+t1: 0}`.
pub fn generate_roi_table(params: &ParamsDict) -> BTreeMap<i64, f64> {
    let (t1, t2, t3) = (
        int_param(params, "roi_t1"),
        int_param(params, "roi_t2"),
        int_param(params, "roi_t3"),
    );
    let (p1, p2, p3) = (
        float_param(params, "roi_p1"),
        float_param(params, "roi_p2"),
        float_param(params, "roi_p3"),
    );
    let mut table = BTreeMap::new();
    table.insert(0, round_to(p1 + p2 + p3, 3));
    table.insert(t3, round_to(p1 + p2, 3));
    table.insert(t3 + t2, round_to(p1, 3));
    table.insert(t3 + t2 + t1, 0.0);
    table
}

/// Trailing settings from the trailing space; the offset is `positive + p1`.
pub fn trailing_settings(params: &ParamsDict) -> Map<String, Value> {
    let positive = float_param(params, "trailing_stop_positive");
    let offset = positive + float_param(params, "trailing_stop_positive_offset_p1");
    let mut settings = Map::new();
    settings.insert(
        "trailing_stop".to_string(),
        Value::from(
            params
                .get("trailing_stop")
                .and_then(ParameterValue::as_bool)
                .unwrap_or(true),
        ),
    );
    settings.insert("trailing_stop_positive".to_string(), Value::from(positive));
    settings.insert(
        "trailing_stop_positive_offset".to_string(),
        Value::from(round_to(offset, 3)),
    );
    settings.insert(
        "trailing_only_offset_is_reached".to_string(),
        Value::from(
            params
                .get("trailing_only_offset_is_reached")
                .and_then(ParameterValue::as_bool)
                .unwrap_or(false),
        ),
    );
    settings
}

fn rounded_json(value: &ParameterValue) -> Value {
    match value {
        ParameterValue::Float(v) => Value::from(round_to(*v, DETAILS_DECIMALS)),
        other => other.to_json(),
    }
}

/// Groups a flat point into per-space sections, as persisted in epoch records
/// and parameter export files.
pub fn params_details(params: &ParamsDict, dimensions: &[Dimension]) -> Map<String, Value> {
    let mut details = Map::new();
    let spaces: Vec<&str> = ALL_SPACES
        .iter()
        .copied()
        .filter(|space| dimensions.iter().any(|d| d.space == *space))
        .collect();

    for space in spaces {
        match space {
            SPACE_ROI => {
                let table: Map<String, Value> = generate_roi_table(params)
                    .into_iter()
                    .map(|(minutes, ratio)| (minutes.to_string(), Value::from(ratio)))
                    .collect();
                details.insert(SPACE_ROI.to_string(), Value::Object(table));
            }
            SPACE_TRAILING => {
                details.insert(
                    SPACE_TRAILING.to_string(),
                    Value::Object(trailing_settings(params)),
                );
            }
            SPACE_TRADES => {
                let mut section = Map::new();
                section.insert(
                    "max_open_trades".to_string(),
                    Value::from(int_param(params, "max_open_trades")),
                );
                details.insert("max_open_trades".to_string(), Value::Object(section));
            }
            other => {
                let section: Map<String, Value> = dimensions
                    .iter()
                    .filter(|d| d.space == other)
                    .filter_map(|d| Some((d.name.clone(), rounded_json(params.get(&d.name)?))))
                    .collect();
                details.insert(other.to_string(), Value::Object(section));
            }
        }
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn resolves_space_shorthands() {
        let all = resolve_spaces(&["all".to_string()]).unwrap();
        assert_eq!(all.len(), ALL_SPACES.len());
        let default = resolve_spaces(&["default".to_string()]).unwrap();
        assert_eq!(default, vec!["buy", "sell", "roi", "stoploss"]);
        let mixed = resolve_spaces(&["stoploss".to_string(), "buy".to_string()]).unwrap();
        assert_eq!(mixed, vec!["buy", "stoploss"]);
        assert!(resolve_spaces(&["nope".to_string()]).is_err());
    }

    #[test]
    fn decimal_domain_steps_without_drift() {
        let domain = Domain::decimal(0.0, 0.5, Some(1), None).unwrap();
        let values: Vec<f64> = domain.values().iter().filter_map(ParameterValue::as_f64).collect();
        assert_eq!(values, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5]);

        let stepped = Domain::decimal(1.0, 2.0, None, Some(0.25)).unwrap();
        assert_eq!(stepped.values().len(), 5);
        assert!(Domain::decimal(0.0, 1.0, Some(2), Some(0.5)).is_err());

        match Domain::decimal(0.0, 1.0, None, None).unwrap() {
            Domain::Decimal { decimals, .. } => assert_eq!(decimals, 4),
            other => panic!("unexpected domain {:?}", other),
        }
    }

    #[test]
    fn sampled_values_stay_in_domain() {
        let mut rng = StdRng::seed_from_u64(7);
        for dimension in roi_space(5).iter().chain(stoploss_space().iter()) {
            for _ in 0..50 {
                let value = dimension.domain.sample(&mut rng);
                let raw = value.as_f64().unwrap();
                match &dimension.domain {
                    Domain::Int { low, high } => assert!(raw >= *low as f64 && raw <= *high as f64),
                    Domain::Decimal { low, high, .. } => assert!(raw >= *low && raw <= *high),
                    _ => unreachable!(),
                }
            }
        }
    }

    #[test]
    fn roi_space_scales_with_timeframe() {
        let five = roi_space(5);
        assert_eq!(five[0].domain, Domain::Int { low: 10, high: 120 });
        let hourly = roi_space(60);
        assert_eq!(hourly[0].domain, Domain::Int { low: 120, high: 1440 });
    }

    #[test]
    fn roi_table_from_params() {
        let mut params = ParamsDict::new();
        params.insert("roi_t1".into(), ParameterValue::Int(60));
        params.insert("roi_t2".into(), ParameterValue::Int(30));
        params.insert("roi_t3".into(), ParameterValue::Int(20));
        params.insert("roi_p1".into(), ParameterValue::Float(0.01));
        params.insert("roi_p2".into(), ParameterValue::Float(0.02));
        params.insert("roi_p3".into(), ParameterValue::Float(0.03));
        let table = generate_roi_table(&params);
        assert_eq!(table.get(&0), Some(&0.06));
        assert_eq!(table.get(&20), Some(&0.03));
        assert_eq!(table.get(&50), Some(&0.01));
        assert_eq!(table.get(&110), Some(&0.0));
    }

    #[test]
    fn params_details_groups_by_space() {
        let mut dims = stoploss_space();
        dims.extend(trailing_space());
        dims.push(Dimension::int("buy_rsi", SPACE_BUY, 10, 40));
        let mut params = ParamsDict::new();
        params.insert("stoploss".into(), ParameterValue::Float(-0.1));
        params.insert("buy_rsi".into(), ParameterValue::Int(30));
        params.insert("trailing_stop_positive".into(), ParameterValue::Float(0.02));
        params.insert(
            "trailing_stop_positive_offset_p1".into(),
            ParameterValue::Float(0.01),
        );
        let details = params_details(&params, &dims);
        assert_eq!(details["buy"]["buy_rsi"], Value::from(30));
        assert_eq!(details["stoploss"]["stoploss"], Value::from(-0.1));
        assert_eq!(
            details["trailing"]["trailing_stop_positive_offset"],
            Value::from(0.03)
        );
        assert!(!details.contains_key("roi"));
    }
}
