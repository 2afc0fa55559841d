use crate::config::SamplerName;
use crate::parameters::ParamsDict;
use crate::space::{Dimension, Domain};
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;

/// Points told before the model-based sampler leaves its random warm-up.
pub const INITIAL_POINTS: usize = 30;

/// Probability of keeping an elite point's categorical value when perturbing.
const CATEGORICAL_KEEP_PROBABILITY: f64 = 0.8;
/// Share of told points treated as the elite set.
const ELITE_FRACTION: f64 = 0.25;

pub trait Sampler: Send {
    fn ask(&mut self, n: usize) -> Vec<ParamsDict>;
    fn tell(&mut self, point: &ParamsDict, loss: f64);
    /// Uniform points, ignoring the model.
    fn sample_random(&mut self, n: usize) -> Vec<ParamsDict>;
    fn told(&self) -> usize;
}

fn random_point(dimensions: &[Dimension], rng: &mut StdRng) -> ParamsDict {
    dimensions
        .iter()
        .map(|dimension| (dimension.name.clone(), dimension.domain.sample(rng)))
        .collect()
}

/// Sampler selected by `hyperopt_sampler`, seeded with `seed`.
pub fn create_sampler(name: SamplerName, dimensions: Vec<Dimension>, seed: u64) -> Box<dyn Sampler> {
    debug!("Using {} with {} dimension(s)", name.label(), dimensions.len());
    match name {
        SamplerName::Tpe => Box::new(TpeSampler::new(dimensions, seed)),
        SamplerName::Random => Box::new(RandomSampler::new(dimensions, seed)),
    }
}

/// Uniform random search.
pub struct RandomSampler {
    dimensions: Vec<Dimension>,
    rng: StdRng,
    told: usize,
}

impl RandomSampler {
    pub fn new(dimensions: Vec<Dimension>, seed: u64) -> Self {
        Self {
            dimensions,
            rng: StdRng::seed_from_u64(seed),
            told: 0,
        }
    }
}

impl Sampler for RandomSampler {
    fn ask(&mut self, n: usize) -> Vec<ParamsDict> {
        self.sample_random(n)
    }

    fn tell(&mut self, _point: &ParamsDict, _loss: f64) {
        self.told += 1;
    }

    fn sample_random(&mut self, n: usize) -> Vec<ParamsDict> {
        (0..n)
            .map(|_| random_point(&self.dimensions, &mut self.rng))
            .collect()
    }

    fn told(&self) -> usize {
        self.told
    }
}

/// Model-based sampler: random for the first `INITIAL_POINTS` observations,
/// then Gaussian perturbations around the best quartile of observed points.
/// The perturbation width narrows as more points are observed.
pub struct TpeSampler {
    dimensions: Vec<Dimension>,
    rng: StdRng,
    history: Vec<(ParamsDict, f64)>,
    initial_points: usize,
}

impl TpeSampler {
    pub fn new(dimensions: Vec<Dimension>, seed: u64) -> Self {
        Self::with_initial_points(dimensions, seed, INITIAL_POINTS)
    }

    pub fn with_initial_points(dimensions: Vec<Dimension>, seed: u64, initial_points: usize) -> Self {
        Self {
            dimensions,
            rng: StdRng::seed_from_u64(seed),
            history: Vec::new(),
            initial_points,
        }
    }

    fn elite(&self) -> Vec<&ParamsDict> {
        let mut ranked: Vec<&(ParamsDict, f64)> =
            self.history.iter().filter(|(_, loss)| loss.is_finite()).collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        let keep = ((ranked.len() as f64 * ELITE_FRACTION).ceil() as usize).max(1);
        ranked.into_iter().take(keep).map(|(point, _)| point).collect()
    }

    fn perturb(&mut self, base: &ParamsDict) -> ParamsDict {
        let shrink = (1.0 + self.history.len() as f64 / self.initial_points.max(1) as f64).sqrt();
        let mut point = ParamsDict::new();
        for dimension in &self.dimensions {
            let current = base.get(&dimension.name);
            let value = match (&dimension.domain, current) {
                (Domain::Categorical(options), Some(value)) => {
                    if self.rng.gen_bool(CATEGORICAL_KEEP_PROBABILITY) {
                        value.clone()
                    } else {
                        options
                            .choose(&mut self.rng)
                            .cloned()
                            .unwrap_or_else(|| value.clone())
                    }
                }
                (domain, Some(value)) => match (value.as_f64(), domain.span()) {
                    (Some(center), Some(span)) if span > 0.0 => {
                        let sigma = (span * 0.2 / shrink).max(f64::EPSILON);
                        let noise = Normal::new(0.0, sigma)
                            .map(|normal| self.rng.sample(normal))
                            .unwrap_or(0.0);
                        domain
                            .clip(center + noise)
                            .unwrap_or_else(|| value.clone())
                    }
                    _ => value.clone(),
                },
                (domain, None) => domain.sample(&mut self.rng),
            };
            point.insert(dimension.name.clone(), value);
        }
        point
    }
}

impl Sampler for TpeSampler {
    fn ask(&mut self, n: usize) -> Vec<ParamsDict> {
        if self.history.len() < self.initial_points {
            return self.sample_random(n);
        }
        let elite: Vec<ParamsDict> = self.elite().into_iter().cloned().collect();
        if elite.is_empty() {
            return self.sample_random(n);
        }
        debug!(
            "Sampling {} point(s) around {} elite observation(s)",
            n,
            elite.len()
        );
        (0..n)
            .map(|_| {
                let base = &elite[self.rng.gen_range(0..elite.len())];
                self.perturb(base)
            })
            .collect()
    }

    fn tell(&mut self, point: &ParamsDict, loss: f64) {
        self.history.push((point.clone(), loss));
    }

    fn sample_random(&mut self, n: usize) -> Vec<ParamsDict> {
        (0..n)
            .map(|_| random_point(&self.dimensions, &mut self.rng))
            .collect()
    }

    fn told(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParameterValue;
    use crate::space::{roi_space, stoploss_space, Dimension};

    fn dims() -> Vec<Dimension> {
        let mut dims = roi_space(5);
        dims.extend(stoploss_space());
        dims.push(Dimension::categorical(
            "buy_trigger",
            "buy",
            vec!["bb".into(), "rsi".into()],
        ));
        dims
    }

    #[test]
    fn same_seed_same_points() {
        let mut a = TpeSampler::new(dims(), 42);
        let mut b = TpeSampler::new(dims(), 42);
        assert_eq!(a.ask(5), b.ask(5));
        let mut c = RandomSampler::new(dims(), 43);
        assert_ne!(a.ask(5), c.ask(5));
    }

    #[test]
    fn random_sampler_ignores_told_points() {
        let mut sampler = create_sampler(SamplerName::Random, dims(), 7);
        let mut reference = RandomSampler::new(dims(), 7);
        for point in sampler.ask(40) {
            sampler.tell(&point, 0.0);
        }
        let _ = reference.ask(40);
        assert_eq!(sampler.told(), 40);
        assert_eq!(sampler.ask(3), reference.ask(3));
    }

    #[test]
    fn model_phase_stays_in_domain_and_near_elite() {
        let mut sampler = TpeSampler::with_initial_points(dims(), 1, 4);
        for point in sampler.sample_random(8) {
            let loss = point["stoploss"].as_f64().unwrap().abs();
            sampler.tell(&point, loss);
        }
        assert_eq!(sampler.told(), 8);
        for point in sampler.ask(20) {
            let stoploss = point["stoploss"].as_f64().unwrap();
            assert!((-0.35..=-0.02).contains(&stoploss));
            assert!(point.contains_key("roi_t1"));
            assert!(matches!(point["buy_trigger"], ParameterValue::Str(_)));
        }
    }
}
