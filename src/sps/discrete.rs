use rand::{Rng, RngCore};

use crate::{
    error::{Result, TraceError},
    math::logsumexp,
    psp::{Args, LogDensity, LogDensityGradient, Psp},
    sps::in_domain,
    value::Value,
};

fn probability(args: &Args) -> Result<f64> {
    args.check_arity_range(0, 1)?;
    if args.is_empty() {
        return Ok(0.5);
    }
    let p = args.number(0)?;
    if !(0. ..=1.).contains(&p) {
        return Err(TraceError::domain(format!("probability {} outside [0, 1]", p)));
    }
    Ok(p)
}

fn log_mass(p: f64, outcome: bool) -> f64 {
    if outcome {
        p.ln()
    } else {
        (1. - p).ln()
    }
}

fn mass_gradient(p: f64, outcome: bool) -> Result<Vec<Value>> {
    let d = if outcome { 1. / p } else { -1. / (1. - p) };
    if !d.is_finite() {
        return Err(TraceError::numerical("probability gradient", d));
    }
    Ok(vec![Value::Number(d)])
}

/// `(flip)` or `(flip p)`, a coin returning booleans.
#[derive(Debug, Clone, Copy)]
pub struct FlipPsp;

impl Psp for FlipPsp {
    fn name(&self) -> &str {
        "flip"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        let p = probability(args)?;
        Ok(Value::Bool(rng.random_bool(p)))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn density(&self) -> Option<&dyn LogDensity> {
        Some(self)
    }

    fn density_gradient(&self) -> Option<&dyn LogDensityGradient> {
        Some(self)
    }
}

impl LogDensity for FlipPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let outcome = value.as_bool()?;
        Ok(match in_domain(probability(args))? {
            Some(p) => log_mass(p, outcome),
            None => f64::NEG_INFINITY,
        })
    }
}

impl LogDensityGradient for FlipPsp {
    fn gradient_of_log_density(&self, value: &Value, args: &Args) -> Result<(Value, Vec<Value>)> {
        let p = probability(args)?;
        let partials = if args.is_empty() {
            Vec::new()
        } else {
            mass_gradient(p, value.as_bool()?)?
        };
        Ok((Value::Number(0.), partials))
    }
}

/// `(bernoulli)` or `(bernoulli p)`, returning 1 or 0.
#[derive(Debug, Clone, Copy)]
pub struct BernoulliPsp;

fn as_outcome(value: &Value) -> Result<bool> {
    match value.as_number()? {
        x if x == 1. => Ok(true),
        x if x == 0. => Ok(false),
        x => Err(TraceError::domain(format!("bernoulli outcome must be 0 or 1, got {}", x))),
    }
}

impl Psp for BernoulliPsp {
    fn name(&self) -> &str {
        "bernoulli"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        let p = probability(args)?;
        Ok(Value::Number(if rng.random_bool(p) { 1. } else { 0. }))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn density(&self) -> Option<&dyn LogDensity> {
        Some(self)
    }

    fn density_gradient(&self) -> Option<&dyn LogDensityGradient> {
        Some(self)
    }
}

impl LogDensity for BernoulliPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let x = value.as_number()?;
        match in_domain(probability(args))? {
            Some(p) if x == 1. || x == 0. => Ok(log_mass(p, x == 1.)),
            _ => Ok(f64::NEG_INFINITY),
        }
    }
}

impl LogDensityGradient for BernoulliPsp {
    fn gradient_of_log_density(&self, value: &Value, args: &Args) -> Result<(Value, Vec<Value>)> {
        let p = probability(args)?;
        let partials = if args.is_empty() {
            Vec::new()
        } else {
            mass_gradient(p, as_outcome(value)?)?
        };
        Ok((Value::Number(0.), partials))
    }
}

/// `(categorical weights)` returns an index into `weights`;
/// `(categorical weights outcomes)` returns the matching element of the
/// list `outcomes`. Weights need not be normalized.
#[derive(Debug, Clone, Copy)]
pub struct CategoricalPsp;

impl CategoricalPsp {
    fn params(args: &Args) -> Result<(Vec<f64>, Option<Vec<Value>>)> {
        args.check_arity_range(1, 2)?;
        let weights = match args.value(0)? {
            Value::Vector(weights) => weights.to_vec(),
            list => list
                .to_vec()?
                .iter()
                .map(Value::as_number)
                .collect::<Result<Vec<_>>>()?,
        };
        if weights.is_empty() || weights.iter().any(|w| !(*w >= 0.) || !w.is_finite()) {
            return Err(TraceError::domain(
                "categorical weights must be finite, non-negative and non-empty",
            ));
        }
        if !(weights.iter().sum::<f64>() > 0.) {
            return Err(TraceError::domain("categorical weights sum to zero"));
        }
        let outcomes = match args.value(1) {
            Ok(outcomes) if args.len() == 2 => {
                let outcomes = outcomes.to_vec()?;
                if outcomes.len() != weights.len() {
                    return Err(TraceError::domain(format!(
                        "{} weights for {} outcomes",
                        weights.len(),
                        outcomes.len()
                    )));
                }
                Some(outcomes)
            }
            _ => None,
        };
        Ok((weights, outcomes))
    }
}

impl Psp for CategoricalPsp {
    fn name(&self) -> &str {
        "categorical"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        let (weights, outcomes) = CategoricalPsp::params(args)?;
        let total: f64 = weights.iter().sum();
        let mut u = rng.random::<f64>() * total;
        let mut index = weights.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if u < *w {
                index = i;
                break;
            }
            u -= w;
        }
        Ok(match outcomes {
            Some(mut outcomes) => outcomes.swap_remove(index),
            None => Value::Number(index as f64),
        })
    }

    fn is_random(&self) -> bool {
        true
    }

    fn density(&self) -> Option<&dyn LogDensity> {
        Some(self)
    }
}

impl LogDensity for CategoricalPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let Some((weights, outcomes)) = in_domain(CategoricalPsp::params(args))? else {
            return Ok(f64::NEG_INFINITY);
        };
        let log_weights: Vec<f64> = weights.iter().map(|w| w.ln()).collect();
        let log_total = logsumexp(&log_weights);
        let matches: Vec<f64> = match outcomes {
            Some(outcomes) => outcomes
                .iter()
                .zip(log_weights.iter())
                .filter(|(outcome, _)| *outcome == value)
                .map(|(_, lw)| *lw)
                .collect(),
            None => {
                let x = value.as_number()?;
                log_weights
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i as f64 == x)
                    .map(|(_, lw)| *lw)
                    .collect()
            }
        };
        Ok(logsumexp(&matches) - log_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::test_args;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn flip_masses() -> Result<()> {
        let args = test_args(vec![Value::Number(0.25)]);
        assert_abs_diff_eq!(FlipPsp.log_density(&Value::Bool(true), &args)?, 0.25f64.ln());
        assert_abs_diff_eq!(FlipPsp.log_density(&Value::Bool(false), &args)?, 0.75f64.ln());
        let fair = test_args(Vec::new());
        assert_abs_diff_eq!(FlipPsp.log_density(&Value::Bool(true), &fair)?, 0.5f64.ln());
        assert!(FlipPsp.log_density(&Value::Number(1.), &args).is_err());
        assert!(FlipPsp
            .simulate(&test_args(vec![Value::Number(1.5)]), &mut StdRng::seed_from_u64(0))
            .is_err());

        let unfair = test_args(vec![Value::Number(1.5)]);
        assert_eq!(FlipPsp.log_density(&Value::Bool(true), &unfair)?, f64::NEG_INFINITY);
        assert_eq!(
            BernoulliPsp.log_density(&Value::Number(1.), &unfair)?,
            f64::NEG_INFINITY
        );

        let (_, partials) = FlipPsp.gradient_of_log_density(&Value::Bool(false), &args)?;
        assert_eq!(partials, vec![Value::Number(-1. / 0.75)]);
        Ok(())
    }

    #[test]
    fn bernoulli_returns_numbers() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let args = test_args(vec![Value::Number(0.7)]);
        let draws: f64 = (0..10_000)
            .map(|_| BernoulliPsp.simulate(&args, &mut rng)?.as_number())
            .sum::<Result<f64>>()?;
        assert_abs_diff_eq!(draws / 10_000., 0.7, epsilon = 0.02);
        assert_eq!(
            BernoulliPsp.log_density(&Value::Number(2.), &args)?,
            f64::NEG_INFINITY
        );
        Ok(())
    }

    #[test]
    fn categorical_masses_sum_to_one() -> Result<()> {
        let args = test_args(vec![Value::vector(vec![1., 2., 1.])]);
        let total: f64 = (0..3)
            .map(|i| CategoricalPsp.log_density(&Value::Number(i as f64), &args).map(f64::exp))
            .sum::<Result<f64>>()?;
        assert_abs_diff_eq!(total, 1., epsilon = 1e-12);
        assert_abs_diff_eq!(
            CategoricalPsp.log_density(&Value::Number(1.), &args)?,
            0.5f64.ln(),
            epsilon = 1e-12
        );
        assert_eq!(
            CategoricalPsp.log_density(&Value::Number(5.), &args)?,
            f64::NEG_INFINITY
        );
        Ok(())
    }

    #[test]
    fn categorical_with_outcomes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(9);
        let outcomes = Value::list(vec![Value::symbol("a"), Value::symbol("b")]);
        let args = test_args(vec![Value::vector(vec![0., 1.]), outcomes]);
        for _ in 0..20 {
            assert_eq!(CategoricalPsp.simulate(&args, &mut rng)?, Value::symbol("b"));
        }
        assert_eq!(
            CategoricalPsp.log_density(&Value::symbol("a"), &args)?,
            f64::NEG_INFINITY
        );
        let bad = test_args(vec![Value::vector(vec![0., 0.])]);
        assert!(CategoricalPsp.simulate(&bad, &mut rng).is_err());
        assert_eq!(
            CategoricalPsp.log_density(&Value::Number(0.), &bad)?,
            f64::NEG_INFINITY
        );
        Ok(())
    }
}
