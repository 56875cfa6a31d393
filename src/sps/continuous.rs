use rand::{Rng, RngCore};
use rand_distr::{Beta, Distribution, Gamma, StandardNormal};
use statrs::function::{
    beta::ln_beta,
    gamma::{digamma, ln_gamma},
};

use crate::{
    error::{Result, TraceError},
    math::normal_log_density,
    psp::{Args, LogDensity, LogDensityGradient, Psp, SimulateGradient},
    sps::in_domain,
    value::Value,
};

fn positive(name: &'static str, x: f64) -> Result<f64> {
    if !(x > 0.) {
        return Err(TraceError::domain(format!("{} must be positive, got {}", name, x)));
    }
    Ok(x)
}

/// `(normal mu sigma)`
#[derive(Debug, Clone, Copy)]
pub struct NormalPsp;

impl NormalPsp {
    fn params(args: &Args) -> Result<(f64, f64)> {
        args.check_arity(2)?;
        Ok((args.number(0)?, positive("sigma", args.number(1)?)?))
    }
}

impl Psp for NormalPsp {
    fn name(&self) -> &str {
        "normal"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        let (mu, sigma) = NormalPsp::params(args)?;
        let z: f64 = StandardNormal.sample(rng);
        Ok(Value::Number(mu + sigma * z))
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

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        Some(self)
    }
}

impl LogDensity for NormalPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let x = value.as_number()?;
        let Some((mu, sigma)) = in_domain(NormalPsp::params(args))? else {
            return Ok(f64::NEG_INFINITY);
        };
        Ok(normal_log_density(x, mu, sigma))
    }
}

impl LogDensityGradient for NormalPsp {
    fn gradient_of_log_density(&self, value: &Value, args: &Args) -> Result<(Value, Vec<Value>)> {
        let (mu, sigma) = NormalPsp::params(args)?;
        let x = value.as_number()?;
        let var = sigma * sigma;
        let d_mu = (x - mu) / var;
        let d_sigma = -1. / sigma + (x - mu) * (x - mu) / (var * sigma);
        Ok((
            Value::Number(-d_mu),
            vec![Value::Number(d_mu), Value::Number(d_sigma)],
        ))
    }
}

impl SimulateGradient for NormalPsp {
    // x = mu + sigma * z with the noise z held fixed.
    fn gradient_of_simulate(
        &self,
        args: &Args,
        value: &Value,
        direction: &Value,
    ) -> Result<Vec<Value>> {
        let (mu, sigma) = NormalPsp::params(args)?;
        let d = direction.as_number()?;
        let z = (value.as_number()? - mu) / sigma;
        Ok(vec![Value::Number(d), Value::Number(d * z)])
    }
}

/// `(uniform_continuous low high)`
#[derive(Debug, Clone, Copy)]
pub struct UniformContinuousPsp;

impl UniformContinuousPsp {
    fn params(args: &Args) -> Result<(f64, f64)> {
        args.check_arity(2)?;
        let (low, high) = (args.number(0)?, args.number(1)?);
        if !(low < high) {
            return Err(TraceError::domain(format!(
                "empty interval [{}, {}]",
                low, high
            )));
        }
        Ok((low, high))
    }
}

impl Psp for UniformContinuousPsp {
    fn name(&self) -> &str {
        "uniform_continuous"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        let (low, high) = UniformContinuousPsp::params(args)?;
        let u: f64 = rng.random();
        Ok(Value::Number(low + (high - low) * u))
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

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        Some(self)
    }
}

impl LogDensity for UniformContinuousPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let x = value.as_number()?;
        match in_domain(UniformContinuousPsp::params(args))? {
            Some((low, high)) if low <= x && x <= high => Ok(-(high - low).ln()),
            _ => Ok(f64::NEG_INFINITY),
        }
    }
}

impl LogDensityGradient for UniformContinuousPsp {
    fn gradient_of_log_density(&self, value: &Value, args: &Args) -> Result<(Value, Vec<Value>)> {
        let (low, high) = UniformContinuousPsp::params(args)?;
        let x = value.as_number()?;
        if x < low || x > high {
            return Err(TraceError::domain("value outside the interval"));
        }
        let width = high - low;
        Ok((
            Value::Number(0.),
            vec![Value::Number(1. / width), Value::Number(-1. / width)],
        ))
    }
}

impl SimulateGradient for UniformContinuousPsp {
    fn gradient_of_simulate(
        &self,
        args: &Args,
        value: &Value,
        direction: &Value,
    ) -> Result<Vec<Value>> {
        let (low, high) = UniformContinuousPsp::params(args)?;
        let d = direction.as_number()?;
        let u = (value.as_number()? - low) / (high - low);
        Ok(vec![Value::Number(d * (1. - u)), Value::Number(d * u)])
    }
}

/// `(gamma shape rate)`
#[derive(Debug, Clone, Copy)]
pub struct GammaPsp;

impl GammaPsp {
    fn params(args: &Args) -> Result<(f64, f64)> {
        args.check_arity(2)?;
        Ok((
            positive("shape", args.number(0)?)?,
            positive("rate", args.number(1)?)?,
        ))
    }
}

impl Psp for GammaPsp {
    fn name(&self) -> &str {
        "gamma"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        let (shape, rate) = GammaPsp::params(args)?;
        let dist = Gamma::new(shape, 1. / rate).map_err(|err| TraceError::domain(err.to_string()))?;
        Ok(Value::Number(dist.sample(rng)))
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

impl LogDensity for GammaPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let x = value.as_number()?;
        let Some((shape, rate)) = in_domain(GammaPsp::params(args))? else {
            return Ok(f64::NEG_INFINITY);
        };
        if !(x > 0.) {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(shape * rate.ln() - ln_gamma(shape) + (shape - 1.) * x.ln() - rate * x)
    }
}

impl LogDensityGradient for GammaPsp {
    fn gradient_of_log_density(&self, value: &Value, args: &Args) -> Result<(Value, Vec<Value>)> {
        let (shape, rate) = GammaPsp::params(args)?;
        let x = positive("gamma value", value.as_number()?)?;
        Ok((
            Value::Number((shape - 1.) / x - rate),
            vec![
                Value::Number(rate.ln() - digamma(shape) + x.ln()),
                Value::Number(shape / rate - x),
            ],
        ))
    }
}

/// `(beta a b)`
#[derive(Debug, Clone, Copy)]
pub struct BetaPsp;

impl BetaPsp {
    fn params(args: &Args) -> Result<(f64, f64)> {
        args.check_arity(2)?;
        Ok((positive("a", args.number(0)?)?, positive("b", args.number(1)?)?))
    }
}

impl Psp for BetaPsp {
    fn name(&self) -> &str {
        "beta"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        let (a, b) = BetaPsp::params(args)?;
        let dist = Beta::new(a, b).map_err(|err| TraceError::domain(err.to_string()))?;
        Ok(Value::Number(dist.sample(rng)))
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

impl LogDensity for BetaPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let x = value.as_number()?;
        let Some((a, b)) = in_domain(BetaPsp::params(args))? else {
            return Ok(f64::NEG_INFINITY);
        };
        if !(x > 0. && x < 1.) {
            return Ok(f64::NEG_INFINITY);
        }
        Ok((a - 1.) * x.ln() + (b - 1.) * (1. - x).ln() - ln_beta(a, b))
    }
}

impl LogDensityGradient for BetaPsp {
    fn gradient_of_log_density(&self, value: &Value, args: &Args) -> Result<(Value, Vec<Value>)> {
        let (a, b) = BetaPsp::params(args)?;
        let x = value.as_number()?;
        if !(x > 0. && x < 1.) {
            return Err(TraceError::domain("beta value outside (0, 1)"));
        }
        let total = digamma(a + b);
        Ok((
            Value::Number((a - 1.) / x - (b - 1.) / (1. - x)),
            vec![
                Value::Number(x.ln() - digamma(a) + total),
                Value::Number((1. - x).ln() - digamma(b) + total),
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::test_args;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    /// Trapezoid rule over [low, high].
    fn integrate(density: impl Fn(f64) -> f64, low: f64, high: f64) -> f64 {
        let n = 20_000;
        let h = (high - low) / n as f64;
        let mut total = 0.5 * (density(low) + density(high));
        for i in 1..n {
            total += density(low + i as f64 * h);
        }
        total * h
    }

    fn check_normalized(psp: &dyn Psp, params: &[f64], low: f64, high: f64) {
        let args = test_args(params.iter().map(|&x| Value::Number(x)).collect());
        let density = psp.density().unwrap();
        let mass = integrate(
            |x| density.log_density(&Value::Number(x), &args).unwrap().exp(),
            low,
            high,
        );
        assert_abs_diff_eq!(mass, 1., epsilon = 1e-3);
    }

    #[test]
    fn densities_are_normalized() {
        check_normalized(&NormalPsp, &[1., 2.], -30., 30.);
        check_normalized(&UniformContinuousPsp, &[-1., 3.], -1., 3.);
        check_normalized(&GammaPsp, &[3., 2.], 1e-9, 40.);
        check_normalized(&BetaPsp, &[2., 3.], 0., 1.);
    }

    /// Compare analytic partials with central differences in the value and
    /// every parameter.
    fn check_density_gradient(psp: &dyn Psp, x: f64, params: &[f64]) {
        let h = 1e-6;
        let density = psp.density().unwrap();
        let logp = |x: f64, params: &[f64]| {
            let args = test_args(params.iter().map(|&p| Value::Number(p)).collect());
            density.log_density(&Value::Number(x), &args).unwrap()
        };
        let args = test_args(params.iter().map(|&p| Value::Number(p)).collect());
        let (d_value, d_params) = psp
            .density_gradient()
            .unwrap()
            .gradient_of_log_density(&Value::Number(x), &args)
            .unwrap();

        let numeric = (logp(x + h, params) - logp(x - h, params)) / (2. * h);
        assert_abs_diff_eq!(d_value.as_number().unwrap(), numeric, epsilon = 1e-5);
        for (i, partial) in d_params.iter().enumerate() {
            let mut up = params.to_vec();
            let mut down = params.to_vec();
            up[i] += h;
            down[i] -= h;
            let numeric = (logp(x, &up) - logp(x, &down)) / (2. * h);
            assert_abs_diff_eq!(partial.as_number().unwrap(), numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn density_gradients_match_finite_differences() {
        check_density_gradient(&NormalPsp, 0.7, &[0.2, 1.5]);
        check_density_gradient(&UniformContinuousPsp, 0.5, &[0., 2.]);
        check_density_gradient(&GammaPsp, 1.3, &[2.5, 0.8]);
        check_density_gradient(&BetaPsp, 0.3, &[2., 5.]);
    }

    #[test]
    fn normal_simulate_gradient_follows_the_noise() {
        let args = test_args(vec![Value::Number(1.), Value::Number(2.)]);
        let partials = NormalPsp
            .gradient_of_simulate(&args, &Value::Number(4.), &Value::Number(0.5))
            .unwrap();
        assert_eq!(partials, vec![Value::Number(0.5), Value::Number(0.75)]);
    }

    #[test]
    fn bad_parameters_are_domain_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        let args = test_args(vec![Value::Number(0.), Value::Number(-1.)]);
        assert!(matches!(
            NormalPsp.simulate(&args, &mut rng),
            Err(TraceError::Domain { .. })
        ));
        assert!(matches!(
            GammaPsp.simulate(&args, &mut rng),
            Err(TraceError::Domain { .. })
        ));
        let args = test_args(vec![Value::Number(1.), Value::Number(1.)]);
        assert!(UniformContinuousPsp.simulate(&args, &mut rng).is_err());
        assert_eq!(
            GammaPsp.log_density(&Value::Number(-1.), &test_args(vec![2.0.into(), 1.0.into()])).unwrap(),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn bad_parameters_give_no_mass() {
        let value = Value::Number(0.5);
        let cases: [(&dyn Psp, [f64; 2]); 5] = [
            (&NormalPsp, [0., -0.2]),
            (&NormalPsp, [0., 0.]),
            (&UniformContinuousPsp, [2., 1.]),
            (&GammaPsp, [-1., 1.]),
            (&BetaPsp, [1., 0.]),
        ];
        for (psp, params) in cases {
            let args = test_args(params.iter().map(|&p| Value::Number(p)).collect());
            let density = psp.density().unwrap();
            assert_eq!(density.log_density(&value, &args).unwrap(), f64::NEG_INFINITY);
        }

        let args = test_args(vec![Value::Number(0.), Value::Number(-1.)]);
        assert!(matches!(
            NormalPsp.log_density(&Value::Bool(true), &args),
            Err(TraceError::TypeMismatch { .. })
        ));
        assert!(matches!(
            NormalPsp.log_density(&value, &test_args(vec![Value::Number(0.)])),
            Err(TraceError::Arity { .. })
        ));
    }

    #[test]
    fn samples_match_moments() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = 20_000;
        let args = test_args(vec![Value::Number(2.), Value::Number(4.)]);
        let gamma: f64 = (0..n)
            .map(|_| GammaPsp.simulate(&args, &mut rng).unwrap().as_number().unwrap())
            .sum::<f64>()
            / n as f64;
        assert_abs_diff_eq!(gamma, 0.5, epsilon = 0.02);
        let beta: f64 = (0..n)
            .map(|_| BetaPsp.simulate(&args, &mut rng).unwrap().as_number().unwrap())
            .sum::<f64>()
            / n as f64;
        assert_abs_diff_eq!(beta, 1. / 3., epsilon = 0.01);
    }
}
