use rand::RngCore;

use crate::{
    error::{Result, TraceError},
    psp::{Args, Psp, SimulateGradient},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arithmetic {
    Add,
    Sub,
    Mul,
    Div,
    Exp,
    Log,
}

/// Arithmetic on numbers, differentiable in every operand.
#[derive(Debug, Clone, Copy)]
pub struct ArithmeticPsp(pub Arithmetic);

impl Psp for ArithmeticPsp {
    fn name(&self) -> &str {
        match self.0 {
            Arithmetic::Add => "+",
            Arithmetic::Sub => "-",
            Arithmetic::Mul => "*",
            Arithmetic::Div => "/",
            Arithmetic::Exp => "exp",
            Arithmetic::Log => "log",
        }
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        let x = args.numbers()?;
        let value = match self.0 {
            Arithmetic::Add => x.iter().sum(),
            Arithmetic::Mul => x.iter().product(),
            Arithmetic::Sub => match x.as_slice() {
                [a] => -a,
                [a, b] => a - b,
                _ => return Err(TraceError::arity("1 to 2", x.len())),
            },
            Arithmetic::Div => {
                args.check_arity(2)?;
                if x[1] == 0. {
                    return Err(TraceError::domain("division by zero"));
                }
                x[0] / x[1]
            }
            Arithmetic::Exp => {
                args.check_arity(1)?;
                x[0].exp()
            }
            Arithmetic::Log => {
                args.check_arity(1)?;
                if !(x[0] > 0.) {
                    return Err(TraceError::domain(format!(
                        "logarithm of non-positive {}",
                        x[0]
                    )));
                }
                x[0].ln()
            }
        };
        Ok(Value::Number(value))
    }

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        Some(self)
    }
}

impl SimulateGradient for ArithmeticPsp {
    fn gradient_of_simulate(
        &self,
        args: &Args,
        value: &Value,
        direction: &Value,
    ) -> Result<Vec<Value>> {
        let d = direction.as_number()?;
        let x = args.numbers()?;
        let partials = match self.0 {
            Arithmetic::Add => vec![d; x.len()],
            Arithmetic::Sub if x.len() == 1 => vec![-d],
            Arithmetic::Sub => vec![d, -d],
            Arithmetic::Mul => (0..x.len())
                .map(|i| {
                    let others: f64 = x
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, x)| x)
                        .product();
                    d * others
                })
                .collect(),
            Arithmetic::Div => vec![d / x[1], -d * x[0] / (x[1] * x[1])],
            Arithmetic::Exp => vec![d * value.as_number()?],
            Arithmetic::Log => vec![d / x[0]],
        };
        Ok(partials.into_iter().map(Value::Number).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Equal,
}

#[derive(Debug, Clone, Copy)]
pub struct ComparePsp(pub Comparison);

impl Psp for ComparePsp {
    fn name(&self) -> &str {
        match self.0 {
            Comparison::Less => "<",
            Comparison::Greater => ">",
            Comparison::LessEq => "<=",
            Comparison::GreaterEq => ">=",
            Comparison::Equal => "=",
        }
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(2)?;
        let number = |i| args.number(i);
        Ok(Value::Bool(match self.0 {
            Comparison::Equal => args.value(0)? == args.value(1)?,
            Comparison::Less => number(0)? < number(1)?,
            Comparison::Greater => number(0)? > number(1)?,
            Comparison::LessEq => number(0)? <= number(1)?,
            Comparison::GreaterEq => number(0)? >= number(1)?,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NotPsp;

impl Psp for NotPsp {
    fn name(&self) -> &str {
        "not"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(1)?;
        Ok(Value::Bool(!args.value(0)?.as_bool()?))
    }
}

/// `(vector x ...)` packs numbers into a vector.
#[derive(Debug, Clone, Copy)]
pub struct VectorPsp;

impl Psp for VectorPsp {
    fn name(&self) -> &str {
        "vector"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        Ok(Value::vector(args.numbers()?))
    }

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        Some(self)
    }
}

impl SimulateGradient for VectorPsp {
    fn gradient_of_simulate(
        &self,
        args: &Args,
        _value: &Value,
        direction: &Value,
    ) -> Result<Vec<Value>> {
        let d = direction.as_vector()?;
        if d.len() != args.len() {
            return Err(TraceError::domain("gradient has the wrong length"));
        }
        Ok(d.iter().map(|&d| Value::Number(d)).collect())
    }
}

/// `(lookup v i)` is element `i` of a vector or list.
#[derive(Debug, Clone, Copy)]
pub struct LookupPsp;

fn index(args: &Args, len: usize) -> Result<usize> {
    let i = args.number(1)?;
    if i.fract() != 0. || i < 0. || i >= len as f64 {
        return Err(TraceError::domain(format!(
            "index {} out of range for length {}",
            i, len
        )));
    }
    Ok(i as usize)
}

impl Psp for LookupPsp {
    fn name(&self) -> &str {
        "lookup"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(2)?;
        match args.value(0)? {
            Value::Vector(x) => Ok(Value::Number(x[index(args, x.len())?])),
            list => {
                let mut items = list.to_vec()?;
                let i = index(args, items.len())?;
                Ok(items.swap_remove(i))
            }
        }
    }

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        Some(self)
    }
}

impl SimulateGradient for LookupPsp {
    fn gradient_of_simulate(
        &self,
        args: &Args,
        _value: &Value,
        direction: &Value,
    ) -> Result<Vec<Value>> {
        let x = args.value(0)?.as_vector()?;
        let mut partial = vec![0.; x.len()];
        partial[index(args, x.len())?] = direction.as_number()?;
        Ok(vec![Value::vector(partial), Value::Number(0.)])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListPsp;

impl Psp for ListPsp {
    fn name(&self) -> &str {
        "list"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        Ok(Value::list(args.operand_values.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityPsp;

impl Psp for IdentityPsp {
    fn name(&self) -> &str {
        "identity"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(1)?;
        Ok(args.value(0)?.clone())
    }

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        Some(self)
    }
}

impl SimulateGradient for IdentityPsp {
    fn gradient_of_simulate(
        &self,
        _args: &Args,
        _value: &Value,
        direction: &Value,
    ) -> Result<Vec<Value>> {
        Ok(vec![direction.clone()])
    }
}

/// `(biplex p consequent alternative)` selects one of two values.
/// Conditionals are built on it.
#[derive(Debug, Clone, Copy)]
pub struct BiplexPsp;

impl Psp for BiplexPsp {
    fn name(&self) -> &str {
        "biplex"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(3)?;
        let chosen = if args.value(0)?.as_bool()? { 1 } else { 2 };
        Ok(args.value(chosen)?.clone())
    }
}
