//! Arithmetic on gradient values.
//!
//! Partial derivatives have the shape of the value they belong to: a number
//! for a number and a vector of the same length for a vector.

use std::collections::BTreeMap;

use itertools::izip;

use crate::{
    error::{Result, TraceError},
    node::NodeId,
    value::Value,
};

pub(crate) fn add(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
        (Value::Vector(x), Value::Vector(y)) if x.len() == y.len() => {
            Ok(Value::vector(izip!(x.iter(), y.iter()).map(|(x, y)| x + y).collect()))
        }
        (Value::Vector(_), Value::Vector(_)) => {
            Err(TraceError::domain("gradient vectors have different lengths"))
        }
        (Value::Number(_), other) | (Value::Vector(_), other) => Err(
            TraceError::type_mismatch("gradient of the same shape", other.type_name()),
        ),
        (other, _) => Err(TraceError::type_mismatch("number or vector", other.type_name())),
    }
}

pub(crate) fn scale(value: &Value, factor: f64) -> Result<Value> {
    match value {
        Value::Number(x) => Ok(Value::Number(x * factor)),
        Value::Vector(x) => Ok(Value::vector(x.iter().map(|x| x * factor).collect())),
        other => Err(TraceError::type_mismatch("number or vector", other.type_name())),
    }
}

pub(crate) fn zeros_like(value: &Value) -> Result<Value> {
    scale(value, 0.)
}

pub(crate) fn check_finite(value: &Value) -> Result<()> {
    let bad = match value {
        Value::Number(x) => (!x.is_finite()).then_some(*x),
        Value::Vector(x) => x.iter().copied().find(|x| !x.is_finite()),
        _ => None,
    };
    match bad {
        Some(bad) => Err(TraceError::numerical("gradient", bad)),
        None => Ok(()),
    }
}

/// Whether a partial contributes nothing. `Nil` marks a parent the output
/// does not depend on differentiably.
pub(crate) fn is_zero(value: &Value) -> bool {
    match value {
        Value::Number(x) => *x == 0.,
        Value::Vector(x) => x.iter().all(|x| *x == 0.),
        Value::Nil => true,
        _ => false,
    }
}

/// Add `delta` to the partial derivative stored for `node`.
pub(crate) fn accumulate(
    partials: &mut BTreeMap<NodeId, Value>,
    node: NodeId,
    delta: Value,
) -> Result<()> {
    check_finite(&delta)?;
    let total = match partials.get(&node) {
        Some(current) => add(current, &delta)?,
        None => delta,
    };
    partials.insert(node, total);
    Ok(())
}

/// Append the coordinates of a number or vector to `out`.
pub(crate) fn flatten(value: &Value, out: &mut Vec<f64>) -> Result<()> {
    match value {
        Value::Number(x) => out.push(*x),
        Value::Vector(x) => out.extend_from_slice(x),
        other => {
            return Err(TraceError::type_mismatch(
                "number or vector",
                other.type_name(),
            ))
        }
    }
    Ok(())
}

/// Rebuild a value shaped like `template` from the front of `flat`.
/// Returns the value and the number of coordinates consumed.
pub(crate) fn unflatten(template: &Value, flat: &[f64]) -> Result<(Value, usize)> {
    let len = match template {
        Value::Number(_) => 1,
        Value::Vector(x) => x.len(),
        other => {
            return Err(TraceError::type_mismatch(
                "number or vector",
                other.type_name(),
            ))
        }
    };
    if flat.len() < len {
        return Err(TraceError::domain("not enough coordinates to rebuild value"));
    }
    let value = match template {
        Value::Number(_) => Value::Number(flat[0]),
        _ => Value::vector(flat[..len].to_vec()),
    };
    Ok((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partials_accumulate_by_shape() {
        let mut partials = BTreeMap::new();
        accumulate(&mut partials, NodeId(1), Value::Number(1.5)).unwrap();
        accumulate(&mut partials, NodeId(1), Value::Number(-0.5)).unwrap();
        assert_eq!(partials[&NodeId(1)], Value::Number(1.0));

        accumulate(&mut partials, NodeId(2), Value::vector(vec![1., 2.])).unwrap();
        accumulate(&mut partials, NodeId(2), Value::vector(vec![1., 1.])).unwrap();
        assert_eq!(partials[&NodeId(2)], Value::vector(vec![2., 3.]));

        assert!(accumulate(&mut partials, NodeId(2), Value::Number(1.)).is_err());
        assert!(matches!(
            accumulate(&mut partials, NodeId(3), Value::Number(f64::NAN)),
            Err(TraceError::Numerical { .. })
        ));
    }

    #[test]
    fn flatten_and_rebuild() {
        let values = [Value::Number(1.), Value::vector(vec![2., 3.])];
        let mut flat = Vec::new();
        for value in values.iter() {
            flatten(value, &mut flat).unwrap();
        }
        assert_eq!(flat, vec![1., 2., 3.]);

        let (first, used) = unflatten(&values[0], &flat).unwrap();
        assert_eq!((first, used), (Value::Number(1.), 1));
        let (second, used) = unflatten(&values[1], &flat[1..]).unwrap();
        assert_eq!((second, used), (Value::vector(vec![2., 3.]), 2));
        assert!(flatten(&Value::Nil, &mut flat).is_err());
        assert_eq!(zeros_like(&values[1]).unwrap(), Value::vector(vec![0., 0.]));
    }
}
