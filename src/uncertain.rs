//! A scalar value paired with its statistical uncertainty.
use std::fmt;
use std::ops;

use serde::{Deserialize, Serialize};

/// Field adapter keeping NaN/Inf out of persisted state: non-finite floats
/// serialize as nulls and come back as NaN.
pub(crate) mod nullable_float {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_f64(*v)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

/// A measured or derived quantity with a 1-sigma uncertainty attached.
///
/// Arithmetic propagates uncertainties assuming uncorrelated operands:
/// additively for sums and differences, in relative quadrature for products
/// and quotients.
///
/// Equality is total-order equality, so an unset (NaN) value compares equal
/// to itself and snapshot comparisons stay exact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UncertainValue {
    #[serde(with = "nullable_float")]
    pub value: f64,
    #[serde(with = "nullable_float")]
    pub sigma: f64,
}

impl PartialEq for UncertainValue {
    fn eq(&self, other: &Self) -> bool {
        self.value.total_cmp(&other.value).is_eq() && self.sigma.total_cmp(&other.sigma).is_eq()
    }
}

impl Default for UncertainValue {
    fn default() -> Self {
        Self {
            value: f64::NAN,
            sigma: f64::NAN,
        }
    }
}

impl UncertainValue {
    pub fn new(value: f64, sigma: f64) -> Self {
        Self { value, sigma }
    }

    /// An exactly-known value
    pub fn exact(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Relative error in percent, infinite for a zero value
    pub fn error_percent(&self) -> f64 {
        if self.value != 0.0 {
            (self.sigma / self.value).abs() * 100.0
        } else {
            f64::INFINITY
        }
    }

    pub fn finite(&self) -> bool {
        self.value.is_finite() && self.sigma.is_finite()
    }
}

impl ops::Add for UncertainValue {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.value + rhs.value, (self.sigma.powi(2) + rhs.sigma.powi(2)).sqrt())
    }
}

impl ops::Sub for UncertainValue {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.value - rhs.value, (self.sigma.powi(2) + rhs.sigma.powi(2)).sqrt())
    }
}

impl ops::AddAssign for UncertainValue {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl ops::Mul for UncertainValue {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let value = self.value * rhs.value;
        let rel = ((self.sigma / self.value).powi(2) + (rhs.sigma / rhs.value).powi(2)).sqrt();
        Self::new(value, (value * rel).abs())
    }
}

impl ops::Div for UncertainValue {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        let value = self.value / rhs.value;
        let rel = ((self.sigma / self.value).powi(2) + (rhs.sigma / rhs.value).powi(2)).sqrt();
        Self::new(value, (value * rel).abs())
    }
}

impl ops::Mul<f64> for UncertainValue {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.value * rhs, (self.sigma * rhs).abs())
    }
}

impl ops::Div<f64> for UncertainValue {
    type Output = Self;

    fn div(self, rhs: f64) -> Self {
        Self::new(self.value / rhs, (self.sigma / rhs).abs())
    }
}

impl fmt::Display for UncertainValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}\u{00B1}{}", self.value, self.sigma)
    }
}
