use serde::{Deserialize, Serialize};

use super::ScalarType;

/// A typed scalar. Literals in the IR, locals in the fallback
/// interpreter, and array elements read back by the host are all values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Value {
    pub fn ty(self) -> ScalarType {
        match self {
            Value::Boolean(_) => ScalarType::Boolean,
            Value::Byte(_) => ScalarType::Byte,
            Value::Short(_) => ScalarType::Short,
            Value::Char(_) => ScalarType::Char,
            Value::Int(_) => ScalarType::Int,
            Value::Long(_) => ScalarType::Long,
            Value::Float(_) => ScalarType::Float,
            Value::Double(_) => ScalarType::Double,
        }
    }

    pub fn zero(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Boolean => Value::Boolean(false),
            ScalarType::Byte => Value::Byte(0),
            ScalarType::Short => Value::Short(0),
            ScalarType::Char => Value::Char(0),
            ScalarType::Int => Value::Int(0),
            ScalarType::Long => Value::Long(0),
            ScalarType::Float => Value::Float(0.0),
            ScalarType::Double => Value::Double(0.0),
        }
    }

    /// The value `1` of a numeric type, used by increments.
    pub fn one(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Boolean => Value::Boolean(true),
            ScalarType::Float => Value::Float(1.0),
            ScalarType::Double => Value::Double(1.0),
            _ => Value::Long(1).cast(ty),
        }
    }

    /// Raw storage bits. Integers are sign- (or zero-, for `char`)
    /// extended; floats store their IEEE bits.
    pub fn to_bits(self) -> u64 {
        match self {
            Value::Boolean(b) => b as u64,
            Value::Byte(v) => v as i64 as u64,
            Value::Short(v) => v as i64 as u64,
            Value::Char(v) => v as u64,
            Value::Int(v) => v as i64 as u64,
            Value::Long(v) => v as u64,
            Value::Float(v) => v.to_bits() as u64,
            Value::Double(v) => v.to_bits(),
        }
    }

    pub fn from_bits(ty: ScalarType, bits: u64) -> Self {
        match ty {
            ScalarType::Boolean => Value::Boolean(bits != 0),
            ScalarType::Byte => Value::Byte(bits as i8),
            ScalarType::Short => Value::Short(bits as i16),
            ScalarType::Char => Value::Char(bits as u16),
            ScalarType::Int => Value::Int(bits as i32),
            ScalarType::Long => Value::Long(bits as i64),
            ScalarType::Float => Value::Float(f32::from_bits(bits as u32)),
            ScalarType::Double => Value::Double(f64::from_bits(bits)),
        }
    }

    /// Integral view of the value, if it has one.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(v as i64),
            Value::Short(v) => Some(v as i64),
            Value::Char(v) => Some(v as i64),
            Value::Int(v) => Some(v as i64),
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Value::Boolean(b) => b as i64 as f64,
            Value::Byte(v) => v as f64,
            Value::Short(v) => v as f64,
            Value::Char(v) => v as f64,
            Value::Int(v) => v as f64,
            Value::Long(v) => v as f64,
            Value::Float(v) => v as f64,
            Value::Double(v) => v,
        }
    }

    /// Primitive conversion with the source language's semantics:
    /// integer narrowing truncates, float-to-integer saturates (NaN is 0),
    /// and float-to-subword goes through `int` first.
    pub fn cast(self, to: ScalarType) -> Value {
        if self.ty() == to {
            return self;
        }
        if to == ScalarType::Boolean {
            return Value::Boolean(self.to_bits() != 0);
        }
        match self {
            Value::Float(_) | Value::Double(_) => {
                let f = self.as_f64();
                match to {
                    ScalarType::Float => Value::Float(f as f32),
                    ScalarType::Double => Value::Double(f),
                    ScalarType::Long => Value::Long(f as i64),
                    _ => Value::Int(f as i32).cast(to),
                }
            }
            _ => {
                let i = match self {
                    Value::Boolean(b) => b as i64,
                    other => other.as_i64().unwrap_or(0),
                };
                match to {
                    ScalarType::Byte => Value::Byte(i as i8),
                    ScalarType::Short => Value::Short(i as i16),
                    ScalarType::Char => Value::Char(i as u16),
                    ScalarType::Int => Value::Int(i as i32),
                    ScalarType::Long => Value::Long(i),
                    ScalarType::Float => Value::Float(i as f32),
                    ScalarType::Double => Value::Double(i as f64),
                    ScalarType::Boolean => Value::Boolean(i != 0),
                }
            }
        }
    }

    /// OpenCL C literal text.
    pub fn to_cl(self) -> String {
        match self {
            Value::Boolean(b) => (if b { "1" } else { "0" }).to_string(),
            Value::Byte(v) => format!("(char){}", v),
            Value::Short(v) => format!("(short){}", v),
            Value::Char(v) => format!("(unsigned short){}", v),
            Value::Int(i32::MIN) => "(-2147483647-1)".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Long(i64::MIN) => "(-9223372036854775807L-1L)".to_string(),
            Value::Long(v) => format!("{}L", v),
            Value::Float(v) => float_literal(v as f64, v.is_finite(), "f", v.to_string()),
            Value::Double(v) => float_literal(v, v.is_finite(), "", v.to_string()),
        }
    }
}

fn float_literal(v: f64, finite: bool, suffix: &str, text: String) -> String {
    if !finite {
        return if v.is_nan() {
            "NAN".to_string()
        } else if v > 0.0 {
            "INFINITY".to_string()
        } else {
            "(-INFINITY)".to_string()
        };
    }
    if text.contains('.') || text.contains('e') {
        format!("{}{}", text, suffix)
    } else {
        format!("{}.0{}", text, suffix)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Float(v) => write!(f, "{}f", v),
            Value::Double(v) => write!(f, "{}", v),
        }
    }
}
