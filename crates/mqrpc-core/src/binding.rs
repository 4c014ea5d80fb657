//! Argument binding for registered methods.
//!
//! Each method declares an ordered list of [`Param`]s when it is registered.
//! A param pairs a name with a [`Decode`] strategy that is fixed at
//! registration time; at call time the supplied JSON params are walked in
//! declaration order, matched by index (positional) or by name (named), and
//! decoded into [`Args`] for the handler.
//!
//! A missing argument is an InvalidParams error. A value that cannot be decoded
//! is an internal error, reported with the parameter name for the server log.

use crate::envelope::Params;
use crate::error::{Result, RpcError};
use crate::taxonomy::ErrorKind;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;

type RecordConstructor = Arc<dyn Fn(Value) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Scalar targets for [`Decode::Cast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastTarget {
    Int,
    Float,
    Str,
    Bool,
    Uuid,
}

impl CastTarget {
    fn as_str(&self) -> &'static str {
        match self {
            CastTarget::Int => "int",
            CastTarget::Float => "float",
            CastTarget::Str => "string",
            CastTarget::Bool => "bool",
            CastTarget::Uuid => "uuid",
        }
    }
}

/// How a raw JSON argument becomes an [`Arg`].
#[derive(Clone)]
pub enum Decode {
    /// Hand the JSON value over unchanged.
    Passthrough,
    /// Build a structured record from a JSON object.
    Record {
        type_name: &'static str,
        construct: RecordConstructor,
    },
    /// Parse ISO-8601 text into a timestamp.
    Timestamp,
    /// Convert a scalar to the target type.
    Cast(CastTarget),
}

impl std::fmt::Debug for Decode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decode::Passthrough => write!(f, "Passthrough"),
            Decode::Record { type_name, .. } => write!(f, "Record({})", type_name),
            Decode::Timestamp => write!(f, "Timestamp"),
            Decode::Cast(target) => write!(f, "Cast({:?})", target),
        }
    }
}

/// A declared method parameter.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    decode: Decode,
}

impl Param {
    pub fn new(name: impl Into<String>, decode: Decode) -> Self {
        Self {
            name: name.into(),
            decode,
        }
    }

    /// Untyped parameter; the JSON value is passed through.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, Decode::Passthrough)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, Decode::Cast(CastTarget::Int))
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, Decode::Cast(CastTarget::Float))
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, Decode::Cast(CastTarget::Str))
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, Decode::Cast(CastTarget::Bool))
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::new(name, Decode::Cast(CastTarget::Uuid))
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, Decode::Timestamp)
    }

    /// Parameter constructed as `T` from a JSON object.
    ///
    /// Fields missing from the object fall back to `T`'s serde defaults.
    pub fn record<T>(name: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        let construct: RecordConstructor = Arc::new(move |value: Value| {
            if !value.is_object() {
                return Err(RpcError::other(format!(
                    "Cannot construct {} from non-object value {}",
                    type_name, value
                )));
            }
            let record: T = serde_json::from_value(value)?;
            Ok(Box::new(record) as Box<dyn Any + Send + Sync>)
        });
        Self::new(
            name,
            Decode::Record {
                type_name,
                construct,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decode(&self) -> &Decode {
        &self.decode
    }

    fn apply(&self, value: Value) -> Result<Arg> {
        match &self.decode {
            Decode::Passthrough => Ok(Arg::Value(value)),
            Decode::Record { construct, .. } => construct(value).map(Arg::Record),
            Decode::Timestamp => match value.as_str() {
                Some(text) => parse_timestamp(text).map(Arg::Timestamp),
                None => Err(RpcError::other(format!(
                    "Expected ISO-8601 text for parameter {}, got {}",
                    self.name, value
                ))),
            },
            Decode::Cast(target) => cast(*target, value).map_err(|e| {
                RpcError::other(format!(
                    "Cannot cast parameter {} to {}: {}",
                    self.name,
                    target.as_str(),
                    e
                ))
            }),
        }
    }
}

/// A decoded argument.
pub enum Arg {
    Value(Value),
    Timestamp(DateTime<FixedOffset>),
    Uuid(Uuid),
    Record(Box<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Value(value) => write!(f, "Value({})", value),
            Arg::Timestamp(ts) => write!(f, "Timestamp({})", ts.to_rfc3339()),
            Arg::Uuid(id) => write!(f, "Uuid({})", id),
            Arg::Record(_) => write!(f, "Record(..)"),
        }
    }
}

/// Decoded arguments in declaration order.
#[derive(Debug, Default)]
pub struct Args {
    entries: Vec<(String, Arg)>,
}

impl Args {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, arg)| arg)
    }

    fn require(&self, name: &str) -> Result<&Arg> {
        self.get(name)
            .ok_or_else(|| RpcError::other(format!("No argument named {}", name)))
    }

    /// JSON value of a passthrough or cast argument.
    pub fn value(&self, name: &str) -> Result<&Value> {
        match self.require(name)? {
            Arg::Value(value) => Ok(value),
            other => Err(RpcError::other(format!(
                "Argument {} is not a JSON value: {:?}",
                name, other
            ))),
        }
    }

    /// Deserialize a passthrough or cast argument into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        Ok(T::deserialize(self.value(name)?)?)
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        self.get_as(name)
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        self.get_as(name)
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        self.get_as(name)
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.value(name)?
            .as_str()
            .ok_or_else(|| RpcError::other(format!("Argument {} is not a string", name)))
    }

    pub fn timestamp(&self, name: &str) -> Result<DateTime<FixedOffset>> {
        match self.require(name)? {
            Arg::Timestamp(ts) => Ok(*ts),
            other => Err(RpcError::other(format!(
                "Argument {} is not a timestamp: {:?}",
                name, other
            ))),
        }
    }

    pub fn uuid(&self, name: &str) -> Result<Uuid> {
        match self.require(name)? {
            Arg::Uuid(id) => Ok(*id),
            other => Err(RpcError::other(format!(
                "Argument {} is not a uuid: {:?}",
                name, other
            ))),
        }
    }

    /// Borrow a record argument as `T`.
    pub fn record<T: Any>(&self, name: &str) -> Result<&T> {
        match self.require(name)? {
            Arg::Record(record) => record.downcast_ref::<T>().ok_or_else(|| {
                RpcError::other(format!(
                    "Argument {} is not a {}",
                    name,
                    std::any::type_name::<T>()
                ))
            }),
            other => Err(RpcError::other(format!(
                "Argument {} is not a record: {:?}",
                name, other
            ))),
        }
    }

    /// Move a record argument out as `T`, leaving `null` in its place.
    pub fn take_record<T: Any>(&mut self, name: &str) -> Result<T> {
        self.record::<T>(name)?;
        let slot = self
            .entries
            .iter_mut()
            .find(|(entry, _)| entry == name)
            .map(|(_, arg)| arg)
            .ok_or_else(|| RpcError::other(format!("No argument named {}", name)))?;

        match std::mem::replace(slot, Arg::Value(Value::Null)) {
            Arg::Record(record) => record
                .downcast::<T>()
                .map(|record| *record)
                .map_err(|_| RpcError::other(format!("Argument {} changed type", name))),
            other => {
                *slot = other;
                Err(RpcError::other(format!("Argument {} is not a record", name)))
            }
        }
    }
}

/// Bind supplied params to a method's declared parameters.
pub fn bind(declared: &[Param], supplied: Params) -> Result<Args> {
    let mut entries = Vec::with_capacity(declared.len());

    match supplied {
        Params::Positional(values) => {
            let mut values = values.into_iter();
            for param in declared {
                let value = values.next().ok_or_else(|| missing(param))?;
                entries.push((param.name.clone(), param.apply(value)?));
            }
        }
        Params::Named(mut values) => {
            for param in declared {
                let value = values.remove(&param.name).ok_or_else(|| missing(param))?;
                entries.push((param.name.clone(), param.apply(value)?));
            }
        }
    }

    Ok(Args { entries })
}

fn missing(param: &Param) -> RpcError {
    RpcError::protocol(
        ErrorKind::InvalidParams,
        format!("Missing required parameter: {}", param.name),
    )
}

/// Date-time layouts tried after the offset suffix has been split off.
const DATE_TIME_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y%m%dT%H%M%S%.f",
    "%Y%m%dT%H%M",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];

/// Parse ISO-8601 text.
///
/// Accepts extended (`2020-01-10T04:54:54`) and basic (`20200110T045454`)
/// layouts down to hour precision, with an optional `Z`, `±hh`, `±hhmm` or
/// `±hh:mm` offset. Text without an offset is taken as UTC; a bare date is
/// midnight UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<FixedOffset>> {
    let text = text.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts);
    }

    split_offset(text)
        .and_then(|(local, offset)| {
            parse_naive(local)?
                .and_local_timezone(offset)
                .single()
        })
        .ok_or_else(|| RpcError::other(format!("Invalid ISO-8601 timestamp: {}", text)))
}

fn is_time_separator(c: char) -> bool {
    c == 'T' || c == 't' || c == ' '
}

/// Split a trailing UTC offset off `text`. No offset means UTC.
fn split_offset(text: &str) -> Option<(&str, FixedOffset)> {
    let utc = FixedOffset::east_opt(0)?;
    if let Some(local) = text.strip_suffix(|c: char| c == 'Z' || c == 'z') {
        return Some((local, utc));
    }

    // Dates contain '-', so only look for a sign inside the time part.
    let Some(time_start) = text.find(is_time_separator) else {
        return Some((text, utc));
    };
    let Some(sign_at) = text[time_start..]
        .rfind(|c: char| c == '+' || c == '-')
        .map(|i| i + time_start)
    else {
        return Some((text, utc));
    };

    let (local, suffix) = text.split_at(sign_at);
    let sign = if suffix.starts_with('-') { -1 } else { 1 };
    let digits: String = suffix[1..].chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.as_str(), "0"),
        4 => digits.split_at(2),
        _ => return None,
    };
    let seconds = hours.parse::<i32>().ok()? * 3600 + minutes.parse::<i32>().ok()? * 60;
    Some((local, FixedOffset::east_opt(sign * seconds)?))
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    if let Some(naive) = DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
    {
        return Some(naive);
    }

    match text.split_once(is_time_separator) {
        // Hour precision: "2020-01-10T04"
        Some((date, hour)) if hour.len() == 2 => {
            let hour = hour.parse::<u32>().ok()?;
            parse_date(date)?.and_hms_opt(hour, 0, 0)
        }
        Some(_) => None,
        None => parse_date(text)?.and_hms_opt(0, 0, 0),
    }
}

fn cast(target: CastTarget, value: Value) -> std::result::Result<Arg, String> {
    let cast = match (target, value) {
        (CastTarget::Int, Value::Number(n)) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => match n.as_f64() {
                Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Value::from(f.trunc() as i64),
                _ => return Err(format!("{} is out of range", n)),
            },
        },
        (CastTarget::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("{:?}: {}", s, e))?,
        (CastTarget::Int, Value::Bool(b)) => Value::from(i64::from(b)),

        (CastTarget::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("{} is not a finite float", n))?,
        (CastTarget::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("{:?} is not a finite float", s))?,
        (CastTarget::Float, Value::Bool(b)) => Value::from(if b { 1.0 } else { 0.0 }),

        (CastTarget::Str, Value::String(s)) => Value::String(s),
        (CastTarget::Str, value @ (Value::Number(_) | Value::Bool(_))) => {
            Value::String(value.to_string())
        }

        (CastTarget::Bool, Value::Bool(b)) => Value::Bool(b),
        (CastTarget::Bool, Value::Number(n)) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
        (CastTarget::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(format!("{:?} is not a boolean", s)),
        },

        (CastTarget::Uuid, Value::String(s)) => {
            return Uuid::parse_str(s.trim())
                .map(Arg::Uuid)
                .map_err(|e| format!("{:?}: {}", s, e));
        }

        (_, value) => return Err(format!("unsupported value {}", value)),
    };

    Ok(Arg::Value(cast))
}
