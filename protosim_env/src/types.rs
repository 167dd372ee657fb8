//! Common types for the protosim environment abstraction.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Address of an externally owned account or deployed contract.
///
/// Stored as a lowercase `0x`-prefixed hex string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountAddress(String);

impl AccountAddress {
    /// Creates an address from 20 raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        let mut hex = String::with_capacity(42);
        hex.push_str("0x");
        for b in bytes {
            hex.push_str(&format!("{:02x}", b));
        }
        Self(hex)
    }

    /// Creates a deterministic address from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[0..8].copy_from_slice(&seed.to_be_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_be_bytes());
        bytes[16..20].copy_from_slice(&(seed as u32).wrapping_mul(0x9e37_79b9).to_be_bytes());
        Self::from_bytes(bytes)
    }

    /// Wraps an already formatted address string.
    pub fn parse(s: &str) -> Self {
        Self(s.to_lowercase())
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A deployed contract, addressable by its reference name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractHandle {
    /// Reference name used in paths (e.g. `StableBaseCDP`)
    pub name: String,

    /// Contract kind; selects the snapshot provider
    pub kind: String,

    /// On-chain address
    pub address: AccountAddress,
}

/// A state value read from, or written to, the execution environment.
///
/// Integers are arbitrary precision since on-chain words exceed 64 bits.
/// JSON form: integers that fit `i64` are numbers, larger ones are decimal
/// strings; decimal-digit strings are read back as integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawValue", into = "RawValue")]
pub enum Value {
    Int(BigInt),
    Bool(bool),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Creates an integer value.
    pub fn int(v: impl Into<BigInt>) -> Self {
        Value::Int(v.into())
    }

    /// Creates a text value.
    pub fn text(v: impl Into<String>) -> Self {
        Value::Text(v.into())
    }

    /// Creates an empty map.
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Returns the integer if this is one.
    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Returns the map if this is one.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns a child entry of a map or list.
    pub fn child(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            Value::List(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Canonical key used when this value addresses a mapping entry.
    ///
    /// Returns `None` for compound values, which cannot be keys.
    pub fn key(&self) -> Option<String> {
        match self {
            Value::Int(i) => Some(i.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::List(_) | Value::Map(_) => None,
        }
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(BigInt::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<AccountAddress> for Value {
    fn from(v: AccountAddress) -> Self {
        Value::Text(v.0)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Wire form of [`Value`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Text(String),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
}

fn is_decimal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

impl From<RawValue> for Value {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Bool(b) => Value::Bool(b),
            RawValue::Int(i) => Value::Int(BigInt::from(i)),
            RawValue::UInt(u) => Value::Int(BigInt::from(u)),
            RawValue::Text(s) if is_decimal(&s) => match s.parse::<BigInt>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
            RawValue::Text(s) => Value::Text(s),
            RawValue::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            RawValue::Map(m) => Value::Map(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => RawValue::Bool(b),
            Value::Int(i) => match i.to_i64() {
                Some(small) => RawValue::Int(small),
                None => RawValue::Text(i.to_string()),
            },
            Value::Text(s) => RawValue::Text(s),
            Value::List(items) => RawValue::List(items.into_iter().map(RawValue::from).collect()),
            Value::Map(m) => RawValue::Map(m.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect()),
        }
    }
}

/// A state-mutating call issued on behalf of an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Target contract reference name
    pub contract: String,

    /// Method to invoke
    pub method: String,

    /// Sending account
    pub sender: AccountAddress,

    /// Ordered named arguments
    pub args: Vec<(String, Value)>,
}

impl CallRequest {
    /// Looks up an argument by name.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Result status of a call that reached the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Reverted { reason: String },
}

/// Receipt for a call that reached the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReceipt {
    /// Success or revert
    pub status: CallStatus,

    /// Transaction identifier, if the environment assigns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,

    /// Named outputs (e.g. newly registered identifiers)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

impl CallReceipt {
    /// A successful receipt with no outputs.
    pub fn success() -> Self {
        Self {
            status: CallStatus::Success,
            tx_hash: None,
            outputs: BTreeMap::new(),
        }
    }

    /// A reverted receipt.
    pub fn reverted(reason: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Reverted { reason: reason.into() },
            tx_hash: None,
            outputs: BTreeMap::new(),
        }
    }

    /// Adds a named output.
    pub fn with_output(mut self, name: &str, value: Value) -> Self {
        self.outputs.insert(name.to_string(), value);
        self
    }
}
