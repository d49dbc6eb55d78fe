//! Unified data façade
//!
//! Every broker reports orders, positions and trades in its own envelope.
//! Calls are routed through the [`ReauthGuard`] and the raw payload is
//! flattened by [`normalize`] into a plain list.

use crate::error::{BrokerError, BrokerResult};
use crate::guard::ReauthGuard;
use crate::providers::AuthDriver;
use crate::Broker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Account data families exposed by every broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Orders,
    Positions,
    Trades,
}

impl DataKind {
    pub const ALL: [Self; 3] = [Self::Orders, Self::Positions, Self::Trades];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Positions => "positions",
            Self::Trades => "trades",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "orders" | "orderbook" => Ok(Self::Orders),
            "positions" => Ok(Self::Positions),
            "trades" | "tradebook" => Ok(Self::Trades),
            other => Err(format!("unknown data kind: {other}")),
        }
    }
}

/// Flatten a raw broker payload into a list
///
/// A bare array is returned as-is. An object yields its `data` array, else
/// its `result` array. Anything else yields an empty list.
#[must_use]
pub fn normalize(raw: &Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items.clone(),
        Value::Object(map) => ["data", "result"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// All three data families for one broker account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub orders: Vec<Value>,
    pub positions: Vec<Value>,
    pub trades: Vec<Value>,
}

impl BrokerSnapshot {
    fn set(&mut self, kind: DataKind, items: Vec<Value>) {
        match kind {
            DataKind::Orders => self.orders = items,
            DataKind::Positions => self.positions = items,
            DataKind::Trades => self.trades = items,
        }
    }

    /// Items for one family
    #[must_use]
    pub fn get(&self, kind: DataKind) -> &[Value] {
        match kind {
            DataKind::Orders => &self.orders,
            DataKind::Positions => &self.positions,
            DataKind::Trades => &self.trades,
        }
    }
}

/// Fetch one data family through the guard and normalize it
///
/// # Errors
/// Propagates the guard's `NotConnected`, `SessionExpired` or
/// `BrokerCallFailed`; a malformed payload is not an error
pub async fn fetch(
    guard: &ReauthGuard,
    driver: &dyn AuthDriver,
    user_id: &str,
    kind: DataKind,
) -> BrokerResult<Vec<Value>> {
    let raw = guard
        .invoke(driver, user_id, move |api| async move { api.fetch(kind).await })
        .await?;
    let items = normalize(&raw);
    debug!(
        "Fetched {} {} from {} for {}",
        items.len(),
        kind,
        driver.broker(),
        user_id
    );
    Ok(items)
}

/// Fetch orders, positions and trades in sequence
///
/// The calls run one after another so a single expiry triggers at most one
/// re-authentication.
///
/// # Errors
/// Returns the first failing call's error
pub async fn fetch_all(
    guard: &ReauthGuard,
    driver: &dyn AuthDriver,
    user_id: &str,
) -> BrokerResult<BrokerSnapshot> {
    let mut snapshot = BrokerSnapshot::default();
    for kind in DataKind::ALL {
        let items = fetch(guard, driver, user_id, kind).await?;
        snapshot.set(kind, items);
    }
    Ok(snapshot)
}

/// Parse a broker name and a data kind from request parameters
///
/// # Errors
/// Returns `UnknownBroker` for an unrecognised broker; an unknown kind is
/// reported as a `ProtocolViolation` against that broker
pub fn parse_request(broker: &str, kind: &str) -> BrokerResult<(Broker, DataKind)> {
    let broker: Broker = broker.parse()?;
    let kind = kind
        .parse::<DataKind>()
        .map_err(|message| BrokerError::ProtocolViolation { broker, message })?;
    Ok((broker, kind))
}
