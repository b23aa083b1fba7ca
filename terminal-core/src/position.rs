//! Typed views over position and deal-ticket records
//!
//! The store keeps entities as flat field maps; these structs project a
//! record into the shape the ticket and blotter surfaces work with.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, EntityRecord, FieldValue};
use crate::error::{TerminalError, TerminalResult};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    fn from_field(value: Option<&FieldValue>) -> Option<Self> {
        match value?.as_text()?.to_lowercase().as_str() {
            "buy" | "b" | "long" => Some(Side::Buy),
            "sell" | "s" | "short" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// A position held in an instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Position identifier (topic id)
    pub id: String,

    /// Instrument the position is in
    pub instrument: String,

    /// Signed quantity (negative when short)
    pub quantity: Decimal,

    /// Average entry price
    pub avg_price: Decimal,

    /// Current mark price
    pub current_price: Decimal,

    /// Unrealized profit/loss as reported by the feed
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// Project a position record
    pub fn from_record(record: &EntityRecord) -> TerminalResult<Self> {
        expect_kind(record, EntityKind::Position)?;
        let number = |field: &str| record.decimal(field).unwrap_or(Decimal::ZERO);

        let mut position = Self {
            id: record.key.id.clone(),
            instrument: text_or(record, "instrument", &record.key.id),
            quantity: number("quantity"),
            avg_price: number("avg_price"),
            current_price: number("current_price"),
            unrealized_pnl: Decimal::ZERO,
        };
        position.unrealized_pnl = record
            .decimal("unrealized_pnl")
            .unwrap_or_else(|| position.calculate_pnl());
        Ok(position)
    }

    /// Calculate the current value of this position
    pub fn current_value(&self) -> Decimal {
        self.quantity * self.current_price
    }

    /// Calculate the cost basis
    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.avg_price
    }

    /// Calculate unrealized P&L
    pub fn calculate_pnl(&self) -> Decimal {
        self.current_value() - self.cost_basis()
    }

    /// Calculate P&L as a percentage
    pub fn pnl_percentage(&self) -> Decimal {
        if self.cost_basis().is_zero() {
            Decimal::ZERO
        } else {
            (self.unrealized_pnl / self.cost_basis().abs()) * Decimal::from(100)
        }
    }
}

/// Lifecycle of a deal ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    /// Submitted, not yet acknowledged
    Pending,
    Working,
    Filled,
    Cancelled,
    Rejected,
}

impl DealStatus {
    fn from_field(value: Option<&FieldValue>) -> Self {
        match value.and_then(FieldValue::as_text).map(str::to_lowercase).as_deref() {
            Some("working") | Some("open") => DealStatus::Working,
            Some("filled") | Some("done") => DealStatus::Filled,
            Some("cancelled") | Some("canceled") => DealStatus::Cancelled,
            Some("rejected") => DealStatus::Rejected,
            _ => DealStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DealStatus::Filled | DealStatus::Cancelled | DealStatus::Rejected)
    }
}

/// A deal ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealTicket {
    pub id: String,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    /// Limit price; `None` for market deals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub status: DealStatus,
}

impl DealTicket {
    /// Project a deal-ticket record
    pub fn from_record(record: &EntityRecord) -> TerminalResult<Self> {
        expect_kind(record, EntityKind::DealTicket)?;
        let side = Side::from_field(record.get("side"))
            .ok_or_else(|| TerminalError::parse(format!("Deal {} has no valid side", record.key.id)))?;

        Ok(Self {
            id: record.key.id.clone(),
            instrument: text_or(record, "instrument", ""),
            side,
            quantity: record.decimal("quantity").unwrap_or(Decimal::ZERO),
            price: record.decimal("price"),
            filled_quantity: record.decimal("filled_quantity").unwrap_or(Decimal::ZERO),
            status: DealStatus::from_field(record.get("status")),
        })
    }

    pub fn remaining_quantity(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

fn expect_kind(record: &EntityRecord, kind: EntityKind) -> TerminalResult<()> {
    if record.key.kind == kind {
        Ok(())
    } else {
        Err(TerminalError::parse(format!(
            "Expected a {} record, got {}",
            kind, record.key
        )))
    }
}

fn text_or(record: &EntityRecord, field: &str, default: &str) -> String {
    record
        .get(field)
        .and_then(FieldValue::as_text)
        .unwrap_or(default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKey, FieldMap};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(kind: EntityKind, id: &str, fields: &[(&str, FieldValue)]) -> EntityRecord {
        let fields: FieldMap = fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        EntityRecord::new(EntityKey::new(kind, id), 1, fields, Utc::now())
    }

    #[test]
    fn test_position_pnl_fallback() {
        let rec = record(
            EntityKind::Position,
            "ACC1-EURUSD",
            &[
                ("instrument", "EURUSD".into()),
                ("quantity", dec!(10).into()),
                ("avg_price", dec!(1.5).into()),
                ("current_price", dec!(2).into()),
            ],
        );

        let position = Position::from_record(&rec).unwrap();
        assert_eq!(position.instrument, "EURUSD");
        assert_eq!(position.unrealized_pnl, dec!(5));
        assert_eq!(position.pnl_percentage().round_dp(2), dec!(33.33));
    }

    #[test]
    fn test_position_wrong_kind() {
        let rec = record(EntityKind::Instrument, "EURUSD", &[]);
        assert!(Position::from_record(&rec).is_err());
    }

    #[test]
    fn test_deal_ticket_projection() {
        let rec = record(
            EntityKind::DealTicket,
            "T-1",
            &[
                ("instrument", "EURUSD".into()),
                ("side", "SELL".into()),
                ("quantity", dec!(100).into()),
                ("filled_quantity", dec!(40).into()),
                ("status", "working".into()),
            ],
        );

        let deal = DealTicket::from_record(&rec).unwrap();
        assert_eq!(deal.side, Side::Sell);
        assert_eq!(deal.price, None);
        assert_eq!(deal.remaining_quantity(), dec!(60));
        assert_eq!(deal.status, DealStatus::Working);
        assert!(!deal.status.is_terminal());
    }
}
