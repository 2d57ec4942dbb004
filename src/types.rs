// =============================================================================
// Shared types used across the Borealis execution engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position. Spot longs buy the base asset; margin shorts
/// borrow and sell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side string for the entry order.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side string for any order that reduces the position.
    pub fn exit_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Self::Long)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Life-cycle status of the single tracked position.
///
///   Pending    — entry order placed, not yet filled
///   Open       — entry filled, exit legs not yet placed
///   OpenFilled — exit legs placed; the position is fully armed
///   Closing    — finalization in progress
///   Closed     — terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Open,
    OpenFilled,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Open => write!(f, "OPEN"),
            Self::OpenFilled => write!(f, "OPEN_FILLED"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Exchange order status as a closed sum.
///
/// `Missing` is synthesized at the adapter boundary from the exchange's
/// "unknown order" error codes, so callers can pattern-match a terminal
/// state instead of inspecting error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    Missing,
}

impl OrderStatus {
    /// Parse the exchange's status string. Unknown strings map to `Missing`
    /// so a new venue-side status can never wedge the watchdogs.
    pub fn parse(s: &str) -> Self {
        match s {
            "NEW" => Self::New,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "FILLED" => Self::Filled,
            "CANCELED" => Self::Canceled,
            "PENDING_CANCEL" => Self::PendingCancel,
            "REJECTED" => Self::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => Self::Expired,
            _ => Self::Missing,
        }
    }

    /// True when the order can no longer execute.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired | Self::Missing
        )
    }

    /// Terminal without having fully executed — an acceptable outcome of a
    /// cancel-verify sequence.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Rejected | Self::Expired | Self::Missing
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled | Self::PendingCancel)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Missing => "MISSING",
        };
        write!(f, "{s}")
    }
}

/// Which tracked order slot an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrderKey {
    Sl,
    Tp1,
    Tp2,
    SlPrev,
    Entry,
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sl => "SL",
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::SlPrev => "SL_PREV",
            Self::Entry => "ENTRY",
        };
        write!(f, "{s}")
    }
}

/// How the entry order is allowed to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMode {
    LimitOnly,
    LimitThenMarket,
    MarketOnly,
}

/// Spot account vs margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    Spot,
    Margin,
}

/// Who manages the borrow/repay life-cycle on margin accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BorrowMode {
    /// The exchange auto-borrows and auto-repays via order side effects.
    Auto,
    /// The coordinator borrows and repays explicitly.
    Manual,
}

/// Price source feeding the trailing engine's confirmation reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrailSource {
    /// Aggregated bar feed (CSV close).
    Agg,
    /// Book ticker mid price.
    Book,
}

/// How the two Plan B deviation thresholds combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanBDevRule {
    /// Abort when either threshold is exceeded.
    Either,
    /// Abort only when both thresholds are exceeded.
    Both,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_parses_known_strings() {
        assert_eq!(OrderStatus::parse("NEW"), OrderStatus::New);
        assert_eq!(OrderStatus::parse("PARTIALLY_FILLED"), OrderStatus::PartiallyFilled);
        assert_eq!(OrderStatus::parse("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::parse("CANCELED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::parse("EXPIRED"), OrderStatus::Expired);
    }

    #[test]
    fn unknown_status_string_is_missing() {
        assert_eq!(OrderStatus::parse("SOMETHING_NEW"), OrderStatus::Missing);
    }

    #[test]
    fn gone_is_terminal_but_filled_is_not_gone() {
        for st in [
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
            OrderStatus::Missing,
        ] {
            assert!(st.is_gone());
            assert!(st.is_terminal());
        }
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::Filled.is_gone());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn side_order_strings() {
        assert_eq!(Side::Long.entry_order_side(), "BUY");
        assert_eq!(Side::Long.exit_order_side(), "SELL");
        assert_eq!(Side::Short.entry_order_side(), "SELL");
        assert_eq!(Side::Short.exit_order_side(), "BUY");
    }
}
