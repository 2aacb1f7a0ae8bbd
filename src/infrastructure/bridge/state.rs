use crate::domain::trading::{AccountSnapshot, Position};
use std::collections::HashMap;
use std::sync::RwLock;

/// Locally mirrored broker state: open positions and the latest account
/// snapshot. The broker transport is the only writer; everyone else reads
/// cloned snapshots. Refreshed on every stream event and on reconnect.
pub struct BrokerStateCache {
    positions: RwLock<Vec<Position>>,
    account: RwLock<Option<AccountSnapshot>>,
}

impl std::fmt::Debug for BrokerStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerStateCache")
            .field("positions", &"<RwLock>")
            .field("account", &"<RwLock>")
            .finish()
    }
}

impl BrokerStateCache {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(Vec::new()),
            account: RwLock::new(None),
        }
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        match self.positions.write() {
            Ok(mut guard) => *guard = positions,
            Err(poisoned) => {
                tracing::error!("BrokerStateCache: positions lock poisoned, recovering");
                *poisoned.into_inner() = positions;
            }
        }
    }

    pub fn set_account(&self, snapshot: AccountSnapshot) {
        match self.account.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => {
                tracing::error!("BrokerStateCache: account lock poisoned, recovering");
                *poisoned.into_inner() = Some(snapshot);
            }
        }
    }

    pub fn positions(&self) -> Vec<Position> {
        match self.positions.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn account(&self) -> Option<AccountSnapshot> {
        match self.account.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn open_position_count(&self) -> usize {
        match self.positions.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn find_by_ticket(&self, ticket: u64) -> Option<Position> {
        self.positions().into_iter().find(|p| p.ticket == ticket)
    }

    /// Positions belonging to one strategy, selected by its magic number.
    pub fn positions_for_magic(&self, magic: i64) -> Vec<Position> {
        self.positions()
            .into_iter()
            .filter(|p| p.magic == magic)
            .collect()
    }
}

impl Default for BrokerStateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::OrderSide;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn position(ticket: u64, magic: i64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side: OrderSide::Buy,
            volume: dec!(0.1),
            open_price: dec!(1.1),
            current_price: dec!(1.1),
            stop_loss: None,
            take_profit: None,
            open_time: 0,
            unrealized_pnl: Decimal::ZERO,
            swap: Decimal::ZERO,
            commission: Decimal::ZERO,
            magic,
        }
    }

    #[test]
    fn test_position_replacement() {
        let cache = BrokerStateCache::new();
        cache.set_positions(vec![position(1, 0), position(2, 0)]);
        assert_eq!(cache.open_position_count(), 2);

        cache.set_positions(vec![position(3, 0)]);
        assert_eq!(cache.open_position_count(), 1);
        assert!(cache.find_by_ticket(1).is_none());
        assert!(cache.find_by_ticket(3).is_some());
    }

    #[test]
    fn test_magic_filter() {
        let cache = BrokerStateCache::new();
        cache.set_positions(vec![position(1, 100), position(2, 200), position(3, 100)]);
        let mine = cache.positions_for_magic(100);
        assert_eq!(mine.len(), 2);
    }

    #[test]
    fn test_account_snapshot() {
        let cache = BrokerStateCache::new();
        assert!(cache.account().is_none());

        cache.set_account(AccountSnapshot {
            balance: dec!(10000),
            equity: dec!(9950),
            margin: dec!(100),
            free_margin: dec!(9850),
            margin_level: dec!(9950),
            currency: "USD".to_string(),
        });
        assert_eq!(cache.account().unwrap().balance, dec!(10000));
    }
}
