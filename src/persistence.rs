//! Embedded persisted state: positions, fills, markouts, sessions, and an
//! append-only event ledger for crash recovery. Grounded on
//! `cooprefr-bettersys`'s rusqlite-backed store shape.

use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::errors::EngineError;
use crate::polymarket::types::{Fill, Side};

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS positions (
                asset TEXT PRIMARY KEY,
                confirmed_size TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fills (
                trade_key TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                size TEXT NOT NULL,
                fee TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS markouts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_key TEXT NOT NULL,
                horizon_s INTEGER NOT NULL,
                markout_bps TEXT NOT NULL,
                recorded_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at_ms INTEGER NOT NULL,
                ended_at_ms INTEGER,
                dry_run INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_ledger (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    pub fn start_session(&self, started_at_ms: i64, dry_run: bool) -> Result<i64, EngineError> {
        self.conn.execute(
            "INSERT INTO sessions (started_at_ms, dry_run) VALUES (?1, ?2)",
            params![started_at_ms, dry_run as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn end_session(&self, session_id: i64, ended_at_ms: i64) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE sessions SET ended_at_ms = ?1 WHERE id = ?2",
            params![ended_at_ms, session_id],
        )?;
        Ok(())
    }

    pub fn upsert_position(&self, asset: &str, confirmed_size: Decimal, updated_at_ms: i64) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT INTO positions (asset, confirmed_size, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(asset) DO UPDATE SET confirmed_size = excluded.confirmed_size, updated_at_ms = excluded.updated_at_ms",
            params![asset, confirmed_size.to_string(), updated_at_ms],
        )?;
        Ok(())
    }

    pub fn load_position(&self, asset: &str) -> Result<Option<Decimal>, EngineError> {
        let mut stmt = self.conn.prepare("SELECT confirmed_size FROM positions WHERE asset = ?1")?;
        let mut rows = stmt.query(params![asset])?;
        if let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            Ok(Decimal::from_str(&raw).ok())
        } else {
            Ok(None)
        }
    }

    pub fn record_fill(&self, fill: &Fill) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO fills (trade_key, order_id, asset, side, price, size, fee, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fill.key(),
                fill.order_id,
                fill.asset.as_str(),
                fill.side.as_str(),
                fill.price.to_string(),
                fill.size.to_string(),
                fill.fee.to_string(),
                fill.timestamp_ms,
            ],
        )?;
        Ok(())
    }

    pub fn record_markout(&self, trade_key: &str, horizon_s: u64, markout_bps: Decimal, recorded_at_ms: i64) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT INTO markouts (trade_key, horizon_s, markout_bps, recorded_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![trade_key, horizon_s as i64, markout_bps.to_string(), recorded_at_ms],
        )?;
        Ok(())
    }

    pub fn append_event(&self, kind: &str, payload: &str, recorded_at_ms: i64) -> Result<i64, EngineError> {
        self.conn.execute(
            "INSERT INTO event_ledger (kind, payload, recorded_at_ms) VALUES (?1, ?2, ?3)",
            params![kind, payload, recorded_at_ms],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replays fills recorded since `since_seq` for startup reconciliation.
    pub fn fills_for_asset(&self, asset: &str) -> Result<Vec<(String, Side, Decimal, Decimal, i64)>, EngineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT trade_key, side, price, size, timestamp_ms FROM fills WHERE asset = ?1 ORDER BY timestamp_ms")?;
        let rows = stmt.query_map(params![asset], |row| {
            let side_str: String = row.get(1)?;
            let side = if side_str == "BUY" { Side::Buy } else { Side::Sell };
            let price: String = row.get(2)?;
            let size: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                side,
                Decimal::from_str(&price).unwrap_or_default(),
                Decimal::from_str(&size).unwrap_or_default(),
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn position_roundtrip() {
        let store = Store::open(":memory:").unwrap();
        store.upsert_position("asset-a", dec!(42.5), 1000).unwrap();
        assert_eq!(store.load_position("asset-a").unwrap(), Some(dec!(42.5)));
        assert_eq!(store.load_position("asset-b").unwrap(), None);
    }

    #[test]
    fn fill_insert_is_idempotent() {
        let store = Store::open(":memory:").unwrap();
        let fill = Fill {
            trade_id: Some("t1".into()),
            order_id: "o1".into(),
            asset: "asset-a".into(),
            side: Side::Buy,
            price: dec!(0.5),
            size: dec!(10),
            fee: dec!(0.01),
            timestamp_ms: 1000,
        };
        store.record_fill(&fill).unwrap();
        store.record_fill(&fill).unwrap();
        let rows = store.fills_for_asset("asset-a").unwrap();
        assert_eq!(rows.len(), 1);
    }
}
