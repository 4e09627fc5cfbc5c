//! Relational backend on SQLite.
//!
//! Every entity kind has its own table with typed columns and its logical key
//! as primary key. `save` is an `INSERT ... ON CONFLICT DO UPDATE`.

mod columns;
mod records;

use crate::error::{Result, ScanResult, StoreError};
use crate::key::Table;
use crate::repo::{
    AskRepo, FundRepo, PaychRepo, Repo, RetrievalDealRepo, StorageDealRepo, StorageDealTx, TxFn,
};
use async_trait::async_trait;
use columns::{exists, in_clause, int, select, select_one, text, uint, upsert, SqlRecord};
use market_types::{
    Address, ChannelInfo, Cid, DealId, FundedAddressState, MinerDeal, MsgInfo,
    ProviderDealIdentifier, ProviderDealState, RetrievalAsk, SignedStorageAsk, StorageDealStatus,
};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storage_deals (
    proposal_cid TEXT PRIMARY KEY NOT NULL,
    piece_cid TEXT NOT NULL,
    piece_size INTEGER NOT NULL,
    verified_deal INTEGER NOT NULL,
    client_addr TEXT NOT NULL,
    provider_addr TEXT NOT NULL,
    label TEXT NOT NULL,
    start_epoch INTEGER NOT NULL,
    end_epoch INTEGER NOT NULL,
    storage_price_per_epoch TEXT NOT NULL,
    provider_collateral TEXT NOT NULL,
    client_collateral TEXT NOT NULL,
    client_signature TEXT NOT NULL,
    client_peer TEXT NOT NULL,
    miner_peer TEXT NOT NULL,
    state INTEGER NOT NULL,
    message TEXT NOT NULL,
    ref_payload_root TEXT NOT NULL,
    piece_path TEXT,
    funds_reserved TEXT NOT NULL,
    publish_cid TEXT,
    deal_id INTEGER,
    sector_number INTEGER,
    piece_offset INTEGER,
    transfer_channel_id TEXT,
    available_for_retrieval INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_storage_deals_state ON storage_deals(state);
CREATE INDEX IF NOT EXISTS idx_storage_deals_provider ON storage_deals(provider_addr);
CREATE INDEX IF NOT EXISTS idx_storage_deals_piece ON storage_deals(piece_cid);
CREATE INDEX IF NOT EXISTS idx_storage_deals_deal_id ON storage_deals(deal_id);

CREATE TABLE IF NOT EXISTS retrieval_deals (
    receiver TEXT NOT NULL,
    deal_id INTEGER NOT NULL,
    payload_cid TEXT NOT NULL,
    piece_cid TEXT,
    price_per_byte TEXT NOT NULL,
    unseal_price TEXT NOT NULL,
    payment_interval INTEGER NOT NULL,
    payment_interval_increase INTEGER NOT NULL,
    status INTEGER NOT NULL,
    channel_id TEXT,
    store_id INTEGER,
    funds_received TEXT NOT NULL,
    total_sent INTEGER NOT NULL,
    current_interval INTEGER NOT NULL,
    message TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (receiver, deal_id)
);

CREATE TABLE IF NOT EXISTS funded_addresses (
    addr TEXT PRIMARY KEY NOT NULL,
    wallet TEXT,
    amt_reserved TEXT NOT NULL,
    msg_cid TEXT
);

CREATE TABLE IF NOT EXISTS channel_infos (
    channel_id TEXT PRIMARY KEY NOT NULL,
    channel_addr TEXT,
    control TEXT NOT NULL,
    target TEXT NOT NULL,
    direction INTEGER NOT NULL,
    vouchers TEXT NOT NULL,
    next_lane INTEGER NOT NULL,
    amount TEXT NOT NULL,
    pending_amount TEXT NOT NULL,
    create_msg TEXT,
    add_funds_msg TEXT,
    settling INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_channel_infos_addr ON channel_infos(channel_addr);

CREATE TABLE IF NOT EXISTS msg_infos (
    msg_cid TEXT PRIMARY KEY NOT NULL,
    channel_id TEXT NOT NULL,
    received INTEGER NOT NULL,
    err TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS storage_asks (
    miner TEXT PRIMARY KEY NOT NULL,
    price TEXT NOT NULL,
    verified_price TEXT NOT NULL,
    min_piece_size INTEGER NOT NULL,
    max_piece_size INTEGER NOT NULL,
    ask_timestamp INTEGER NOT NULL,
    expiry INTEGER NOT NULL,
    seq_no INTEGER NOT NULL,
    signature TEXT
);

CREATE TABLE IF NOT EXISTS retrieval_asks (
    miner TEXT PRIMARY KEY NOT NULL,
    price_per_byte TEXT NOT NULL,
    unseal_price TEXT NOT NULL,
    payment_interval INTEGER NOT NULL,
    payment_interval_increase INTEGER NOT NULL
);
"#;

pub struct SqliteRepo {
    conn: Mutex<Connection>,
}

impl SqliteRepo {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        info!(path = %path.as_ref().display(), "🗄️ Opened SQLite deal repository");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("SQLite connection lock poisoned".to_string()))
    }
}

fn status_codes(statuses: &[StorageDealStatus]) -> Vec<Value> {
    statuses.iter().map(|s| int(s.code() as i64)).collect()
}

fn get_storage_deal(conn: &Connection, proposal_cid: &Cid) -> Result<MinerDeal> {
    select_one(conn, "WHERE proposal_cid = ?1", &[text(proposal_cid)], proposal_cid)
}

#[async_trait]
impl StorageDealRepo for SqliteRepo {
    async fn save_deal(&self, deal: &MinerDeal) -> Result<()> {
        upsert(&*self.conn()?, deal)
    }

    async fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal> {
        get_storage_deal(&*self.conn()?, proposal_cid)
    }

    async fn has_deal(&self, proposal_cid: &Cid) -> Result<bool> {
        exists::<MinerDeal>(&*self.conn()?, "WHERE proposal_cid = ?1", &[text(proposal_cid)])
    }

    async fn list_deals(&self) -> Result<ScanResult<MinerDeal>> {
        select(&*self.conn()?, "", &[])
    }

    async fn list_deals_by_provider(
        &self,
        provider: &Address,
        statuses: &[StorageDealStatus],
    ) -> Result<ScanResult<MinerDeal>> {
        let mut args = vec![text(provider)];
        let mut clause = "WHERE provider_addr = ?1".to_string();
        if !statuses.is_empty() {
            clause.push_str(&format!(" AND {}", in_clause("state", 2, statuses.len())));
            args.extend(status_codes(statuses));
        }
        select(&*self.conn()?, &clause, &args)
    }

    async fn get_deals_by_piece(
        &self,
        piece: &Cid,
        statuses: &[StorageDealStatus],
    ) -> Result<ScanResult<MinerDeal>> {
        let mut args = vec![text(piece)];
        let mut clause = "WHERE piece_cid = ?1".to_string();
        if !statuses.is_empty() {
            clause.push_str(&format!(" AND {}", in_clause("state", 2, statuses.len())));
            args.extend(status_codes(statuses));
        }
        select(&*self.conn()?, &clause, &args)
    }

    async fn get_deal_by_deal_id(&self, provider: &Address, deal_id: DealId) -> Result<MinerDeal> {
        select_one(
            &*self.conn()?,
            "WHERE provider_addr = ?1 AND deal_id = ?2",
            &[text(provider), uint(deal_id)?],
            deal_id,
        )
    }

    async fn list_deals_page(&self, offset: usize, limit: usize) -> Result<ScanResult<MinerDeal>> {
        select(
            &*self.conn()?,
            "ORDER BY created_at, proposal_cid LIMIT ?1 OFFSET ?2",
            &[uint(limit as u64)?, uint(offset as u64)?],
        )
    }

    async fn update_deal_status(&self, proposal_cid: &Cid, status: StorageDealStatus) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE storage_deals SET state = ?1, updated_at = ?2 WHERE proposal_cid = ?3",
            rusqlite::params![
                status.code() as i64,
                chrono::Utc::now().timestamp(),
                proposal_cid.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(Table::StorageDeals.name(), proposal_cid));
        }
        Ok(())
    }
}

#[async_trait]
impl RetrievalDealRepo for SqliteRepo {
    async fn save_retrieval_deal(&self, deal: &ProviderDealState) -> Result<()> {
        upsert(&*self.conn()?, deal)
    }

    async fn get_retrieval_deal(&self, id: &ProviderDealIdentifier) -> Result<ProviderDealState> {
        select_one(
            &*self.conn()?,
            "WHERE receiver = ?1 AND deal_id = ?2",
            &[text(&id.receiver), uint(id.deal_id)?],
            id,
        )
    }

    async fn has_retrieval_deal(&self, id: &ProviderDealIdentifier) -> Result<bool> {
        exists::<ProviderDealState>(
            &*self.conn()?,
            "WHERE receiver = ?1 AND deal_id = ?2",
            &[text(&id.receiver), uint(id.deal_id)?],
        )
    }

    async fn list_retrieval_deals(&self) -> Result<ScanResult<ProviderDealState>> {
        select(&*self.conn()?, "", &[])
    }
}

#[async_trait]
impl FundRepo for SqliteRepo {
    async fn save_fund_state(&self, state: &FundedAddressState) -> Result<()> {
        upsert(&*self.conn()?, state)
    }

    async fn get_fund_state(&self, addr: &Address) -> Result<FundedAddressState> {
        select_one(&*self.conn()?, "WHERE addr = ?1", &[text(addr)], addr)
    }

    async fn list_fund_states(&self) -> Result<ScanResult<FundedAddressState>> {
        select(&*self.conn()?, "", &[])
    }
}

#[async_trait]
impl PaychRepo for SqliteRepo {
    async fn save_channel_info(&self, info: &ChannelInfo) -> Result<()> {
        upsert(&*self.conn()?, info)
    }

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        select_one(&*self.conn()?, "WHERE channel_id = ?1", &[text(channel_id)], channel_id)
    }

    async fn get_channel_by_address(&self, channel: &Address) -> Result<ChannelInfo> {
        select_one(&*self.conn()?, "WHERE channel_addr = ?1", &[text(channel)], channel)
    }

    async fn outbound_active_by_from_to(&self, from: &Address, to: &Address) -> Result<ChannelInfo> {
        select_one(
            &*self.conn()?,
            "WHERE direction = 2 AND settling = 0 AND control = ?1 AND target = ?2 LIMIT 1",
            &[text(from), text(to)],
            format!("{}->{}", from, to),
        )
    }

    async fn list_channels(&self) -> Result<ScanResult<ChannelInfo>> {
        select(&*self.conn()?, "", &[])
    }

    async fn remove_channel(&self, channel_id: &str) -> Result<()> {
        let removed = self
            .conn()?
            .execute("DELETE FROM channel_infos WHERE channel_id = ?1", [channel_id])?;
        if removed == 0 {
            return Err(StoreError::not_found(Table::ChannelInfos.name(), channel_id));
        }
        Ok(())
    }

    async fn save_msg_info(&self, info: &MsgInfo) -> Result<()> {
        upsert(&*self.conn()?, info)
    }

    async fn get_msg_info(&self, msg_cid: &Cid) -> Result<MsgInfo> {
        select_one(&*self.conn()?, "WHERE msg_cid = ?1", &[text(msg_cid)], msg_cid)
    }

    async fn list_msg_infos(&self) -> Result<ScanResult<MsgInfo>> {
        select(&*self.conn()?, "", &[])
    }
}

#[async_trait]
impl AskRepo for SqliteRepo {
    async fn set_storage_ask(&self, ask: &SignedStorageAsk) -> Result<()> {
        upsert(&*self.conn()?, ask)
    }

    async fn get_storage_ask(&self, miner: &Address) -> Result<SignedStorageAsk> {
        select_one(&*self.conn()?, "WHERE miner = ?1", &[text(miner)], miner)
    }

    async fn list_storage_asks(&self) -> Result<ScanResult<SignedStorageAsk>> {
        select(&*self.conn()?, "", &[])
    }

    async fn set_retrieval_ask(&self, ask: &RetrievalAsk) -> Result<()> {
        upsert(&*self.conn()?, ask)
    }

    async fn get_retrieval_ask(&self, miner: &Address) -> Result<RetrievalAsk> {
        select_one(&*self.conn()?, "WHERE miner = ?1", &[text(miner)], miner)
    }

    async fn list_retrieval_asks(&self) -> Result<ScanResult<RetrievalAsk>> {
        select(&*self.conn()?, "", &[])
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl StorageDealTx for SqliteTx<'_> {
    fn get_deal(&mut self, proposal_cid: &Cid) -> Result<MinerDeal> {
        get_storage_deal(self.conn, proposal_cid)
    }

    fn save_deal(&mut self, deal: &MinerDeal) -> Result<()> {
        upsert(self.conn, deal)
    }
}

fn first_key_field<T: SqlRecord>() -> &'static str {
    T::FIELDS[0]
}

#[async_trait]
impl Repo for SqliteRepo {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn storage_deals(&self) -> &dyn StorageDealRepo {
        self
    }

    fn retrieval_deals(&self) -> &dyn RetrievalDealRepo {
        self
    }

    fn funds(&self) -> &dyn FundRepo {
        self
    }

    fn paych(&self) -> &dyn PaychRepo {
        self
    }

    fn asks(&self) -> &dyn AskRepo {
        self
    }

    async fn transaction(&self, f: &mut TxFn<'_>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut view = SqliteTx { conn: &tx };
            let view: &mut dyn StorageDealTx = &mut view;
            // Dropping `tx` on error rolls back.
            f(view)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn raw_keys(&self, table: Table) -> Result<Vec<String>> {
        let key_expr = match table {
            Table::StorageDeals => first_key_field::<MinerDeal>().to_string(),
            Table::RetrievalDeals => "receiver || '/' || deal_id".to_string(),
            Table::FundedAddresses => first_key_field::<FundedAddressState>().to_string(),
            Table::ChannelInfos => first_key_field::<ChannelInfo>().to_string(),
            Table::MsgInfos => first_key_field::<MsgInfo>().to_string(),
            Table::StorageAsks => first_key_field::<SignedStorageAsk>().to_string(),
            Table::RetrievalAsks => first_key_field::<RetrievalAsk>().to_string(),
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {key} FROM {table} ORDER BY {key}",
            key = key_expr,
            table = table.name()
        ))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
