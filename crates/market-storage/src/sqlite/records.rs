use super::columns::{
    flag, int, json, opt_json, opt_text, opt_uint, text, uint, Columns, SqlRecord,
};
use crate::error::{Result, StoreError};
use crate::key::Table;
use market_types::{
    ChannelDirection, ChannelInfo, ClientDealProposal, DealProposal, FundedAddressState,
    MinerDeal, MsgInfo, PeerId, ProviderDealState, RetrievalAsk, RetrievalDealStatus,
    RetrievalParams, SignedStorageAsk, StorageAsk, StorageDealStatus,
};
use rusqlite::types::Value;

impl SqlRecord for MinerDeal {
    const TABLE: Table = Table::StorageDeals;
    const FIELDS: &'static [&'static str] = &[
        "proposal_cid",
        "piece_cid",
        "piece_size",
        "verified_deal",
        "client_addr",
        "provider_addr",
        "label",
        "start_epoch",
        "end_epoch",
        "storage_price_per_epoch",
        "provider_collateral",
        "client_collateral",
        "client_signature",
        "client_peer",
        "miner_peer",
        "state",
        "message",
        "ref_payload_root",
        "piece_path",
        "funds_reserved",
        "publish_cid",
        "deal_id",
        "sector_number",
        "piece_offset",
        "transfer_channel_id",
        "available_for_retrieval",
        "created_at",
        "updated_at",
    ];

    fn bind(&self) -> Result<Vec<Value>> {
        let p = &self.client_deal_proposal.proposal;
        Ok(vec![
            text(self.proposal_cid),
            text(p.piece_cid),
            uint(p.piece_size)?,
            flag(p.verified_deal),
            text(p.client),
            text(p.provider),
            text(&p.label),
            int(p.start_epoch),
            int(p.end_epoch),
            text(p.storage_price_per_epoch),
            text(p.provider_collateral),
            text(p.client_collateral),
            json(&self.client_deal_proposal.client_signature)?,
            text(&self.client),
            text(&self.miner),
            int(self.state.code() as i64),
            text(&self.message),
            text(self.ref_payload_root),
            opt_text(self.piece_path.as_ref()),
            text(self.funds_reserved),
            opt_text(self.publish_cid),
            opt_uint(self.deal_id)?,
            opt_uint(self.sector_number)?,
            opt_uint(self.offset)?,
            opt_json(self.transfer_channel_id.as_ref())?,
            flag(self.available_for_retrieval),
            int(self.created_at),
            int(self.updated_at),
        ])
    }

    fn decode(c: &Columns) -> Result<Self> {
        let proposal = DealProposal {
            piece_cid: c.parse(1)?,
            piece_size: c.u64(2)?,
            verified_deal: c.flag(3)?,
            client: c.parse(4)?,
            provider: c.parse(5)?,
            label: c.text(6)?.to_string(),
            start_epoch: c.int(7)?,
            end_epoch: c.int(8)?,
            storage_price_per_epoch: c.parse(9)?,
            provider_collateral: c.parse(10)?,
            client_collateral: c.parse(11)?,
        };
        Ok(MinerDeal {
            proposal_cid: c.parse(0)?,
            client_deal_proposal: ClientDealProposal {
                proposal,
                client_signature: c.json(12)?,
            },
            client: PeerId::new(c.text(13)?),
            miner: PeerId::new(c.text(14)?),
            state: storage_status(c, 15)?,
            message: c.text(16)?.to_string(),
            ref_payload_root: c.parse(17)?,
            piece_path: c.opt_text(18)?.map(str::to_string),
            funds_reserved: c.parse(19)?,
            publish_cid: c.opt_parse(20)?,
            deal_id: c.opt_u64(21)?,
            sector_number: c.opt_u64(22)?,
            offset: c.opt_u64(23)?,
            transfer_channel_id: c.opt_json(24)?,
            available_for_retrieval: c.flag(25)?,
            created_at: c.int(26)?,
            updated_at: c.int(27)?,
        })
    }
}

fn storage_status(c: &Columns, i: usize) -> Result<StorageDealStatus> {
    let code = u32::try_from(c.int(i)?).map_err(|e| decode_err(c, e))?;
    StorageDealStatus::from_code(code).map_err(|e| decode_err(c, e))
}

fn retrieval_status(c: &Columns, i: usize) -> Result<RetrievalDealStatus> {
    let code = u32::try_from(c.int(i)?).map_err(|e| decode_err(c, e))?;
    RetrievalDealStatus::from_code(code).map_err(|e| decode_err(c, e))
}

fn decode_err(c: &Columns, e: impl std::fmt::Display) -> StoreError {
    StoreError::Decode {
        key: c.key(),
        reason: e.to_string(),
    }
}

impl SqlRecord for ProviderDealState {
    const TABLE: Table = Table::RetrievalDeals;
    const FIELDS: &'static [&'static str] = &[
        "receiver",
        "deal_id",
        "payload_cid",
        "piece_cid",
        "price_per_byte",
        "unseal_price",
        "payment_interval",
        "payment_interval_increase",
        "status",
        "channel_id",
        "store_id",
        "funds_received",
        "total_sent",
        "current_interval",
        "message",
        "created_at",
        "updated_at",
    ];
    const KEY_LEN: usize = 2;

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            text(&self.receiver),
            uint(self.deal_id)?,
            text(self.params.payload_cid),
            opt_text(self.params.piece_cid),
            text(self.params.price_per_byte),
            text(self.params.unseal_price),
            uint(self.params.payment_interval)?,
            uint(self.params.payment_interval_increase)?,
            int(self.status.code() as i64),
            opt_json(self.channel_id.as_ref())?,
            opt_uint(self.store_id)?,
            text(self.funds_received),
            uint(self.total_sent)?,
            uint(self.current_interval)?,
            text(&self.message),
            int(self.created_at),
            int(self.updated_at),
        ])
    }

    fn decode(c: &Columns) -> Result<Self> {
        Ok(ProviderDealState {
            receiver: PeerId::new(c.text(0)?),
            deal_id: c.u64(1)?,
            params: RetrievalParams {
                payload_cid: c.parse(2)?,
                piece_cid: c.opt_parse(3)?,
                price_per_byte: c.parse(4)?,
                unseal_price: c.parse(5)?,
                payment_interval: c.u64(6)?,
                payment_interval_increase: c.u64(7)?,
            },
            status: retrieval_status(c, 8)?,
            channel_id: c.opt_json(9)?,
            store_id: c.opt_u64(10)?,
            funds_received: c.parse(11)?,
            total_sent: c.u64(12)?,
            current_interval: c.u64(13)?,
            message: c.text(14)?.to_string(),
            created_at: c.int(15)?,
            updated_at: c.int(16)?,
        })
    }
}

impl SqlRecord for FundedAddressState {
    const TABLE: Table = Table::FundedAddresses;
    const FIELDS: &'static [&'static str] = &["addr", "wallet", "amt_reserved", "msg_cid"];

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            text(self.addr),
            opt_text(self.wallet),
            text(self.amt_reserved),
            opt_text(self.msg_cid),
        ])
    }

    fn decode(c: &Columns) -> Result<Self> {
        Ok(FundedAddressState {
            addr: c.parse(0)?,
            wallet: c.opt_parse(1)?,
            amt_reserved: c.parse(2)?,
            msg_cid: c.opt_parse(3)?,
        })
    }
}

impl SqlRecord for ChannelInfo {
    const TABLE: Table = Table::ChannelInfos;
    const FIELDS: &'static [&'static str] = &[
        "channel_id",
        "channel_addr",
        "control",
        "target",
        "direction",
        "vouchers",
        "next_lane",
        "amount",
        "pending_amount",
        "create_msg",
        "add_funds_msg",
        "settling",
    ];

    fn bind(&self) -> Result<Vec<Value>> {
        let direction = match self.direction {
            ChannelDirection::Inbound => 1,
            ChannelDirection::Outbound => 2,
        };
        Ok(vec![
            text(&self.channel_id),
            opt_text(self.channel),
            text(self.control),
            text(self.target),
            int(direction),
            json(&self.vouchers)?,
            uint(self.next_lane)?,
            text(self.amount),
            text(self.pending_amount),
            opt_text(self.create_msg),
            opt_text(self.add_funds_msg),
            flag(self.settling),
        ])
    }

    fn decode(c: &Columns) -> Result<Self> {
        let direction = match c.int(4)? {
            1 => ChannelDirection::Inbound,
            2 => ChannelDirection::Outbound,
            other => return Err(decode_err(c, format!("unknown direction {}", other))),
        };
        Ok(ChannelInfo {
            channel_id: c.text(0)?.to_string(),
            channel: c.opt_parse(1)?,
            control: c.parse(2)?,
            target: c.parse(3)?,
            direction,
            vouchers: c.json(5)?,
            next_lane: c.u64(6)?,
            amount: c.parse(7)?,
            pending_amount: c.parse(8)?,
            create_msg: c.opt_parse(9)?,
            add_funds_msg: c.opt_parse(10)?,
            settling: c.flag(11)?,
        })
    }
}

impl SqlRecord for MsgInfo {
    const TABLE: Table = Table::MsgInfos;
    const FIELDS: &'static [&'static str] = &["msg_cid", "channel_id", "received", "err"];

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            text(self.msg_cid),
            text(&self.channel_id),
            flag(self.received),
            text(&self.err),
        ])
    }

    fn decode(c: &Columns) -> Result<Self> {
        Ok(MsgInfo {
            msg_cid: c.parse(0)?,
            channel_id: c.text(1)?.to_string(),
            received: c.flag(2)?,
            err: c.text(3)?.to_string(),
        })
    }
}

impl SqlRecord for SignedStorageAsk {
    const TABLE: Table = Table::StorageAsks;
    const FIELDS: &'static [&'static str] = &[
        "miner",
        "price",
        "verified_price",
        "min_piece_size",
        "max_piece_size",
        "ask_timestamp",
        "expiry",
        "seq_no",
        "signature",
    ];

    fn bind(&self) -> Result<Vec<Value>> {
        let a = &self.ask;
        Ok(vec![
            text(a.miner),
            text(a.price),
            text(a.verified_price),
            uint(a.min_piece_size)?,
            uint(a.max_piece_size)?,
            int(a.timestamp),
            int(a.expiry),
            uint(a.seq_no)?,
            opt_json(self.signature.as_ref())?,
        ])
    }

    fn decode(c: &Columns) -> Result<Self> {
        Ok(SignedStorageAsk {
            ask: StorageAsk {
                miner: c.parse(0)?,
                price: c.parse(1)?,
                verified_price: c.parse(2)?,
                min_piece_size: c.u64(3)?,
                max_piece_size: c.u64(4)?,
                timestamp: c.int(5)?,
                expiry: c.int(6)?,
                seq_no: c.u64(7)?,
            },
            signature: c.opt_json(8)?,
        })
    }
}

impl SqlRecord for RetrievalAsk {
    const TABLE: Table = Table::RetrievalAsks;
    const FIELDS: &'static [&'static str] = &[
        "miner",
        "price_per_byte",
        "unseal_price",
        "payment_interval",
        "payment_interval_increase",
    ];

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            text(self.miner),
            text(self.price_per_byte),
            text(self.unseal_price),
            uint(self.payment_interval)?,
            uint(self.payment_interval_increase)?,
        ])
    }

    fn decode(c: &Columns) -> Result<Self> {
        Ok(RetrievalAsk {
            miner: c.parse(0)?,
            price_per_byte: c.parse(1)?,
            unseal_price: c.parse(2)?,
            payment_interval: c.u64(3)?,
            payment_interval_increase: c.u64(4)?,
        })
    }
}
