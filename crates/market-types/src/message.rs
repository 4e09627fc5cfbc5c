use crate::address::Address;
use crate::amount::TokenAmount;
use crate::cid::Cid;
use crate::deal::{ClientDealProposal, DealId};
use crate::error::{Result, TypesError};
use crate::tipset::{ChainEpoch, TipSetKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Actor methods the market node invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Send,
    AddBalance,
    PublishStorageDeals,
    PaychCreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub value: TokenAmount,
    pub method: Method,
    pub params: Vec<u8>,
}

impl Message {
    pub fn new(from: Address, to: Address, value: TokenAmount, method: Method, params: Vec<u8>) -> Self {
        Self {
            from,
            to,
            nonce: 0,
            value,
            method,
            params,
        }
    }

    pub fn cid(&self) -> Result<Cid> {
        Cid::of_serialized(self)
    }
}

/// Well-known singleton actors.
pub mod actors {
    use crate::address::Address;

    pub const MARKET_ACTOR: Address = Address::Id(5);
    pub const INIT_ACTOR: Address = Address::Id(1);
}

pub const EXIT_CODE_OK: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub exit_code: i64,
    pub return_data: Vec<u8>,
    pub gas_used: i64,
}

impl MessageReceipt {
    pub fn ok(return_data: Vec<u8>) -> Self {
        Self {
            exit_code: EXIT_CODE_OK,
            return_data,
            gas_used: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_CODE_OK
    }
}

/// Where and how a message landed on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLookup {
    pub message: Cid,
    pub receipt: MessageReceipt,
    pub tipset: TipSetKey,
    pub height: ChainEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishStorageDealsParams {
    pub deals: Vec<ClientDealProposal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishStorageDealsReturn {
    pub ids: Vec<DealId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaychCreateParams {
    pub from: Address,
    pub to: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaychCreateReturn {
    pub id_address: Address,
    pub robust_address: Address,
}

pub fn encode_params<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| TypesError::Encoding(e.to_string()))
}

pub fn decode_params<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| TypesError::Encoding(e.to_string()))
}
