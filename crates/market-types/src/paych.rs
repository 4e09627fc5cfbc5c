use crate::address::Address;
use crate::amount::TokenAmount;
use crate::cid::Cid;
use crate::crypto::Signature;
use crate::error::{Result, TypesError};
use crate::tipset::ChainEpoch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelDirection {
    Inbound,
    Outbound,
}

/// Off-chain claim for a cumulative amount on one lane of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoucher {
    pub channel_addr: Address,
    pub time_lock_min: ChainEpoch,
    pub time_lock_max: ChainEpoch,
    pub secret_hash: Vec<u8>,
    pub lane: u64,
    pub nonce: u64,
    pub amount: TokenAmount,
    pub min_settle_height: ChainEpoch,
    pub signature: Option<Signature>,
}

impl SignedVoucher {
    pub fn new(channel_addr: Address, lane: u64, nonce: u64, amount: TokenAmount) -> Self {
        Self {
            channel_addr,
            time_lock_min: 0,
            time_lock_max: 0,
            secret_hash: Vec::new(),
            lane,
            nonce,
            amount,
            min_settle_height: 0,
            signature: None,
        }
    }

    /// Bytes covered by the signature: the voucher with the signature cleared.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        bincode::serialize(&unsigned).map_err(|e| TypesError::Encoding(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherInfo {
    pub voucher: SignedVoucher,
    pub proof: Vec<u8>,
    pub submitted: bool,
}

/// Highest nonce and amount seen on a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaneState {
    pub nonce: u64,
    pub redeemed: TokenAmount,
}

/// Local bookkeeping for one payment channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Local identifier; stable before the on-chain address is known.
    pub channel_id: String,
    pub channel: Option<Address>,
    pub control: Address,
    pub target: Address,
    pub direction: ChannelDirection,
    pub vouchers: Vec<VoucherInfo>,
    pub next_lane: u64,
    /// Confirmed amount sent to the channel.
    pub amount: TokenAmount,
    /// Amount in flight in a create or add-funds message.
    pub pending_amount: TokenAmount,
    pub create_msg: Option<Cid>,
    pub add_funds_msg: Option<Cid>,
    pub settling: bool,
}

impl ChannelInfo {
    pub fn new_outbound(channel_id: String, from: Address, to: Address) -> Self {
        Self {
            channel_id,
            channel: None,
            control: from,
            target: to,
            direction: ChannelDirection::Outbound,
            vouchers: Vec::new(),
            next_lane: 0,
            amount: TokenAmount::ZERO,
            pending_amount: TokenAmount::ZERO,
            create_msg: None,
            add_funds_msg: None,
            settling: false,
        }
    }

    pub fn new_inbound(channel_id: String, channel: Address, from: Address, to: Address) -> Self {
        Self {
            channel: Some(channel),
            direction: ChannelDirection::Inbound,
            ..Self::new_outbound(channel_id, to, from)
        }
    }

    /// Payer of the channel.
    pub fn from(&self) -> Address {
        match self.direction {
            ChannelDirection::Outbound => self.control,
            ChannelDirection::Inbound => self.target,
        }
    }

    /// Payee of the channel.
    pub fn to(&self) -> Address {
        match self.direction {
            ChannelDirection::Outbound => self.target,
            ChannelDirection::Inbound => self.control,
        }
    }

    pub fn lane_states(&self) -> BTreeMap<u64, LaneState> {
        let mut lanes: BTreeMap<u64, LaneState> = BTreeMap::new();
        for info in &self.vouchers {
            let v = &info.voucher;
            let lane = lanes.entry(v.lane).or_default();
            lane.nonce = lane.nonce.max(v.nonce);
            lane.redeemed = lane.redeemed.max(v.amount);
        }
        lanes
    }

    pub fn lane_state(&self, lane: u64) -> LaneState {
        self.lane_states().remove(&lane).unwrap_or_default()
    }

    /// Sum of the highest voucher amount on every lane.
    pub fn redeemed_total(&self) -> TokenAmount {
        self.lane_states().values().map(|l| l.redeemed).sum()
    }

    pub fn has_voucher(&self, voucher: &SignedVoucher) -> bool {
        self.vouchers.iter().any(|v| &v.voucher == voucher)
    }
}

/// Tracks a message sent on behalf of a channel until its result is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub channel_id: String,
    pub msg_cid: Cid,
    pub received: bool,
    pub err: String,
}

/// Funds reserved against an address's market escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundedAddressState {
    pub addr: Address,
    pub wallet: Option<Address>,
    pub amt_reserved: TokenAmount,
    /// Last AddBalance message sent for this address, if any.
    pub msg_cid: Option<Cid>,
}

impl FundedAddressState {
    pub fn new(addr: Address) -> Self {
        Self {
            addr,
            wallet: None,
            amt_reserved: TokenAmount::ZERO,
            msg_cid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voucher(lane: u64, nonce: u64, amount: u128) -> VoucherInfo {
        VoucherInfo {
            voucher: SignedVoucher::new(Address::new_id(100), lane, nonce, TokenAmount::from_atto(amount)),
            proof: Vec::new(),
            submitted: false,
        }
    }

    #[test]
    fn test_lane_states() {
        let mut ci = ChannelInfo::new_outbound("ch".into(), Address::new_id(1), Address::new_id(2));
        ci.vouchers.push(voucher(0, 1, 10));
        ci.vouchers.push(voucher(0, 2, 25));
        ci.vouchers.push(voucher(1, 1, 5));

        let lanes = ci.lane_states();
        assert_eq!(lanes[&0].nonce, 2);
        assert_eq!(lanes[&0].redeemed, TokenAmount::from_atto(25));
        assert_eq!(ci.redeemed_total(), TokenAmount::from_atto(30));
        assert_eq!(ci.lane_state(7), LaneState::default());
    }

    #[test]
    fn test_direction() {
        let from = Address::new_id(1);
        let to = Address::new_id(2);
        let inbound = ChannelInfo::new_inbound("in".into(), Address::new_id(9), from, to);
        assert_eq!(inbound.from(), from);
        assert_eq!(inbound.to(), to);
        let outbound = ChannelInfo::new_outbound("out".into(), from, to);
        assert_eq!(outbound.from(), from);
        assert_eq!(outbound.to(), to);
    }

    #[test]
    fn test_signing_bytes_ignore_signature() {
        let mut v = SignedVoucher::new(Address::new_id(3), 0, 1, TokenAmount::from_atto(1));
        let unsigned = v.signing_bytes().unwrap();
        v.signature = Some(Signature::new_ed25519(vec![1; 64]));
        assert_eq!(v.signing_bytes().unwrap(), unsigned);
    }
}
