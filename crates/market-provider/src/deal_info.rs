use crate::error::{ProviderError, Result};
use market_chain::ChainApi;
use market_types::message::{decode_params, PublishStorageDealsParams, PublishStorageDealsReturn};
use market_types::{Cid, DealId, DealProposal, MarketDeal, TipSetKey};
use std::sync::Arc;
use tracing::debug;

/// Deal id and on-chain state of a published deal as seen at some tipset.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentDealInfo {
    pub deal_id: DealId,
    pub market_deal: MarketDeal,
    pub publish_msg_tsk: TipSetKey,
}

/// Finds the deal id a proposal was given by its publish message.
///
/// Deal ids are assigned when the publish message executes, so a reorg can
/// change them. Looking the id up again from the message receipt at the
/// tipset of interest keeps callers correct across reorgs.
#[derive(Clone)]
pub struct DealInfoResolver {
    chain: Arc<dyn ChainApi>,
}

impl DealInfoResolver {
    pub fn new(chain: Arc<dyn ChainApi>) -> Self {
        Self { chain }
    }

    pub async fn get_current_deal_info(
        &self,
        tsk: &TipSetKey,
        proposal: &DealProposal,
        publish_cid: &Cid,
    ) -> Result<CurrentDealInfo> {
        let (deal_id, publish_msg_tsk) = self.deal_id_from_publish_msg(proposal, publish_cid).await?;

        let market_deal = self.chain.state_market_storage_deal(deal_id, tsk).await?;
        if &market_deal.proposal != proposal {
            return Err(ProviderError::DealInfo(format!(
                "deal {} on chain does not match the local proposal for piece {}",
                deal_id, proposal.piece_cid
            )));
        }

        Ok(CurrentDealInfo {
            deal_id,
            market_deal,
            publish_msg_tsk,
        })
    }

    /// Deal id given to `proposal` by its publish message, with the tipset
    /// the message executed in. Does not read the deal state.
    pub async fn deal_id_from_publish_msg(
        &self,
        proposal: &DealProposal,
        publish_cid: &Cid,
    ) -> Result<(DealId, TipSetKey)> {
        let lookup = self
            .chain
            .state_search_msg(publish_cid)
            .await?
            .ok_or_else(|| {
                ProviderError::DealInfo(format!("publish message {} not found on chain", publish_cid))
            })?;
        if !lookup.receipt.is_success() {
            return Err(ProviderError::PublishFailed {
                cid: lookup.message,
                exit_code: lookup.receipt.exit_code,
            });
        }

        let msg = self.chain.chain_get_message(&lookup.message).await?;
        let params: PublishStorageDealsParams = decode_params(&msg.params)?;
        let ret: PublishStorageDealsReturn = decode_params(&lookup.receipt.return_data)?;

        let index = params
            .deals
            .iter()
            .position(|d| &d.proposal == proposal)
            .ok_or_else(|| {
                ProviderError::DealInfo(format!(
                    "proposal for piece {} not in publish message {}",
                    proposal.piece_cid, publish_cid
                ))
            })?;
        let deal_id = *ret.ids.get(index).ok_or_else(|| {
            ProviderError::DealInfo(format!(
                "publish message {} returned {} ids for {} deals",
                publish_cid,
                ret.ids.len(),
                params.deals.len()
            ))
        })?;

        debug!(msg = %publish_cid, deal_id, index, "resolved deal id from publish message");
        Ok((deal_id, lookup.tipset))
    }
}
