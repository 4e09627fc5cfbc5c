use crate::error::{Result, ScanResult, StoreError};
use crate::key::Table;
use crate::repo::Repo;
use serde::Serialize;
use serde_json::{json, Map, Value};

fn section<T: Serialize>(scan: ScanResult<T>) -> Result<Value> {
    let records = scan
        .items
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    let failures: Vec<Value> = scan
        .failures
        .iter()
        .map(|f| json!({ "key": f.key, "error": f.reason }))
        .collect();
    Ok(json!({ "records": records, "decode_failures": failures }))
}

/// Dump every table as JSON, keyed by table name.
pub async fn export_json(repo: &dyn Repo) -> Result<Value> {
    let mut out = Map::new();
    for table in Table::ALL {
        let value = match table {
            Table::StorageDeals => section(repo.storage_deals().list_deals().await?)?,
            Table::RetrievalDeals => section(repo.retrieval_deals().list_retrieval_deals().await?)?,
            Table::FundedAddresses => section(repo.funds().list_fund_states().await?)?,
            Table::ChannelInfos => section(repo.paych().list_channels().await?)?,
            Table::MsgInfos => section(repo.paych().list_msg_infos().await?)?,
            Table::StorageAsks => section(repo.asks().list_storage_asks().await?)?,
            Table::RetrievalAsks => section(repo.asks().list_retrieval_asks().await?)?,
        };
        out.insert(table.name().to_string(), value);
    }
    Ok(Value::Object(out))
}
