//! Blockchain node JSON-RPC collaborator.
//!
//! The pool consults a geth-family node for work templates, canonical blocks
//! and uncles, transaction receipts, and block submission. [`NodeRpc`]
//! abstracts the node so the share pipeline and the unlocker can run against
//! channel-free mocks in tests; [`HttpNodeRpc`] is the production client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Block as returned by `eth_getBlockByNumber` and the uncle query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub hash: String,
    /// Geth-style blocks carry the sealing nonce directly.
    #[serde(default)]
    pub nonce: String,
    /// Parity-style blocks carry `[mixDigest, nonce]` instead.
    #[serde(default)]
    pub seal_fields: Vec<String>,
    #[serde(default)]
    pub uncles: Vec<String>,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
    #[serde(default)]
    pub difficulty: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub gas_price: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    #[serde(default)]
    pub gas_used: String,
}

/// Node operations the core depends on.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// `[header hash, seed, boundary]` for the next block to mine.
    async fn get_work(&self) -> anyhow::Result<[String; 3]>;

    async fn get_pending_block(&self) -> anyhow::Result<RpcBlock>;

    /// `None` when the node has no canonical block at this height.
    async fn get_block_by_height(&self, height: u64) -> anyhow::Result<Option<RpcBlock>>;

    async fn get_uncle_by_block_number_and_index(
        &self,
        height: u64,
        index: usize,
    ) -> anyhow::Result<Option<RpcBlock>>;

    async fn get_tx_receipt(&self, hash: &str) -> anyhow::Result<Option<TxReceipt>>;

    /// Submit `[nonce, header hash, mix digest]`; the node answers whether it
    /// accepted the solution.
    async fn submit_block(&self, params: &[String]) -> anyhow::Result<bool>;
}

/// JSON-RPC 2.0 client over HTTP.
pub struct HttpNodeRpc {
    name: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcCall<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl HttpNodeRpc {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> anyhow::Result<T> {
        let call = RpcCall {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let envelope: RpcEnvelope = self
            .client
            .post(&self.url)
            .json(&call)
            .send()
            .await
            .with_context(|| format!("{}: {} request failed", self.name, method))?
            .error_for_status()
            .with_context(|| format!("{}: {} http error", self.name, method))?
            .json()
            .await
            .with_context(|| format!("{}: {} malformed response", self.name, method))?;

        if let Some(err) = envelope.error {
            bail!(
                "{}: {} rpc error: {} (code {})",
                self.name,
                method,
                err.message,
                err.code
            );
        }
        let result = envelope.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .with_context(|| format!("{}: {} unexpected result shape", self.name, method))
    }
}

#[async_trait]
impl NodeRpc for HttpNodeRpc {
    async fn get_work(&self) -> anyhow::Result<[String; 3]> {
        let work: Vec<String> = self.call("eth_getWork", json!([])).await?;
        work.try_into()
            .map_err(|w: Vec<String>| anyhow!("eth_getWork returned {} fields", w.len()))
    }

    async fn get_pending_block(&self) -> anyhow::Result<RpcBlock> {
        self.call("eth_getBlockByNumber", json!(["pending", false]))
            .await
    }

    async fn get_block_by_height(&self, height: u64) -> anyhow::Result<Option<RpcBlock>> {
        self.call(
            "eth_getBlockByNumber",
            json!([format!("0x{height:x}"), true]),
        )
        .await
    }

    async fn get_uncle_by_block_number_and_index(
        &self,
        height: u64,
        index: usize,
    ) -> anyhow::Result<Option<RpcBlock>> {
        self.call(
            "eth_getUncleByBlockNumberAndIndex",
            json!([format!("0x{height:x}"), format!("0x{index:x}")]),
        )
        .await
    }

    async fn get_tx_receipt(&self, hash: &str) -> anyhow::Result<Option<TxReceipt>> {
        self.call("eth_getTransactionReceipt", json!([hash])).await
    }

    async fn submit_block(&self, params: &[String]) -> anyhow::Result<bool> {
        self.call("eth_submitWork", json!(params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_deserializes_geth_shape() {
        let block: RpcBlock = serde_json::from_str(
            r#"{
                "number": "0x1b4",
                "hash": "0xdeadbeef",
                "nonce": "0x689056015818adbe",
                "uncles": ["0x01"],
                "difficulty": "0x27f1e",
                "transactions": [{"hash": "0xabc", "gasPrice": "0x9184e72a000"}]
            }"#,
        )
        .unwrap();
        assert_eq!(block.number, "0x1b4");
        assert_eq!(block.nonce, "0x689056015818adbe");
        assert!(block.seal_fields.is_empty());
        assert_eq!(block.transactions[0].gas_price, "0x9184e72a000");
    }

    #[test]
    fn block_deserializes_parity_seal_fields() {
        let block: RpcBlock = serde_json::from_str(
            r#"{"number": "0x1", "hash": "0x02", "sealFields": ["0xaa", "0xbb"]}"#,
        )
        .unwrap();
        assert!(block.nonce.is_empty());
        assert_eq!(block.seal_fields, vec!["0xaa", "0xbb"]);
    }

    #[test]
    fn receipt_defaults_missing_fields() {
        let receipt: TxReceipt = serde_json::from_str("{}").unwrap();
        assert!(receipt.gas_used.is_empty());
    }
}
