//! Subscription documents for the realtime service and the payloads they
//! produce.
//!
//! The client treats queries as opaque strings; these builders are a
//! convenience for the common event types. Each returns a [`GqlRequest`],
//! which carries the variables the document declares, if any.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A subscription document plus its variables.
#[derive(Clone, Debug, PartialEq)]
pub struct GqlRequest {
    pub query: String,
    pub variables: Option<Value>,
}

/// Filters for NFT sale events. Unset fields subscribe to every collection
/// or network.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NftSalesParams {
    pub contract_address: Option<String>,
    pub network_id: Option<u64>,
}

/// Filters for token price updates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenPriceParams {
    pub contract_address: Option<String>,
    pub network_id: Option<u64>,
}

/// Selects the pair whose chart bars to stream. The address may be the
/// token's or the pair's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenChartParams {
    pub contract_address_or_pair_address: String,
    pub network_id: u64,
}

/// Selects the pair whose swaps to stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenSwapParams {
    pub contract_address_or_pair_address: String,
    pub network_id: u64,
}

impl TokenChartParams {
    /// `address:networkId`, the key the service indexes pairs by.
    pub fn pair_id(&self) -> String {
        format!("{}:{}", self.contract_address_or_pair_address, self.network_id)
    }
}

impl TokenSwapParams {
    pub fn pair_id(&self) -> String {
        format!("{}:{}", self.contract_address_or_pair_address, self.network_id)
    }
}

const NFT_EVENT_FIELDS: &str = "    address
    id
    networkId
    events {
      id
      tokenId
      aggregatorAddress
      blockNumber
      contractAddress
      eventType
      exchangeAddress
      data {
        buyHash
        maker
        metadata
        price
        sellHash
        taker
        type
      }
      taker
      timestamp
      numberOfTokens
      transactionHash
      logIndex
      maker
      networkId
      totalPriceNetworkBaseToken
      totalPriceUsd
      transactionIndex
      individualPrice
      individualPriceUsd
      individualPriceNetworkBaseToken
      paymentTokenAddress
      poolAddress
      sortKey
      totalPrice
    }";

const PRICE_SUBSCRIPTION: &str = "subscription UpdatePrice($address: String, $networkId: Int) {
  onUpdatePrice(address: $address, networkId: $networkId) {
    address
    networkId
    priceUsd
    timestamp
  }
}
";

const SWAP_SUBSCRIPTION: &str = "subscription CreateEvents($id: String) {
  onCreateEvents(id: $id) {
    address
    id
    networkId
    events {
      address
      baseTokenPrice
      blockHash
      blockNumber
      eventDisplayType
      eventType
      logIndex
      maker
      timestamp
      token0SwapValueUsd
      token1SwapValueUsd
      transactionHash
      transactionIndex
      data {
        ... on SwapEventData {
          amount0
          amount1
          amountNonLiquidityToken
          priceBaseToken
          priceBaseTokenTotal
          priceUsd
          priceUsdTotal
          type
        }
      }
    }
  }
}
";

/// Bar resolutions requested by [`token_chart_subscription`].
pub const CHART_RESOLUTIONS: [&str; 8] = ["r1", "r5", "r15", "r60", "r240", "r720", "r1D", "r7D"];

/// Builds the `onCreateNftEvents` subscription document. Filters are inlined
/// into the argument list.
pub fn nft_sales_subscription(params: &NftSalesParams) -> GqlRequest {
    let args = render_args(params.contract_address.as_deref(), params.network_id);
    GqlRequest {
        query: format!(
            "subscription NftSaleEventSubscription {{\n  onCreateNftEvents{args} {{\n{NFT_EVENT_FIELDS}\n  }}\n}}\n"
        ),
        variables: None,
    }
}

/// Builds the `onUpdatePrice` subscription. Unset filters are left out of
/// the variables, which the service treats as a wildcard.
pub fn token_price_subscription(params: &TokenPriceParams) -> GqlRequest {
    let mut variables = Map::new();
    if let Some(address) = params.contract_address.as_ref() {
        variables.insert("address".to_string(), Value::from(address.as_str()));
    }
    if let Some(network_id) = params.network_id {
        variables.insert("networkId".to_string(), Value::from(network_id));
    }
    GqlRequest {
        query: PRICE_SUBSCRIPTION.to_string(),
        variables: Some(Value::Object(variables)),
    }
}

/// Builds the `onUpdateAggregateBatch` subscription for one pair.
pub fn token_chart_subscription(params: &TokenChartParams) -> GqlRequest {
    let mut query = String::from(
        "subscription UpdateAggregateBatch($pairId: String) {\n  onUpdateAggregateBatch(pairId: $pairId) {\n    eventSortKey\n    networkId\n    pairAddress\n    pairId\n    timestamp\n    aggregates {\n",
    );
    for resolution in CHART_RESOLUTIONS {
        query.push_str(&format!(
            "      {resolution} {{\n        t\n        usd {{ t o h l c volume }}\n        token {{ t o h l c volume }}\n      }}\n"
        ));
    }
    query.push_str("    }\n  }\n}\n");

    GqlRequest {
        query,
        variables: Some(serde_json::json!({ "pairId": params.pair_id() })),
    }
}

/// Builds the `onCreateEvents` subscription for one pair.
pub fn token_swap_subscription(params: &TokenSwapParams) -> GqlRequest {
    GqlRequest {
        query: SWAP_SUBSCRIPTION.to_string(),
        variables: Some(serde_json::json!({ "id": params.pair_id() })),
    }
}

fn render_args(address: Option<&str>, network_id: Option<u64>) -> String {
    let mut args = Vec::new();
    if let Some(address) = address {
        args.push(format!("address: {}", Value::String(address.to_string())));
    }
    if let Some(network_id) = network_id {
        args.push(format!("networkId: {network_id}"));
    }
    if args.is_empty() {
        String::new()
    } else {
        format!("({})", args.join(", "))
    }
}

/// `data` payload of an NFT sale subscription.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NftEventsData {
    pub on_create_nft_events: NftEventsBatch,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NftEventsBatch {
    pub address: String,
    #[serde(default)]
    pub id: Option<String>,
    pub network_id: u64,
    #[serde(default)]
    pub events: Vec<NftEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NftEvent {
    pub id: String,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub exchange_address: Option<String>,
    #[serde(default)]
    pub maker: Option<String>,
    #[serde(default)]
    pub taker: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub total_price_usd: Option<String>,
    #[serde(default)]
    pub total_price: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// `data` payload of a token price subscription.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPriceData {
    pub on_update_price: PriceUpdate,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub address: String,
    pub network_id: u64,
    pub price_usd: f64,
    pub timestamp: i64,
}

/// `data` payload of a token chart subscription.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenChartData {
    pub on_update_aggregate_batch: AggregateBatch,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBatch {
    #[serde(default)]
    pub event_sort_key: Option<String>,
    pub network_id: u64,
    pub pair_address: String,
    #[serde(default)]
    pub pair_id: Option<String>,
    pub timestamp: i64,
    /// Bars keyed by resolution (`r1`, `r60`, `r1D`, ...). Resolutions
    /// without activity are `null` or absent.
    #[serde(default)]
    pub aggregates: HashMap<String, Option<ResolutionBar>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolutionBar {
    pub t: i64,
    #[serde(default)]
    pub usd: Option<Bar>,
    #[serde(default)]
    pub token: Option<Bar>,
}

/// One OHLCV bar. `volume` is a decimal string.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    #[serde(default)]
    pub volume: Option<String>,
}

/// `data` payload of a token swap subscription.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenSwapData {
    pub on_create_events: SwapEventBatch,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwapEventBatch {
    pub address: String,
    #[serde(default)]
    pub id: Option<String>,
    pub network_id: u64,
    #[serde(default)]
    pub events: Vec<SwapEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwapEvent {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub event_display_type: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub maker: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub token0_swap_value_usd: Option<String>,
    #[serde(default)]
    pub token1_swap_value_usd: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl NftEventsData {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

impl TokenPriceData {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

impl TokenChartData {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

impl TokenSwapData {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
