//! Tool trait, registry, and data-provider clients
//!
//! Tools are pure lookups with no side effects on session state.
//! Provider failures degrade to explanatory text so a stage never
//! crashes on an outage.

use crate::error::AdvisoryError;
use crate::llm::ToolSpec;
use crate::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Trait for a single tool callable from the tool loop.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON-schema argument spec advertised to the model.
    fn parameters(&self) -> Value;
    async fn execute(&self, arguments: &Value) -> Result<String>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.order.push(tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Catalog in registration order, for the completion request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(*name))
            .map(|tool| ToolSpec {
                name: tool.name(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn string_arg<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn require_string_arg(arguments: &Value, key: &str) -> Result<String> {
    string_arg(arguments, key)
        .map(str::to_string)
        .ok_or_else(|| {
            AdvisoryError::InvalidToolInput(format!("Expected '{}' in tool arguments", key))
        })
}

fn pooled_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .expect("Failed to build HTTP client")
}

/// =============================
/// Web / News Search Provider
/// =============================

#[derive(Clone)]
pub struct TavilySearchClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TavilySearchClient {
    pub fn from_env() -> Self {
        Self {
            client: pooled_client(30),
            api_key: env::var("TAVILY_API_KEY").unwrap_or_default(),
            base_url: env::var("TAVILY_BASE_URL")
                .unwrap_or_else(|_| "https://api.tavily.com/search".to_string()),
        }
    }

    /// Run a search; `topic` narrows to the provider's news index.
    pub async fn search(
        &self,
        query: &str,
        topic: Option<&str>,
        max_results: u32,
    ) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AdvisoryError::ProviderError(
                "TAVILY_API_KEY not configured".to_string(),
            ));
        }

        let mut payload = json!({
            "api_key": self.api_key,
            "query": query,
            "search_depth": "basic",
            "max_results": max_results,
        });
        if let Some(topic) = topic {
            payload["topic"] = json!(topic);
        }

        let response = self
            .client
            .post(&self.base_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdvisoryError::ProviderError(format!("Web search failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AdvisoryError::ProviderError(format!(
                "Web search returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdvisoryError::ProviderError(format!("Web search parse error: {}", e)))?;

        let results = body.get("results").cloned().unwrap_or(Value::Array(vec![]));
        Ok(results.to_string())
    }
}

/// =============================
/// Market Data Provider
/// =============================

/// Index aliases accepted in place of a raw ticker.
const SYMBOL_MAP: &[(&str, &str)] = &[
    ("KOSPI", "^KS11"),
    ("KOSDAQ", "^KQ11"),
    ("S&P500", "^GSPC"),
    ("NASDAQ", "^IXIC"),
    ("VIX", "^VIX"),
    ("USD/KRW", "KRW=X"),
    ("GOLD", "GC=F"),
    ("BITCOIN", "BTC-USD"),
];

/// Six-digit codes are domestic listings; anything else goes to the
/// global quote path.
pub fn is_domestic_code(ticker: &str) -> bool {
    ticker.len() == 6 && ticker.chars().all(|c| c.is_ascii_digit())
}

pub fn resolve_symbol(ticker: &str) -> String {
    let cleaned = ticker.trim().to_uppercase();
    SYMBOL_MAP
        .iter()
        .find(|(alias, _)| *alias == cleaned)
        .map(|(_, symbol)| symbol.to_string())
        .unwrap_or(cleaned)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerEntry {
    pub name: String,
    pub code: String,
}

#[derive(Clone)]
pub struct MarketDataClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl MarketDataClient {
    pub fn from_env() -> Self {
        Self {
            client: pooled_client(30),
            base_url: env::var("MARKET_DATA_BASE_URL")
                .ok()
                .map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    fn base_url(&self) -> Result<&str> {
        self.base_url.as_deref().ok_or_else(|| {
            AdvisoryError::ProviderError("MARKET_DATA_BASE_URL not configured".to_string())
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url()?, path);

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| AdvisoryError::ProviderError(format!("Market data request failed: {}", e)))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            AdvisoryError::ProviderError(format!("Market data parse error: {}", e))
        })?;

        if !status.is_success() {
            return Err(AdvisoryError::ProviderError(format!(
                "Market data provider returned {}: {}",
                status, body
            )));
        }

        Ok(body)
    }

    /// Latest quote for a ticker (price, change, valuation when available).
    pub async fn quote(&self, ticker: &str) -> Result<Value> {
        let symbol = if is_domestic_code(ticker) {
            ticker.to_string()
        } else {
            resolve_symbol(ticker)
        };
        self.get_json("/quote", &[("ticker", symbol.as_str())]).await
    }

    /// Full listing of domestic tickers (name + code).
    pub async fn listing(&self) -> Result<Vec<TickerEntry>> {
        let body = self.get_json("/listing", &[]).await?;
        let entries: Vec<TickerEntry> = serde_json::from_value(body)
            .map_err(|e| AdvisoryError::ProviderError(format!("Malformed listing: {}", e)))?;
        Ok(entries)
    }
}

// Listing download is expensive; fetched once per process on first use.
static TICKER_LISTING: OnceCell<Vec<TickerEntry>> = OnceCell::const_new();

pub async fn cached_ticker_listing(market: &MarketDataClient) -> Result<&'static [TickerEntry]> {
    let listing = TICKER_LISTING
        .get_or_try_init(|| async {
            info!("Downloading ticker listing (only once)");
            market.listing().await
        })
        .await?;
    Ok(listing.as_slice())
}

/// =============================
/// Embedding + Document Search
/// =============================

#[derive(Clone)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl EmbeddingClient {
    pub fn from_env() -> Self {
        Self {
            client: pooled_client(60),
            base_url: env::var("EMBEDDING_BASE_URL")
                .ok()
                .map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let base = self.base_url.as_deref().ok_or_else(|| {
            AdvisoryError::ProviderError("EMBEDDING_BASE_URL not configured".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}/embed", base))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| AdvisoryError::ProviderError(format!("Embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AdvisoryError::ProviderError(format!(
                "Embedding provider returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            embedding: Vec<f32>,
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            AdvisoryError::ProviderError(format!("Embedding parse error: {}", e))
        })?;

        Ok(parsed.embedding)
    }
}

// Process-wide embedding handle, initialized on first use.
static EMBEDDING_CLIENT: OnceLock<EmbeddingClient> = OnceLock::new();

pub fn embedding_client() -> &'static EmbeddingClient {
    EMBEDDING_CLIENT.get_or_init(EmbeddingClient::from_env)
}

#[derive(Clone)]
pub struct DocumentSearchClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl DocumentSearchClient {
    pub fn from_env() -> Self {
        Self {
            client: pooled_client(60),
            base_url: env::var("DOCSEARCH_BASE_URL")
                .ok()
                .map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    /// Similarity search over the document corpus. Returns formatted
    /// matches or a "not found" line.
    pub async fn match_documents(
        &self,
        query: &str,
        match_threshold: f32,
        match_count: u32,
    ) -> Result<String> {
        let base = self.base_url.as_deref().ok_or_else(|| {
            AdvisoryError::ProviderError("DOCSEARCH_BASE_URL not configured".to_string())
        })?;

        let vector = embedding_client().embed(query).await?;

        let response = self
            .client
            .post(format!("{}/match_documents", base))
            .json(&json!({
                "query_embedding": vector,
                "match_threshold": match_threshold,
                "match_count": match_count,
            }))
            .send()
            .await
            .map_err(|e| {
                AdvisoryError::ProviderError(format!("Document search failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(AdvisoryError::ProviderError(format!(
                "Document search returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct DocumentMatch {
            title: Option<String>,
            content: Option<String>,
        }

        let matches: Vec<DocumentMatch> = response.json().await.map_err(|e| {
            AdvisoryError::ProviderError(format!("Document search parse error: {}", e))
        })?;

        if matches.is_empty() {
            return Ok("No related documents found.".to_string());
        }

        Ok(matches
            .iter()
            .map(|d| {
                format!(
                    "[Document: {}]\n{}",
                    d.title.as_deref().unwrap_or("untitled"),
                    d.content.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// =============================
/// Product Catalog (SQL)
/// =============================

/// Maps a stated risk profile onto catalog risk bands (1 = highest risk
/// appetite products, 6 = most defensive).
pub fn map_risk_bands(risk_profile: &str) -> Vec<i32> {
    let profile = risk_profile.to_lowercase();
    if profile.contains("aggressive") {
        vec![1, 2, 3]
    } else if profile.contains("moderate") {
        vec![3, 4]
    } else if profile.contains("conservative") {
        vec![4, 5, 6]
    } else {
        vec![1, 2, 3, 4, 5, 6]
    }
}

// Adjectives the model sometimes puts in `keyword`; they belong in sort_by.
const NON_KEYWORDS: &[&str] = &["low fee", "cheap", "best", "good", "high return"];

#[derive(Clone)]
pub struct ProductCatalog {
    pool: Option<PgPool>,
}

impl ProductCatalog {
    pub fn from_env() -> Self {
        let database_url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        let pool = database_url.and_then(|url| {
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(&url)
                .map_err(|e| {
                    warn!("Product catalog pool init failed: {}", e);
                    e
                })
                .ok()
        });

        Self { pool }
    }

    fn format_rows(rows: Vec<sqlx::postgres::PgRow>) -> String {
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("product_name").unwrap_or_default();
            let code: String = row.try_get("product_code").unwrap_or_default();
            let group: String = row.try_get("product_group").unwrap_or_default();
            let risk: String = row.try_get("risk_category").unwrap_or_default();
            let fee: f64 = row.try_get("fee").unwrap_or_default();
            let expected: f64 = row.try_get("expected_return").unwrap_or_default();
            let description: String = row.try_get("description").unwrap_or_default();
            let summary: String = description.chars().take(100).collect();

            results.push(format!(
                "- {} ({})\n  [Fee]: {}% | [Expected Return]: {}%\n  [Type]: {} | [Risk]: {}\n  [Description]: {}...",
                name, code, fee, expected, group, risk, summary
            ));
        }
        results.join("\n\n")
    }

    /// Keyword/category/sort search over the product table.
    pub async fn search(
        &self,
        keyword: Option<&str>,
        category: Option<&str>,
        sort_by: Option<&str>,
    ) -> Result<String> {
        let pool = self.pool.as_ref().ok_or_else(|| {
            AdvisoryError::ProviderError("Product catalog database not configured".to_string())
        })?;

        let keyword = keyword
            .filter(|k| !NON_KEYWORDS.contains(&k.to_lowercase().as_str()))
            .map(str::to_string);

        let rows = sqlx::query(
            r#"
            SELECT product_name, product_code, product_group, risk_category,
                   fee, expected_return, description
            FROM investment_products
            WHERE ($1::text IS NULL OR product_name ILIKE '%' || $1 || '%')
              AND ($2::text IS NULL OR product_group ILIKE $2)
            ORDER BY
              CASE WHEN $3::text = 'fees_asc' THEN fee END ASC,
              CASE WHEN $3::text = 'return_desc' THEN expected_return END DESC,
              expected_return DESC
            LIMIT 5
            "#,
        )
        .bind(keyword.as_deref())
        .bind(category)
        .bind(sort_by)
        .fetch_all(pool)
        .await
        .map_err(|e| AdvisoryError::ProviderError(format!("Product lookup failed: {}", e)))?;

        if rows.is_empty() {
            return Ok(format!(
                "No products found for the given conditions: {:?}, {:?}, {:?}",
                keyword, category, sort_by
            ));
        }

        Ok(Self::format_rows(rows))
    }

    /// Profile-driven recommendation: risk bands, category, theme keyword.
    pub async fn recommend(
        &self,
        risk_profile: Option<&str>,
        category: Option<&str>,
        keyword: Option<&str>,
    ) -> Result<String> {
        let pool = self.pool.as_ref().ok_or_else(|| {
            AdvisoryError::ProviderError("Product catalog database not configured".to_string())
        })?;

        let bands = risk_profile.map(map_risk_bands);

        let rows = sqlx::query(
            r#"
            SELECT product_name, product_code, product_group, risk_category,
                   fee, expected_return, description
            FROM investment_products
            WHERE ($1::int[] IS NULL OR risk_level = ANY($1))
              AND ($2::text IS NULL OR product_group ILIKE $2)
              AND ($3::text IS NULL
                   OR product_name ILIKE '%' || $3 || '%'
                   OR description ILIKE '%' || $3 || '%')
            ORDER BY expected_return DESC
            LIMIT 5
            "#,
        )
        .bind(bands)
        .bind(category)
        .bind(keyword)
        .fetch_all(pool)
        .await
        .map_err(|e| AdvisoryError::ProviderError(format!("Product lookup failed: {}", e)))?;

        if rows.is_empty() {
            return Ok(format!(
                "No products found for the given conditions: {:?}, {:?}, {:?}",
                risk_profile, category, keyword
            ));
        }

        Ok(Self::format_rows(rows))
    }
}

/// =============================
/// Retrieval Tools
/// =============================

pub struct SearchProductsTool {
    catalog: ProductCatalog,
}

#[async_trait::async_trait]
impl Tool for SearchProductsTool {
    fn name(&self) -> &'static str {
        "search_products"
    }

    fn description(&self) -> &'static str {
        "Run a structured query to find financial products (ETFs, Funds). \
         Use when the user asks for products by Theme, Sector, Region (keyword) \
         or Ranking/Comparison (sort_by). Do NOT use this for general definitions."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "keyword": {
                    "type": "string",
                    "description": "The Subject, Sector, or Region to filter by (e.g. 'Semiconductor', 'US'). Do NOT put adjectives like 'cheap' or 'best' here; leave empty for a global search."
                },
                "category": {
                    "type": "string",
                    "description": "Product type filter. Values: 'ETF', 'FUND', 'STOCK', 'BOND'. Optional."
                },
                "sort_by": {
                    "type": "string",
                    "enum": ["fees_asc", "return_desc"],
                    "description": "REQUIRED when the user says 'cheapest' (fees_asc) or 'highest return' (return_desc)."
                }
            },
            "required": ["keyword"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let result = self
            .catalog
            .search(
                string_arg(arguments, "keyword"),
                string_arg(arguments, "category"),
                string_arg(arguments, "sort_by"),
            )
            .await;

        Ok(result.unwrap_or_else(|e| format!("Product search error: {}", e)))
    }
}

pub struct SearchDocumentsTool {
    docs: DocumentSearchClient,
}

#[async_trait::async_trait]
impl Tool for SearchDocumentsTool {
    fn name(&self) -> &'static str {
        "search_documents"
    }

    fn description(&self) -> &'static str {
        "Search generic financial concepts, reports, and knowledge."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let query = require_string_arg(arguments, "query")?;
        let result = self.docs.match_documents(&query, 0.4, 3).await;
        Ok(result.unwrap_or_else(|e| format!("Document search error: {}", e)))
    }
}

pub struct GetMarketPriceTool {
    market: MarketDataClient,
}

#[async_trait::async_trait]
impl Tool for GetMarketPriceTool {
    fn name(&self) -> &'static str {
        "get_market_price"
    }

    fn description(&self) -> &'static str {
        "Get the real-time price for a specific ticker."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "ticker": { "type": "string" } },
            "required": ["ticker"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let ticker = require_string_arg(arguments, "ticker")?;
        match self.market.quote(&ticker).await {
            Ok(quote) => Ok(quote.to_string()),
            Err(e) => Ok(format!("Price lookup failed: {}", e)),
        }
    }
}

pub struct SearchWebTool {
    tavily: TavilySearchClient,
}

#[async_trait::async_trait]
impl Tool for SearchWebTool {
    fn name(&self) -> &'static str {
        "search_web"
    }

    fn description(&self) -> &'static str {
        "Search latest news or general info from the web."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let query = require_string_arg(arguments, "query")?;
        let result = self.tavily.search(&query, None, 2).await;
        Ok(result.unwrap_or_else(|e| format!("Web search error: {}", e)))
    }
}

/// =============================
/// Debate Tools
/// =============================

pub struct SearchTickerTool {
    market: MarketDataClient,
}

#[async_trait::async_trait]
impl Tool for SearchTickerTool {
    fn name(&self) -> &'static str {
        "search_ticker"
    }

    fn description(&self) -> &'static str {
        "Search a stock ticker code by company name (domestic listings first). \
         Use this if you don't know the ticker."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "company_name": { "type": "string" } },
            "required": ["company_name"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let company_name = require_string_arg(arguments, "company_name")?;

        let listing = match cached_ticker_listing(&self.market).await {
            Ok(listing) => listing,
            Err(e) => return Ok(format!("Ticker search failed: {}", e)),
        };

        let needle = company_name.to_lowercase();
        let candidates: Vec<String> = listing
            .iter()
            .filter(|entry| entry.name.to_lowercase().contains(&needle))
            .take(3)
            .map(|entry| format!("{} ({})", entry.name, entry.code))
            .collect();

        if candidates.is_empty() {
            return Ok(format!(
                "Couldn't find '{}' in the domestic listing. If it's a foreign stock, \
                 use the ticker directly (e.g. AAPL) or search the news first to find it.",
                company_name
            ));
        }

        Ok(format!("Found listed stocks: {}", candidates.join(", ")))
    }
}

pub struct GetMarketDataTool {
    market: MarketDataClient,
}

#[async_trait::async_trait]
impl Tool for GetMarketDataTool {
    fn name(&self) -> &'static str {
        "get_market_data"
    }

    fn description(&self) -> &'static str {
        "Get market data. Input MUST be a ticker (e.g. '005930', 'AAPL'). \
         If you only know the company name, use 'search_ticker' first."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "ticker": { "type": "string" } },
            "required": ["ticker"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let ticker = require_string_arg(arguments, "ticker")?;
        match self.market.quote(&ticker).await {
            Ok(quote) => Ok(quote.to_string()),
            Err(e) => Ok(format!("Data lookup failed: {}", e)),
        }
    }
}

pub struct SearchRegulationsTool {
    docs: DocumentSearchClient,
}

#[async_trait::async_trait]
impl Tool for SearchRegulationsTool {
    fn name(&self) -> &'static str {
        "search_regulations"
    }

    fn description(&self) -> &'static str {
        "Search financial laws and regulations."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let query = require_string_arg(arguments, "query")?;
        let result = self.docs.match_documents(&query, 0.5, 3).await;
        Ok(result.unwrap_or_else(|e| format!("Regulation search error: {}", e)))
    }
}

pub struct SearchNewsTool {
    tavily: TavilySearchClient,
}

#[async_trait::async_trait]
impl Tool for SearchNewsTool {
    fn name(&self) -> &'static str {
        "search_news"
    }

    fn description(&self) -> &'static str {
        "Search financial news."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let query = require_string_arg(arguments, "query")?;
        let result = self.tavily.search(&query, Some("news"), 3).await;
        Ok(result.unwrap_or_else(|e| format!("News search failed: {}", e)))
    }
}

/// =============================
/// Report Tools
/// =============================

pub struct RecommendProductsTool {
    catalog: ProductCatalog,
}

#[async_trait::async_trait]
impl Tool for RecommendProductsTool {
    fn name(&self) -> &'static str {
        "recommend_products"
    }

    fn description(&self) -> &'static str {
        "Search investment products matching the user profile."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "risk_level": {
                    "type": "string",
                    "description": "User risk profile (aggressive, moderate, conservative)"
                },
                "category": {
                    "type": "string",
                    "description": "Product category (ETF, FUND)"
                },
                "keyword": {
                    "type": "string",
                    "description": "Theme keyword (e.g. 'Semiconductor', 'US')"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let result = self
            .catalog
            .recommend(
                string_arg(arguments, "risk_level"),
                string_arg(arguments, "category"),
                string_arg(arguments, "keyword"),
            )
            .await;

        Ok(result.unwrap_or_else(|e| format!("Product recommendation error: {}", e)))
    }
}

/// =============================
/// Catalogs
/// =============================

/// Tools available to the retrieval stage.
pub fn create_retrieval_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SearchProductsTool {
        catalog: ProductCatalog::from_env(),
    }));
    registry.register(Arc::new(SearchDocumentsTool {
        docs: DocumentSearchClient::from_env(),
    }));
    registry.register(Arc::new(GetMarketPriceTool {
        market: MarketDataClient::from_env(),
    }));
    registry.register(Arc::new(SearchWebTool {
        tavily: TavilySearchClient::from_env(),
    }));
    registry
}

/// Tools available to each debate persona.
pub fn create_debate_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SearchTickerTool {
        market: MarketDataClient::from_env(),
    }));
    registry.register(Arc::new(GetMarketDataTool {
        market: MarketDataClient::from_env(),
    }));
    registry.register(Arc::new(SearchRegulationsTool {
        docs: DocumentSearchClient::from_env(),
    }));
    registry.register(Arc::new(SearchNewsTool {
        tavily: TavilySearchClient::from_env(),
    }));
    registry
}

/// Tools available during report synthesis.
pub fn create_report_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(RecommendProductsTool {
        catalog: ProductCatalog::from_env(),
    }));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domestic_code_detection() {
        assert!(is_domestic_code("005930"));
        assert!(!is_domestic_code("AAPL"));
        assert!(!is_domestic_code("12345"));
        assert!(!is_domestic_code("1234567"));
    }

    #[test]
    fn test_symbol_aliases() {
        assert_eq!(resolve_symbol("kospi"), "^KS11");
        assert_eq!(resolve_symbol("S&P500"), "^GSPC");
        assert_eq!(resolve_symbol("AAPL"), "AAPL");
    }

    #[test]
    fn test_risk_band_mapping() {
        assert_eq!(map_risk_bands("aggressive"), vec![1, 2, 3]);
        assert_eq!(map_risk_bands("moderate"), vec![3, 4]);
        assert_eq!(map_risk_bands("conservative"), vec![4, 5, 6]);
        assert_eq!(map_risk_bands("unspecified"), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_registry_catalog_order() {
        let registry = create_retrieval_registry();
        let specs = registry.specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "search_products",
                "search_documents",
                "get_market_price",
                "search_web"
            ]
        );
        assert!(registry.get("search_products").is_some());
        assert!(registry.get("unknown_tool").is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_providers_degrade_to_text() {
        let tool = SearchWebTool {
            tavily: TavilySearchClient {
                client: pooled_client(5),
                api_key: String::new(),
                base_url: "https://api.tavily.com/search".to_string(),
            },
        };

        let result = tool
            .execute(&json!({ "query": "semiconductor outlook" }))
            .await
            .unwrap();
        assert!(result.contains("Web search error"));
    }
}
