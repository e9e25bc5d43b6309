//! Gateway REST client.
//!
//! JSON-POST client for the futures gateway. Session tokens last about a
//! day; a 401 triggers one in-place refresh and retry. A 429 honors the
//! server's Retry-After hint and retries once. Every request passes the
//! rate limiter first so the client never runs the account into the
//! gateway's hard limits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::rate_limit::{EndpointClass, RateLimiter};
use super::types::*;
use super::{BrokerError, BrokerGateway};
use crate::config::{GatewayCredentials, InstrumentConfig};
use crate::types::{Bar, OrderSide, OrderType};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_LIMIT_FALLBACK_SLEEP: Duration = Duration::from_secs(10);

/// Authenticated REST client bound to one account and contract.
pub struct GatewayClient {
    http: reqwest::Client,
    credentials: GatewayCredentials,
    token: RwLock<String>,
    limiter: RateLimiter,
    account_id: i64,
    account_name: String,
    contract: ContractSpec,
}

impl GatewayClient {
    /// Authenticate and resolve the account and contract. Fails fast on
    /// bad credentials, no matching account, or no matching contract;
    /// nothing here is worth limping past.
    pub async fn connect(
        credentials: GatewayCredentials,
        instrument: &InstrumentConfig,
    ) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;

        let token = authenticate(&http, &credentials).await?;
        info!(username = %credentials.username, "Gateway session established");

        let client = Self {
            http,
            credentials,
            token: RwLock::new(token),
            limiter: RateLimiter::new(),
            account_id: 0,
            account_name: String::new(),
            contract: ContractSpec {
                id: String::new(),
                name: String::new(),
                description: String::new(),
                tick_size: Decimal::ZERO,
                tick_value: Decimal::ZERO,
            },
        };

        let account = client.resolve_account(instrument).await?;
        let contract = client.resolve_contract(instrument).await?;
        info!(
            account_id = account.id,
            account = %account.name,
            contract = %contract.id,
            tick_size = %contract.tick_size,
            tick_value = %contract.tick_value,
            "Trading scope resolved"
        );

        Ok(Self {
            account_id: account.id,
            account_name: account.name,
            contract,
            ..client
        })
    }

    /// Re-validate the session token, falling back to a full login when
    /// validation itself is refused.
    pub async fn refresh_token(&self) -> Result<(), BrokerError> {
        let current = self.token.read().await.clone();
        let response = self
            .http
            .post(format!("{}/api/Auth/validate", self.credentials.api_url))
            .bearer_auth(&current)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        if response.status().is_success() {
            let body: ValidateResponse = response
                .json()
                .await
                .map_err(|e| BrokerError::Decode(e.to_string()))?;
            if body.success {
                if let Some(new_token) = body.new_token {
                    *self.token.write().await = new_token;
                    debug!("Session token rotated");
                    return Ok(());
                }
                // Validated without rotation; the old token still works.
                return Ok(());
            }
        }

        warn!("Token validation refused, re-authenticating from scratch");
        let token = authenticate(&self.http, &self.credentials).await?;
        *self.token.write().await = token;
        Ok(())
    }

    /// Current balance of the trading account, when the gateway reports one.
    pub async fn account_balance(&self) -> Result<Option<Decimal>, BrokerError> {
        let response: AccountSearchResponse = self
            .post(
                "/api/Account/search",
                &AccountSearchRequest {
                    only_active_accounts: true,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)?;
        Ok(response
            .accounts
            .into_iter()
            .find(|a| a.id == self.account_id)
            .and_then(|a| a.balance))
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Base URL of the real-time hub endpoint.
    pub fn rtc_url(&self) -> &str {
        &self.credentials.rtc_url
    }

    /// Current session token, for hub URLs that carry it as a query param.
    pub async fn session_token(&self) -> String {
        self.token.read().await.clone()
    }

    async fn resolve_account(&self, instrument: &InstrumentConfig) -> Result<AccountModel, BrokerError> {
        let response: AccountSearchResponse = self
            .post(
                "/api/Account/search",
                &AccountSearchRequest {
                    only_active_accounts: true,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)?;
        select_account(response.accounts, instrument)
    }

    async fn resolve_contract(&self, instrument: &InstrumentConfig) -> Result<ContractSpec, BrokerError> {
        let response: ContractSearchResponse = self
            .post(
                "/api/Contract/search",
                &ContractSearchRequest {
                    search_text: &instrument.symbol,
                    live: instrument.live,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)?;
        select_contract(response.contracts, &instrument.symbol)
    }

    /// POST one endpoint. Handles the token refresh and the single
    /// rate-limit retry; everything else is the caller's problem.
    async fn post<B, R>(&self, path: &str, body: &B, class: EndpointClass) -> Result<R, BrokerError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut auth_retried = false;
        let mut rate_retried = false;

        loop {
            self.limiter.acquire(class).await;

            let token = self.token.read().await.clone();
            let response = self
                .http
                .post(format!("{}{}", self.credentials.api_url, path))
                .bearer_auth(&token)
                .json(body)
                .send()
                .await
                .map_err(|e| BrokerError::Network(e.to_string()))?;

            match response.status() {
                StatusCode::UNAUTHORIZED => {
                    if auth_retried {
                        return Err(BrokerError::AuthExpired);
                    }
                    auth_retried = true;
                    warn!(path, "401 from gateway, refreshing session token");
                    self.refresh_token().await?;
                    continue;
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(RATE_LIMIT_FALLBACK_SLEEP);
                    if rate_retried {
                        return Err(BrokerError::RateLimited {
                            retry_after_secs: retry_after.as_secs(),
                        });
                    }
                    rate_retried = true;
                    warn!(
                        path,
                        retry_after_secs = retry_after.as_secs(),
                        "429 from gateway, honoring Retry-After"
                    );
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                status if !status.is_success() => {
                    return Err(BrokerError::Network(format!(
                        "HTTP {} from {}",
                        status, path
                    )));
                }
                _ => {}
            }

            return response
                .json::<R>()
                .await
                .map_err(|e| BrokerError::Decode(e.to_string()));
        }
    }
}

#[async_trait]
impl BrokerGateway for GatewayClient {
    async fn place_order(&self, ticket: &OrderTicket) -> Result<OrderId, BrokerError> {
        let (stop_bracket, target_bracket) = match ticket.bracket {
            Some(bracket) => bracket_specs(ticket.side, bracket),
            None => (None, None),
        };

        let request = PlaceOrderRequest {
            account_id: self.account_id,
            contract_id: &self.contract.id,
            kind: ticket.order_type,
            side: ticket.side,
            size: ticket.size,
            limit_price: ticket.limit_price,
            stop_price: ticket.stop_price,
            custom_tag: ticket.tag.as_deref(),
            stop_loss_bracket: stop_bracket,
            take_profit_bracket: target_bracket,
        };

        let response: PlaceOrderResponse = self
            .post("/api/Order/place", &request, EndpointClass::Standard)
            .await?;

        if !response.success {
            return Err(BrokerError::OrderRejected(format!(
                "code {}: {}",
                response.error_code,
                response.error_message.unwrap_or_else(|| "no message".into())
            )));
        }
        let order_id = response
            .order_id
            .ok_or_else(|| BrokerError::Decode("place response missing orderId".into()))?;

        debug!(
            order_id,
            kind = %ticket.order_type,
            side = %ticket.side,
            size = ticket.size,
            "Order accepted by gateway"
        );
        Ok(OrderId::from(order_id))
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), BrokerError> {
        let numeric = parse_order_id(order_id)?;
        let response: StatusResponse = self
            .post(
                "/api/Order/cancel",
                &CancelOrderRequest {
                    account_id: self.account_id,
                    order_id: numeric,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)
    }

    async fn modify_order(
        &self,
        order_id: &OrderId,
        changes: &OrderChanges,
    ) -> Result<(), BrokerError> {
        let numeric = parse_order_id(order_id)?;
        let response: StatusResponse = self
            .post(
                "/api/Order/modify",
                &ModifyOrderRequest {
                    account_id: self.account_id,
                    order_id: numeric,
                    size: changes.size,
                    limit_price: changes.limit_price,
                    stop_price: changes.stop_price,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let response: OrderSearchResponse = self
            .post(
                "/api/Order/searchOpen",
                &AccountScopedRequest {
                    account_id: self.account_id,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)?;
        Ok(response
            .orders
            .into_iter()
            .filter(|o| o.contract_id == self.contract.id)
            .map(BrokerOrder::from)
            .collect())
    }

    async fn open_position(&self) -> Result<Option<BrokerPosition>, BrokerError> {
        let response: PositionSearchResponse = self
            .post(
                "/api/Position/searchOpen",
                &AccountScopedRequest {
                    account_id: self.account_id,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)?;
        Ok(response
            .positions
            .into_iter()
            .filter(|p| p.contract_id == self.contract.id && p.size != 0)
            .map(BrokerPosition::from)
            .next())
    }

    async fn close_position(&self) -> Result<(), BrokerError> {
        let response: StatusResponse = self
            .post(
                "/api/Position/closeContract",
                &CloseContractRequest {
                    account_id: self.account_id,
                    contract_id: &self.contract.id,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)
    }

    async fn partial_close_position(&self, size: i64) -> Result<(), BrokerError> {
        let response: StatusResponse = self
            .post(
                "/api/Position/partialCloseContract",
                &PartialCloseContractRequest {
                    account_id: self.account_id,
                    contract_id: &self.contract.id,
                    size,
                },
                EndpointClass::Standard,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)
    }

    async fn recent_bars(&self, request: &BarsRequest) -> Result<Vec<Bar>, BrokerError> {
        let end = Utc::now();
        let span_minutes = i64::from(request.unit_minutes) * i64::from(request.count);
        // One extra bar of slack so a bar boundary never clips the range.
        let start = end - chrono::Duration::minutes(span_minutes + i64::from(request.unit_minutes));

        let response: RetrieveBarsResponse = self
            .post(
                "/api/History/retrieveBars",
                &RetrieveBarsRequest {
                    contract_id: &self.contract.id,
                    live: false,
                    start_time: start,
                    end_time: end,
                    unit: 2,
                    unit_number: request.unit_minutes,
                    limit: request.count,
                    include_partial_bar: request.include_partial,
                },
                EndpointClass::History,
            )
            .await?;
        envelope_result(response.success, response.error_code, response.error_message)?;
        Ok(response.bars)
    }

    fn contract(&self) -> &ContractSpec {
        &self.contract
    }

    fn account_id(&self) -> i64 {
        self.account_id
    }
}

async fn authenticate(
    http: &reqwest::Client,
    credentials: &GatewayCredentials,
) -> Result<String, BrokerError> {
    let response = http
        .post(format!("{}/api/Auth/loginKey", credentials.api_url))
        .json(&LoginKeyRequest {
            user_name: &credentials.username,
            api_key: &credentials.api_key,
        })
        .send()
        .await
        .map_err(|e| BrokerError::Network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(BrokerError::Network(format!(
            "HTTP {} from loginKey",
            response.status()
        )));
    }

    let body: LoginResponse = response
        .json()
        .await
        .map_err(|e| BrokerError::Decode(e.to_string()))?;
    envelope_result(body.success, body.error_code, body.error_message)?;
    body.token
        .ok_or_else(|| BrokerError::Decode("login response missing token".into()))
}

fn parse_order_id(order_id: &OrderId) -> Result<i64, BrokerError> {
    order_id
        .as_str()
        .parse::<i64>()
        .map_err(|_| BrokerError::Configuration(format!("non-numeric order id {}", order_id)))
}

/// Bracket specs with side-correct signs: distances move against a long
/// entry's stop (negative ticks) and with its target, mirrored for shorts.
fn bracket_specs(
    entry_side: OrderSide,
    bracket: BracketTicks,
) -> (Option<BracketSpec>, Option<BracketSpec>) {
    let (stop_sign, target_sign) = match entry_side {
        OrderSide::Bid => (-1, 1),
        OrderSide::Ask => (1, -1),
    };
    (
        Some(BracketSpec {
            ticks: stop_sign * bracket.stop_ticks.abs(),
            kind: OrderType::Stop,
        }),
        Some(BracketSpec {
            ticks: target_sign * bracket.target_ticks.abs(),
            kind: OrderType::Limit,
        }),
    )
}

/// Account selection: explicit id first, then suffix match against id or
/// name preferring tradable accounts, then the first tradable account.
fn select_account(
    accounts: Vec<AccountModel>,
    instrument: &InstrumentConfig,
) -> Result<AccountModel, BrokerError> {
    if accounts.is_empty() {
        return Err(BrokerError::Configuration(
            "no active accounts on this login".into(),
        ));
    }

    if let Some(id) = instrument.account_id {
        return accounts
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| BrokerError::Configuration(format!("account {} not found", id)));
    }

    if let Some(suffix) = &instrument.account_suffix {
        let mut matches: Vec<AccountModel> = accounts
            .into_iter()
            .filter(|a| a.id.to_string().ends_with(suffix) || a.name.ends_with(suffix))
            .collect();
        if matches.is_empty() {
            return Err(BrokerError::Configuration(format!(
                "no account matching suffix {}",
                suffix
            )));
        }
        if let Some(idx) = matches.iter().position(|a| a.can_trade) {
            return Ok(matches.swap_remove(idx));
        }
        return Ok(matches.swap_remove(0));
    }

    accounts
        .into_iter()
        .find(|a| a.can_trade)
        .ok_or_else(|| BrokerError::Configuration("no tradable account found".into()))
}

/// Contract selection: prefer the gateway-flagged active contract, fall
/// back to the first search hit.
fn select_contract(contracts: Vec<ContractModel>, symbol: &str) -> Result<ContractSpec, BrokerError> {
    if contracts.is_empty() {
        return Err(BrokerError::Configuration(format!(
            "no contract found for {}",
            symbol
        )));
    }
    let chosen = contracts
        .iter()
        .position(|c| c.active_contract)
        .unwrap_or(0);
    let mut contracts = contracts;
    let c = contracts.swap_remove(chosen);
    Ok(ContractSpec {
        id: c.id,
        name: c.name,
        description: c.description,
        tick_size: c.tick_size,
        tick_value: c.tick_value,
    })
}
