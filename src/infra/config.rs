use std::net::SocketAddr;

use axum::http::HeaderValue;
use chrono::Duration;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;
use url::Url;

use crate::use_cases::{
    credits::DEFAULT_CAS_RETRIES,
    entitlement::{DEFAULT_GRANT_PER_PERIOD, DEFAULT_ROLLOVER_LIMIT, EntitlementPolicy},
    reconciliation::ReconciliationSettings,
};

pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub cors_origin: HeaderValue,
    /// HS256 key for user access tokens.
    pub jwt_secret: SecretString,
    /// Standard Webhooks secret, optionally `whsec_`-prefixed base64.
    pub polar_webhook_secret: SecretString,
    /// Bearer token guarding the internal mutation routes.
    pub internal_api_token: SecretString,
    /// Event bus ingest endpoint. The relay worker is not started without it.
    pub event_bus_url: Option<Url>,
    pub event_bus_signing_key: Option<SecretString>,
    pub entitled_statuses: Vec<String>,
    pub default_grant_per_period: i64,
    pub default_rollover_limit: i64,
    pub webhook_grant_amount: i64,
    pub pre_expiry_lookback_secs: i64,
    pub pre_expiry_min_delay_secs: i64,
    pub balance_cas_retries: u32,
    pub expiry_worker_poll_secs: u64,
    pub event_relay_poll_secs: u64,
    pub balance_audit_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url: String = get_env("DATABASE_URL");
        let bind_addr: SocketAddr = get_env_default("BIND_ADDR", "127.0.0.1:3001".parse().unwrap());
        let cors_origin: HeaderValue =
            get_env_default("CORS_ORIGIN", String::from("http://localhost:3000"))
                .parse()
                .expect("CORS_ORIGIN must be a valid header value");

        let jwt_secret = SecretString::new(get_env::<String>("JWT_SECRET").into());
        let polar_webhook_secret =
            SecretString::new(get_env::<String>("POLAR_WEBHOOK_SECRET").into());
        let internal_api_token =
            SecretString::new(get_env::<String>("INTERNAL_API_TOKEN").into());

        let event_bus_url: Option<Url> = std::env::var("EVENT_BUS_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse().expect("EVENT_BUS_URL must be a valid URL"));
        let event_bus_signing_key: Option<SecretString> = std::env::var("EVENT_BUS_SIGNING_KEY")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::new(s.into()));

        let entitled_statuses: Vec<String> =
            get_env_default("ENTITLED_STATUSES", String::from("active,trialing,paid"))
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();

        Self {
            database_url,
            bind_addr,
            cors_origin,
            jwt_secret,
            polar_webhook_secret,
            internal_api_token,
            event_bus_url,
            event_bus_signing_key,
            entitled_statuses,
            default_grant_per_period: get_env_default(
                "DEFAULT_GRANT_PER_PERIOD",
                DEFAULT_GRANT_PER_PERIOD,
            ),
            default_rollover_limit: get_env_default("DEFAULT_ROLLOVER_LIMIT", DEFAULT_ROLLOVER_LIMIT),
            webhook_grant_amount: get_env_default("WEBHOOK_GRANT_AMOUNT", 10),
            pre_expiry_lookback_secs: get_env_default("PRE_EXPIRY_LOOKBACK_SECS", 259_200),
            pre_expiry_min_delay_secs: get_env_default("PRE_EXPIRY_MIN_DELAY_SECS", 5),
            balance_cas_retries: get_env_default("BALANCE_CAS_RETRIES", DEFAULT_CAS_RETRIES),
            expiry_worker_poll_secs: get_env_default("EXPIRY_WORKER_POLL_SECS", 15),
            event_relay_poll_secs: get_env_default("EVENT_RELAY_POLL_SECS", 5),
            balance_audit_interval_secs: get_env_default("BALANCE_AUDIT_INTERVAL_SECS", 3_600),
        }
    }

    pub fn entitlement_policy(&self) -> EntitlementPolicy {
        EntitlementPolicy::new(
            self.entitled_statuses.iter(),
            self.default_grant_per_period,
            self.default_rollover_limit,
        )
    }

    pub fn reconciliation_settings(&self) -> ReconciliationSettings {
        ReconciliationSettings {
            grant_amount: self.webhook_grant_amount,
            pre_expiry_lookback: Duration::seconds(self.pre_expiry_lookback_secs),
            pre_expiry_min_delay: Duration::seconds(self.pre_expiry_min_delay_secs),
        }
    }
}
