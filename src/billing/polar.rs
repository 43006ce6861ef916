//! HTTP client for the external billing meter (Polar).
//!
//! Bearer-authed JSON API with a 30-second client timeout, wired at
//! construction. Abstracted behind [`BillingMeter`] so the metering and
//! quota services can be tested against canned meters.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::config::PolarConfig;

/// Default Polar API base URL.
const POLAR_API_BASE: &str = "https://api.polar.sh";

/// Client-side timeout on every meter call.
const METER_TIMEOUT: Duration = Duration::from_secs(30);

/// A product on the billing side.
#[derive(Debug, Clone, Deserialize)]
pub struct PolarProduct {
    /// Product id, e.g. `prod_free_tier`.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

/// A customer subscription on the billing side.
#[derive(Debug, Clone, Deserialize)]
pub struct PolarSubscription {
    /// Subscription id.
    pub id: String,
    /// Product the subscription is for.
    pub product_id: String,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    items: Vec<T>,
}

/// Errors produced by meter calls.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("meter transport error: {0}")]
    Transport(String),

    /// The meter answered with a non-success status.
    #[error("meter rejected request: status {status}")]
    Api {
        /// HTTP status returned.
        status: u16,
    },

    /// The meter's response body did not parse.
    #[error("meter response malformed: {0}")]
    Malformed(String),
}

/// External billing meter operations used by the control plane.
#[async_trait]
pub trait BillingMeter: Send + Sync {
    /// Submit aggregated usage hours for one customer and tier.
    async fn record_usage(
        &self,
        customer_id: &str,
        hours: f64,
        org_id: &str,
        tier: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), MeterError>;

    /// Product id of the customer's active subscription, when any.
    async fn subscription_product(&self, customer_id: &str)
        -> Result<Option<String>, MeterError>;

    /// List products for the configured organization.
    async fn list_products(&self) -> Result<Vec<PolarProduct>, MeterError>;

    /// Create a product under the configured organization.
    async fn create_product(&self, name: &str) -> Result<PolarProduct, MeterError>;
}

/// Polar-backed meter client.
pub struct PolarClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    meter_id: String,
    organization_id: String,
}

impl PolarClient {
    /// Build a client from the config section.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying HTTP client cannot be built.
    pub fn new(config: &PolarConfig) -> Result<Self, MeterError> {
        let client = reqwest::Client::builder()
            .timeout(METER_TIMEOUT)
            .build()
            .map_err(|e| MeterError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| POLAR_API_BASE.to_owned()),
            access_token: config.access_token.clone(),
            meter_id: config.meter_id.clone(),
            organization_id: config.organization_id.clone(),
        })
    }

    fn check_status(response: &reqwest::Response) -> Result<(), MeterError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(MeterError::Api {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl BillingMeter for PolarClient {
    async fn record_usage(
        &self,
        customer_id: &str,
        hours: f64,
        org_id: &str,
        tier: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), MeterError> {
        let body = json!({
            "customer_id": customer_id,
            "usage": hours,
            "timestamp": timestamp.to_rfc3339(),
            "metadata": {
                "org_id": org_id,
                "tier": tier,
            },
        });

        let response = self
            .client
            .post(format!(
                "{}/v1/meters/{}/usage",
                self.base_url, self.meter_id
            ))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| MeterError::Transport(e.to_string()))?;

        Self::check_status(&response)
    }

    async fn subscription_product(
        &self,
        customer_id: &str,
    ) -> Result<Option<String>, MeterError> {
        let response = self
            .client
            .get(format!("{}/v1/subscriptions", self.base_url))
            .query(&[("customer_id", customer_id)])
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| MeterError::Transport(e.to_string()))?;

        Self::check_status(&response)?;

        let subscriptions: ListEnvelope<PolarSubscription> = response
            .json()
            .await
            .map_err(|e| MeterError::Malformed(e.to_string()))?;

        Ok(subscriptions.items.into_iter().next().map(|s| s.product_id))
    }

    async fn list_products(&self) -> Result<Vec<PolarProduct>, MeterError> {
        let response = self
            .client
            .get(format!("{}/v1/products", self.base_url))
            .query(&[("organization_id", self.organization_id.as_str())])
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| MeterError::Transport(e.to_string()))?;

        Self::check_status(&response)?;

        let products: ListEnvelope<PolarProduct> = response
            .json()
            .await
            .map_err(|e| MeterError::Malformed(e.to_string()))?;

        Ok(products.items)
    }

    async fn create_product(&self, name: &str) -> Result<PolarProduct, MeterError> {
        let body = json!({
            "name": name,
            "organization_id": self.organization_id,
        });

        let response = self
            .client
            .post(format!("{}/v1/products", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| MeterError::Transport(e.to_string()))?;

        Self::check_status(&response)?;

        response
            .json()
            .await
            .map_err(|e| MeterError::Malformed(e.to_string()))
    }
}
