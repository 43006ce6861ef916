//! Canned billing meters and email senders for billing tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use orzbob::billing::polar::{BillingMeter, MeterError, PolarProduct};
use orzbob::email::{BudgetAlert, EmailError, EmailSender};

/// One captured meter submission.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterCall {
    pub customer_id: String,
    pub hours: f64,
    pub tier: String,
}

/// Meter fake: records submissions, answers subscription lookups with a
/// fixed product, and optionally fails everything.
pub struct FakeMeter {
    pub calls: Mutex<Vec<MeterCall>>,
    pub product: Option<String>,
    pub fail: Mutex<bool>,
}

impl FakeMeter {
    pub fn with_product(product: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            product: Some(product.to_owned()),
            fail: Mutex::new(false),
        })
    }

    pub fn without_product() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            product: None,
            fail: Mutex::new(false),
        })
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.lock().await = fail;
    }

    pub async fn calls(&self) -> Vec<MeterCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl BillingMeter for FakeMeter {
    async fn record_usage(
        &self,
        customer_id: &str,
        hours: f64,
        _org_id: &str,
        tier: &str,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), MeterError> {
        if *self.fail.lock().await {
            return Err(MeterError::Api { status: 503 });
        }
        self.calls.lock().await.push(MeterCall {
            customer_id: customer_id.to_owned(),
            hours,
            tier: tier.to_owned(),
        });
        Ok(())
    }

    async fn subscription_product(
        &self,
        _customer_id: &str,
    ) -> Result<Option<String>, MeterError> {
        Ok(self.product.clone())
    }

    async fn list_products(&self) -> Result<Vec<PolarProduct>, MeterError> {
        Ok(Vec::new())
    }

    async fn create_product(&self, _name: &str) -> Result<PolarProduct, MeterError> {
        Err(MeterError::Api { status: 501 })
    }
}

/// Email fake: records alerts, optionally refusing delivery.
pub struct RecordingSender {
    pub sent: Mutex<Vec<(String, BudgetAlert)>>,
    pub fail: Mutex<bool>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        })
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.lock().await = fail;
    }

    pub async fn sent(&self) -> Vec<(String, BudgetAlert)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send_budget_alert(&self, to: &str, alert: &BudgetAlert) -> Result<(), EmailError> {
        if *self.fail.lock().await {
            return Err(EmailError::Send("refused".to_owned()));
        }
        self.sent
            .lock()
            .await
            .push((to.to_owned(), alert.clone()));
        Ok(())
    }
}
