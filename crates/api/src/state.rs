//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use bidcraft_billing::BillingService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, billing: BillingService) -> Self {
        Self {
            pool,
            billing: Arc::new(billing),
        }
    }
}
