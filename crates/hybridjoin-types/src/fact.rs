//! Output record persisted by the final stage.

use serde::{Deserialize, Serialize};

/// Channel recorded on every fact produced by the pipeline.
pub const IN_STORE_CHANNEL: &str = "In-Store";

/// One sales fact with every natural key replaced by its surrogate key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub order_id: i64,
    pub order_line_number: i64,
    pub customer_key: i64,
    pub product_key: i64,
    pub store_key: i64,
    pub supplier_key: i64,
    /// Calendar key in `YYYYMMDD` form.
    pub date_key: i64,
    pub quantity: i64,
    pub unit_price: f64,
    pub total_purchase_amount: f64,
    pub discount_amount: f64,
    /// `1` when the order date falls on a Saturday or Sunday.
    pub weekend_flag: i64,
    pub order_channel: String,
}
