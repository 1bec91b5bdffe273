//! API and Database Models
//!
//! This module defines the row types used for database mapping with `sqlx`
//! and the HTTP payloads documented with `utoipa`.

use chrono::{DateTime, Utc};
use restaurant_core::store::{MenuItem, Order, OrderLine, OrderStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};

/// Mirrors the `order_status` Postgres enum.
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
pub enum OrderStatusRecord {
    Pending,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl From<OrderStatusRecord> for OrderStatus {
    fn from(record: OrderStatusRecord) -> Self {
        match record {
            OrderStatusRecord::Pending => OrderStatus::Pending,
            OrderStatusRecord::Preparing => OrderStatus::Preparing,
            OrderStatusRecord::Ready => OrderStatus::Ready,
            OrderStatusRecord::Completed => OrderStatus::Completed,
            OrderStatusRecord::Cancelled => OrderStatus::Cancelled,
        }
    }
}

impl From<OrderStatus> for OrderStatusRecord {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Pending => OrderStatusRecord::Pending,
            OrderStatus::Preparing => OrderStatusRecord::Preparing,
            OrderStatus::Ready => OrderStatusRecord::Ready,
            OrderStatus::Completed => OrderStatusRecord::Completed,
            OrderStatus::Cancelled => OrderStatusRecord::Cancelled,
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct OrderRecord {
    pub id: i64,
    pub customer_name: Option<String>,
    pub notes: Option<String>,
    pub status: OrderStatusRecord,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
}

/// An `order_items` row joined with the dish name.
#[derive(FromRow, Debug, Clone)]
pub struct OrderLineRecord {
    pub item_id: i64,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

impl OrderRecord {
    pub fn into_order(self, lines: Vec<OrderLineRecord>) -> Order {
        Order {
            id: self.id,
            lines: lines
                .into_iter()
                .map(|line| OrderLine {
                    item_id: line.item_id,
                    name: line.name,
                    quantity: line.quantity,
                    unit_price_cents: line.unit_price_cents,
                })
                .collect(),
            notes: self.notes,
            customer_name: self.customer_name,
            status: self.status.into(),
            total_cents: self.total_cents,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct MenuItemRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub price_cents: i64,
}

impl From<MenuItemRecord> for MenuItem {
    fn from(record: MenuItemRecord) -> Self {
        MenuItem {
            id: record.id,
            name: record.name,
            description: record.description,
            category: record.category,
            price_cents: record.price_cents,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub active_calls: usize,
    pub agent_key_configured: bool,
    #[schema(example = "postgres")]
    pub store: String,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct OrderStatusResponse {
    pub order_id: i64,
    #[schema(example = "pending")]
    pub status: String,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct MenuItemResponse {
    pub id: i64,
    #[schema(example = "Margherita Pizza")]
    pub name: String,
    pub description: String,
    pub category: String,
    #[schema(example = 1250)]
    pub price_cents: i64,
}

impl From<MenuItem> for MenuItemResponse {
    fn from(item: MenuItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            description: item.description,
            category: item.category,
            price_cents: item.price_cents,
        }
    }
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct UpdateOrderStatusPayload {
    #[schema(example = "ready")]
    pub status: String,
}

#[derive(Deserialize, IntoParams, Debug)]
pub struct MenuSearchQuery {
    /// Dish name or part of one.
    #[param(example = "pizza")]
    pub q: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
