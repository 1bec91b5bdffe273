//! Data Access Layer
//!
//! Postgres implementation of `BackendStore`. Queries are checked at runtime
//! and mapped onto the row types in `models`; every `sqlx` failure surfaces as
//! `StoreError::Unavailable` so the dispatcher can report it to the agent.

use anyhow::Result;
use async_trait::async_trait;
use restaurant_core::{
    BackendStore, StoreError,
    store::{MenuItem, NewOrder, Order, OrderStatus},
};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::models::{MenuItemRecord, OrderLineRecord, OrderRecord, OrderStatusRecord};

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Escapes `LIKE` wildcards so user input only ever matches literally.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.trim().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl BackendStore for Db {
    async fn find_menu_items(&self, query: &str) -> Result<Vec<MenuItem>, StoreError> {
        let rows = sqlx::query_as::<_, MenuItemRecord>(
            r#"
            SELECT id, name, description, category, price_cents
            FROM menu_items
            WHERE name ILIKE $1
            ORDER BY length(name), name
            "#,
        )
        .bind(like_pattern(query))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        debug!(query, matches = rows.len(), "Menu lookup");
        Ok(rows.into_iter().map(MenuItem::from).collect())
    }

    async fn get_menu_item(&self, id: i64) -> Result<Option<MenuItem>, StoreError> {
        let row = sqlx::query_as::<_, MenuItemRecord>(
            "SELECT id, name, description, category, price_cents FROM menu_items WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.map(MenuItem::from))
    }

    /// Writes the order and its lines in a single transaction.
    async fn create_order(&self, order: &NewOrder) -> Result<i64, StoreError> {
        let total_cents = order.total_cents()?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let order_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders (customer_name, notes, status, total_cents)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(order.customer_name.as_deref())
        .bind(order.notes.as_deref())
        .bind(OrderStatusRecord::Pending)
        .bind(total_cents)
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?;

        for line in &order.lines {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, menu_item_id, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(order_id)
            .bind(line.item_id)
            .bind(line.quantity)
            .bind(line.unit_price_cents)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;
        info!(order_id, lines = order.lines.len(), "Order stored");
        Ok(order_id)
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, StoreError> {
        let Some(order) = sqlx::query_as::<_, OrderRecord>(
            r#"
            SELECT id, customer_name, notes, status, total_cents, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?
        else {
            return Ok(None);
        };

        let lines = sqlx::query_as::<_, OrderLineRecord>(
            r#"
            SELECT oi.menu_item_id AS item_id, mi.name, oi.quantity, oi.unit_price_cents
            FROM order_items oi
            JOIN menu_items mi ON mi.id = oi.menu_item_id
            WHERE oi.order_id = $1
            ORDER BY oi.id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(Some(order.into_order(lines)))
    }

    async fn get_order_status(&self, order_id: i64) -> Result<Option<OrderStatus>, StoreError> {
        let status: Option<OrderStatusRecord> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(status.map(OrderStatus::from))
    }

    async fn update_order_status(
        &self,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
            .bind(OrderStatusRecord::from(status))
            .bind(order_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }
}
