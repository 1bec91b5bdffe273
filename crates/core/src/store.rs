//! Menu & Order Store
//!
//! The bridge never persists menu or order records itself. Everything goes
//! through the `BackendStore` trait, so the Postgres implementation used in
//! production and the in-memory one used for development and tests are
//! interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuzzy_matcher::{FuzzyMatcher, skim::SkimMatcherV2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Fuzzy matches must score at least this much per query character.
const FUZZY_SCORE_PER_CHAR: i64 = 14;

/// A dish on the menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub price_cents: i64,
}

/// Lifecycle of an order in the kitchen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown order status '{other}'"))),
        }
    }
}

/// One validated line of an order, priced at the time it was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewOrderLine {
    pub item_id: i64,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// An order ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewOrder {
    pub lines: Vec<NewOrderLine>,
    pub notes: Option<String>,
    pub customer_name: Option<String>,
}

impl NewOrder {
    /// Sum of every line. Fails instead of wrapping when the amounts do not fit in an `i64`.
    pub fn total_cents(&self) -> Result<i64, StoreError> {
        self.lines.iter().try_fold(0i64, |total, line| {
            line.total_cents()
                .and_then(|line_total| total.checked_add(line_total))
                .ok_or_else(|| StoreError::InvalidOrder("order total is out of range".into()))
        })
    }
}

impl NewOrderLine {
    /// `quantity * unit_price_cents`, or `None` on overflow.
    pub fn total_cents(&self) -> Option<i64> {
        self.quantity.checked_mul(self.unit_price_cents)
    }
}

/// One line of a stored order, with the dish name resolved for read-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderLine {
    pub item_id: i64,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// A stored order as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: i64,
    pub lines: Vec<OrderLine>,
    pub notes: Option<String>,
    pub customer_name: Option<String>,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with data that cannot be interpreted.
    #[error("store returned invalid data: {0}")]
    Corrupt(String),
    /// The order cannot be stored as given.
    #[error("order rejected: {0}")]
    InvalidOrder(String),
}

/// Defines the contract for the menu and order backend.
///
/// Implementations must be safe to share across every live call; the bridge
/// issues at most one call at a time per session but many sessions run at once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Returns every menu item whose name matches `query`, best match first.
    async fn find_menu_items(&self, query: &str) -> Result<Vec<MenuItem>, StoreError>;

    /// Fetches a single menu item by id.
    async fn get_menu_item(&self, id: i64) -> Result<Option<MenuItem>, StoreError>;

    /// Persists a new order and returns its id. Lines are already validated.
    async fn create_order(&self, order: &NewOrder) -> Result<i64, StoreError>;

    /// Fetches a whole order with its lines, or `None` if no such order exists.
    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, StoreError>;

    /// Returns the status of an order, or `None` if no such order exists.
    async fn get_order_status(&self, order_id: i64) -> Result<Option<OrderStatus>, StoreError>;

    /// Moves an existing order to a new status. Returns `false` if the order is unknown.
    async fn update_order_status(
        &self,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<bool, StoreError>;
}

/// A `BackendStore` that keeps everything in process memory.
///
/// Used when no database is configured, and by the test suites. Name lookups
/// accept every query token as a substring of the item name, falling back to
/// fuzzy matching so small mis-hearings ("margerita") still find the dish.
pub struct InMemoryStore {
    menu: Vec<MenuItem>,
    orders: RwLock<HashMap<i64, Order>>,
    next_order_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new(menu: Vec<MenuItem>) -> Self {
        Self {
            menu,
            orders: RwLock::new(HashMap::new()),
            next_order_id: AtomicI64::new(1),
        }
    }

    /// Builds a store from a JSON array of menu items.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let menu: Vec<MenuItem> =
            serde_json::from_str(json).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        info!(items = menu.len(), "Loaded menu seed");
        Ok(Self::new(menu))
    }

    /// A small Italian menu for local development.
    pub fn demo() -> Self {
        let item = |id, name: &str, description: &str, category: &str, price_cents| MenuItem {
            id,
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            price_cents,
        };
        Self::new(vec![
            item(1, "Margherita Pizza", "Tomato, mozzarella and fresh basil", "pizza", 1250),
            item(2, "Pepperoni Pizza", "Tomato, mozzarella and spicy pepperoni", "pizza", 1450),
            item(3, "Caesar Salad", "Romaine, parmesan, croutons, caesar dressing", "salad", 950),
            item(4, "Spaghetti Carbonara", "Egg, pecorino, guanciale, black pepper", "pasta", 1600),
            item(5, "Tiramisu", "Espresso-soaked ladyfingers, mascarpone", "dessert", 750),
        ])
    }

    pub fn menu(&self) -> &[MenuItem] {
        &self.menu
    }

    fn score(matcher: &SkimMatcherV2, name: &str, query: &str) -> Option<i64> {
        let name = name.to_lowercase();
        if query.split_whitespace().all(|token| name.contains(token)) {
            return Some(i64::MAX);
        }
        let min_score = FUZZY_SCORE_PER_CHAR * query.chars().count() as i64;
        matcher
            .fuzzy_match(&name, query)
            .filter(|score| *score >= min_score)
    }
}

#[async_trait]
impl BackendStore for InMemoryStore {
    async fn find_menu_items(&self, query: &str) -> Result<Vec<MenuItem>, StoreError> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &MenuItem)> = self
            .menu
            .iter()
            .filter_map(|item| Self::score(&matcher, &item.name, &query).map(|s| (s, item)))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        debug!(%query, matches = scored.len(), "Menu lookup");
        Ok(scored.into_iter().map(|(_, item)| item.clone()).collect())
    }

    async fn get_menu_item(&self, id: i64) -> Result<Option<MenuItem>, StoreError> {
        Ok(self.menu.iter().find(|item| item.id == id).cloned())
    }

    async fn create_order(&self, order: &NewOrder) -> Result<i64, StoreError> {
        let total_cents = order.total_cents()?;
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let stored = Order {
            id,
            lines: order
                .lines
                .iter()
                .map(|line| OrderLine {
                    item_id: line.item_id,
                    name: self
                        .menu
                        .iter()
                        .find(|item| item.id == line.item_id)
                        .map(|item| item.name.clone())
                        .unwrap_or_default(),
                    quantity: line.quantity,
                    unit_price_cents: line.unit_price_cents,
                })
                .collect(),
            notes: order.notes.clone(),
            customer_name: order.customer_name.clone(),
            status: OrderStatus::Pending,
            total_cents,
            created_at: Utc::now(),
        };
        self.orders.write().await.insert(id, stored);
        info!(order_id = id, lines = order.lines.len(), "Order created");
        Ok(id)
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn get_order_status(&self, order_id: i64) -> Result<Option<OrderStatus>, StoreError> {
        Ok(self
            .orders
            .read()
            .await
            .get(&order_id)
            .map(|order| order.status))
    }

    async fn update_order_status(
        &self,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<bool, StoreError> {
        match self.orders.write().await.get_mut(&order_id) {
            Some(order) => {
                debug!(order_id, %status, "Order status updated");
                order.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
