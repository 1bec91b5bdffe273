//! Function Dispatcher
//!
//! Maps the function calls issued by the voice agent onto backend store
//! operations. Each function has a typed argument struct that doubles as its
//! JSON schema, so the definitions advertised to the agent and the validation
//! applied here never drift apart.

use crate::store::{BackendStore, NewOrder, NewOrderLine, StoreError};
use schemars::JsonSchema;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub const LOOKUP_MENU_ITEM: &str = "lookup_menu_item";
pub const PLACE_ORDER: &str = "place_order";
pub const CHECK_ORDER_STATUS: &str = "check_order_status";

/// Errors returned to the agent as function results. None of them end the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid arguments: {0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("unsupported function '{0}'")]
    UnsupportedFunction(String),
    #[error("backend unavailable: {0}")]
    Backend(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation_error",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::UnsupportedFunction(_) => "unsupported_function",
            DispatchError::Backend(_) => "backend_error",
        }
    }

    /// The JSON shape the agent receives in place of a result.
    pub fn to_payload(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidOrder(message) => DispatchError::Validation(message),
            other => DispatchError::Backend(other.to_string()),
        }
    }
}

// --- Argument schemas ---

/// Arguments for `lookup_menu_item`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct LookupMenuItemArgs {
    /// The dish the caller asked about, as spoken (e.g. "margherita pizza").
    pub query: String,
}

/// One requested line of an order.
#[derive(Deserialize, JsonSchema, Debug, Clone)]
pub struct OrderItemArgs {
    /// Menu item id, as returned by `lookup_menu_item`.
    pub item_id: i64,
    /// How many of this item the caller wants.
    #[schemars(description = "Number of portions; must be at least 1")]
    pub quantity: i64,
}

/// Arguments for `place_order`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct PlaceOrderArgs {
    /// The items to order.
    pub items: Vec<OrderItemArgs>,
    /// Free-form kitchen notes ("no onions").
    #[serde(default)]
    pub notes: Option<String>,
    /// The caller's name, used when the order is picked up.
    #[serde(default)]
    pub customer_name: Option<String>,
}

/// Arguments for `check_order_status`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct CheckOrderStatusArgs {
    /// The order id given to the caller when the order was placed.
    pub order_id: i64,
}

/// A function the agent may call, in the shape voice-agent settings expect.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FunctionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Validates and executes agent function calls against a `BackendStore`.
pub struct FunctionDispatcher {
    store: Arc<dyn BackendStore>,
}

impl FunctionDispatcher {
    pub fn new(store: Arc<dyn BackendStore>) -> Self {
        Self { store }
    }

    /// The fixed set of functions this dispatcher understands.
    pub fn definitions() -> Vec<FunctionDefinition> {
        vec![
            FunctionDefinition {
                name: LOOKUP_MENU_ITEM,
                description: "Look up dishes on the restaurant menu by name. Returns matching items with their id, description, category and price in cents.",
                parameters: parameters_schema::<LookupMenuItemArgs>(),
            },
            FunctionDefinition {
                name: PLACE_ORDER,
                description: "Place an order for one or more menu items. Item ids come from lookup_menu_item. Returns the new order id.",
                parameters: parameters_schema::<PlaceOrderArgs>(),
            },
            FunctionDefinition {
                name: CHECK_ORDER_STATUS,
                description: "Check the current status of a previously placed order.",
                parameters: parameters_schema::<CheckOrderStatusArgs>(),
            },
        ]
    }

    /// Runs one function call to completion.
    ///
    /// Arguments are validated before the store is touched; store failures
    /// surface as `DispatchError::Backend`.
    pub async fn dispatch(&self, name: &str, arguments: &Value) -> Result<Value, DispatchError> {
        let started = Instant::now();
        let result = self.route(name, arguments).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(function = %name, elapsed_ms, "Function call succeeded"),
            Err(e) => warn!(function = %name, elapsed_ms, kind = e.kind(), error = %e, "Function call failed"),
        }
        result
    }

    async fn route(&self, name: &str, arguments: &Value) -> Result<Value, DispatchError> {
        match name {
            LOOKUP_MENU_ITEM => self.lookup_menu_item(parse_args(arguments)?).await,
            PLACE_ORDER => self.place_order(parse_args(arguments)?).await,
            CHECK_ORDER_STATUS => self.check_order_status(parse_args(arguments)?).await,
            other => Err(DispatchError::UnsupportedFunction(other.to_string())),
        }
    }

    async fn lookup_menu_item(&self, args: LookupMenuItemArgs) -> Result<Value, DispatchError> {
        let query = args.query.trim();
        if query.is_empty() {
            return Err(DispatchError::Validation("`query` must not be empty".into()));
        }
        let items = self.store.find_menu_items(query).await?;
        if items.is_empty() {
            return Ok(json!({
                "found": false,
                "query": query,
                "items": [],
                "message": format!("No menu item matching \"{query}\" was found."),
            }));
        }
        Ok(json!({
            "found": true,
            "query": query,
            "items": items,
        }))
    }

    async fn place_order(&self, args: PlaceOrderArgs) -> Result<Value, DispatchError> {
        if args.items.is_empty() {
            return Err(DispatchError::Validation(
                "an order needs at least one item".into(),
            ));
        }

        let mut lines = Vec::with_capacity(args.items.len());
        let mut described = Vec::with_capacity(args.items.len());
        for requested in &args.items {
            if requested.quantity <= 0 {
                return Err(DispatchError::Validation(format!(
                    "quantity for item {} must be greater than zero, got {}",
                    requested.item_id, requested.quantity
                )));
            }
            let item = self
                .store
                .get_menu_item(requested.item_id)
                .await?
                .ok_or_else(|| {
                    DispatchError::Validation(format!(
                        "item {} is not on the menu",
                        requested.item_id
                    ))
                })?;
            let line = NewOrderLine {
                item_id: item.id,
                quantity: requested.quantity,
                unit_price_cents: item.price_cents,
            };
            let line_total_cents = line.total_cents().ok_or_else(|| {
                DispatchError::Validation(format!(
                    "quantity {} of item {} is too large",
                    requested.quantity, requested.item_id
                ))
            })?;
            described.push(json!({
                "item_id": item.id,
                "name": item.name,
                "quantity": requested.quantity,
                "line_total_cents": line_total_cents,
            }));
            lines.push(line);
        }

        let order = NewOrder {
            lines,
            notes: args.notes.filter(|n| !n.trim().is_empty()),
            customer_name: args.customer_name.filter(|n| !n.trim().is_empty()),
        };
        let total_cents = order.total_cents()?;
        let order_id = self.store.create_order(&order).await?;

        let summary = described
            .iter()
            .map(|line| format!("{} x {}", line["quantity"], line["name"].as_str().unwrap_or_default()))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(json!({
            "order_id": order_id,
            "status": "pending",
            "items": described,
            "total_cents": total_cents,
            "summary": format!("Order {order_id}: {summary}. Total ${}.{:02}.", total_cents / 100, total_cents % 100),
        }))
    }

    /// Reads the whole order back so the agent can confirm it with the caller.
    async fn check_order_status(&self, args: CheckOrderStatusArgs) -> Result<Value, DispatchError> {
        let order = self
            .store
            .get_order(args.order_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Order {} not found", args.order_id)))?;
        let items: Vec<Value> = order
            .lines
            .iter()
            .map(|line| {
                json!({
                    "item_id": line.item_id,
                    "name": line.name,
                    "quantity": line.quantity,
                    "unit_price_cents": line.unit_price_cents,
                })
            })
            .collect();
        Ok(json!({
            "order_id": order.id,
            "status": order.status,
            "customer_name": order.customer_name,
            "notes": order.notes,
            "items": items,
            "total_cents": order.total_cents,
            "created_at": order.created_at.to_rfc3339(),
        }))
    }
}

fn parse_args<T: DeserializeOwned>(arguments: &Value) -> Result<T, DispatchError> {
    serde_json::from_value(arguments.clone()).map_err(|e| DispatchError::Validation(e.to_string()))
}

fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({}));
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    schema
}
