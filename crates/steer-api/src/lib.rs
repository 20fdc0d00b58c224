//! steer-api — administrative HTTP façade.
//!
//! Thin axum wrapper around one [`ForwardingStateManager`]. Every mutating
//! request takes the same lock, so lifecycle transactions never overlap.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/migrateNode` | `{old_ipv4, new_ipv4}` move a backend's slot to a new address |
//! | POST | `/updateForward` | `{ipv4, sw_port, mac?}` re-point a node's egress port |
//! | POST | `/addNode` | `{ipv4, sw_port, mac?, is_lb_node?}` install a node |
//! | POST | `/removeNode` | `{ipv4}` remove a node |
//! | POST | `/cleanup` | Clear every managed table |
//! | POST | `/reinitialize` | Clear and re-install the configured nodes |
//! | GET | `/nodes` | Snapshot of the in-memory model |
//! | GET | `/verify` | Read the switch tables back and compare with the model |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use steer_forwarding::{ForwardingStateManager, SwitchTables};
use tokio::sync::Mutex;

/// The manager behind the global mutation lock.
pub type SharedManager<T> = Arc<Mutex<ForwardingStateManager<T>>>;

/// Shared state for API handlers.
pub struct ApiState<T> {
    pub manager: SharedManager<T>,
}

impl<T> Clone for ApiState<T> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<T> ApiState<T> {
    pub fn new(manager: ForwardingStateManager<T>) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
        }
    }

    /// Wrap a manager the caller keeps a handle to.
    pub fn shared(manager: SharedManager<T>) -> Self {
        Self { manager }
    }
}

/// Build the admin router.
pub fn build_router<T: SwitchTables + 'static>(state: ApiState<T>) -> Router {
    Router::new()
        .route("/migrateNode", post(handlers::migrate_node::<T>))
        .route("/updateForward", post(handlers::update_forward::<T>))
        .route("/addNode", post(handlers::add_node::<T>))
        .route("/removeNode", post(handlers::remove_node::<T>))
        .route("/cleanup", post(handlers::cleanup::<T>))
        .route("/reinitialize", post(handlers::reinitialize::<T>))
        .route("/nodes", get(handlers::list_nodes::<T>))
        .route("/verify", get(handlers::verify::<T>))
        .with_state(state)
}
