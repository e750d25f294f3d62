//! Typed models for the console pages, mirroring the backend contract.
//!
//! The cache itself moves opaque JSON; these types only exist at the edge
//! where a page decodes an entry into something renderable.

use serde::{Deserialize, Serialize};

use tunnelboard_core::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnServer {
    pub id: String,
    pub name: String,
    pub ip_address: String,
    pub country: String,
    pub city: String,
    pub is_premium: bool,
    pub status: ServerStatus,
    pub max_connections: u32,
    pub current_connections: u32,
}

/// Create/update payload for a server; the backend assigns id and live
/// connection counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub ip_address: String,
    pub country: String,
    pub city: String,
    pub is_premium: bool,
    pub status: ServerStatus,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub duration_days: u32,
    pub features: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    pub price: f64,
    pub duration_days: u32,
    pub features: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Expired,
}

/// Console user row. `role` stays a plain string: the two backend shapes
/// disagree on its vocabulary (`user`/`admin` vs `admin`/`super_admin`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub role: String,
    pub subscription_status: SubscriptionStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnUser {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub country: Option<String>,
    pub is_email_verified: bool,
    pub is_premium: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUserSpec {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConnections {
    pub server_id: String,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAnalytics {
    pub active_users: u64,
    pub total_bandwidth: u64,
    pub connections_per_server: Vec<ServerConnections>,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPerformance {
    pub server_id: String,
    pub latency_ms: f64,
    pub uptime_percentage: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub service: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub last_check: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_decodes_from_backend_shape() {
        let v: VpnServer = serde_json::from_value(json!({
            "id": "s1",
            "name": "fra-1",
            "ip_address": "10.0.0.1",
            "country": "DE",
            "city": "Frankfurt",
            "is_premium": false,
            "status": "maintenance",
            "max_connections": 500,
            "current_connections": 42
        }))
        .unwrap();
        assert_eq!(v.status, ServerStatus::Maintenance);
        assert_eq!(v.current_connections, 42);
    }

    #[test]
    fn health_message_is_optional() {
        let h: SystemHealth = serde_json::from_value(json!({
            "service": "db",
            "status": "healthy",
            "last_check": "2026-08-30T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(h.status, HealthStatus::Healthy);
        assert!(h.message.is_none());
    }
}
