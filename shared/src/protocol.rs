/// Relation endpoint name shared by requesters and the provider
pub const LOADBALANCER_ENDPOINT: &str = "loadbalancer";

/// Relation endpoint name for the HA clustering subordinate
pub const HA_ENDPOINT: &str = "ha";

/// Data bag keys
pub const ENDPOINTS_KEY: &str = "endpoints";
pub const FRONTENDS_KEY: &str = "frontends";

/// Wire field names used in `endpoints` records
pub const SERVICE_NAME: &str = "service-name";
pub const FRONTEND_PORT: &str = "frontend-port";
pub const CHECK_TYPE: &str = "check-type";
pub const BACKEND_PORT: &str = "backend-port";
pub const BACKEND_IP: &str = "backend-ip";

pub const DEFAULT_CHECK_TYPE: &str = "http";

/// Well-known network partitions
pub const PUBLIC_PARTITION: &str = "public";
pub const INTERNAL_PARTITION: &str = "internal";
pub const ADMIN_PARTITION: &str = "admin";

/// HA resource agents
pub const INIT_SERVICE_AGENT: &str = "lsb";
pub const VIP_AGENT: &str = "ocf:heartbeat:IPaddr2";

/// API path prefix
pub const API_PREFIX: &str = "/v1";
