pub mod schema;

#[allow(unused_imports)]
pub use schema::{
    Config, EmailDefaultsConfig, GatewayConfig, QuotaConfig, ReasoningConfig, SessionsConfig,
    StoreConfig, TenantProfile, VaultConfig,
};
