use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use super::logging::LoggingConfig;

/// A top-level enum for versioned configurations.
#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(tag = "version")]
pub enum Config {
    #[serde(rename = "1.0.0")]
    ConfigV1(ConfigV1),
}

/// Main config for v1.0.0: server bind, identity provider, session, caches.
#[derive(Deserialize, Serialize, Debug, JsonSchema)]
pub struct ConfigV1 {
    pub bind_address: String,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Load config from a YAML file named "config.yaml" in the current directory,
/// with `AUTHGATE_`-prefixed environment variables taking precedence.
pub fn load_config() -> ConfigV1 {
    let figment = Figment::new()
        .merge(Yaml::file("./config.yaml"))
        .merge(Env::prefixed("AUTHGATE_").split("__"));
    let config = match figment.extract::<Config>() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };
    match config {
        Config::ConfigV1(c) => c,
    }
}

/// Print the JSON schema for the configuration to stdout.
pub fn print_schema() {
    let schema = schema_for!(Config);
    println!("{}", serde_json::to_string_pretty(&schema).unwrap());
}

/// The single OIDC identity provider this deployment authenticates against.
///
/// The CEL expression strings are validated upstream; they arrive here ready
/// to compile.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ProviderConfig {
    /// Display name shown to the frontend via the `auth-provider` cookie.
    pub name: String,
    /// Issuer URL; discovery runs against `{issuer}/.well-known/openid-configuration`.
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Absolute callback URL registered with the provider.
    pub redirect_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub claims: ClaimsConfig,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "profile".into(), "email".into()]
}

/// CEL expressions turning verified token claims into a dashboard identity.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ClaimsConfig {
    /// Named expressions evaluated in order; results are visible to later
    /// expressions as `variables.<name>`.
    #[serde(default)]
    pub variables: Vec<VariableExpression>,
    /// Boolean checks; the first failing one aborts login with its message.
    #[serde(default)]
    pub validations: Vec<ValidationExpression>,
    #[serde(default = "default_profile_name_expression")]
    pub profile_name_expression: String,
    #[serde(default = "default_username_expression")]
    pub username_expression: String,
    #[serde(default = "default_groups_expression")]
    pub groups_expression: String,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        ClaimsConfig {
            variables: Vec::new(),
            validations: Vec::new(),
            profile_name_expression: default_profile_name_expression(),
            username_expression: default_username_expression(),
            groups_expression: default_groups_expression(),
        }
    }
}

fn default_profile_name_expression() -> String {
    "has(claims.name) ? claims.name : claims.email".to_string()
}

fn default_username_expression() -> String {
    "claims.email".to_string()
}

fn default_groups_expression() -> String {
    "has(claims.groups) ? claims.groups : []".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct VariableExpression {
    pub name: String,
    pub expression: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ValidationExpression {
    pub expression: String,
    /// Shown to the user when the check fails.
    pub message: String,
}

/// Session cookie behavior.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct SessionConfig {
    /// Lifetime of the credential storage cookie, in seconds.
    #[serde(default = "default_session_duration")]
    pub duration_secs: u64,
    /// When true, cookies are issued without the Secure attribute. Only for
    /// deployments terminating TLS is not an option (local development).
    #[serde(default)]
    pub insecure_cookies: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            duration_secs: default_session_duration(),
            insecure_cookies: false,
        }
    }
}

fn default_session_duration() -> u64 {
    12 * 60 * 60
}

/// Knobs for the per-identity client and namespace-access caches.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CacheConfig {
    #[serde(default = "default_client_capacity")]
    pub client_capacity: usize,
    #[serde(default = "default_namespace_ttl")]
    pub namespace_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            client_capacity: default_client_capacity(),
            namespace_ttl_secs: default_namespace_ttl(),
        }
    }
}

fn default_client_capacity() -> usize {
    64
}

fn default_namespace_ttl() -> u64 {
    60
}
