//! Upstream proxy and credential configuration.

use crate::credential::{CredentialInfo, CredentialPersistence};
use crate::resolver::{DnsEndpoint, StaticResolver};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpstreamProxyConfig {
    /// Candidate upstream proxies as `host:port`, tried in order.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Hosts reached directly: exact names, `*.suffix` or `<local>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypass: Vec<String>,
}

impl UpstreamProxyConfig {
    pub fn parse_endpoints(&self) -> Result<Vec<DnsEndpoint>, anyhow::Error> {
        self.endpoints
            .iter()
            .map(|e| {
                DnsEndpoint::parse(e)
                    .ok_or_else(|| anyhow::anyhow!("Invalid upstream proxy endpoint '{}', expected host:port", e))
            })
            .collect()
    }

    pub fn to_resolver(&self) -> Result<StaticResolver, anyhow::Error> {
        Ok(StaticResolver::new(
            self.parse_endpoints()?,
            self.bypass.clone(),
        ))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialConfig {
    /// Upstream proxy `host:port` this credential belongs to, `*` for any.
    #[serde(default = "default_credential_endpoint")]
    pub endpoint: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default)]
    pub persistence: CredentialPersistence,
    #[serde(default)]
    pub enable_assumption_mode: bool,
}

fn default_credential_endpoint() -> String {
    "*".to_string()
}

impl CredentialConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.username.is_empty() {
            anyhow::bail!("Credential for '{}' has an empty username", self.endpoint);
        }
        match (&self.password, &self.password_env) {
            (Some(_), Some(_)) => anyhow::bail!(
                "Credential for '{}' sets both 'password' and 'password_env'",
                self.endpoint
            ),
            (None, None) => anyhow::bail!(
                "Credential for '{}' needs 'password' or 'password_env'",
                self.endpoint
            ),
            _ => {}
        }
        if self.endpoint != "*" && DnsEndpoint::parse(&self.endpoint).is_none() {
            anyhow::bail!(
                "Invalid credential endpoint '{}', expected host:port or '*'",
                self.endpoint
            );
        }
        Ok(())
    }

    /// Build the credential, reading `password_env` now.
    pub fn resolve(&self) -> Result<(String, CredentialInfo), anyhow::Error> {
        let password = match (&self.password, &self.password_env) {
            (Some(password), _) => password.clone(),
            (None, Some(var)) => std::env::var(var).map_err(|_| {
                anyhow::anyhow!(
                    "Environment variable '{}' for credential '{}' is not set",
                    var,
                    self.endpoint
                )
            })?,
            (None, None) => anyhow::bail!("Credential for '{}' has no password", self.endpoint),
        };
        Ok((
            self.endpoint.clone(),
            CredentialInfo {
                username: self.username.clone(),
                password,
                persistence: self.persistence,
                enable_assumption_mode: self.enable_assumption_mode,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(yaml: &str) -> CredentialConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_credential_defaults() {
        let config = credential("username: alice\npassword: secret\n");
        assert_eq!(config.endpoint, "*");
        assert_eq!(config.persistence, CredentialPersistence::Process);
        assert!(!config.enable_assumption_mode);
        config.validate().unwrap();

        let (endpoint, info) = config.resolve().unwrap();
        assert_eq!(endpoint, "*");
        assert_eq!(info.username, "alice");
        assert_eq!(info.password, "secret");
    }

    #[test]
    fn test_password_from_env() {
        std::env::set_var("AUTHRELAY_TEST_PASSWORD", "from-env");
        let config = credential(
            "endpoint: proxy:8080\nusername: bob\npassword_env: AUTHRELAY_TEST_PASSWORD\npersistence: session\n",
        );
        config.validate().unwrap();
        let (_, info) = config.resolve().unwrap();
        assert_eq!(info.password, "from-env");
        assert_eq!(info.persistence, CredentialPersistence::Session);

        let missing = credential("username: bob\npassword_env: AUTHRELAY_TEST_UNSET_VARIABLE\n");
        assert!(missing.resolve().is_err());
    }

    #[test]
    fn test_credential_validation() {
        assert!(credential("username: a\n").validate().is_err());
        assert!(credential("username: ''\npassword: x\n").validate().is_err());
        assert!(credential("username: a\npassword: x\npassword_env: Y\n")
            .validate()
            .is_err());
        assert!(credential("endpoint: noport\nusername: a\npassword: x\n")
            .validate()
            .is_err());
    }

    #[test]
    fn test_upstream_endpoints() {
        let config: UpstreamProxyConfig =
            serde_yaml::from_str("endpoints: [\"proxy1:8080\", \"[::1]:3128\"]\nbypass: [\"<local>\"]\n")
                .unwrap();
        let endpoints = config.parse_endpoints().unwrap();
        assert_eq!(endpoints[1], DnsEndpoint::new("::1", 3128));
        assert!(config.to_resolver().unwrap().is_bypassed("intranet"));

        let bad = UpstreamProxyConfig {
            endpoints: vec!["proxy1".to_string()],
            bypass: vec![],
        };
        assert!(bad.parse_endpoints().is_err());
    }
}
