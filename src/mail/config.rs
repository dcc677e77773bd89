//! Email Configuration Module

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Security type for IMAP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    #[default]
    SSL,
    STARTTLS,
    NONE,
}

impl SecurityType {
    pub fn default_imap_port(&self) -> u16 {
        match self {
            SecurityType::SSL => 993,
            SecurityType::STARTTLS => 143,
            SecurityType::NONE => 143,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityType::SSL => "SSL",
            SecurityType::STARTTLS => "STARTTLS",
            SecurityType::NONE => "NONE",
        }
    }

    /// Lenient parse used for values coming out of the accounts table
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "SSL" | "TLS" => SecurityType::SSL,
            "STARTTLS" => SecurityType::STARTTLS,
            "NONE" | "PLAIN" => SecurityType::NONE,
            _ => SecurityType::SSL,
        }
    }
}

/// IMAP server configuration for one account
#[derive(Clone, PartialEq, Eq)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityType,
    pub username: String,
    pub password: Zeroizing<String>,
    pub accept_invalid_certs: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            security: SecurityType::SSL,
            username: String::new(),
            password: Zeroizing::new(String::new()),
            accept_invalid_certs: false, // Secure by default
        }
    }
}

// Manual Debug so the password never reaches a log line.
impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish_non_exhaustive()
    }
}

impl ImapConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("IMAP host is required".to_string());
        }
        if self.port == 0 {
            errors.push("IMAP port is required".to_string());
        }
        if self.username.is_empty() {
            errors.push("IMAP username is required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
