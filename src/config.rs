//! Configuration types, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Accounts polled when `INTAKE_ACCOUNTS` is unset.
const DEFAULT_ACCOUNTS: &str = "admin,sales,operations:OPS";

/// Default OpenAI-compatible endpoint for the extraction model.
pub const DEFAULT_EXTRACTION_BASE: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai";

/// One department mailbox, polled over IMAP.
#[derive(Debug, Clone)]
pub struct MailboxAccount {
    /// Short account name (`admin`, `sales`, ...), stored on every message.
    pub name: String,
    /// Department address. Doubles as a forwarding recipient.
    pub address: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_password: SecretString,
    /// Implicit TLS on connect. Plain TCP when false.
    pub tls: bool,
    /// Socket read timeout for the IMAP session.
    pub read_timeout: Duration,
}

impl MailboxAccount {
    /// Accounts without a password are skipped by the scheduler.
    pub fn has_credentials(&self) -> bool {
        !self.imap_password.expose_secret().is_empty()
    }
}

/// Outbound SMTP relay used for forwarding.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when true, STARTTLS otherwise.
    pub secure: bool,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    /// Display name used in the `From` header.
    pub from_name: String,
}

impl SmtpConfig {
    /// SMTP is usable only with both a user and a password.
    pub fn is_configured(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
            && self
                .password
                .as_ref()
                .is_some_and(|p| !p.expose_secret().is_empty())
    }
}

/// External structured-extraction service.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub api_key: Option<SecretString>,
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
}

/// Sweep timer settings.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Where attachment bytes are written.
#[derive(Debug, Clone)]
pub struct AttachmentConfig {
    pub dir: PathBuf,
    /// Attachments larger than this are skipped.
    pub max_size: usize,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./uploads/attachments"),
            max_size: 10 * 1024 * 1024,
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub accounts: Vec<MailboxAccount>,
    pub smtp: SmtpConfig,
    pub extraction: ExtractionConfig,
    pub polling: PollingConfig,
    pub attachments: AttachmentConfig,
    /// Upper bound on a single fetched message.
    pub max_message_size: usize,
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Directory for the rolling log file. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl IntakeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let read_timeout =
            Duration::from_secs(parse_or(&get, "MAILBOX_READ_TIMEOUT_SECS", 30u64)?);

        let account_list = get("INTAKE_ACCOUNTS").unwrap_or_else(|| DEFAULT_ACCOUNTS.to_string());
        let mut accounts = Vec::new();
        for entry in account_list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, prefix) = match entry.split_once(':') {
                Some((name, prefix)) => (name.trim().to_string(), prefix.trim().to_uppercase()),
                None => (entry.to_string(), entry.to_uppercase()),
            };
            if name.is_empty() || prefix.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "INTAKE_ACCOUNTS".into(),
                    message: format!("malformed account entry '{entry}'"),
                });
            }
            let var = |suffix: &str| get(&format!("{prefix}_{suffix}"));

            let address = var("EMAIL").unwrap_or_else(|| format!("{name}@company.com"));
            accounts.push(MailboxAccount {
                imap_host: var("IMAP_HOST").unwrap_or_else(|| "imap.gmail.com".into()),
                imap_port: parse_or(&get, &format!("{prefix}_IMAP_PORT"), 993u16)?,
                imap_user: var("IMAP_USER").unwrap_or_else(|| address.clone()),
                imap_password: SecretString::from(var("IMAP_PASSWORD").unwrap_or_default()),
                tls: parse_bool(var("IMAP_TLS"), true),
                read_timeout,
                address,
                name,
            });
        }

        let smtp = SmtpConfig {
            host: get("SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".into()),
            port: parse_or(&get, "SMTP_PORT", 587u16)?,
            secure: parse_bool(get("SMTP_SECURE"), false),
            user: get("SMTP_USER"),
            password: get("SMTP_PASSWORD").map(SecretString::from),
            from_name: get("SMTP_FROM_NAME").unwrap_or_else(|| "Funnel Automation".into()),
        };

        let extraction = ExtractionConfig {
            api_key: get("EXTRACTION_API_KEY")
                .or_else(|| get("GEMINI_API_KEY"))
                .map(SecretString::from),
            api_base: get("EXTRACTION_API_BASE")
                .unwrap_or_else(|| DEFAULT_EXTRACTION_BASE.into())
                .trim_end_matches('/')
                .to_string(),
            model: get("EXTRACTION_MODEL").unwrap_or_else(|| "gemini-1.5-flash".into()),
            timeout: Duration::from_secs(parse_or(&get, "EXTRACTION_TIMEOUT_SECS", 60u64)?),
        };

        let interval_secs = parse_or(&get, "EMAIL_POLL_INTERVAL_SECS", 300u64)?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EMAIL_POLL_INTERVAL_SECS".into(),
                message: "interval must be greater than zero".into(),
            });
        }
        let polling = PollingConfig {
            enabled: parse_bool(get("EMAIL_POLLING_ENABLED"), true),
            interval: Duration::from_secs(interval_secs),
        };

        let attachments = AttachmentConfig {
            dir: get("ATTACHMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| AttachmentConfig::default().dir),
            max_size: parse_or(&get, "MAX_ATTACHMENT_SIZE", AttachmentConfig::default().max_size)?,
        };

        Ok(Self {
            accounts,
            smtp,
            extraction,
            polling,
            attachments,
            max_message_size: parse_or(
                &get,
                "MAX_MESSAGE_SIZE",
                crate::mail::DEFAULT_MAX_MESSAGE_SIZE,
            )?,
            db_path: get("INTAKE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/funnel-intake.db")),
            http_port: parse_or(&get, "INTAKE_HTTP_PORT", 8080u16)?,
            log_dir: get("INTAKE_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Every configured department address, in account order.
    pub fn department_addresses(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.address.clone()).collect()
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Anything other than an explicit false-ish value keeps the default of `true`.
fn parse_bool(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => false,
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => true,
        _ => default,
    }
}
