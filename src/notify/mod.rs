//! Outbound traffic alerts.
//!
//! The `Notifier` renders a `DensityReport` into a subject and body, records
//! the message in the local audit log, then hands it to a `PublishTransport`.
//! Delivery failures are reported to the caller as `DeliveryOutcome::Failed`
//! and never abort the run.

pub mod audit;
pub mod mqtt;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use std::fmt;

use crate::report::DensityReport;

pub use audit::AuditLog;
pub use mqtt::MqttTransport;

pub const HEAVY_SUBJECT: &str = "Heavy Traffic Alert";
pub const UPDATE_SUBJECT: &str = "Traffic Update";
pub const ADVICE_LINE: &str = "Stay safe and consider alternative routes.";

/// Upper bound on group and dedup key length.
pub const MAX_KEY_LEN: usize = 128;
const FALLBACK_KEY: &str = "site";

/// A rendered message ready for a transport.
#[derive(Debug)]
pub struct PublishRequest<'a> {
    pub channel: &'a str,
    pub subject: &'a str,
    pub body: String,
    /// Present only for transports that need ordered delivery.
    pub group_key: Option<String>,
    /// Present only for transports that need ordered delivery.
    pub dedup_key: Option<String>,
    pub report: &'a DensityReport,
}

pub trait PublishTransport: Send {
    fn name(&self) -> &'static str;

    /// Whether messages must carry group and dedup keys.
    fn requires_ordering(&self) -> bool {
        false
    }

    fn publish(&mut self, request: &PublishRequest<'_>) -> Result<()>;

    /// Flush and release the connection, if any.
    fn close(&mut self) {}
}

/// Transport used when no broker is configured; the audit log is the only
/// record.
#[derive(Debug, Default)]
pub struct LogOnlyTransport;

impl PublishTransport for LogOnlyTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    fn publish(&mut self, request: &PublishRequest<'_>) -> Result<()> {
        log::info!(
            "Notifier: [{}] {} ({})",
            request.channel,
            request.subject,
            request.report.summary()
        );
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

pub struct Notifier {
    channel: String,
    audit: AuditLog,
    transport: Box<dyn PublishTransport>,
}

impl Notifier {
    /// Every message goes to `audit` before it reaches `transport`.
    pub fn new(
        channel: impl Into<String>,
        transport: Box<dyn PublishTransport>,
        audit: AuditLog,
    ) -> Self {
        Self {
            channel: channel.into(),
            audit,
            transport,
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Publish `report` on the configured channel.
    pub fn deliver(&mut self, report: &DensityReport, at: DateTime<Utc>) -> DeliveryOutcome {
        let subject = subject_for(report);
        let body = compose_body(report, at);
        let (group_key, dedup_key) = if self.transport.requires_ordering() {
            (
                Some(sanitize_key(&self.channel)),
                Some(dedup_key(&report.site_name, at)),
            )
        } else {
            (None, None)
        };

        if let Err(e) = self.audit.record_message(at, subject, &body) {
            log::warn!("Notifier: audit log write failed: {:#}", e);
        }

        let request = PublishRequest {
            channel: &self.channel,
            subject,
            body,
            group_key,
            dedup_key,
            report,
        };
        let outcome = match self.transport.publish(&request) {
            Ok(()) => {
                log::info!(
                    "Notifier: {} sent for '{}' via {}",
                    subject,
                    report.site_name,
                    self.transport.name()
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                log::error!(
                    "Notifier: delivery via {} failed: {:#}",
                    self.transport.name(),
                    e
                );
                DeliveryOutcome::Failed(format!("{:#}", e))
            }
        };

        if let Err(e) = self.audit.record_outcome(at, &outcome) {
            log::warn!("Notifier: audit log write failed: {:#}", e);
        }
        outcome
    }
}

pub fn subject_for(report: &DensityReport) -> &'static str {
    if report.is_heavy() {
        HEAVY_SUBJECT
    } else {
        UPDATE_SUBJECT
    }
}

/// Human-readable alert body. Date and time are rendered in local time.
pub fn compose_body(report: &DensityReport, at: DateTime<Utc>) -> String {
    let headline = if report.is_heavy() {
        format!("High traffic detected on {}", report.site_name)
    } else {
        format!("Traffic update for {}", report.site_name)
    };
    format!(
        "{}\n\nDate & Time: {}\nReport Summary:\n{}\n\n{}",
        headline,
        at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        report.summary(),
        ADVICE_LINE
    )
}

/// Reduce `input` to `[A-Za-z0-9_-]`, at most `MAX_KEY_LEN` characters.
///
/// Spaces become `-`; other characters are dropped. Input with nothing usable
/// left maps to a fixed fallback token.
pub fn sanitize_key(input: &str) -> String {
    sanitize_key_with_limit(input, MAX_KEY_LEN)
}

fn sanitize_key_with_limit(input: &str, limit: usize) -> String {
    let key: String = input
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('-'),
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => Some(c),
            _ => None,
        })
        .take(limit)
        .collect();
    if key.is_empty() {
        FALLBACK_KEY.chars().take(limit).collect()
    } else {
        key
    }
}

/// `<sanitized site>-<unix seconds>`, never longer than `MAX_KEY_LEN`.
pub fn dedup_key(site: &str, at: DateTime<Utc>) -> String {
    let suffix = format!("-{}", at.timestamp());
    let room = MAX_KEY_LEN.saturating_sub(suffix.len());
    format!("{}{}", sanitize_key_with_limit(site, room), suffix)
}
