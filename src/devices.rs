//! Device registry — human-readable Kindle labels mapped to delivery addresses.
//!
//! Built once at startup from `UBOT_KINDLE_DEVICES`, read-only afterwards.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::delivery::selector::choice_token;

/// Maximum length of a device label.
pub const MAX_DEVICE_LABEL_LENGTH: usize = 100;

/// Telegram rejects inline buttons whose callback data exceeds this many bytes.
pub const MAX_CALLBACK_DATA_BYTES: usize = 64;

/// Immutable label → address mapping.
///
/// Labels are kept sorted so every choice prompt lists devices in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, String>,
}

impl DeviceRegistry {
    /// Parse `Label:addr|Label:addr`. Invalid pairs are skipped with a warning.
    pub fn parse(raw: &str) -> Self {
        let mut devices = BTreeMap::new();

        for pair in raw.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((label, address)) = pair.split_once(':') else {
                warn!(pair, "Invalid device format (expected 'Name:email')");
                continue;
            };
            let label = label.trim();
            let address = address.trim();

            if label.is_empty() || address.is_empty() {
                warn!(pair, "Empty device name or email");
                continue;
            }
            if label.chars().count() > MAX_DEVICE_LABEL_LENGTH {
                warn!(label, "Device name too long (max {MAX_DEVICE_LABEL_LENGTH} chars)");
                continue;
            }
            if choice_token(label).len() > MAX_CALLBACK_DATA_BYTES {
                warn!(label, "Device name too long for a Telegram button");
                continue;
            }
            if !address.contains('@') {
                warn!(label, address = %mask_email(address), "Invalid email format");
                continue;
            }

            info!(label, "Registered Kindle device");
            devices.insert(label.to_string(), address.to_string());
        }

        Self { devices }
    }

    /// Build a registry from already-validated pairs.
    pub fn from_pairs<I, L, A>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (L, A)>,
        L: Into<String>,
        A: Into<String>,
    {
        Self {
            devices: pairs
                .into_iter()
                .map(|(l, a)| (l.into(), a.into()))
                .collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.devices.get(label).map(String::as_str)
    }

    /// Labels in presentation order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.devices.iter().map(|(l, a)| (l.as_str(), a.as_str()))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// A resolved delivery destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Device label, `None` for the unlabeled fallback address.
    pub label: Option<String>,
    pub address: String,
}

impl Destination {
    /// Label for user-facing messages.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or("your Kindle")
    }
}

/// Routing view over the configured destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destinations {
    None,
    Single(Destination),
    Multiple,
}

/// Decide how an upload is routed.
///
/// A non-empty registry wins over the fallback address; the fallback is only
/// used when the registry is empty.
pub fn route(registry: &DeviceRegistry, fallback: Option<&str>) -> Destinations {
    let mut entries = registry.iter();
    match (entries.next(), entries.next()) {
        (None, _) => match fallback {
            Some(address) => Destinations::Single(Destination {
                label: None,
                address: address.to_string(),
            }),
            None => Destinations::None,
        },
        (Some((label, address)), None) => Destinations::Single(Destination {
            label: Some(label.to_string()),
            address: address.to_string(),
        }),
        _ => Destinations::Multiple,
    }
}

/// Hide the local part of an address for logging.
pub fn mask_email(email: &str) -> String {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(domain), None) => format!("***@{domain}"),
        _ => "***@***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_devices() {
        let reg = DeviceRegistry::parse("Kindle Paperwhite:a@kindle.com|Kindle Oasis:b@kindle.com");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get("Kindle Paperwhite"), Some("a@kindle.com"));
        assert_eq!(reg.get("Kindle Oasis"), Some("b@kindle.com"));
    }

    #[test]
    fn parse_empty_is_empty() {
        assert!(DeviceRegistry::parse("").is_empty());
        assert!(DeviceRegistry::parse(" | ").is_empty());
    }

    #[test]
    fn parse_trims_whitespace() {
        let reg = DeviceRegistry::parse("  Oasis :  b@kindle.com  | ");
        assert_eq!(reg.get("Oasis"), Some("b@kindle.com"));
    }

    #[test]
    fn parse_splits_on_first_colon_only() {
        let reg = DeviceRegistry::parse("Work:mailto:x@kindle.com");
        assert_eq!(reg.get("Work"), Some("mailto:x@kindle.com"));
    }

    #[test]
    fn parse_skips_invalid_entries() {
        let long = "x".repeat(MAX_DEVICE_LABEL_LENGTH + 1);
        let raw = format!("NoColon|:a@kindle.com|Empty:|Bad:not-an-email|{long}:c@kindle.com|Ok:d@kindle.com");
        let reg = DeviceRegistry::parse(&raw);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("Ok"), Some("d@kindle.com"));
    }

    #[test]
    fn parse_skips_labels_over_callback_limit() {
        let label = "y".repeat(MAX_CALLBACK_DATA_BYTES);
        let reg = DeviceRegistry::parse(&format!("{label}:a@kindle.com"));
        assert!(reg.is_empty());
    }

    #[test]
    fn labels_are_sorted() {
        let reg = DeviceRegistry::parse("Zeta:z@kindle.com|Alpha:a@kindle.com|Mid:m@kindle.com");
        let labels: Vec<_> = reg.labels().collect();
        assert_eq!(labels, vec!["Alpha", "Mid", "Zeta"]);
    }

    #[test]
    fn route_without_destinations() {
        assert_eq!(route(&DeviceRegistry::default(), None), Destinations::None);
    }

    #[test]
    fn route_fallback_only() {
        let dest = route(&DeviceRegistry::default(), Some("me@kindle.com"));
        assert_eq!(
            dest,
            Destinations::Single(Destination {
                label: None,
                address: "me@kindle.com".into()
            })
        );
    }

    #[test]
    fn route_single_registry_entry_wins_over_fallback() {
        let reg = DeviceRegistry::from_pairs([("Oasis", "b@kindle.com")]);
        let Destinations::Single(dest) = route(&reg, Some("me@kindle.com")) else {
            panic!("expected single destination");
        };
        assert_eq!(dest.label.as_deref(), Some("Oasis"));
        assert_eq!(dest.address, "b@kindle.com");
    }

    #[test]
    fn route_multiple() {
        let reg = DeviceRegistry::from_pairs([("A", "a@kindle.com"), ("B", "b@kindle.com")]);
        assert_eq!(route(&reg, None), Destinations::Multiple);
    }

    #[test]
    fn mask_email_variants() {
        assert_eq!(mask_email("user@example.com"), "***@example.com");
        assert_eq!(mask_email("user123@kindle.com"), "***@kindle.com");
        assert_eq!(mask_email("notanemail"), "***@***");
        assert_eq!(mask_email("user@domain@example.com"), "***@***");
    }
}
