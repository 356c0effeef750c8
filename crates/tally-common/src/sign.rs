//! HMAC-SHA256 signatures over a canonical metric string.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::{Metric, MetricValue};

type HmacSha256 = Hmac<Sha256>;

/// Canonical form that gets signed: `id:type:delta` for counters and
/// `id:type:value` with six decimals for gauges.
pub fn canonical(metric: &Metric) -> String {
    match metric.value {
        MetricValue::Counter(delta) => format!("{}:counter:{}", metric.id, delta),
        MetricValue::Gauge(value) => format!("{}:gauge:{:.6}", metric.id, value),
    }
}

/// Signs and verifies metrics with a shared key.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("key", &"<redacted>").finish()
    }
}

impl Signer {
    /// Returns `None` for an empty key: no key means no signing.
    pub fn new(key: &str) -> Option<Self> {
        if key.is_empty() {
            return None;
        }
        // HMAC accepts keys of any length, so this only fails for empty input.
        let mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
        Some(Self { mac })
    }

    pub fn from_config(key: Option<&str>) -> Option<Self> {
        key.and_then(Self::new)
    }

    /// Hex-encoded signature of the metric's canonical string.
    pub fn sign(&self, metric: &Metric) -> String {
        let mut mac = self.mac.clone();
        mac.update(canonical(metric).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn sign_in_place(&self, metric: &mut Metric) {
        metric.hash = Some(self.sign(metric));
    }

    pub fn signed(&self, mut metric: Metric) -> Metric {
        self.sign_in_place(&mut metric);
        metric
    }

    /// Constant-time check of the metric's own `hash`. A missing or
    /// non-hex hash never verifies.
    pub fn verify(&self, metric: &Metric) -> bool {
        let Some(hash) = metric.hash.as_deref() else {
            return false;
        };
        let Ok(expected) = hex::decode(hash) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(canonical(metric).as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

/// Applies an optional signer: without one every metric passes.
pub fn verify_optional(signer: Option<&Signer>, metric: &Metric) -> bool {
    signer.map_or(true, |s| s.verify(metric))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_formats_by_kind() {
        assert_eq!(canonical(&Metric::counter("PollCount", 42)), "PollCount:counter:42");
        assert_eq!(canonical(&Metric::gauge("Alloc", 1.5)), "Alloc:gauge:1.500000");
    }

    #[test]
    fn empty_key_disables_signing() {
        assert!(Signer::new("").is_none());
        assert!(Signer::from_config(None).is_none());
        assert!(verify_optional(None, &Metric::counter("a", 1)));
    }

    #[test]
    fn sign_then_verify() {
        let signer = Signer::new("secret").unwrap();
        for metric in [Metric::counter("PollCount", 3), Metric::gauge("Alloc", 0.125)] {
            let signed = signer.signed(metric);
            assert_eq!(signed.hash.as_ref().map(String::len), Some(64));
            assert!(signer.verify(&signed));
        }
    }

    #[test]
    fn tampering_breaks_verification() {
        let signer = Signer::new("secret").unwrap();
        let signed = signer.signed(Metric::gauge("Alloc", 10.0));

        let mut changed_value = signed.clone();
        changed_value.value = MetricValue::Gauge(11.0);
        assert!(!signer.verify(&changed_value));

        let mut changed_id = signed.clone();
        changed_id.id = "Sys".into();
        assert!(!signer.verify(&changed_id));

        let other = Signer::new("other").unwrap();
        assert!(!other.verify(&signed));

        assert!(!signer.verify(&signed.clone().unsigned()));

        let mut garbage = signed;
        garbage.hash = Some("not-hex".into());
        assert!(!signer.verify(&garbage));
    }

    #[test]
    fn debug_hides_key() {
        let signer = Signer::new("secret").unwrap();
        assert!(!format!("{signer:?}").contains("secret"));
    }
}
