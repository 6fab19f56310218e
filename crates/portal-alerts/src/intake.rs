use crate::report::Report;

/// VerifyPolicy governs whether reports lacking a verified sender signature
/// are accepted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum VerifyPolicy {
    /// Reject reports without a verified signature of the signing domain.
    #[default]
    Enforce,
    /// Accept unverified reports. Only suitable for development.
    AllowUnverified,
}

/// Envelope is a report as delivered by the upstream mail gateway,
/// along with the outcome of its sender signature checks.
#[derive(Debug, serde::Deserialize)]
pub struct Envelope {
    /// Checked signatures of the message which carried the report.
    #[serde(default)]
    pub signatures: Vec<Signature>,
    pub report: serde_json::Value,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Signature {
    pub domain: String,
    pub verified: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("failed to decode report envelope")]
    Decode(#[from] serde_json::Error),
    #[error("report is not signed by {expected} (signatures: {found:?})")]
    Unverified {
        expected: String,
        found: Vec<String>,
    },
    #[error("malformed report: {0}")]
    Malformed(String),
}

impl Envelope {
    /// Returns true if any signature of `domain` was verified.
    pub fn is_verified_by(&self, domain: &str) -> bool {
        self.signatures
            .iter()
            .any(|sig| sig.verified && sig.domain.eq_ignore_ascii_case(domain))
    }
}

/// Accept a single NDJSON `line` holding an Envelope, returning its Report
/// only if it's verified under `policy` and well-formed.
pub fn accept(line: &str, policy: VerifyPolicy, domain: &str) -> Result<Report, IntakeError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    accept_envelope(envelope, policy, domain)
}

pub fn accept_envelope(
    envelope: Envelope,
    policy: VerifyPolicy,
    domain: &str,
) -> Result<Report, IntakeError> {
    if !envelope.is_verified_by(domain) {
        let found = envelope
            .signatures
            .iter()
            .map(|sig| format!("{}(verified={})", sig.domain, sig.verified))
            .collect();

        match policy {
            VerifyPolicy::Enforce => {
                return Err(IntakeError::Unverified {
                    expected: domain.to_string(),
                    found,
                })
            }
            VerifyPolicy::AllowUnverified => {
                tracing::warn!(
                    expected = domain,
                    ?found,
                    "accepting unverified report (verification is bypassed)"
                );
            }
        }
    }

    // Decode only after verification, so unverified content is never parsed.
    let mut report: Report = serde_json::from_value(envelope.report)
        .map_err(|err| IntakeError::Malformed(err.to_string()))?;
    report.validate().map_err(IntakeError::Malformed)?;
    report.reorder_links();

    Ok(report)
}
