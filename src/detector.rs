//! Classification of fetch outcomes.
//!
//! A pure, ordered rule list turns a raw response into a [`FetchStatus`].
//! Explicit denial signals (status codes, known block pages) always win over
//! content heuristics, so a suspicious body can never mask a hard block.

use std::fmt;
use std::time::Duration;

use crate::driver::RawResponse;

/// Body substrings that identify an explicit block page.
const BLOCK_FINGERPRINTS: &[&str] = &[
    "access denied",
    "you have been blocked",
    "request blocked",
    "has banned your access",
    "error 1005",
    "error 1006",
];

/// Body substrings that identify a CAPTCHA or interstitial challenge page.
const CHALLENGE_FINGERPRINTS: &[&str] = &[
    "captcha",
    "verify you are human",
    "unusual traffic from",
    "/sorry/",
    "cf-challenge",
    "challenge-form",
    "press & hold",
];

/// Classification of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// The response looks like a genuine result page.
    Success,
    /// Rate-limiting or suspicion signal, recoverable by slowing down or
    /// rotating identity.
    SoftBlock,
    /// Explicit denial; the identity/proxy has been flagged.
    HardBlock,
    /// CAPTCHA or similar interactive verification page.
    Challenge,
    /// The fetch never produced a response (timeout, connection reset).
    Transport,
}

impl FetchStatus {
    pub fn is_success(self) -> bool {
        matches!(self, FetchStatus::Success)
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FetchStatus::Success => "success",
            FetchStatus::SoftBlock => "soft block",
            FetchStatus::HardBlock => "hard block",
            FetchStatus::Challenge => "challenge",
            FetchStatus::Transport => "transport error",
        };
        f.write_str(label)
    }
}

/// Result of one physical fetch attempt, as recorded by the orchestrator.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Classification of the attempt.
    pub status: FetchStatus,
    /// HTTP status code, if a response arrived at all.
    pub status_code: Option<u16>,
    /// Time the attempt took.
    pub elapsed: Duration,
    /// Identity that performed the attempt.
    pub identity_id: u64,
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {code})")?;
        }
        write!(
            f,
            " after {:.2}s via identity {}",
            self.elapsed.as_secs_f64(),
            self.identity_id
        )
    }
}

/// Classify a response that arrived over the wire.
///
/// Rules, in priority order: 429/503 are soft blocks; 403 or a block-page
/// fingerprint is a hard block; a challenge fingerprint is a challenge; a
/// body the caller's validator rejects is a suspected soft block; anything
/// else is a success. Transport failures never reach this function; the
/// orchestrator maps them to [`FetchStatus::Transport`] directly.
pub fn classify(response: &RawResponse, looks_like_result: &dyn Fn(&str) -> bool) -> FetchStatus {
    match response.status {
        429 | 503 => return FetchStatus::SoftBlock,
        403 => return FetchStatus::HardBlock,
        _ => {}
    }

    let body = response.body.to_lowercase();
    if BLOCK_FINGERPRINTS.iter().any(|f| body.contains(f)) {
        return FetchStatus::HardBlock;
    }
    if CHALLENGE_FINGERPRINTS.iter().any(|f| body.contains(f)) {
        return FetchStatus::Challenge;
    }
    if !looks_like_result(&response.body) {
        return FetchStatus::SoftBlock;
    }

    FetchStatus::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.to_string(),
            elapsed: Duration::from_millis(100),
        }
    }

    fn accept_all(_body: &str) -> bool {
        true
    }

    fn has_results(body: &str) -> bool {
        body.contains("id=\"results\"")
    }

    #[test]
    fn status_429_is_soft_block() {
        assert_eq!(
            classify(&response(429, "slow down"), &accept_all),
            FetchStatus::SoftBlock
        );
    }

    #[test]
    fn status_503_is_soft_block() {
        assert_eq!(
            classify(&response(503, ""), &accept_all),
            FetchStatus::SoftBlock
        );
    }

    #[test]
    fn status_403_is_hard_block() {
        assert_eq!(
            classify(&response(403, "<html>forbidden</html>"), &accept_all),
            FetchStatus::HardBlock
        );
    }

    #[test]
    fn block_fingerprint_is_hard_block() {
        let body = "<html><body><h1>Access Denied</h1></body></html>";
        assert_eq!(
            classify(&response(200, body), &accept_all),
            FetchStatus::HardBlock
        );
    }

    #[test]
    fn captcha_fingerprint_is_challenge() {
        let body = "<html>Please solve this CAPTCHA to continue</html>";
        assert_eq!(
            classify(&response(200, body), &accept_all),
            FetchStatus::Challenge
        );
    }

    #[test]
    fn block_fingerprint_wins_over_challenge_fingerprint() {
        // A page carrying both markers is an explicit denial first.
        let body = "Access denied. Complete the captcha to regain access.";
        assert_eq!(
            classify(&response(200, body), &accept_all),
            FetchStatus::HardBlock
        );
    }

    #[test]
    fn status_code_wins_over_body_content() {
        // 429 with a captcha-looking body stays a soft block.
        let body = "rate limited, solve the captcha";
        assert_eq!(
            classify(&response(429, body), &accept_all),
            FetchStatus::SoftBlock
        );
    }

    #[test]
    fn missing_result_marker_is_soft_block() {
        assert_eq!(
            classify(&response(200, "<html>empty shell</html>"), &has_results),
            FetchStatus::SoftBlock
        );
    }

    #[test]
    fn valid_page_is_success() {
        let body = "<html><div id=\"results\"><a href=\"#\">hit</a></div></html>";
        assert_eq!(
            classify(&response(200, body), &has_results),
            FetchStatus::Success
        );
    }
}
