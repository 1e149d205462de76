// =============================================================================
// Policy Advisor — LLM-assisted intent hints behind a hard deadline
// =============================================================================
//
// The deterministic path never depends on the advisor for correctness: on
// timeout, transport failure, or malformed output the engine downgrades to
// HOLD_FALLBACK and the governor runs normally. The advisor can only widen
// what the orchestrator and governor would otherwise allow.
//
// Advisor output is parsed leniently: fenced code blocks are unwrapped,
// trailing commas removed, and unbalanced braces closed (bounded repair)
// before schema validation.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fills::SinkPosition;
use crate::governor::PolicyInput;
use crate::state::DeterministicState;
use crate::types::{Intent, Side};

/// Retries after the first failed attempt.
const MAX_RETRIES: u32 = 2;
/// Most braces the repair pass will append.
const MAX_BRACE_REPAIR: usize = 8;

/// Capability: produce a policy hint for the current state.
pub trait PolicyAdvisor: Send + Sync {
    fn advise<'a>(
        &'a self,
        state: &'a DeterministicState,
        position: Option<&'a SinkPosition>,
    ) -> Pin<Box<dyn Future<Output = Result<PolicyInput>> + Send + 'a>>;
}

/// Outcome of one advised tick.
#[derive(Debug, Clone, Copy)]
pub struct AdvisedPolicy {
    pub policy: PolicyInput,
    /// True when HOLD_FALLBACK replaced a failed/invalid advisor response.
    pub fallback: bool,
}

/// Run the advisor with the configured deadline and bounded retries.
pub async fn advise_with_deadline(
    advisor: &dyn PolicyAdvisor,
    state: &DeterministicState,
    position: Option<&SinkPosition>,
    timeout_ms: u64,
) -> AdvisedPolicy {
    for attempt in 0..=MAX_RETRIES {
        let deadline = Duration::from_millis(timeout_ms);
        match tokio::time::timeout(deadline, advisor.advise(state, position)).await {
            Ok(Ok(policy)) => {
                debug!(attempt, intent = %policy.intent, "advisor responded");
                return AdvisedPolicy {
                    policy,
                    fallback: false,
                };
            }
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "advisor call failed");
            }
            Err(_) => {
                warn!(attempt, timeout_ms, "advisor deadline expired");
            }
        }
    }

    AdvisedPolicy {
        policy: PolicyInput::hold_fallback(),
        fallback: true,
    }
}

// =============================================================================
// Lenient JSON parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawPolicy {
    intent: String,
    #[serde(default)]
    side: Option<String>,
    #[serde(default, alias = "riskMultiplier")]
    risk_multiplier: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parse advisor text into a validated policy.
pub fn parse_policy_text(text: &str) -> Result<PolicyInput> {
    let repaired = repair_json(text);
    let raw: RawPolicy =
        serde_json::from_str(&repaired).context("advisor response is not valid policy JSON")?;

    let intent = match raw.intent.to_uppercase().as_str() {
        "ENTER" => Intent::Enter,
        "ADD" => Intent::Add,
        "REDUCE" => Intent::Reduce,
        "EXIT" => Intent::Exit,
        "HOLD" => Intent::Hold,
        other => anyhow::bail!("unknown intent '{other}'"),
    };

    let side = match raw.side.as_deref().map(str::to_uppercase).as_deref() {
        Some("BUY") | Some("LONG") => Some(Side::Buy),
        Some("SELL") | Some("SHORT") => Some(Side::Sell),
        Some("") | None => None,
        Some(other) => anyhow::bail!("unknown side '{other}'"),
    };

    Ok(PolicyInput {
        intent,
        side,
        risk_multiplier: raw.risk_multiplier.unwrap_or(1.0).clamp(0.0, 2.0),
        confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
    })
}

/// Bounded JSON repair: unwrap fences, strip trailing commas, close braces.
fn repair_json(text: &str) -> String {
    let mut s = text.trim().to_string();

    // Unwrap a fenced block if present.
    if let Some(start) = s.find("```") {
        let after = &s[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let body_end = body.find("```").unwrap_or(body.len());
        s = body[..body_end].trim().to_string();
    }

    // Cut any prose before the first brace.
    if let Some(first) = s.find('{') {
        s = s[first..].to_string();
    }

    // Remove trailing commas before closers (outside strings).
    let mut cleaned = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in s.chars() {
        if in_string {
            cleaned.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                cleaned.push(ch);
            }
            '}' | ']' => {
                while cleaned.ends_with(',')
                    || cleaned.ends_with(char::is_whitespace) && cleaned.trim_end().ends_with(',')
                {
                    let trimmed = cleaned.trim_end().trim_end_matches(',').to_string();
                    cleaned = trimmed;
                }
                cleaned.push(ch);
            }
            _ => cleaned.push(ch),
        }
    }

    // A dangling trailing comma (cut-off response) would poison the brace
    // repair below.
    let mut tail = cleaned.trim_end().to_string();
    while tail.ends_with(',') {
        tail.pop();
        let t = tail.trim_end().to_string();
        tail = t;
    }
    let mut cleaned = tail;

    // Close unbalanced braces/brackets (bounded).
    let mut depth_obj = 0i32;
    let mut depth_arr = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for ch in cleaned.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth_obj += 1,
            '}' => depth_obj -= 1,
            '[' => depth_arr += 1,
            ']' => depth_arr -= 1,
            _ => {}
        }
    }

    let mut repairs = 0usize;
    while depth_arr > 0 && repairs < MAX_BRACE_REPAIR {
        cleaned.push(']');
        depth_arr -= 1;
        repairs += 1;
    }
    while depth_obj > 0 && repairs < MAX_BRACE_REPAIR {
        cleaned.push('}');
        depth_obj -= 1;
        repairs += 1;
    }

    cleaned
}

// =============================================================================
// HTTP advisor
// =============================================================================

/// Advisor backed by an HTTP policy endpoint.
pub struct HttpPolicyAdvisor {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPolicyAdvisor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

impl PolicyAdvisor for HttpPolicyAdvisor {
    fn advise<'a>(
        &'a self,
        state: &'a DeterministicState,
        position: Option<&'a SinkPosition>,
    ) -> Pin<Box<dyn Future<Output = Result<PolicyInput>> + Send + 'a>> {
        Box::pin(async move {
            let payload = serde_json::json!({
                "state": state,
                "position": position,
            });

            let resp = self
                .client
                .post(&self.endpoint)
                .json(&payload)
                .send()
                .await
                .context("advisor POST failed")?;

            let status = resp.status();
            let text = resp.text().await.context("advisor body read failed")?;
            if !status.is_success() {
                anyhow::bail!("advisor returned {status}: {text}");
            }

            parse_policy_text(&text)
        })
    }
}
