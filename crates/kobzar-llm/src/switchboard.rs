//! Routes every LLM call across the ordered provider list.
//!
//! Retryable failures promote the next provider and put the failing one on a
//! cooldown clock; fatal failures abort the call. A provider is never tried
//! twice within one logical call.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use kobzar_core::metrics;

use crate::provider::{ChatRequest, LlmProvider, ProviderError};

/// A completed call: the content plus which provider produced it.
#[derive(Debug, Clone)]
pub struct SwitchboardReply {
    pub content: String,
    pub provider: String,
}

pub struct Switchboard {
    providers: Vec<Arc<dyn LlmProvider>>,
    cooldown: Duration,
    /// Provider name → instant until which it is skipped.
    unhealthy_until: DashMap<String, Instant>,
}

impl Switchboard {
    /// Providers in priority order. At least one is required — the daemon
    /// refuses to start (exit code 4) with an empty list.
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, cooldown: Duration) -> Self {
        assert!(
            !providers.is_empty(),
            "Switchboard requires at least one provider"
        );
        Self {
            providers,
            cooldown,
            unhealthy_until: DashMap::new(),
        }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    fn in_cooldown(&self, name: &str) -> bool {
        self.unhealthy_until
            .get(name)
            .map(|until| Instant::now() < *until)
            .unwrap_or(false)
    }

    fn mark_unhealthy(&self, name: &str) {
        self.unhealthy_until
            .insert(name.to_string(), Instant::now() + self.cooldown);
    }

    /// Route one logical call. Tries providers in order, skipping those in
    /// cooldown; enforces the response schema when the request carries one
    /// (a violation counts as the call's single extra retry).
    pub async fn call(&self, req: &ChatRequest) -> Result<SwitchboardReply, ProviderError> {
        let mut last_err: Option<ProviderError> = None;
        let mut failing_over = false;
        let mut schema_retry_used = false;

        for provider in &self.providers {
            let name = provider.name();

            if self.in_cooldown(name) {
                info!(provider = %name, "provider in cooldown, skipping");
                continue;
            }

            if failing_over {
                metrics::incr(metrics::names::PROVIDER_FAILOVERS_TOTAL);
                failing_over = false;
            }

            match provider.send(req).await {
                Ok(resp) => {
                    if let Some(schema) = &req.response_schema {
                        if let Err(reason) = validate_against_schema(&resp.content, schema) {
                            warn!(provider = %name, reason = %reason, "response schema violation");
                            last_err = Some(ProviderError::Parse(reason));
                            if schema_retry_used {
                                break;
                            }
                            schema_retry_used = true;
                            failing_over = true;
                            continue;
                        }
                    }
                    return Ok(SwitchboardReply {
                        content: resp.content,
                        provider: name.to_string(),
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(provider = %name, err = %e, "provider failed, promoting next");
                    self.mark_unhealthy(name);
                    last_err = Some(e);
                    failing_over = true;
                }
                Err(e) => {
                    warn!(provider = %name, err = %e, "fatal provider error, aborting call");
                    return Err(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::Unavailable("no providers available".to_string())))
    }
}

/// Parse the content as JSON and check it against the schema.
fn validate_against_schema(content: &str, schema: &serde_json::Value) -> Result<(), String> {
    let instance: serde_json::Value = serde_json::from_str(strip_fences(content))
        .map_err(|e| format!("response is not JSON: {e}"))?;
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("invalid response schema: {e}"))?;
    if let Err(errors) = compiled.validate(&instance) {
        let first = errors
            .into_iter()
            .next()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown violation".to_string());
        return Err(format!("schema violation: {first}"));
    }
    Ok(())
}

/// Models love markdown fences around JSON; strip one layer if present.
pub fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
