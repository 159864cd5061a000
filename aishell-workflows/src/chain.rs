//! ABOUTME: Sequential pipeline where each link consumes the previous link's output
//! ABOUTME: Links support input transforms, output validation, and short-circuit predicates

use aishell_core::{AiShellError, ErrorKind, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type LinkFn = Arc<dyn Fn(Value, CancellationToken) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
type ValidateFn = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;
type WhenFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// How a link failure affects the rest of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkErrorPolicy {
    /// Stop the chain; the result reports failure
    #[default]
    Halt,
    /// Record the failure and pass the previous value onward
    Skip,
}

/// One link of the chain
pub struct ChainLink {
    name: String,
    invoke: LinkFn,
    transform: Option<TransformFn>,
    validate: Option<ValidateFn>,
    when: Option<WhenFn>,
    on_error: LinkErrorPolicy,
}

impl ChainLink {
    pub fn new<F>(name: impl Into<String>, invoke: F) -> Self
    where
        F: Fn(Value, CancellationToken) -> BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            invoke: Arc::new(invoke),
            transform: None,
            validate: None,
            when: None,
            on_error: LinkErrorPolicy::default(),
        }
    }

    /// Pure transformation applied to the input before invocation
    #[must_use]
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Validation applied to the output after invocation
    #[must_use]
    pub fn with_validation<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Short-circuit predicate: when false, the link is skipped and the
    /// value flows through unchanged
    #[must_use]
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn on_error(mut self, policy: LinkErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

/// Terminal status of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Per-link record in the chain result
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub name: String,
    pub status: LinkStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// Result of a chain execution
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub success: bool,
    pub final_value: Value,
    pub links: Vec<LinkRecord>,
}

/// Sequential agent chain.
///
/// Each link's output feeds the next link. Failures either halt the chain
/// or are skipped per the link's `on_error` policy; cancellation surfaces
/// as an error.
#[derive(Default)]
pub struct AgentChain {
    links: Vec<ChainLink>,
}

impl AgentChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_link(mut self, link: ChainLink) -> Self {
        self.links.push(link);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run the chain from the initial input
    pub async fn execute(
        &self,
        initial: Value,
        cancellation: &CancellationToken,
    ) -> Result<ChainResult> {
        let mut current = initial;
        let mut records = Vec::with_capacity(self.links.len());

        for link in &self.links {
            if cancellation.is_cancelled() {
                return Err(AiShellError::Cancelled);
            }

            if let Some(when) = &link.when {
                if !when(&current) {
                    debug!(link = %link.name, "short-circuited");
                    records.push(LinkRecord {
                        name: link.name.clone(),
                        status: LinkStatus::Skipped,
                        error_kind: None,
                        error_message: None,
                    });
                    continue;
                }
            }

            let input = match &link.transform {
                Some(transform) => transform(current.clone()),
                None => current.clone(),
            };

            let invoked = tokio::select! {
                output = (link.invoke)(input, cancellation.child_token()) => output,
                () = cancellation.cancelled() => Err(AiShellError::Cancelled),
            };

            let outcome = invoked.and_then(|output| match &link.validate {
                Some(validate) => validate(&output).map(|()| output),
                None => Ok(output),
            });

            match outcome {
                Ok(output) => {
                    records.push(LinkRecord {
                        name: link.name.clone(),
                        status: LinkStatus::Succeeded,
                        error_kind: None,
                        error_message: None,
                    });
                    current = output;
                }
                Err(err) if err.kind() == ErrorKind::Cancelled => {
                    return Err(AiShellError::Cancelled);
                }
                Err(err) => {
                    records.push(LinkRecord {
                        name: link.name.clone(),
                        status: LinkStatus::Failed,
                        error_kind: Some(err.kind()),
                        error_message: Some(err.to_string()),
                    });
                    match link.on_error {
                        LinkErrorPolicy::Halt => {
                            return Ok(ChainResult {
                                success: false,
                                final_value: current,
                                links: records,
                            });
                        }
                        // Skip: the previous value flows to the next link
                        LinkErrorPolicy::Skip => {}
                    }
                }
            }
        }

        Ok(ChainResult {
            success: true,
            final_value: current,
            links: records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn append_link(name: &str, suffix: &'static str) -> ChainLink {
        ChainLink::new(name, move |input, _token| {
            Box::pin(async move {
                let text = input.as_str().unwrap_or_default().to_string();
                Ok(Value::String(format!("{text}{suffix}")))
            })
        })
    }

    #[tokio::test]
    async fn test_values_flow_through_links() {
        let chain = AgentChain::new()
            .add_link(append_link("first", "a"))
            .add_link(append_link("second", "b"));

        let result = chain
            .execute(json!(""), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.final_value, json!("ab"));
        assert_eq!(result.links.len(), 2);
        assert!(result.links.iter().all(|l| l.status == LinkStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_transform_applies_before_invoke() {
        let chain = AgentChain::new().add_link(
            append_link("upper", "!").with_transform(|input| {
                Value::String(input.as_str().unwrap_or_default().to_uppercase())
            }),
        );

        let result = chain
            .execute(json!("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.final_value, json!("HI!"));
    }

    #[tokio::test]
    async fn test_validation_failure_halts() {
        let chain = AgentChain::new()
            .add_link(append_link("first", "a").with_validation(|output| {
                if output.as_str() == Some("a") {
                    Err(AiShellError::ValidationFailed {
                        message: "unexpected output".to_string(),
                    })
                } else {
                    Ok(())
                }
            }))
            .add_link(append_link("unreached", "b"));

        let result = chain
            .execute(json!(""), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.links.len(), 1);
        assert_eq!(result.links[0].status, LinkStatus::Failed);
        assert_eq!(result.links[0].error_kind, Some(ErrorKind::ValidationFailed));
        // The failing link's output is discarded
        assert_eq!(result.final_value, json!(""));
    }

    #[tokio::test]
    async fn test_skip_policy_passes_previous_value() {
        let chain = AgentChain::new()
            .add_link(
                ChainLink::new("flaky", |_input, _token| {
                    Box::pin(async { Err(AiShellError::transient("flaky backend")) })
                })
                .on_error(LinkErrorPolicy::Skip),
            )
            .add_link(append_link("after", "z"));

        let result = chain
            .execute(json!("v"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.final_value, json!("vz"));
        assert_eq!(result.links[0].status, LinkStatus::Failed);
        assert_eq!(result.links[1].status, LinkStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_when_predicate_short_circuits() {
        let chain = AgentChain::new()
            .add_link(append_link("always", "a"))
            .add_link(append_link("never", "b").when(|value| value.as_str() == Some("nope")));

        let result = chain
            .execute(json!(""), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.final_value, json!("a"));
        assert_eq!(result.links[1].status, LinkStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancellation_surfaces() {
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let chain = AgentChain::new().add_link(append_link("first", "a"));
        let err = chain.execute(json!(""), &cancellation).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
