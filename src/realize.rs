//! Polls the realization state of applied intent.

use crate::{client::PolicyClient, error::Error};
use std::time::Duration;

pub const REALIZED: &str = "REALIZED";
pub const ERROR: &str = "ERROR";

/// Controls how long realization is polled for.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay after the first unrealized poll.
    pub initial: Duration,
    /// Multiplier applied to the delay after each poll.
    pub factor: f64,
    /// Maximum number of polls.
    pub steps: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            steps: 6,
            cap: Duration::from_secs(30),
        }
    }
}

// === impl Backoff ===

impl Backoff {
    /// The delays slept between polls.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let steps = self.steps.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial.min(self.cap)), move |delay| {
            Some(Duration::from_secs_f64(
                (delay.as_secs_f64() * self.factor).min(self.cap.as_secs_f64()),
            ))
        })
        .take(steps)
    }
}

/// Waits until every entity realized from `intent_path` reports
/// [`REALIZED`].
///
/// An [`ERROR`] state fails immediately. Any other state, an empty entity
/// list, and retryable API errors are polled again until `backoff` is
/// exhausted.
pub async fn wait_realized<C>(client: &C, intent_path: &str, backoff: &Backoff) -> Result<(), Error>
where
    C: PolicyClient + ?Sized,
{
    let mut delays = backoff.delays();
    for attempt in 1..=backoff.steps.max(1) {
        match client.list_realized_entities(intent_path).await {
            Ok(entities) => {
                if let Some(failed) = entities.iter().find(|e| e.state == ERROR) {
                    let message = failed
                        .alarms
                        .iter()
                        .map(|a| a.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                    tracing::warn!(%intent_path, entity = %failed.entity_type, %message, "realization failed");
                    return Err(Error::RealizeFailed {
                        path: intent_path.to_string(),
                        message,
                    });
                }
                if !entities.is_empty() && entities.iter().all(|e| e.state == REALIZED) {
                    tracing::debug!(%intent_path, attempt, "realized");
                    return Ok(());
                }
                tracing::debug!(%intent_path, attempt, "not yet realized");
            }
            Err(error) if error.is_retryable() => {
                tracing::warn!(%intent_path, attempt, %error, "failed to poll realization");
            }
            Err(error) => return Err(error.into()),
        }

        match delays.next() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => break,
        }
    }
    Err(Error::NotRealized {
        path: intent_path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{RealizedAlarm, RealizedEntity},
        tests::FakeClient,
    };

    fn entity(state: &str) -> RealizedEntity {
        RealizedEntity {
            entity_type: "RealizedFirewallSection".to_string(),
            state: state.to_string(),
            alarms: vec![],
        }
    }

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            factor: 2.0,
            steps: 3,
            cap: Duration::from_millis(2),
        }
    }

    #[test]
    fn delays_are_capped() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            factor: 3.0,
            steps: 5,
            cap: Duration::from_secs(5),
        };
        assert_eq!(
            backoff.delays().collect::<Vec<_>>(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[tokio::test]
    async fn retries_until_realized() {
        let client = FakeClient::default();
        client.push_realized(vec![entity("UNREALIZED")]);
        client.push_realized(vec![entity(REALIZED)]);
        wait_realized(&client, "/infra/domains/default/security-policies/sp", &fast())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn error_state_is_terminal() {
        let client = FakeClient::default();
        client.push_realized(vec![RealizedEntity {
            alarms: vec![RealizedAlarm {
                message: "bad rule".to_string(),
            }],
            ..entity(ERROR)
        }]);
        client.push_realized(vec![entity(REALIZED)]);
        let err = wait_realized(&client, "/p", &fast()).await.unwrap_err();
        assert!(matches!(err, Error::RealizeFailed { ref message, .. } if message == "bad rule"));
    }

    #[tokio::test]
    async fn exhausts_backoff() {
        let client = FakeClient::default();
        for _ in 0..3 {
            client.push_realized(vec![entity("IN_PROGRESS")]);
        }
        client.push_realized(vec![entity(REALIZED)]);
        let err = wait_realized(&client, "/p", &fast()).await.unwrap_err();
        assert!(matches!(err, Error::NotRealized { .. }));
    }
}
