//! Tracking of declared funnels (queues) for the current session
//!
//! A funnel is claimed before any broker round-trip so that two overlapping
//! `subscribe` calls for the same funnel attach exactly one consumer.

use super::connection::ChannelRole;
use std::collections::HashMap;

/// Consumer attached to a tracked funnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedConsumer {
    pub funnel: String,
    pub channel: ChannelRole,
    pub consumer_tag: String,
}

#[derive(Debug, Clone)]
struct TrackedFunnel {
    channel: ChannelRole,
    consumer_tag: Option<String>,
}

/// Funnels declared this session, keyed by name
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    funnels: HashMap<String, TrackedFunnel>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `funnel`; returns true if it was not tracked yet
    pub fn claim(&mut self, funnel: &str, channel: ChannelRole) -> bool {
        if self.funnels.contains_key(funnel) {
            return false;
        }
        self.funnels.insert(
            funnel.to_string(),
            TrackedFunnel {
                channel,
                consumer_tag: None,
            },
        );
        true
    }

    /// Forget a claim whose declaration failed, so a later subscribe retries
    pub fn release(&mut self, funnel: &str) {
        self.funnels.remove(funnel);
    }

    /// Record the consumer attached to a claimed funnel
    pub fn attach(&mut self, funnel: &str, consumer_tag: String) -> bool {
        match self.funnels.get_mut(funnel) {
            Some(tracked) => {
                tracked.consumer_tag = Some(consumer_tag);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, funnel: &str) -> bool {
        self.funnels.contains_key(funnel)
    }

    pub fn consumer_tag(&self, funnel: &str) -> Option<&str> {
        self.funnels
            .get(funnel)
            .and_then(|tracked| tracked.consumer_tag.as_deref())
    }

    pub fn len(&self) -> usize {
        self.funnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funnels.is_empty()
    }

    /// Clear the registry, returning every attached consumer
    pub fn drain(&mut self) -> Vec<TrackedConsumer> {
        let mut consumers: Vec<TrackedConsumer> = self
            .funnels
            .drain()
            .filter_map(|(funnel, tracked)| {
                tracked.consumer_tag.map(|consumer_tag| TrackedConsumer {
                    funnel,
                    channel: tracked.channel,
                    consumer_tag,
                })
            })
            .collect();
        consumers.sort_by(|a, b| a.funnel.cmp(&b.funnel));
        consumers
    }

    pub fn clear(&mut self) {
        self.funnels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_first_wins() {
        let mut registry = SubscriptionRegistry::new();

        assert!(registry.claim("results", ChannelRole::Secondary));
        assert!(!registry.claim("results", ChannelRole::Secondary));
        assert!(registry.contains("results"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_allows_reclaim() {
        let mut registry = SubscriptionRegistry::new();
        registry.claim("results", ChannelRole::Secondary);
        registry.release("results");

        assert!(!registry.contains("results"));
        assert!(registry.claim("results", ChannelRole::Secondary));
    }

    #[test]
    fn test_attach_requires_claim() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.attach("results", "ctag-1".to_string()));

        registry.claim("results", ChannelRole::Secondary);
        assert!(registry.attach("results", "ctag-1".to_string()));
        assert_eq!(registry.consumer_tag("results"), Some("ctag-1"));
    }

    #[test]
    fn test_drain_returns_attached_consumers_only() {
        let mut registry = SubscriptionRegistry::new();
        registry.claim("keepalives", ChannelRole::Primary);
        registry.attach("keepalives", "ctag-k".to_string());
        registry.claim("results", ChannelRole::Secondary);
        registry.attach("results", "ctag-r".to_string());
        registry.claim("pending", ChannelRole::Secondary);

        let drained = registry.drain();

        assert!(registry.is_empty());
        assert_eq!(
            drained,
            vec![
                TrackedConsumer {
                    funnel: "keepalives".to_string(),
                    channel: ChannelRole::Primary,
                    consumer_tag: "ctag-k".to_string(),
                },
                TrackedConsumer {
                    funnel: "results".to_string(),
                    channel: ChannelRole::Secondary,
                    consumer_tag: "ctag-r".to_string(),
                },
            ]
        );
    }
}
