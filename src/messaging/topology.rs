//! Exchange and queue layout shared by producer and consumer

use super::BrokerChannel;
use crate::errors::BrokerResult;

pub const GAMING_EXCHANGE: &str = "gaming";
pub const GAME_RESULTS_QUEUE: &str = "analytics.game_results";
pub const PAYMENTS_QUEUE: &str = "analytics.payments";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// A durable topic exchange and the durable queues bound to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    /// The analytics layout: game results and payments on `gaming`
    pub fn analytics() -> Self {
        Self {
            exchange: GAMING_EXCHANGE.to_string(),
            bindings: vec![
                QueueBinding::new(GAME_RESULTS_QUEUE, "game.result"),
                QueueBinding::new(PAYMENTS_QUEUE, "payment.*"),
            ],
        }
    }

    /// Idempotently declare the exchange, every queue, and every binding
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> BrokerResult<()> {
        channel.declare_exchange(&self.exchange).await?;
        for binding in &self.bindings {
            channel.declare_queue(&binding.queue).await?;
            channel
                .bind_queue(&binding.queue, &self.exchange, &binding.routing_key)
                .await?;
        }
        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::analytics()
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((first, key_rest)) if word == "*" || word == *first => matches_words(rest, key_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("game.result", "game.result"));
        assert!(!topic_matches("game.result", "game.results"));

        assert!(topic_matches("payment.*", "payment.credit"));
        assert!(topic_matches("payment.*", "payment.debit"));
        assert!(!topic_matches("payment.*", "payment"));
        assert!(!topic_matches("payment.*", "payment.credit.retry"));

        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("payment.#", "payment"));
        assert!(topic_matches("payment.#", "payment.credit.retry"));
        assert!(topic_matches("*.result", "game.result"));
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(!topic_matches("a.#.z", "a.b.c"));
    }

    #[test]
    fn test_analytics_topology() {
        let topology = Topology::analytics();
        assert_eq!(topology.exchange, "gaming");
        assert_eq!(topology.bindings.len(), 2);
        assert!(topology
            .bindings
            .iter()
            .any(|b| b.queue == PAYMENTS_QUEUE && b.routing_key == "payment.*"));
    }
}
