//! Filter & routing engine: the per-consumer delivery predicate plus the
//! two bridge-facing throttles (screenshot spacing, overload guard).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use aria_protocol::{
    capability, is_gated_type, Event, LlmFilter, RateLimitReason, ServerFrame,
    OVERLOAD_WINDOW_LIMIT, OVERLOAD_WINDOW_MS, SCREENSHOT_MIN_INTERVAL_MS,
};
use metrics::counter;
use tracing::{debug, warn};

use crate::registry::{Broker, HelloInfo, Subscription};

/// Rolling count of every event the router touches. While the window holds
/// [`OVERLOAD_WINDOW_LIMIT`] or more hits, consumers running an llm filter
/// are restricted to `error` events.
#[derive(Debug, Default)]
pub struct OverloadWindow {
    hits: VecDeque<Instant>,
}

impl OverloadWindow {
    /// Record one routed event and report whether the window is saturated.
    pub fn touch(&mut self, now: Instant) -> bool {
        if let Some(horizon) = now.checked_sub(Duration::from_millis(OVERLOAD_WINDOW_MS)) {
            while self.hits.front().is_some_and(|t| *t < horizon) {
                self.hits.pop_front();
            }
        }
        self.hits.push_back(now);
        self.hits.len() >= OVERLOAD_WINDOW_LIMIT
    }
}

/// The routing predicate: does consumer `sub` receive `event` from a bridge
/// that advertised `bridge_hello`? All four gates must pass.
pub fn deliver(
    event: &Event,
    bridge_hello: Option<&HelloInfo>,
    sub: &Subscription,
    overloaded: bool,
) -> bool {
    // Level hierarchy.
    if event.tier().rank() > sub.max_rank() {
        return false;
    }

    // Capability gate, both sides. A bridge that has not sent `hello` yet is
    // exempt from the bridge-side check.
    let kind = event.kind.to_ascii_lowercase();
    if is_gated_type(&kind) {
        if !sub.capabilities.is_empty() && !sub.capabilities.contains(&kind) {
            return false;
        }
        if let Some(hello) = bridge_hello {
            if !hello.has_capability(&kind) {
                return false;
            }
        }
    }

    // Consumer's own noise filter.
    let level = event.level_or_default();
    if !sub.llm_filter.allows(level) {
        return false;
    }

    // Overload guard: saturated window restricts filtered consumers to
    // errors, overriding the filter's own allowances.
    if overloaded && sub.llm_filter != LlmFilter::Off && !level.eq_ignore_ascii_case("error") {
        return false;
    }

    true
}

/// Fan one bridge event out to every matching consumer. Returns a
/// `rate_limit_notice` to bounce back to the bridge when a screenshot is
/// withheld.
pub fn route_event(broker: &Broker, bridge_id: &str, event: &Event) -> Option<ServerFrame> {
    counter!("aria_events_received_total").increment(1);
    let overloaded = broker.overload.lock().touch(Instant::now());

    let bridge_hello = broker.bridge_hello(bridge_id);
    if event.kind.eq_ignore_ascii_case(capability::SCREENSHOT) {
        return route_screenshot(broker, bridge_id, bridge_hello.as_ref(), event, overloaded);
    }

    let payload = serde_json::to_value(event).ok()?;
    let mut delivered = 0usize;
    broker.for_each_consumer(|consumer| {
        if deliver(event, bridge_hello.as_ref(), &consumer.subscription, overloaded) {
            if consumer.tx.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
    });
    counter!("aria_events_delivered_total").increment(delivered as u64);
    debug!(bridge_id, kind = %event.kind, delivered, "event routed");
    None
}

fn route_screenshot(
    broker: &Broker,
    bridge_id: &str,
    bridge_hello: Option<&HelloInfo>,
    event: &Event,
    overloaded: bool,
) -> Option<ServerFrame> {
    if !bridge_hello.is_some_and(|h| h.has_capability(capability::SCREENSHOT)) {
        counter!("aria_screenshots_rejected_total").increment(1);
        return Some(notice(
            RateLimitReason::MissingCapability,
            None,
            "bridge did not advertise the screenshot capability",
        ));
    }
    if event.mime.as_deref().unwrap_or("").is_empty()
        || event.data.as_deref().unwrap_or("").is_empty()
    {
        counter!("aria_screenshots_rejected_total").increment(1);
        return Some(notice(
            RateLimitReason::InvalidFormat,
            None,
            "screenshot requires mime and data",
        ));
    }

    // Minimum spacing per bridge. The clock only advances on a successful
    // forward, so a rejected burst does not push the window out.
    let min_interval = Duration::from_millis(SCREENSHOT_MIN_INTERVAL_MS);
    if let Some(elapsed) = screenshot_elapsed(broker, bridge_id) {
        if elapsed < min_interval {
            let retry_after = (min_interval - elapsed).as_millis() as u64;
            counter!("aria_screenshots_rejected_total").increment(1);
            return Some(notice(
                RateLimitReason::RateLimit,
                Some(retry_after),
                "screenshot rate limited",
            ));
        }
    }

    let payload = serde_json::to_value(event).ok()?;
    let mut delivered = 0usize;
    broker.for_each_consumer(|consumer| {
        if deliver(event, bridge_hello, &consumer.subscription, overloaded) {
            if consumer.tx.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
    });

    if delivered == 0 {
        counter!("aria_screenshots_rejected_total").increment(1);
        return Some(notice(
            RateLimitReason::NoConsumers,
            None,
            "no consumer is subscribed to screenshots",
        ));
    }

    counter!("aria_events_delivered_total").increment(delivered as u64);
    mark_screenshot_sent(broker, bridge_id);
    None
}

fn notice(reason: RateLimitReason, retry_after_ms: Option<u64>, message: &str) -> ServerFrame {
    ServerFrame::RateLimitNotice {
        reason,
        retry_after_ms,
        message: message.to_string(),
    }
}

fn screenshot_elapsed(broker: &Broker, bridge_id: &str) -> Option<Duration> {
    broker
        .with_screenshot_clock(bridge_id, |slot| (*slot).map(|at| at.elapsed()))
        .flatten()
}

fn mark_screenshot_sent(broker: &Broker, bridge_id: &str) {
    if broker
        .with_screenshot_clock(bridge_id, |slot| *slot = Some(Instant::now()))
        .is_none()
    {
        warn!(bridge_id, "screenshot forwarded for unknown bridge");
    }
}
