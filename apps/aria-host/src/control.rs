//! Control correlator: routes `control_request` frames to capable
//! counterparts and steers each `control_result` back to its originator
//! exactly once.

use aria_protocol::{
    capability, now_ms, ControlRequest, ControlResult, Event, Role, ServerFrame,
};
use metrics::counter;
use serde_json::Map;
use tracing::debug;

use crate::registry::{Broker, PendingControl};
use crate::router::deliver;

const NO_BRIDGE_MSG: &str = "No bridge with control capability is connected";
const NO_CONSUMER_MSG: &str = "No consumers connected for control";

/// A consumer asked a bridge to do something: fan the request out to every
/// bridge advertising `control`, remember who to answer, and acknowledge
/// with a `control_forwarded` receipt.
pub fn control_from_consumer(broker: &Broker, consumer_id: &str, mut request: ControlRequest) {
    let id = request
        .id
        .take()
        .unwrap_or_else(|| format!("{consumer_id}-{}", now_ms()));
    request.id = Some(id.clone());

    let frame = ServerFrame::ControlRequest(request).to_value();
    let mut delivered = 0usize;
    for bridge_id in broker.bridges_with_capability(capability::CONTROL) {
        if broker.send_to_bridge(&bridge_id, frame.clone()) {
            delivered += 1;
        }
    }

    if delivered == 0 {
        broker.send_to_consumer(
            consumer_id,
            ServerFrame::ControlResult(ControlResult::failure(&id, NO_BRIDGE_MSG)).to_value(),
        );
        return;
    }

    counter!("aria_control_forwarded_total").increment(1);
    broker.insert_pending(
        id.clone(),
        PendingControl {
            reply_to: consumer_id.to_string(),
            origin: Role::Consumer,
        },
    );
    broker.send_to_consumer(
        consumer_id,
        ServerFrame::ControlForwarded { id, delivered }.to_value(),
    );
}

/// The symmetric direction: a bridge raises a control request and every
/// consumer that would receive a `control`-typed info event gets it.
pub fn control_from_bridge(broker: &Broker, bridge_id: &str, mut request: ControlRequest) {
    let id = request
        .id
        .take()
        .unwrap_or_else(|| format!("{bridge_id}-{}", now_ms()));
    request.id = Some(id.clone());

    let probe = control_probe_event();
    let bridge_hello = broker.bridge_hello(bridge_id);
    let frame = ServerFrame::ControlRequest(request).to_value();

    let mut targets = Vec::new();
    broker.for_each_consumer(|consumer| {
        if deliver(&probe, bridge_hello.as_ref(), &consumer.subscription, false) {
            targets.push(consumer.client_id.clone());
        }
    });

    let mut delivered = 0usize;
    for consumer_id in targets {
        if broker.send_to_consumer(&consumer_id, frame.clone()) {
            delivered += 1;
        }
    }

    if delivered == 0 {
        broker.send_to_bridge(
            bridge_id,
            ServerFrame::ControlResult(ControlResult::failure(&id, NO_CONSUMER_MSG)).to_value(),
        );
        return;
    }

    counter!("aria_control_forwarded_total").increment(1);
    broker.insert_pending(
        id.clone(),
        PendingControl {
            reply_to: bridge_id.to_string(),
            origin: Role::Bridge,
        },
    );
    broker.send_to_bridge(
        bridge_id,
        ServerFrame::ControlForwarded { id, delivered }.to_value(),
    );
}

/// First matching result wins; duplicates and results for dead originators
/// are dropped on the floor.
pub fn handle_control_result(broker: &Broker, result: ControlResult) {
    let Some(pending) = broker.take_pending(&result.id) else {
        debug!(id = %result.id, "control_result without pending entry ignored");
        return;
    };
    let frame = ServerFrame::ControlResult(result).to_value();
    let sent = match pending.origin {
        Role::Consumer => broker.send_to_consumer(&pending.reply_to, frame),
        Role::Bridge => broker.send_to_bridge(&pending.reply_to, frame),
    };
    if !sent {
        debug!(reply_to = %pending.reply_to, "control originator gone, result dropped");
    }
}

/// The routing probe for bridge-originated control requests: a `control`
/// event at `info` level, evaluated against each consumer's subscription.
fn control_probe_event() -> Event {
    Event {
        kind: capability::CONTROL.to_string(),
        level: Some("info".to_string()),
        message: None,
        timestamp: None,
        platform: None,
        project_id: None,
        stack: None,
        url: None,
        route: None,
        mime: None,
        data: None,
        args: None,
        breadcrumbs: None,
        navigation: None,
        network: None,
        extra: Map::new(),
    }
}
